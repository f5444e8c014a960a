//! Customers, keyed by their external identity document number.
//!
//! The register looks a customer up before every sale and upserts what the
//! operator typed. Upserting unchanged content is a no-op, so that lookup-
//! then-save does not create sync traffic.

use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use tracing::debug;

use crate::db::DbState;
use crate::error::{Result, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{Customer, RecordState, Table};
use crate::store::{self, opt_text, read_state, text, Record};

/// Identity document type used when none is given.
pub const DEFAULT_CUSTOMER_TYPE: &str = "CC";

impl Record for Customer {
    const TABLE: Table = Table::Customers;
    const ENTITY: &'static str = "customer";
    const COLUMNS: &'static [&'static str] = &[
        "id_number",
        "customer_type",
        "name",
        "phone",
        "email",
        "address",
    ];

    fn key(&self) -> String {
        self.id_number.clone()
    }

    fn state(&self) -> &RecordState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id_number: row.get(0)?,
            customer_type: row.get(1)?,
            name: row.get(2)?,
            phone: row.get(3)?,
            email: row.get(4)?,
            address: row.get(5)?,
            state: read_state(row, 6)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id_number),
            text(&self.customer_type),
            text(&self.name),
            opt_text(self.phone.as_deref()),
            opt_text(self.email.as_deref()),
            opt_text(self.address.as_deref()),
        ]
    }

    fn normalize(&mut self) {
        self.id_number = self.id_number.trim().to_string();
        self.name = self.name.trim().to_string();
        if self.customer_type.trim().is_empty() {
            self.customer_type = DEFAULT_CUSTOMER_TYPE.to_string();
        }
        for field in [&mut self.phone, &mut self.email, &mut self.address] {
            if field.as_deref().is_some_and(|v| v.trim().is_empty()) {
                *field = None;
            }
        }
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.id_number.is_empty() {
            return Err(ValidationError::MissingField("id_number"));
        }
        Ok(())
    }
}

impl Customer {
    pub fn new(id_number: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id_number: id_number.into(),
            customer_type: DEFAULT_CUSTOMER_TYPE.to_string(),
            name: name.into(),
            phone: None,
            email: None,
            address: None,
            state: RecordState::default(),
        }
    }
}

pub fn find_customer(db: &DbState, id_number: &str) -> Result<Option<Customer>> {
    store::get(db, id_number.trim())
}

pub fn list_customers(db: &DbState) -> Result<Vec<Customer>> {
    store::list(db)
}

/// Insert or update a customer. Returns the stored record; when the content
/// already matches, nothing is written and the record stays clean.
pub fn upsert_customer(db: &DbState, mut customer: Customer) -> Result<Customer> {
    customer.normalize();
    customer.validate()?;
    let saved = {
        let conn = db.lock()?;
        if let Some(existing) = store::get_in::<Customer>(&conn, &customer.id_number)? {
            if !existing.state.deleted && existing.same_content(&customer) {
                debug!(id_number = %customer.id_number, "Customer unchanged, skipping write");
                return Ok(existing);
            }
        }
        store::upsert_in(&conn, customer)?
    };
    db.emit(StoreEvent::new(Table::Customers, &saved.id_number, ChangeKind::Upsert));
    Ok(saved)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> DbState {
        DbState::open_in_memory().expect("open in-memory db")
    }

    #[test]
    fn test_upsert_then_find() {
        let db = test_db();
        let mut ana = Customer::new(" 1020 ", "Ana Ruiz");
        ana.phone = Some("3001234567".into());
        ana.email = Some("  ".into());
        upsert_customer(&db, ana).unwrap();

        let found = find_customer(&db, "1020").unwrap().expect("present");
        assert_eq!(found.name, "Ana Ruiz");
        assert_eq!(found.customer_type, "CC");
        assert_eq!(found.email, None);
        assert!(found.state.dirty);
    }

    #[test]
    fn test_identical_upsert_is_noop() {
        let db = test_db();
        upsert_customer(&db, Customer::new("1020", "Ana")).unwrap();
        store::mark_clean::<Customer>(&db, &["1020".into()]).unwrap();

        let again = upsert_customer(&db, Customer::new("1020", "Ana")).unwrap();
        assert!(!again.state.dirty);
        assert_eq!(store::pending_count(&db).unwrap(), 0);

        let changed = upsert_customer(&db, Customer::new("1020", "Ana María")).unwrap();
        assert!(changed.state.dirty);
        assert!(changed.state.synced_once);
    }

    #[test]
    fn test_missing_id_number_rejected() {
        let db = test_db();
        let err = upsert_customer(&db, Customer::new("  ", "Nobody")).unwrap_err();
        assert!(matches!(
            err,
            crate::error::PosError::Validation(ValidationError::MissingField("id_number"))
        ));
        assert!(list_customers(&db).unwrap().is_empty());
    }
}
