//! Merchandise returns.
//!
//! Implements the compensating side of a sale: the refund is recorded
//! against the current shift and, when the size is known, the returned units
//! go back into that stock bucket.
//!
//! **Rules:**
//! - purchase date must be within the last 30 days (boundary accepted)
//! - purchase date may not be in the future
//! - refund amount must be positive, quantity at least 1
//! - returns are never removed, locally or remotely

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::Row;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::catalog;
use crate::context::OperatorContext;
use crate::db::DbState;
use crate::error::{Result, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{truncate_millis, RecordState, Return, SizeBucket, Table};
use crate::store::{self, int, opt_text, read_state, text, ts, ts_col, Record};

/// How far back a purchase may be returned.
pub const RETURN_WINDOW_DAYS: i64 = 30;

impl Record for Return {
    const TABLE: Table = Table::Returns;
    const ENTITY: &'static str = "return";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "item_code",
        "size",
        "quantity",
        "reason",
        "refund_amount",
        "purchase_date",
        "shift_id",
    ];
    const DELETABLE: bool = false;

    fn key(&self) -> String {
        self.id.clone()
    }

    fn state(&self) -> &RecordState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            item_code: row.get(1)?,
            size: row.get(2)?,
            quantity: row.get(3)?,
            reason: row.get(4)?,
            refund_amount: row.get(5)?,
            purchase_date: ts_col(row, 6)?,
            shift_id: row.get(7)?,
            state: read_state(row, 8)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            text(&self.item_code),
            opt_text(self.size.map(SizeBucket::as_str)),
            int(self.quantity),
            text(&self.reason),
            int(self.refund_amount),
            ts(&self.purchase_date),
            opt_text(self.shift_id.as_deref()),
        ]
    }

    fn normalize(&mut self) {
        self.item_code = self.item_code.trim().to_string();
        self.reason = self.reason.trim().to_string();
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.item_code.is_empty() {
            return Err(ValidationError::EmptyCode);
        }
        if self.reason.is_empty() {
            return Err(ValidationError::MissingField("reason"));
        }
        if self.quantity < 1 {
            return Err(ValidationError::InvalidQuantity {
                field: "quantity".into(),
                quantity: self.quantity,
            });
        }
        if self.refund_amount <= 0 {
            return Err(ValidationError::InvalidAmount {
                field: "refund_amount".into(),
                amount: self.refund_amount,
            });
        }
        Ok(())
    }
}

/// What the operator enters on the return form.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewReturn {
    pub item_code: String,
    pub size: Option<SizeBucket>,
    pub quantity: i64,
    pub reason: String,
    pub refund_amount: i64,
    pub purchase_date: DateTime<Utc>,
}

/// Reject purchase dates outside `[now - 30 days, now]`.
pub fn check_return_window(
    purchase_date: DateTime<Utc>,
    now: DateTime<Utc>,
) -> std::result::Result<(), ValidationError> {
    if purchase_date > now {
        return Err(ValidationError::PurchaseDateInFuture);
    }
    if now - purchase_date > Duration::days(RETURN_WINDOW_DAYS) {
        return Err(ValidationError::ReturnWindowExpired {
            days: RETURN_WINDOW_DAYS,
        });
    }
    Ok(())
}

/// Record a return made at `now`, restocking the size bucket when given.
pub fn register_return(
    db: &DbState,
    ctx: &OperatorContext,
    request: NewReturn,
    now: DateTime<Utc>,
) -> Result<Return> {
    let purchase_date = truncate_millis(request.purchase_date);
    let now = truncate_millis(now);
    check_return_window(purchase_date, now)?;

    let record = Return {
        id: Uuid::new_v4().to_string(),
        item_code: request.item_code,
        size: request.size,
        quantity: request.quantity,
        reason: request.reason,
        refund_amount: request.refund_amount,
        purchase_date,
        shift_id: ctx.shift_id.clone(),
        state: RecordState::new_local(now),
    };

    let saved = {
        let conn = db.lock()?;
        let tx = conn.unchecked_transaction()?;
        let saved = store::upsert_at_in(&tx, record, now)?;
        if let Some(size) = saved.size {
            catalog::adjust_stock_in(&tx, &saved.item_code, size, saved.quantity)?;
        }
        tx.commit()?;
        saved
    };

    info!(
        return_id = %saved.id,
        item_code = %saved.item_code,
        size = ?saved.size,
        quantity = saved.quantity,
        refund = saved.refund_amount,
        shift_id = ?saved.shift_id,
        "Return registered"
    );
    db.emit(StoreEvent::new(Table::Returns, &saved.id, ChangeKind::Upsert));
    if saved.size.is_some() {
        db.emit(StoreEvent::new(Table::CatalogItems, &saved.item_code, ChangeKind::Upsert));
    }
    Ok(saved)
}

pub fn list_returns(db: &DbState) -> Result<Vec<Return>> {
    store::list(db)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PosError;
    use crate::models::{now_millis, CatalogItem};

    fn test_db() -> DbState {
        let db = DbState::open_in_memory().expect("open in-memory db");
        catalog::create_item(
            &db,
            CatalogItem::new("T-001", "Basic tee", 25000).with_stock(SizeBucket::M, 3),
        )
        .unwrap();
        db
    }

    fn request(purchase_date: DateTime<Utc>) -> NewReturn {
        NewReturn {
            item_code: "T-001".into(),
            size: Some(SizeBucket::M),
            quantity: 2,
            reason: "Wrong size".into(),
            refund_amount: 50000,
            purchase_date,
        }
    }

    #[test]
    fn test_window_boundary_accepted_and_beyond_rejected() {
        let now = now_millis();
        assert!(check_return_window(now - Duration::days(30), now).is_ok());
        assert_eq!(
            check_return_window(now - Duration::days(30) - Duration::milliseconds(1), now),
            Err(ValidationError::ReturnWindowExpired { days: 30 })
        );
        assert_eq!(
            check_return_window(now + Duration::hours(1), now),
            Err(ValidationError::PurchaseDateInFuture)
        );
    }

    #[test]
    fn test_register_return_restocks_and_tags_shift() {
        let db = test_db();
        let now = now_millis();
        let ctx = OperatorContext::new("till-1").with_shift("shift-9");
        let saved = register_return(&db, &ctx, request(now - Duration::days(3)), now).unwrap();

        assert_eq!(saved.shift_id.as_deref(), Some("shift-9"));
        assert!(saved.state.dirty);
        let tee = catalog::find_by_code(&db, "T-001").unwrap().unwrap();
        assert_eq!(tee.stock.m, 5);
        assert_eq!(tee.total, 5);
    }

    #[test]
    fn test_return_is_stamped_at_the_given_instant() {
        let db = test_db();
        let now = DateTime::parse_from_rfc3339("2026-03-10T12:00:00.123456Z")
            .unwrap()
            .with_timezone(&Utc);
        let stamped = DateTime::parse_from_rfc3339("2026-03-10T12:00:00.123Z")
            .unwrap()
            .with_timezone(&Utc);
        let ctx = OperatorContext::new("till-1");
        let saved = register_return(&db, &ctx, request(now - Duration::days(30)), now).unwrap();

        assert_eq!(saved.state.created_at, stamped);
        assert_eq!(saved.state.updated_at, stamped);
        let stored = store::get::<Return>(&db, &saved.id).unwrap().unwrap();
        assert_eq!(stored.state.created_at, stamped);
    }

    #[test]
    fn test_expired_return_writes_nothing() {
        let db = test_db();
        let now = now_millis();
        let ctx = OperatorContext::new("till-1");
        let err = register_return(&db, &ctx, request(now - Duration::days(31)), now).unwrap_err();
        assert!(matches!(
            err,
            PosError::Validation(ValidationError::ReturnWindowExpired { .. })
        ));
        assert!(list_returns(&db).unwrap().is_empty());
        assert_eq!(catalog::find_by_code(&db, "T-001").unwrap().unwrap().stock.m, 3);
    }

    #[test]
    fn test_return_without_size_does_not_touch_stock() {
        let db = test_db();
        let now = now_millis();
        let mut req = request(now);
        req.size = None;
        register_return(&db, &OperatorContext::new("till-1"), req, now).unwrap();
        assert_eq!(catalog::find_by_code(&db, "T-001").unwrap().unwrap().stock.m, 3);
    }

    #[test]
    fn test_returns_are_immutable() {
        let db = test_db();
        let now = now_millis();
        let saved =
            register_return(&db, &OperatorContext::new("till-1"), request(now), now).unwrap();
        assert!(matches!(
            store::mark_deleted::<Return>(&db, &saved.id),
            Err(PosError::Validation(ValidationError::Immutable("return")))
        ));
    }

    #[test]
    fn test_non_positive_refund_rejected() {
        let db = test_db();
        let now = now_millis();
        let mut req = request(now);
        req.refund_amount = 0;
        assert!(matches!(
            register_return(&db, &OperatorContext::new("till-1"), req, now),
            Err(PosError::Validation(ValidationError::InvalidAmount { .. }))
        ));
    }
}
