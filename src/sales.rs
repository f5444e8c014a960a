//! Checkout: sales, sale lines and the in-flight cart draft.
//!
//! **Rules:**
//! - cart entries with the same (product, size) collapse into one line
//! - every quantity must be positive
//! - stock is re-checked right before it is decremented
//! - sale, lines and stock decrements commit in one local transaction
//! - sales are never edited or deleted; corrections are returns
//!
//! The register keeps the cart it is building in the `pending_sale` meta
//! entry so an interrupted sale survives a restart.

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use crate::catalog;
use crate::context::OperatorContext;
use crate::db::{self, DbState, META_PENDING_SALE};
use crate::error::{PosError, Result, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{
    now_millis, CatalogItem, PaymentMethod, RecordState, Sale, SaleLine, SizeBucket, Table,
};
use crate::store::{self, int, opt_text, read_state, text, Record};

impl Record for Sale {
    const TABLE: Table = Table::Sales;
    const ENTITY: &'static str = "sale";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "total",
        "item_count",
        "payment_method",
        "shift_id",
        "customer_id",
        "employee_id",
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
            total: row.get(1)?,
            item_count: row.get(2)?,
            payment_method: row.get(3)?,
            shift_id: row.get(4)?,
            customer_id: row.get(5)?,
            employee_id: row.get(6)?,
            state: read_state(row, 7)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            int(self.total),
            int(self.item_count),
            text(self.payment_method.as_str()),
            opt_text(self.shift_id.as_deref()),
            opt_text(self.customer_id.as_deref()),
            opt_text(self.employee_id.as_deref()),
        ]
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.total < 0 {
            return Err(ValidationError::InvalidAmount {
                field: "total".into(),
                amount: self.total,
            });
        }
        if self.item_count <= 0 {
            return Err(ValidationError::InvalidQuantity {
                field: "item_count".into(),
                quantity: self.item_count,
            });
        }
        Ok(())
    }
}

impl Record for SaleLine {
    const TABLE: Table = Table::SaleLines;
    const ENTITY: &'static str = "sale line";
    const COLUMNS: &'static [&'static str] = &[
        "line_id",
        "seq",
        "sale_id",
        "line_no",
        "product_code",
        "size",
        "quantity",
        "unit_price",
    ];
    const DELETABLE: bool = false;

    fn key(&self) -> String {
        self.line_id.clone()
    }

    fn state(&self) -> &RecordState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            line_id: row.get(0)?,
            seq: row.get(1)?,
            sale_id: row.get(2)?,
            line_no: row.get(3)?,
            product_code: row.get(4)?,
            size: row.get(5)?,
            quantity: row.get(6)?,
            unit_price: row.get(7)?,
            state: read_state(row, 8)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.line_id),
            int(self.seq),
            text(&self.sale_id),
            int(self.line_no),
            text(&self.product_code),
            text(self.size.as_str()),
            int(self.quantity),
            int(self.unit_price),
        ]
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.quantity <= 0 {
            return Err(ValidationError::InvalidQuantity {
                field: format!("line {}", self.line_id),
                quantity: self.quantity,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Cart
// ---------------------------------------------------------------------------

/// One scanned entry in the register's cart. Unit price comes from the
/// catalog at checkout time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CartEntry {
    pub product_code: String,
    pub size: SizeBucket,
    pub quantity: i64,
}

impl CartEntry {
    pub fn new(product_code: impl Into<String>, size: SizeBucket, quantity: i64) -> Self {
        Self {
            product_code: product_code.into(),
            size,
            quantity,
        }
    }
}

/// The cart being built, persisted under `pending_sale`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaleDraft {
    pub entries: Vec<CartEntry>,
    #[serde(default)]
    pub customer_id: Option<String>,
    #[serde(default)]
    pub payment_method: Option<PaymentMethod>,
    pub saved_at: DateTime<Utc>,
}

/// Merge entries with the same (product, size), keeping first-seen order.
pub fn collapse_cart(cart: &[CartEntry]) -> Result<Vec<CartEntry>> {
    if cart.is_empty() {
        return Err(ValidationError::EmptyCart.into());
    }
    let mut lines: Vec<CartEntry> = Vec::with_capacity(cart.len());
    for entry in cart {
        if entry.quantity <= 0 {
            return Err(ValidationError::InvalidQuantity {
                field: format!("{} {}", entry.product_code.trim(), entry.size),
                quantity: entry.quantity,
            }
            .into());
        }
        let code = entry.product_code.trim();
        match lines
            .iter_mut()
            .find(|l| l.product_code == code && l.size == entry.size)
        {
            Some(line) => {
                line.quantity = line.quantity.checked_add(entry.quantity).ok_or_else(|| {
                    ValidationError::Overflow {
                        field: format!("quantity of {code} {}", entry.size),
                    }
                })?
            }
            None => lines.push(CartEntry::new(code, entry.size, entry.quantity)),
        }
    }
    Ok(lines)
}

/// Time-seeded and strictly increasing locally. Only orders lines; identity
/// is the line id.
fn next_line_seq(conn: &Connection) -> Result<i64> {
    let local_next: i64 = conn.query_row(
        "SELECT COALESCE(MAX(seq), 0) + 1 FROM sale_lines",
        [],
        |row| row.get(0),
    )?;
    let seeded = now_millis().timestamp_millis().saturating_mul(100);
    Ok(local_next.max(seeded))
}

// ---------------------------------------------------------------------------
// Checkout
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckoutReceipt {
    pub sale: Sale,
    pub lines: Vec<SaleLine>,
}

/// Persist a sale for `cart`, decrementing stock for every line.
///
/// Stock is re-validated inside the transaction; if any line is short the
/// whole sale is rejected and nothing is written.
pub fn checkout(
    db: &DbState,
    ctx: &OperatorContext,
    cart: &[CartEntry],
    payment_method: PaymentMethod,
    customer_id: Option<&str>,
) -> Result<CheckoutReceipt> {
    let entries = collapse_cart(cart)?;

    let (receipt, touched) = {
        let conn = db.lock()?;
        let tx = conn.unchecked_transaction()?;

        let mut priced: Vec<(CartEntry, CatalogItem)> = Vec::with_capacity(entries.len());
        for entry in entries {
            let item = store::get_in::<CatalogItem>(&tx, &entry.product_code)?
                .filter(|i| !i.state.deleted)
                .ok_or_else(|| PosError::not_found("catalog item", &entry.product_code))?;
            let available = item.stock.get(entry.size);
            if entry.quantity > available {
                return Err(ValidationError::InsufficientStock {
                    code: entry.product_code.clone(),
                    size: entry.size.to_string(),
                    requested: entry.quantity,
                    available,
                }
                .into());
            }
            priced.push((entry, item));
        }

        let mut total: i64 = 0;
        let mut item_count: i64 = 0;
        for (entry, item) in &priced {
            total = entry
                .quantity
                .checked_mul(item.price)
                .and_then(|amount| total.checked_add(amount))
                .ok_or_else(|| ValidationError::Overflow { field: "sale total".into() })?;
            item_count = item_count
                .checked_add(entry.quantity)
                .ok_or_else(|| ValidationError::Overflow { field: "item count".into() })?;
        }

        let sale = Sale {
            id: Uuid::new_v4().to_string(),
            total,
            item_count,
            payment_method,
            shift_id: ctx.shift_id.clone(),
            customer_id: customer_id
                .map(str::trim)
                .filter(|c| !c.is_empty())
                .map(String::from),
            employee_id: ctx.operator_id.clone(),
            state: RecordState::default(),
        };
        let sale = store::upsert_in(&tx, sale)?;

        let mut seq = next_line_seq(&tx)?;
        let mut lines = Vec::with_capacity(priced.len());
        let mut touched = Vec::with_capacity(priced.len());
        for (line_no, (entry, item)) in (1_i64..).zip(priced) {
            let line = store::upsert_in(
                &tx,
                SaleLine {
                    line_id: format!("{}:{line_no}", sale.id),
                    seq,
                    sale_id: sale.id.clone(),
                    line_no,
                    product_code: entry.product_code.clone(),
                    size: entry.size,
                    quantity: entry.quantity,
                    unit_price: item.price,
                    state: RecordState::default(),
                },
            )?;
            catalog::adjust_stock_in(&tx, &entry.product_code, entry.size, -entry.quantity)?;
            touched.push(entry.product_code);
            lines.push(line);
            seq += 1;
        }

        db::delete_meta(&tx, META_PENDING_SALE)?;
        tx.commit()?;
        (CheckoutReceipt { sale, lines }, touched)
    };

    info!(
        sale_id = %receipt.sale.id,
        total = receipt.sale.total,
        items = receipt.sale.item_count,
        lines = receipt.lines.len(),
        payment = %receipt.sale.payment_method,
        shift_id = ?receipt.sale.shift_id,
        terminal_id = %ctx.terminal_id,
        "Sale completed"
    );

    db.emit(StoreEvent::new(Table::Sales, &receipt.sale.id, ChangeKind::Upsert));
    for line in &receipt.lines {
        db.emit(StoreEvent::new(Table::SaleLines, &line.line_id, ChangeKind::Upsert));
    }
    for code in touched {
        db.emit(StoreEvent::new(Table::CatalogItems, code, ChangeKind::Upsert));
    }
    Ok(receipt)
}

pub fn list_sales(db: &DbState) -> Result<Vec<Sale>> {
    store::list(db)
}

pub fn sale_lines(db: &DbState, sale_id: &str) -> Result<Vec<SaleLine>> {
    let conn = db.lock()?;
    store::query(
        &conn,
        "sale_id = ?1 AND deleted = 0 ORDER BY line_no",
        params![sale_id],
    )
}

// ---------------------------------------------------------------------------
// Draft (pending_sale)
// ---------------------------------------------------------------------------

pub fn save_draft(db: &DbState, draft: &SaleDraft) -> Result<()> {
    let json = serde_json::to_string(draft)?;
    let conn = db.lock()?;
    db::set_meta(&conn, META_PENDING_SALE, &json)
}

/// Load the saved cart. A draft that no longer parses is discarded.
pub fn load_draft(db: &DbState) -> Result<Option<SaleDraft>> {
    let conn = db.lock()?;
    let Some(raw) = db::get_meta(&conn, META_PENDING_SALE)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(draft) => Ok(Some(draft)),
        Err(e) => {
            warn!("Discarding unreadable pending sale draft: {e}");
            db::delete_meta(&conn, META_PENDING_SALE)?;
            Ok(None)
        }
    }
}

pub fn clear_draft(db: &DbState) -> Result<()> {
    let conn = db.lock()?;
    db::delete_meta(&conn, META_PENDING_SALE)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> DbState {
        let db = DbState::open_in_memory().expect("open in-memory db");
        catalog::create_item(
            &db,
            CatalogItem::new("T-001", "Basic tee", 25000)
                .with_stock(SizeBucket::M, 10)
                .with_stock(SizeBucket::L, 1),
        )
        .unwrap();
        catalog::create_item(
            &db,
            CatalogItem::new("J-002", "Denim jacket", 120000).with_stock(SizeBucket::S, 2),
        )
        .unwrap();
        db
    }

    fn ctx() -> OperatorContext {
        OperatorContext::new("till-1")
            .with_operator("op-7")
            .with_shift("shift-1")
    }

    #[test]
    fn test_collapse_merges_same_product_and_size() {
        let cart = vec![
            CartEntry::new("T-001", SizeBucket::M, 1),
            CartEntry::new("J-002", SizeBucket::S, 1),
            CartEntry::new(" T-001", SizeBucket::M, 2),
            CartEntry::new("T-001", SizeBucket::L, 1),
        ];
        let lines = collapse_cart(&cart).unwrap();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], CartEntry::new("T-001", SizeBucket::M, 3));
        assert_eq!(lines[2], CartEntry::new("T-001", SizeBucket::L, 1));
    }

    #[test]
    fn test_collapse_rejects_empty_and_non_positive() {
        assert!(matches!(
            collapse_cart(&[]),
            Err(PosError::Validation(ValidationError::EmptyCart))
        ));
        assert!(matches!(
            collapse_cart(&[CartEntry::new("T-001", SizeBucket::M, 0)]),
            Err(PosError::Validation(ValidationError::InvalidQuantity { .. }))
        ));
    }

    #[test]
    fn test_checkout_creates_sale_lines_and_decrements_stock() {
        let db = test_db();
        let cart = vec![
            CartEntry::new("T-001", SizeBucket::M, 1),
            CartEntry::new("T-001", SizeBucket::M, 1),
            CartEntry::new("J-002", SizeBucket::S, 1),
        ];
        let receipt = checkout(&db, &ctx(), &cart, PaymentMethod::Cash, Some("1020")).unwrap();

        assert_eq!(receipt.sale.total, 2 * 25000 + 120000);
        assert_eq!(receipt.sale.item_count, 3);
        assert_eq!(receipt.sale.shift_id.as_deref(), Some("shift-1"));
        assert_eq!(receipt.sale.employee_id.as_deref(), Some("op-7"));
        assert_eq!(receipt.lines.len(), 2);
        assert!(receipt.lines[1].seq > receipt.lines[0].seq);
        assert_eq!(receipt.lines[0].line_no, 1);
        assert_eq!(receipt.lines[1].line_id, format!("{}:2", receipt.sale.id));

        let tee = catalog::find_by_code(&db, "T-001").unwrap().unwrap();
        assert_eq!(tee.stock.m, 8);
        assert_eq!(tee.total, 9);
        assert!(tee.state.dirty);

        assert_eq!(sale_lines(&db, &receipt.sale.id).unwrap().len(), 2);
        assert_eq!(list_sales(&db).unwrap().len(), 1);
    }

    #[test]
    fn test_collapse_rejects_quantity_overflow() {
        let cart = vec![
            CartEntry::new("T-001", SizeBucket::M, i64::MAX),
            CartEntry::new("T-001", SizeBucket::M, 1),
        ];
        assert!(matches!(
            collapse_cart(&cart),
            Err(PosError::Validation(ValidationError::Overflow { .. }))
        ));
    }

    #[test]
    fn test_checkout_rejects_total_overflow() {
        let db = test_db();
        catalog::create_item(
            &db,
            CatalogItem::new("GOLD", "Gold coat", i64::MAX / 2).with_stock(SizeBucket::M, 3),
        )
        .unwrap();
        let err = checkout(
            &db,
            &ctx(),
            &[CartEntry::new("GOLD", SizeBucket::M, 3)],
            PaymentMethod::Card,
            None,
        )
        .unwrap_err();
        assert!(matches!(err, PosError::Validation(ValidationError::Overflow { .. })));
        assert!(list_sales(&db).unwrap().is_empty());
        assert_eq!(catalog::find_by_code(&db, "GOLD").unwrap().unwrap().stock.m, 3);
    }

    #[test]
    fn test_lines_with_equal_seq_from_two_sales_both_persist() {
        let db = test_db();
        let line = |sale_id: &str| SaleLine {
            line_id: format!("{sale_id}:1"),
            seq: 177_000_000_000_000,
            sale_id: sale_id.into(),
            line_no: 1,
            product_code: "T-001".into(),
            size: SizeBucket::M,
            quantity: 1,
            unit_price: 25000,
            state: RecordState::default(),
        };
        store::upsert(&db, line("sale-a")).unwrap();
        store::upsert(&db, line("sale-b")).unwrap();
        assert_eq!(sale_lines(&db, "sale-a").unwrap().len(), 1);
        assert_eq!(sale_lines(&db, "sale-b").unwrap().len(), 1);
    }

    #[test]
    fn test_checkout_rejects_oversell_and_writes_nothing() {
        let db = test_db();
        let cart = vec![
            CartEntry::new("T-001", SizeBucket::M, 1),
            CartEntry::new("T-001", SizeBucket::L, 1),
            CartEntry::new("T-001", SizeBucket::L, 1),
        ];
        let err = checkout(&db, &ctx(), &cart, PaymentMethod::Card, None).unwrap_err();
        assert!(matches!(
            err,
            PosError::Validation(ValidationError::InsufficientStock {
                requested: 2,
                available: 1,
                ..
            })
        ));
        assert!(list_sales(&db).unwrap().is_empty());
        assert_eq!(catalog::find_by_code(&db, "T-001").unwrap().unwrap().stock.m, 10);
    }

    #[test]
    fn test_sales_cannot_be_deleted() {
        let db = test_db();
        let receipt = checkout(
            &db,
            &ctx(),
            &[CartEntry::new("J-002", SizeBucket::S, 1)],
            PaymentMethod::Transfer,
            None,
        )
        .unwrap();
        assert!(matches!(
            store::mark_deleted::<Sale>(&db, &receipt.sale.id),
            Err(PosError::Validation(ValidationError::Immutable("sale")))
        ));
    }

    #[test]
    fn test_draft_round_trip_and_cleared_by_checkout() {
        let db = test_db();
        assert_eq!(load_draft(&db).unwrap(), None);

        let draft = SaleDraft {
            entries: vec![CartEntry::new("T-001", SizeBucket::M, 2)],
            customer_id: Some("1020".into()),
            payment_method: Some(PaymentMethod::Cash),
            saved_at: now_millis(),
        };
        save_draft(&db, &draft).unwrap();
        assert_eq!(load_draft(&db).unwrap(), Some(draft.clone()));

        checkout(&db, &ctx(), &draft.entries, PaymentMethod::Cash, None).unwrap();
        assert_eq!(load_draft(&db).unwrap(), None);
    }

    #[test]
    fn test_unreadable_draft_is_discarded() {
        let db = test_db();
        {
            let conn = db.lock().unwrap();
            db::set_meta(&conn, META_PENDING_SALE, "{not json").unwrap();
        }
        assert_eq!(load_draft(&db).unwrap(), None);
        clear_draft(&db).unwrap();
    }
}
