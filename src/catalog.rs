//! Catalog items and per-size stock bookkeeping.
//!
//! **Rules:**
//! - `total` always equals the sum of the five size buckets
//! - buckets never go below zero; `adjust_stock` clamps at 0
//! - identity codes are unique among live items and at most 15 characters
//!
//! Stock adjustments are read-modify-write under the store lock, so two
//! adjustments inside one process never interleave. Terminals sharing the
//! remote still race; the last pushed write wins.

use rusqlite::types::Value as SqlValue;
use rusqlite::{Connection, Row};
use tracing::{info, warn};

use crate::db::DbState;
use crate::error::{PosError, Result, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{CatalogItem, RecordState, SizeBucket, SizeStock, Table, MAX_CODE_LEN};
use crate::store::{self, int, read_state, text, Record};

impl Record for CatalogItem {
    const TABLE: Table = Table::CatalogItems;
    const ENTITY: &'static str = "catalog item";
    const COLUMNS: &'static [&'static str] = &[
        "code",
        "title",
        "price",
        "xs",
        "s",
        "m",
        "l",
        "xl",
        "total",
        "gender",
        "description",
    ];

    fn key(&self) -> String {
        self.code.clone()
    }

    fn state(&self) -> &RecordState {
        &self.state
    }

    fn state_mut(&mut self) -> &mut RecordState {
        &mut self.state
    }

    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            code: row.get(0)?,
            title: row.get(1)?,
            price: row.get(2)?,
            stock: SizeStock {
                xs: row.get(3)?,
                s: row.get(4)?,
                m: row.get(5)?,
                l: row.get(6)?,
                xl: row.get(7)?,
            },
            total: row.get(8)?,
            gender: row.get(9)?,
            description: row.get(10)?,
            state: read_state(row, 11)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.code),
            text(&self.title),
            int(self.price),
            int(self.stock.xs),
            int(self.stock.s),
            int(self.stock.m),
            int(self.stock.l),
            int(self.stock.xl),
            int(self.total),
            text(self.gender.as_str()),
            text(&self.description),
        ]
    }

    fn normalize(&mut self) {
        self.code = self.code.trim().to_string();
        self.total = self.stock.total();
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        validate_code(&self.code)?;
        if self.price < 0 {
            return Err(ValidationError::InvalidAmount {
                field: "price".into(),
                amount: self.price,
            });
        }
        for bucket in SizeBucket::ALL {
            let count = self.stock.get(bucket);
            if count < 0 {
                return Err(ValidationError::InvalidQuantity {
                    field: format!("stock.{bucket}"),
                    quantity: count,
                });
            }
        }
        Ok(())
    }
}

fn validate_code(code: &str) -> std::result::Result<(), ValidationError> {
    if code.is_empty() {
        return Err(ValidationError::EmptyCode);
    }
    if code.chars().count() > MAX_CODE_LEN {
        return Err(ValidationError::CodeTooLong {
            code: code.to_string(),
            max: MAX_CODE_LEN,
        });
    }
    Ok(())
}

fn live_item(conn: &Connection, code: &str) -> Result<Option<CatalogItem>> {
    Ok(store::get_in::<CatalogItem>(conn, code)?.filter(|i| !i.state.deleted))
}

// ---------------------------------------------------------------------------
// Catalog CRUD
// ---------------------------------------------------------------------------

/// Create a new item. Fails if a live item already uses the code.
pub fn create_item(db: &DbState, item: CatalogItem) -> Result<CatalogItem> {
    let saved = {
        let conn = db.lock()?;
        let code = item.code.trim();
        if live_item(&conn, code)?.is_some() {
            return Err(ValidationError::DuplicateCode(code.to_string()).into());
        }
        store::upsert_in(&conn, item)?
    };
    info!(code = %saved.code, total = saved.total, "Catalog item created");
    db.emit(StoreEvent::new(Table::CatalogItems, &saved.code, ChangeKind::Upsert));
    Ok(saved)
}

/// Save an edited item (insert-or-replace by code).
pub fn save_item(db: &DbState, item: CatalogItem) -> Result<CatalogItem> {
    store::upsert(db, item)
}

pub fn find_by_code(db: &DbState, code: &str) -> Result<Option<CatalogItem>> {
    store::get(db, code.trim())
}

pub fn list_items(db: &DbState) -> Result<Vec<CatalogItem>> {
    store::list(db)
}

/// Soft-delete; the remote copy is hard-deleted on the next push.
pub fn delete_item(db: &DbState, code: &str) -> Result<()> {
    store::mark_deleted::<CatalogItem>(db, code.trim())
}

/// Upsert a batch (bulk import target). All-or-nothing: one invalid row
/// rejects the whole batch.
pub fn bulk_upsert(db: &DbState, items: Vec<CatalogItem>) -> Result<usize> {
    let codes = {
        let conn = db.lock()?;
        let tx = conn.unchecked_transaction()?;
        let mut codes = Vec::with_capacity(items.len());
        for item in items {
            let saved = store::upsert_in(&tx, item)?;
            codes.push(saved.code);
        }
        tx.commit()?;
        codes
    };
    info!(count = codes.len(), "Catalog bulk upsert committed");
    for code in &codes {
        db.emit(StoreEvent::new(Table::CatalogItems, code, ChangeKind::Upsert));
    }
    Ok(codes.len())
}

/// Change an item's identity code.
///
/// The old record is removed physically when it never reached the remote,
/// otherwise it is tombstoned so the remote copy gets deleted too.
pub fn rename_code(db: &DbState, old_code: &str, new_code: &str) -> Result<CatalogItem> {
    let old_code = old_code.trim();
    let new_code = new_code.trim();
    validate_code(new_code)?;

    let renamed = {
        let conn = db.lock()?;
        let existing =
            live_item(&conn, old_code)?.ok_or_else(|| PosError::not_found("catalog item", old_code))?;
        if old_code == new_code {
            return Ok(existing);
        }
        if live_item(&conn, new_code)?.is_some() {
            return Err(ValidationError::DuplicateCode(new_code.to_string()).into());
        }

        let tx = conn.unchecked_transaction()?;
        let mut replacement = existing.clone();
        replacement.code = new_code.to_string();
        replacement.state = RecordState::default();
        let replacement = store::upsert_in(&tx, replacement)?;

        if existing.state.synced_once {
            let mut tombstone = existing;
            tombstone.state.deleted = true;
            store::upsert_in(&tx, tombstone)?;
        } else {
            tx.execute(
                "DELETE FROM catalog_items WHERE code = ?1",
                rusqlite::params![old_code],
            )?;
        }
        tx.commit()?;
        replacement
    };

    info!(old = %old_code, new = %new_code, "Catalog item code renamed");
    db.emit(StoreEvent::new(Table::CatalogItems, old_code, ChangeKind::Delete));
    db.emit(StoreEvent::new(Table::CatalogItems, new_code, ChangeKind::Upsert));
    Ok(renamed)
}

// ---------------------------------------------------------------------------
// Stock ledger
// ---------------------------------------------------------------------------

/// Adjust one size bucket by `delta`, clamping the result at zero.
///
/// Recomputes the total, stamps the timestamp and marks the item dirty.
pub fn adjust_stock(
    db: &DbState,
    code: &str,
    bucket: SizeBucket,
    delta: i64,
) -> Result<CatalogItem> {
    let item = {
        let conn = db.lock()?;
        adjust_stock_in(&conn, code, bucket, delta)?
    };
    db.emit(StoreEvent::new(Table::CatalogItems, &item.code, ChangeKind::Upsert));
    Ok(item)
}

/// Same as [`adjust_stock`] on an already-locked connection, so checkout and
/// returns can include it in their own transaction.
pub(crate) fn adjust_stock_in(
    conn: &Connection,
    code: &str,
    bucket: SizeBucket,
    delta: i64,
) -> Result<CatalogItem> {
    let code = code.trim();
    let mut item =
        live_item(conn, code)?.ok_or_else(|| PosError::not_found("catalog item", code))?;
    let current = item.stock.get(bucket);
    let requested = current.saturating_add(delta);
    if requested < 0 {
        warn!(
            code = %code,
            size = %bucket,
            current,
            delta,
            "Stock adjustment would go negative, clamping at 0"
        );
    }
    item.stock.set(bucket, requested.max(0));
    let item = store::upsert_in(conn, item)?;
    info!(
        code = %code,
        size = %bucket,
        delta,
        bucket_after = item.stock.get(bucket),
        total_after = item.total,
        "Stock adjusted"
    );
    Ok(item)
}

// ===========================================================================
// Tests
// ===========================================================================
