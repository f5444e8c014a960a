//! Shift lifecycle and the blind cash count ("arqueo").
//!
//! A shift goes `OPEN → CLOSED`. Sales and returns made while it is open are
//! tagged with its id. Closing is two-phase: [`begin_close`] hands out a
//! [`PendingClose`] that carries no expected figure, the operator submits
//! the counted cash, and only then is the expected cash computed and the
//! variance classified.
//!
//! **Rules:**
//! - at most one active shift per terminal among the shifts opened on this
//!   device (also enforced by a partial unique index); shifts pulled from
//!   other devices never count
//! - opening while one is active, or closing with none active, is a hard error
//! - expected = initial cash + cash sales − returns

use chrono::{DateTime, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, Connection, Row};
use serde::Serialize;
use tracing::{info, warn};
use uuid::Uuid;

use crate::context::OperatorContext;
use crate::db::DbState;
use crate::error::{PosError, Result, ShiftStateError, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{now_millis, PaymentMethod, RecordState, Shift, Table};
use crate::store::{self, int, opt_int, opt_text, opt_ts_col, read_state, text, ts, ts_col, Record};

/// Variances strictly below this (minor units, absolute) count as balanced.
pub const BALANCE_TOLERANCE: i64 = 100;

impl Record for Shift {
    const TABLE: Table = Table::Shifts;
    const ENTITY: &'static str = "shift";
    const COLUMNS: &'static [&'static str] = &[
        "id",
        "terminal_id",
        "opened_by",
        "opened_at",
        "initial_cash",
        "closed_at",
        "counted_cash",
        "expected_cash",
        "variance",
        "active",
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
            terminal_id: row.get(1)?,
            opened_by: row.get(2)?,
            opened_at: ts_col(row, 3)?,
            initial_cash: row.get(4)?,
            closed_at: opt_ts_col(row, 5)?,
            counted_cash: row.get(6)?,
            expected_cash: row.get(7)?,
            variance: row.get(8)?,
            active: row.get(9)?,
            state: read_state(row, 10)?,
        })
    }

    fn bind(&self) -> Vec<SqlValue> {
        vec![
            text(&self.id),
            text(&self.terminal_id),
            opt_text(self.opened_by.as_deref()),
            ts(&self.opened_at),
            int(self.initial_cash),
            self.closed_at.as_ref().map_or(SqlValue::Null, ts),
            opt_int(self.counted_cash),
            opt_int(self.expected_cash),
            opt_int(self.variance),
            int(i64::from(self.active)),
        ]
    }

    fn validate(&self) -> std::result::Result<(), ValidationError> {
        if self.initial_cash < 0 {
            return Err(ValidationError::InvalidAmount {
                field: "initial_cash".into(),
                amount: self.initial_cash,
            });
        }
        if let Some(counted) = self.counted_cash.filter(|c| *c < 0) {
            return Err(ValidationError::InvalidAmount {
                field: "counted_cash".into(),
                amount: counted,
            });
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reconciliation math
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ArqueoStatus {
    Balanced,
    Overage,
    Shortage,
}

impl ArqueoStatus {
    pub fn classify(variance: i64) -> Self {
        if variance.abs() < BALANCE_TOLERANCE {
            ArqueoStatus::Balanced
        } else if variance > 0 {
            ArqueoStatus::Overage
        } else {
            ArqueoStatus::Shortage
        }
    }
}

/// Cash movements of one shift.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct CashTotals {
    pub initial_cash: i64,
    pub cash_sales: i64,
    pub returns_amount: i64,
}

impl CashTotals {
    pub fn expected(&self) -> i64 {
        self.initial_cash + self.cash_sales - self.returns_amount
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArqueoResult {
    pub shift_id: String,
    pub totals: CashTotals,
    pub expected: i64,
    pub counted: i64,
    pub variance: i64,
    pub status: ArqueoStatus,
}

/// Compare a counted figure against the shift's totals.
pub fn reconcile(shift_id: &str, totals: CashTotals, counted: i64) -> ArqueoResult {
    let expected = totals.expected();
    let variance = counted - expected;
    ArqueoResult {
        shift_id: shift_id.to_string(),
        totals,
        expected,
        counted,
        variance,
        status: ArqueoStatus::classify(variance),
    }
}

fn cash_totals(conn: &Connection, shift: &Shift) -> Result<CashTotals> {
    let cash_sales: i64 = conn.query_row(
        "SELECT COALESCE(SUM(total), 0) FROM sales
         WHERE shift_id = ?1 AND payment_method = ?2 AND deleted = 0",
        params![shift.id, PaymentMethod::Cash.as_str()],
        |row| row.get(0),
    )?;
    let returns_amount: i64 = conn.query_row(
        "SELECT COALESCE(SUM(refund_amount), 0) FROM returns
         WHERE shift_id = ?1 AND deleted = 0",
        params![shift.id],
        |row| row.get(0),
    )?;
    Ok(CashTotals {
        initial_cash: shift.initial_cash,
        cash_sales,
        returns_amount,
    })
}

// ---------------------------------------------------------------------------
// Open
// ---------------------------------------------------------------------------

fn active_shift_in(conn: &Connection, terminal_id: &str) -> Result<Option<Shift>> {
    Ok(store::query::<Shift>(
        conn,
        "terminal_id = ?1 AND active = 1 AND opened_here = 1 AND deleted = 0",
        params![terminal_id],
    )?
    .into_iter()
    .next())
}

pub fn active_shift(db: &DbState, terminal_id: &str) -> Result<Option<Shift>> {
    let conn = db.lock()?;
    active_shift_in(&conn, terminal_id)
}

/// Open a shift on the context's terminal with an opening cash float.
pub fn open_shift(db: &DbState, ctx: &OperatorContext, initial_cash: i64) -> Result<Shift> {
    let shift = {
        let conn = db.lock()?;
        let tx = conn.unchecked_transaction()?;
        if let Some(existing) = active_shift_in(&tx, &ctx.terminal_id)? {
            return Err(ShiftStateError::AlreadyOpen {
                terminal_id: ctx.terminal_id.clone(),
                shift_id: existing.id,
            }
            .into());
        }
        let shift = store::upsert_in(
            &tx,
            Shift {
                id: Uuid::new_v4().to_string(),
                terminal_id: ctx.terminal_id.clone(),
                opened_by: ctx.operator_id.clone(),
                opened_at: now_millis(),
                initial_cash,
                closed_at: None,
                counted_cash: None,
                expected_cash: None,
                variance: None,
                active: true,
                state: RecordState::default(),
            },
        )?;
        tx.execute(
            "UPDATE shifts SET opened_here = 1 WHERE id = ?1",
            params![shift.id],
        )?;
        tx.commit()?;
        shift
    };
    info!(
        shift_id = %shift.id,
        terminal_id = %shift.terminal_id,
        opened_by = ?shift.opened_by,
        initial_cash,
        "Shift opened"
    );
    db.emit(StoreEvent::new(Table::Shifts, &shift.id, ChangeKind::Upsert));
    Ok(shift)
}

// ---------------------------------------------------------------------------
// Two-phase close
// ---------------------------------------------------------------------------

/// Phase one of a close. Deliberately carries no expected figure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PendingClose {
    pub shift_id: String,
    pub terminal_id: String,
    pub opened_at: DateTime<Utc>,
}

/// Start closing the active shift on the context's terminal.
pub fn begin_close(db: &DbState, ctx: &OperatorContext) -> Result<PendingClose> {
    let shift = active_shift(db, &ctx.terminal_id)?
        .ok_or_else(|| ShiftStateError::NoneOpen(ctx.terminal_id.clone()))?;
    info!(shift_id = %shift.id, "Shift close started, awaiting blind count");
    Ok(PendingClose {
        shift_id: shift.id,
        terminal_id: shift.terminal_id,
        opened_at: shift.opened_at,
    })
}

impl PendingClose {
    /// Phase two: record the counted cash, then compute and persist the
    /// expected figure and variance.
    pub fn submit_count(self, db: &DbState, counted: i64) -> Result<ArqueoResult> {
        if counted < 0 {
            return Err(ValidationError::InvalidAmount {
                field: "counted_cash".into(),
                amount: counted,
            }
            .into());
        }

        let result = {
            let conn = db.lock()?;
            let tx = conn.unchecked_transaction()?;
            let mut shift = store::get_in::<Shift>(&tx, &self.shift_id)?
                .ok_or_else(|| PosError::not_found("shift", &self.shift_id))?;
            if !shift.active {
                return Err(ShiftStateError::AlreadyClosed(self.shift_id).into());
            }

            let result = reconcile(&shift.id, cash_totals(&tx, &shift)?, counted);
            shift.active = false;
            shift.closed_at = Some(now_millis());
            shift.counted_cash = Some(result.counted);
            shift.expected_cash = Some(result.expected);
            shift.variance = Some(result.variance);
            store::upsert_in(&tx, shift)?;
            tx.commit()?;
            result
        };

        if result.status == ArqueoStatus::Balanced {
            info!(
                shift_id = %result.shift_id,
                expected = result.expected,
                counted = result.counted,
                "Shift closed balanced"
            );
        } else {
            warn!(
                shift_id = %result.shift_id,
                expected = result.expected,
                counted = result.counted,
                variance = result.variance,
                status = ?result.status,
                "Shift closed with cash variance"
            );
        }
        db.emit(StoreEvent::new(Table::Shifts, &result.shift_id, ChangeKind::Upsert));
        Ok(result)
    }
}

// ---------------------------------------------------------------------------
// Summary
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PaymentTotal {
    pub method: PaymentMethod,
    pub count: i64,
    pub amount: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ShiftSummary {
    pub shift: Shift,
    pub sales_count: i64,
    pub sales_total: i64,
    pub by_payment_method: Vec<PaymentTotal>,
    pub returns_count: i64,
    pub returns_total: i64,
}

/// Totals for a shift. Expected cash is only known once the shift is closed.
pub fn shift_summary(db: &DbState, shift_id: &str) -> Result<ShiftSummary> {
    let conn = db.lock()?;
    let shift = store::get_in::<Shift>(&conn, shift_id)?
        .ok_or_else(|| PosError::not_found("shift", shift_id))?;

    let mut stmt = conn.prepare(
        "SELECT payment_method, COUNT(*), COALESCE(SUM(total), 0) FROM sales
         WHERE shift_id = ?1 AND deleted = 0
         GROUP BY payment_method ORDER BY payment_method",
    )?;
    let by_payment_method = stmt
        .query_map(params![shift_id], |row| {
            Ok(PaymentTotal {
                method: row.get(0)?,
                count: row.get(1)?,
                amount: row.get(2)?,
            })
        })?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let (returns_count, returns_total): (i64, i64) = conn.query_row(
        "SELECT COUNT(*), COALESCE(SUM(refund_amount), 0) FROM returns
         WHERE shift_id = ?1 AND deleted = 0",
        params![shift_id],
        |row| Ok((row.get(0)?, row.get(1)?)),
    )?;

    Ok(ShiftSummary {
        sales_count: by_payment_method.iter().map(|p| p.count).sum(),
        sales_total: by_payment_method.iter().map(|p| p.amount).sum(),
        by_payment_method,
        returns_count,
        returns_total,
        shift,
    })
}

// ===========================================================================
// Tests
// ===========================================================================
