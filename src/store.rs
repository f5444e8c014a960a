//! Generic record persistence over the synced tables.
//!
//! Every entity implements [`Record`]; the functions here give the UI and the
//! sync engine one CRUD surface: `list`, `get`, `upsert` (local, marks dirty),
//! `upsert_clean` (pulled or realtime data), `mark_deleted`, `get_dirty`,
//! `mark_clean`, and `purge` (physical removal). The `_if_unchanged` variants
//! let the sync engine skip rows edited again while a push was in flight.

use chrono::{DateTime, Duration, Utc};
use rusqlite::types::Value as SqlValue;
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use tracing::debug;

use crate::db::DbState;
use crate::error::{Result, ValidationError};
use crate::live::{ChangeKind, StoreEvent};
use crate::models::{format_ts, now_millis, parse_ts, RecordState, Table};

/// Bookkeeping columns appended after each entity's own columns.
const STATE_COLUMNS: [&str; 5] = ["dirty", "deleted", "synced_once", "created_at", "updated_at"];

/// A row in one of the synced tables.
pub trait Record: Sized + Clone + Send + Sync + 'static {
    const TABLE: Table;
    /// Human-readable entity name for errors and logs.
    const ENTITY: &'static str;
    /// Entity columns in bind/read order. The key column comes first.
    const COLUMNS: &'static [&'static str];
    /// Returns and sales are never removed, only compensated.
    const DELETABLE: bool = true;

    fn key(&self) -> String;
    fn state(&self) -> &RecordState;
    fn state_mut(&mut self) -> &mut RecordState;

    /// Build from a row whose first `COLUMNS.len()` values are the entity
    /// columns, followed by the state columns.
    fn from_row(row: &Row<'_>) -> rusqlite::Result<Self>;

    /// Values in `COLUMNS` order.
    fn bind(&self) -> Vec<SqlValue>;

    /// Re-derive computed fields before any write.
    fn normalize(&mut self) {}

    /// Reject malformed local writes. Clean writes skip this.
    fn validate(&self) -> std::result::Result<(), ValidationError> {
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// SQL helpers
// ---------------------------------------------------------------------------

pub(crate) fn text(value: impl Into<String>) -> SqlValue {
    SqlValue::Text(value.into())
}

pub(crate) fn opt_text<S: AsRef<str>>(value: Option<S>) -> SqlValue {
    value.map_or(SqlValue::Null, |v| SqlValue::Text(v.as_ref().to_string()))
}

pub(crate) fn int(value: i64) -> SqlValue {
    SqlValue::Integer(value)
}

pub(crate) fn opt_int(value: Option<i64>) -> SqlValue {
    value.map_or(SqlValue::Null, SqlValue::Integer)
}

pub(crate) fn ts(value: &DateTime<Utc>) -> SqlValue {
    SqlValue::Text(format_ts(value))
}

/// Read an RFC 3339 timestamp column.
pub(crate) fn ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    parse_ts(&raw).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            idx,
            rusqlite::types::Type::Text,
            format!("invalid timestamp '{raw}'").into(),
        )
    })
}

pub(crate) fn opt_ts_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<DateTime<Utc>>> {
    match row.get::<_, Option<String>>(idx)? {
        None => Ok(None),
        Some(_) => ts_col(row, idx).map(Some),
    }
}

/// Read the trailing state columns that follow `offset` entity columns.
pub(crate) fn read_state(row: &Row<'_>, offset: usize) -> rusqlite::Result<RecordState> {
    Ok(RecordState {
        dirty: row.get(offset)?,
        deleted: row.get(offset + 1)?,
        synced_once: row.get(offset + 2)?,
        created_at: ts_col(row, offset + 3)?,
        updated_at: ts_col(row, offset + 4)?,
    })
}

fn select_list<R: Record>() -> String {
    R::COLUMNS
        .iter()
        .chain(STATE_COLUMNS.iter())
        .copied()
        .collect::<Vec<_>>()
        .join(", ")
}

fn select_sql<R: Record>(where_clause: &str) -> String {
    format!(
        "SELECT {} FROM {} WHERE {where_clause}",
        select_list::<R>(),
        R::TABLE.name()
    )
}

fn upsert_sql<R: Record>() -> String {
    let columns: Vec<&str> = R::COLUMNS
        .iter()
        .chain(STATE_COLUMNS.iter())
        .copied()
        .collect();
    let placeholders: Vec<String> = (1..=columns.len()).map(|i| format!("?{i}")).collect();
    let key = R::TABLE.key_column();
    let updates: Vec<String> = columns
        .iter()
        .filter(|c| **c != key && **c != "created_at")
        .map(|c| format!("{c} = excluded.{c}"))
        .collect();
    format!(
        "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({key}) DO UPDATE SET {}",
        R::TABLE.name(),
        columns.join(", "),
        placeholders.join(", "),
        updates.join(", ")
    )
}

fn bind_all<R: Record>(record: &R) -> Vec<SqlValue> {
    let state = record.state();
    let mut values = record.bind();
    values.push(SqlValue::Integer(i64::from(state.dirty)));
    values.push(SqlValue::Integer(i64::from(state.deleted)));
    values.push(SqlValue::Integer(i64::from(state.synced_once)));
    values.push(ts(&state.created_at));
    values.push(ts(&state.updated_at));
    values
}

// ---------------------------------------------------------------------------
// Connection-level operations (usable inside a caller's transaction)
// ---------------------------------------------------------------------------

pub(crate) fn query<R: Record>(
    conn: &Connection,
    where_clause: &str,
    params: impl rusqlite::Params,
) -> Result<Vec<R>> {
    let mut stmt = conn.prepare(&select_sql::<R>(where_clause))?;
    let rows = stmt.query_map(params, R::from_row)?;
    Ok(rows.collect::<rusqlite::Result<Vec<R>>>()?)
}

/// Lookup by identity, tombstones included.
pub(crate) fn get_in<R: Record>(conn: &Connection, key: &str) -> Result<Option<R>> {
    let sql = select_sql::<R>(&format!("{} = ?1", R::TABLE.key_column()));
    Ok(conn.query_row(&sql, params![key], R::from_row).optional()?)
}

/// Write the record exactly as given (state included).
pub(crate) fn write_in<R: Record>(conn: &Connection, record: &R) -> Result<()> {
    conn.execute(&upsert_sql::<R>(), params_from_iter(bind_all(record)))?;
    Ok(())
}

/// Next local `updated_at` for a row last stamped at `prev`. Strictly
/// after `prev`, so an edit in the same millisecond as a push snapshot is
/// still seen as a change.
pub(crate) fn next_stamp(prev: Option<DateTime<Utc>>, now: DateTime<Utc>) -> DateTime<Utc> {
    match prev {
        Some(prev) if prev >= now => prev + Duration::milliseconds(1),
        _ => now,
    }
}

/// Local write: validate, normalize, stamp, mark dirty.
pub(crate) fn upsert_in<R: Record>(conn: &Connection, record: R) -> Result<R> {
    upsert_at_in(conn, record, now_millis())
}

/// Local write stamped at `now` instead of the wall clock.
pub(crate) fn upsert_at_in<R: Record>(
    conn: &Connection,
    mut record: R,
    now: DateTime<Utc>,
) -> Result<R> {
    record.normalize();
    record.validate()?;
    let existing: Option<R> = get_in(conn, &record.key())?;
    let state = record.state_mut();
    state.dirty = true;
    state.updated_at = next_stamp(existing.as_ref().map(|p| p.state().updated_at), now);
    match existing {
        Some(prev) => {
            state.created_at = prev.state().created_at;
            state.synced_once = prev.state().synced_once;
        }
        None => state.created_at = now,
    }
    write_in(conn, &record)?;
    Ok(record)
}

/// Remote-confirmed write: dirty stays 0 and the remote timestamp is kept.
pub(crate) fn upsert_clean_in<R: Record>(conn: &Connection, mut record: R) -> Result<R> {
    record.normalize();
    let state = record.state_mut();
    state.dirty = false;
    state.deleted = false;
    state.synced_once = true;
    write_in(conn, &record)?;
    Ok(record)
}

// ---------------------------------------------------------------------------
// Store API
// ---------------------------------------------------------------------------

/// All non-deleted records.
pub fn list<R: Record>(db: &DbState) -> Result<Vec<R>> {
    let conn = db.lock()?;
    query(&conn, "deleted = 0", [])
}

/// Lookup by identity; tombstoned records are reported as absent.
pub fn get<R: Record>(db: &DbState, key: &str) -> Result<Option<R>> {
    let conn = db.lock()?;
    Ok(get_in::<R>(&conn, key)?.filter(|r| !r.state().deleted))
}

/// Local write. Always succeeds offline; the record is marked dirty.
pub fn upsert<R: Record>(db: &DbState, record: R) -> Result<R> {
    let saved = {
        let conn = db.lock()?;
        upsert_in(&conn, record)?
    };
    db.emit(StoreEvent::new(R::TABLE, saved.key(), ChangeKind::Upsert));
    Ok(saved)
}

/// Write remote-confirmed data (pull or realtime) without marking it dirty.
pub fn upsert_clean<R: Record>(db: &DbState, record: R) -> Result<R> {
    let saved = {
        let conn = db.lock()?;
        upsert_clean_in(&conn, record)?
    };
    db.emit(StoreEvent::new(R::TABLE, saved.key(), ChangeKind::Upsert));
    Ok(saved)
}

/// Tombstone a record so the deletion propagates on the next push.
pub fn mark_deleted<R: Record>(db: &DbState, key: &str) -> Result<()> {
    if !R::DELETABLE {
        return Err(ValidationError::Immutable(R::ENTITY).into());
    }
    let changed = {
        let conn = db.lock()?;
        match get_in::<R>(&conn, key)?.filter(|r| !r.state().deleted) {
            Some(prev) => conn.execute(
                &format!(
                    "UPDATE {} SET deleted = 1, dirty = 1, updated_at = ?1 WHERE {} = ?2 AND deleted = 0",
                    R::TABLE.name(),
                    R::TABLE.key_column()
                ),
                params![
                    format_ts(&next_stamp(Some(prev.state().updated_at), now_millis())),
                    key
                ],
            )?,
            None => 0,
        }
    };
    if changed == 0 {
        return Err(crate::error::PosError::not_found(R::ENTITY, key));
    }
    debug!(table = %R::TABLE, key, "Record tombstoned");
    db.emit(StoreEvent::new(R::TABLE, key, ChangeKind::Delete));
    Ok(())
}

/// Every record with dirty = 1, tombstones included.
pub fn get_dirty<R: Record>(db: &DbState) -> Result<Vec<R>> {
    let conn = db.lock()?;
    query(&conn, "dirty = 1", [])
}

/// Flip dirty → 0 for exactly the given identities.
pub fn mark_clean<R: Record>(db: &DbState, keys: &[String]) -> Result<usize> {
    let conn = db.lock()?;
    let sql = format!(
        "UPDATE {} SET dirty = 0, synced_once = 1 WHERE {} = ?1",
        R::TABLE.name(),
        R::TABLE.key_column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut changed = 0;
    for key in keys {
        changed += stmt.execute(params![key])?;
    }
    Ok(changed)
}

/// Clear dirty only where the row still carries the pushed `updated_at`.
///
/// A record edited again while its push was in flight keeps dirty = 1 so
/// the newer edit goes up on the next cycle.
pub fn mark_clean_if_unchanged<R: Record>(
    db: &DbState,
    pushed: &[(String, DateTime<Utc>)],
) -> Result<usize> {
    let conn = db.lock()?;
    let sql = format!(
        "UPDATE {} SET dirty = 0, synced_once = 1 WHERE {} = ?1 AND updated_at = ?2",
        R::TABLE.name(),
        R::TABLE.key_column()
    );
    let mut stmt = conn.prepare(&sql)?;
    let mut changed = 0;
    for (key, updated_at) in pushed {
        changed += stmt.execute(params![key, format_ts(updated_at)])?;
    }
    Ok(changed)
}

/// Physically remove tombstones whose deletion reached the remote, skipping
/// any that were touched again meanwhile.
pub fn purge_if_unchanged<R: Record>(
    db: &DbState,
    pushed: &[(String, DateTime<Utc>)],
) -> Result<usize> {
    let mut removed_keys = Vec::new();
    {
        let conn = db.lock()?;
        let sql = format!(
            "DELETE FROM {} WHERE {} = ?1 AND deleted = 1 AND updated_at = ?2",
            R::TABLE.name(),
            R::TABLE.key_column()
        );
        let mut stmt = conn.prepare(&sql)?;
        for (key, updated_at) in pushed {
            if stmt.execute(params![key, format_ts(updated_at)])? > 0 {
                removed_keys.push(key.clone());
            }
        }
    }
    for key in &removed_keys {
        db.emit(StoreEvent::new(R::TABLE, key, ChangeKind::Delete));
    }
    Ok(removed_keys.len())
}

/// Physically remove a record.
pub fn purge<R: Record>(db: &DbState, key: &str) -> Result<bool> {
    let removed = {
        let conn = db.lock()?;
        conn.execute(
            &format!(
                "DELETE FROM {} WHERE {} = ?1",
                R::TABLE.name(),
                R::TABLE.key_column()
            ),
            params![key],
        )?
    };
    if removed > 0 {
        db.emit(StoreEvent::new(R::TABLE, key, ChangeKind::Delete));
    }
    Ok(removed > 0)
}

/// Count of dirty rows across every synced table: the pending indicator.
pub fn pending_count(db: &DbState) -> Result<i64> {
    let conn = db.lock()?;
    let mut total = 0;
    for table in Table::ALL {
        let n: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM {} WHERE dirty = 1", table.name()),
            [],
            |row| row.get(0),
        )?;
        total += n;
    }
    Ok(total)
}
