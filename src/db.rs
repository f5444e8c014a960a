//! Local SQLite database layer for Boutique POS.
//!
//! Uses rusqlite with WAL mode. Owns the versioned schema: every version
//! declares its table/index shape plus an optional one-time transform that
//! default-fills existing rows. Versions are applied in order on open and a
//! failure aborts the open, leaving the file at the last good version.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use tokio::sync::broadcast;
use tracing::{debug, error, info};

use crate::error::{PosError, Result};
use crate::live::StoreEvent;
use crate::models::format_ts;

/// Meta key holding the timestamp of the last fully successful pull.
pub const META_LAST_SYNCED_AT: &str = "lastSyncedAt";
/// Meta key holding the in-flight sale draft.
pub const META_PENDING_SALE: &str = "pending_sale";
/// Meta key holding the generated terminal id when none is configured.
pub const META_TERMINAL_ID: &str = "terminal_id";

const EVENT_CHANNEL_CAPACITY: usize = 256;

/// The terminal's local store: one connection, single owner per process.
pub struct DbState {
    pub conn: Mutex<Connection>,
    pub db_path: PathBuf,
    events: broadcast::Sender<StoreEvent>,
}

impl DbState {
    /// Open (or create) the database file and bring it to the current schema.
    pub fn open(db_path: &Path) -> Result<Self> {
        if let Some(dir) = db_path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir).map_err(|e| {
                    PosError::Config(format!("create data dir {}: {e}", dir.display()))
                })?;
            }
        }
        info!("Opening database at {}", db_path.display());
        let conn = open_and_configure(db_path)?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn, db_path.to_path_buf()))
    }

    /// In-memory store with the production schema, used by tests and demos.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(
            "PRAGMA foreign_keys = ON;
             PRAGMA busy_timeout = 5000;",
        )?;
        run_migrations(&conn)?;
        Ok(Self::from_connection(conn, PathBuf::from(":memory:")))
    }

    fn from_connection(conn: Connection, db_path: PathBuf) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            conn: Mutex::new(conn),
            db_path,
            events,
        }
    }

    pub fn lock(&self) -> Result<MutexGuard<'_, Connection>> {
        Ok(self.conn.lock()?)
    }

    /// Notify live queries. Called after the write has committed.
    pub fn emit(&self, event: StoreEvent) {
        // No receivers is the common case for a headless terminal.
        let _ = self.events.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

/// Open the database file and apply pragmas.
fn open_and_configure(path: &Path) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode = WAL;
         PRAGMA foreign_keys = ON;
         PRAGMA busy_timeout = 5000;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Schema registry
// ---------------------------------------------------------------------------

type Transform = fn(&Transaction<'_>) -> rusqlite::Result<()>;

/// One schema version: DDL plus an optional transform over existing rows.
///
/// Transforms must only fill values that are still missing so that a client
/// jumping several versions at once ends up with the same rows as one that
/// upgraded step by step.
struct Migration {
    version: i32,
    description: &'static str,
    schema: &'static str,
    transform: Option<Transform>,
}

const MIGRATIONS: &[Migration] = &[
    Migration {
        version: 1,
        description: "catalog, sales, sale lines, customers, meta",
        schema: "
        CREATE TABLE IF NOT EXISTS catalog_items (
            code TEXT PRIMARY KEY,
            title TEXT NOT NULL,
            price INTEGER NOT NULL DEFAULT 0,
            xs INTEGER,
            s INTEGER,
            m INTEGER,
            l INTEGER,
            xl INTEGER,
            total INTEGER,
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT
        );

        CREATE TABLE IF NOT EXISTS sales (
            id TEXT PRIMARY KEY,
            total INTEGER NOT NULL,
            item_count INTEGER NOT NULL,
            payment_method TEXT NOT NULL DEFAULT 'cash',
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS sale_lines (
            seq INTEGER PRIMARY KEY,
            sale_id TEXT NOT NULL,
            product_code TEXT NOT NULL,
            size TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS customers (
            id_number TEXT PRIMARY KEY,
            customer_type TEXT,
            name TEXT,
            phone TEXT,
            email TEXT,
            synced INTEGER NOT NULL DEFAULT 0,
            created_at TEXT
        );

        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_catalog_items_dirty ON catalog_items(dirty);
        CREATE INDEX IF NOT EXISTS idx_sales_dirty ON sales(dirty);
        CREATE INDEX IF NOT EXISTS idx_sale_lines_dirty ON sale_lines(dirty);
        CREATE INDEX IF NOT EXISTS idx_sale_lines_sale_id ON sale_lines(sale_id);
        ",
        transform: None,
    },
    Migration {
        version: 2,
        description: "returns table, gender and description on catalog items",
        schema: "
        CREATE TABLE IF NOT EXISTS returns (
            id TEXT PRIMARY KEY,
            item_code TEXT NOT NULL,
            reason TEXT NOT NULL,
            refund_amount INTEGER NOT NULL,
            purchase_date TEXT NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_returns_dirty ON returns(dirty);
        ",
        transform: Some(migrate_v2),
    },
    Migration {
        version: 3,
        description: "shifts, shift/customer/employee references, size on returns",
        schema: "
        CREATE TABLE IF NOT EXISTS shifts (
            id TEXT PRIMARY KEY,
            terminal_id TEXT NOT NULL,
            opened_by TEXT,
            opened_at TEXT NOT NULL,
            initial_cash INTEGER NOT NULL DEFAULT 0,
            closed_at TEXT,
            counted_cash INTEGER,
            expected_cash INTEGER,
            variance INTEGER,
            active INTEGER NOT NULL DEFAULT 1,
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_one_active_per_terminal
            ON shifts(terminal_id) WHERE active = 1;
        CREATE INDEX IF NOT EXISTS idx_shifts_dirty ON shifts(dirty);
        ",
        transform: Some(migrate_v3),
    },
    Migration {
        version: 4,
        description: "dirty/tombstone bookkeeping on customers",
        schema: "",
        transform: Some(migrate_v4),
    },
    Migration {
        version: 5,
        description: "synced_once flag on every synced table",
        schema: "",
        transform: Some(migrate_v5),
    },
    Migration {
        version: 6,
        description: "active-shift uniqueness scoped to shifts opened on this device",
        schema: "",
        transform: Some(migrate_v6),
    },
    Migration {
        version: 7,
        description: "sale lines keyed by line id instead of seq",
        schema: "",
        transform: Some(migrate_v7),
    },
];

/// Current schema version. Derived from the registry.
pub fn current_schema_version() -> i32 {
    MIGRATIONS.last().map(|m| m.version).unwrap_or(0)
}

/// Apply every pending migration, each in its own transaction.
pub fn run_migrations(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY,
            applied_at TEXT DEFAULT (datetime('now'))
        );",
    )
    .map_err(|e| PosError::Migration {
        version: 0,
        reason: format!("create schema_version: {e}"),
    })?;

    let current = schema_version(conn)?;
    let target = current_schema_version();
    if current >= target {
        info!("Database schema up to date (v{current})");
        return Ok(());
    }

    info!("Migrating database from v{current} to v{target}");
    for migration in MIGRATIONS.iter().filter(|m| m.version > current) {
        apply_migration(conn, migration).map_err(|e| {
            error!(
                version = migration.version,
                "Migration failed, aborting store open: {e}"
            );
            PosError::Migration {
                version: migration.version,
                reason: e.to_string(),
            }
        })?;
        info!(
            "Applied migration v{} ({})",
            migration.version, migration.description
        );
    }
    Ok(())
}

fn apply_migration(conn: &Connection, migration: &Migration) -> rusqlite::Result<()> {
    let tx = conn.unchecked_transaction()?;
    if !migration.schema.trim().is_empty() {
        tx.execute_batch(migration.schema)?;
    }
    if let Some(transform) = migration.transform {
        transform(&tx)?;
    }
    tx.execute(
        "INSERT INTO schema_version (version) VALUES (?1)",
        params![migration.version],
    )?;
    tx.commit()
}

pub fn schema_version(conn: &Connection) -> Result<i32> {
    conn.query_row(
        "SELECT COALESCE(MAX(version), 0) FROM schema_version",
        [],
        |row| row.get(0),
    )
    .map_err(|e| PosError::Migration {
        version: 0,
        reason: format!("read schema_version: {e}"),
    })
}

/// Check whether a column exists on a table (PRAGMA table_info).
fn column_exists(conn: &Connection, table: &str, column: &str) -> rusqlite::Result<bool> {
    let mut stmt = conn.prepare(&format!("PRAGMA table_info({table})"))?;
    let names = stmt.query_map([], |row| row.get::<_, String>(1))?;
    for name in names {
        if name? == column {
            return Ok(true);
        }
    }
    Ok(false)
}

fn add_column_if_missing(
    conn: &Connection,
    table: &str,
    column: &str,
    definition: &str,
) -> rusqlite::Result<()> {
    if !column_exists(conn, table, column)? {
        conn.execute_batch(&format!(
            "ALTER TABLE {table} ADD COLUMN {column} {definition};"
        ))?;
        debug!(table, column, "Added column");
    }
    Ok(())
}

/// v2: catalog items gain gender/description; missing buckets become 0.
fn migrate_v2(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "catalog_items", "gender", "TEXT")?;
    add_column_if_missing(tx, "catalog_items", "description", "TEXT")?;
    tx.execute_batch(
        "UPDATE catalog_items SET gender = 'unisex' WHERE gender IS NULL OR gender = '';
         UPDATE catalog_items SET description = '' WHERE description IS NULL;
         UPDATE catalog_items SET
            xs = COALESCE(xs, 0),
            s = COALESCE(s, 0),
            m = COALESCE(m, 0),
            l = COALESCE(l, 0),
            xl = COALESCE(xl, 0);",
    )
}

/// v3: references to shift/customer/employee; sizes on returns; catalog
/// timestamps; totals re-derived from clamped buckets.
fn migrate_v3(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "sales", "shift_id", "TEXT")?;
    add_column_if_missing(tx, "sales", "customer_id", "TEXT")?;
    add_column_if_missing(tx, "sales", "employee_id", "TEXT")?;
    add_column_if_missing(tx, "returns", "shift_id", "TEXT")?;
    add_column_if_missing(tx, "returns", "size", "TEXT")?;
    add_column_if_missing(tx, "returns", "quantity", "INTEGER NOT NULL DEFAULT 1")?;
    add_column_if_missing(tx, "catalog_items", "created_at", "TEXT")?;

    let now = format_ts(&Utc::now());
    tx.execute(
        "UPDATE catalog_items SET updated_at = ?1 WHERE updated_at IS NULL OR updated_at = ''",
        params![now],
    )?;
    tx.execute_batch(
        "UPDATE catalog_items SET created_at = updated_at WHERE created_at IS NULL;
         UPDATE catalog_items SET
            xs = MAX(xs, 0),
            s = MAX(s, 0),
            m = MAX(m, 0),
            l = MAX(l, 0),
            xl = MAX(xl, 0);
         UPDATE catalog_items SET total = xs + s + m + l + xl;
         CREATE INDEX IF NOT EXISTS idx_sales_shift_id ON sales(shift_id);
         CREATE INDEX IF NOT EXISTS idx_returns_shift_id ON returns(shift_id);",
    )
}

/// v4: customers move from a `synced` flag to dirty/tombstone bookkeeping.
fn migrate_v4(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    add_column_if_missing(tx, "customers", "address", "TEXT")?;
    add_column_if_missing(tx, "customers", "dirty", "INTEGER")?;
    add_column_if_missing(tx, "customers", "deleted", "INTEGER NOT NULL DEFAULT 0")?;
    add_column_if_missing(tx, "customers", "updated_at", "TEXT")?;

    let now = format_ts(&Utc::now());
    tx.execute(
        "UPDATE customers SET created_at = ?1 WHERE created_at IS NULL OR created_at = ''",
        params![now],
    )?;
    tx.execute_batch(
        "UPDATE customers SET dirty = CASE WHEN synced = 1 THEN 0 ELSE 1 END WHERE dirty IS NULL;
         UPDATE customers SET updated_at = created_at WHERE updated_at IS NULL;
         UPDATE customers SET customer_type = 'CC' WHERE customer_type IS NULL OR customer_type = '';
         UPDATE customers SET name = '' WHERE name IS NULL;
         CREATE INDEX IF NOT EXISTS idx_customers_dirty ON customers(dirty);",
    )
}

/// v5: remember which rows ever reached the remote. Clean rows must have.
fn migrate_v5(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    for table in [
        "catalog_items",
        "customers",
        "shifts",
        "sales",
        "sale_lines",
        "returns",
    ] {
        add_column_if_missing(tx, table, "synced_once", "INTEGER NOT NULL DEFAULT 0")?;
        tx.execute_batch(&format!(
            "UPDATE {table} SET synced_once = 1 WHERE dirty = 0 AND synced_once = 0;"
        ))?;
    }
    Ok(())
}

/// v6: shifts pulled from other devices may share a terminal id with ours.
/// Only shifts opened here take part in the one-active-shift rule; every
/// shift already stored satisfied the old index, so all count as local.
fn migrate_v6(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if !column_exists(tx, "shifts", "opened_here")? {
        add_column_if_missing(tx, "shifts", "opened_here", "INTEGER NOT NULL DEFAULT 0")?;
        tx.execute_batch("UPDATE shifts SET opened_here = 1;")?;
    }
    tx.execute_batch(
        "DROP INDEX IF EXISTS idx_shifts_one_active_per_terminal;
         CREATE UNIQUE INDEX IF NOT EXISTS idx_shifts_one_active_local
            ON shifts(terminal_id) WHERE active = 1 AND opened_here = 1;",
    )
}

/// v7: sale lines get a text `line_id` primary key (`<sale id>:<line no>`)
/// so lines written by different terminals can never share a key. `seq`
/// stays as the local ordering column.
fn migrate_v7(tx: &Transaction<'_>) -> rusqlite::Result<()> {
    if column_exists(tx, "sale_lines", "line_id")? {
        return Ok(());
    }
    tx.execute_batch(
        "CREATE TABLE sale_lines_v7 (
            line_id TEXT PRIMARY KEY,
            seq INTEGER NOT NULL,
            sale_id TEXT NOT NULL,
            line_no INTEGER NOT NULL,
            product_code TEXT NOT NULL,
            size TEXT NOT NULL,
            quantity INTEGER NOT NULL,
            unit_price INTEGER NOT NULL,
            dirty INTEGER NOT NULL DEFAULT 1,
            deleted INTEGER NOT NULL DEFAULT 0,
            synced_once INTEGER NOT NULL DEFAULT 0,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        INSERT INTO sale_lines_v7 (line_id, seq, sale_id, line_no, product_code, size,
            quantity, unit_price, dirty, deleted, synced_once, created_at, updated_at)
        SELECT cur.sale_id || ':' || (
                SELECT COUNT(*) FROM sale_lines AS earlier
                WHERE earlier.sale_id = cur.sale_id AND earlier.seq <= cur.seq
            ),
            cur.seq, cur.sale_id,
            (
                SELECT COUNT(*) FROM sale_lines AS earlier
                WHERE earlier.sale_id = cur.sale_id AND earlier.seq <= cur.seq
            ),
            cur.product_code, cur.size, cur.quantity, cur.unit_price,
            cur.dirty, cur.deleted, cur.synced_once, cur.created_at, cur.updated_at
        FROM sale_lines AS cur;

        DROP TABLE sale_lines;
        ALTER TABLE sale_lines_v7 RENAME TO sale_lines;
        CREATE INDEX IF NOT EXISTS idx_sale_lines_dirty ON sale_lines(dirty);
        CREATE INDEX IF NOT EXISTS idx_sale_lines_sale_id ON sale_lines(sale_id);
        CREATE INDEX IF NOT EXISTS idx_sale_lines_seq ON sale_lines(seq);",
    )
}

// ---------------------------------------------------------------------------
// Terminal identity
// ---------------------------------------------------------------------------

/// The id this terminal stamps on shifts and sales. A configured id wins;
/// otherwise one is generated on first use and kept in meta, so two
/// unconfigured terminals never share an id.
pub fn resolve_terminal_id(conn: &Connection, configured: Option<&str>) -> Result<String> {
    if let Some(id) = configured.map(str::trim).filter(|id| !id.is_empty()) {
        return Ok(id.to_string());
    }
    if let Some(id) = get_meta(conn, META_TERMINAL_ID)? {
        return Ok(id);
    }
    let id = format!("terminal-{}", uuid::Uuid::new_v4().simple());
    set_meta(conn, META_TERMINAL_ID, &id)?;
    info!(terminal_id = %id, "Generated terminal id");
    Ok(id)
}

// ---------------------------------------------------------------------------
// Meta helpers
// ---------------------------------------------------------------------------

/// Read a meta value. Returns `None` if not found.
pub fn get_meta(conn: &Connection, key: &str) -> Result<Option<String>> {
    Ok(conn
        .query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )
        .optional()?)
}

/// Upsert a meta value.
pub fn set_meta(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT INTO meta (key, value, updated_at) VALUES (?1, ?2, ?3)
         ON CONFLICT(key) DO UPDATE SET value = excluded.value, updated_at = excluded.updated_at",
        params![key, value, format_ts(&Utc::now())],
    )?;
    Ok(())
}

pub fn delete_meta(conn: &Connection, key: &str) -> Result<()> {
    conn.execute("DELETE FROM meta WHERE key = ?1", params![key])?;
    Ok(())
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn test_db() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        conn.execute_batch("PRAGMA foreign_keys = ON;")
            .expect("pragma setup");
        conn
    }

    fn table_names(conn: &Connection) -> Vec<String> {
        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .expect("prepare table list");
        stmt.query_map([], |row| row.get(0))
            .expect("query tables")
            .filter_map(|r| r.ok())
            .collect()
    }

    /// Apply migrations up to (and including) `version` only.
    fn migrate_to(conn: &Connection, version: i32) {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY,
                applied_at TEXT DEFAULT (datetime('now'))
            );",
        )
        .unwrap();
        for m in MIGRATIONS.iter().filter(|m| m.version <= version) {
            apply_migration(conn, m).expect("apply migration");
        }
    }

    #[test]
    fn test_migrations_v1_to_latest() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        let tables = table_names(&conn);
        for expected in [
            "catalog_items",
            "customers",
            "meta",
            "returns",
            "sale_lines",
            "sales",
            "schema_version",
            "shifts",
        ] {
            assert!(tables.contains(&expected.to_string()), "missing {expected}");
        }
        assert_eq!(schema_version(&conn).unwrap(), current_schema_version());
    }

    #[test]
    fn test_migrations_are_idempotent() {
        let conn = test_db();
        run_migrations(&conn).expect("first run");
        run_migrations(&conn).expect("second run should succeed");

        let rows: i32 = conn
            .query_row("SELECT COUNT(*) FROM schema_version", [], |row| row.get(0))
            .unwrap();
        assert_eq!(rows, current_schema_version());
    }

    #[test]
    fn test_wal_mode_on_file_db() {
        let dir = std::env::temp_dir().join(format!("boutique_pos_wal_{}", uuid::Uuid::new_v4()));
        let db_path = dir.join("pos.db");

        let state = DbState::open(&db_path).expect("open file db");
        {
            let conn = state.lock().unwrap();
            let mode: String = conn
                .query_row("PRAGMA journal_mode", [], |row| row.get(0))
                .expect("read journal_mode");
            assert_eq!(mode.to_lowercase(), "wal");
        }
        drop(state);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_v1_rows_are_default_filled_on_multi_version_jump() {
        let conn = test_db();
        migrate_to(&conn, 1);

        conn.execute_batch(
            "INSERT INTO catalog_items (code, title, price, xs, s, m, l, xl, total, dirty, updated_at)
             VALUES ('T-001', 'Tee', 25000, NULL, 2, -3, 4, NULL, 99, 0, NULL);
             INSERT INTO customers (id_number, name, synced, created_at)
             VALUES ('1010', 'Ana', 1, '2025-01-01T00:00:00.000Z');
             INSERT INTO customers (id_number, name, synced)
             VALUES ('2020', NULL, 0);",
        )
        .unwrap();

        run_migrations(&conn).expect("jump to latest");

        let (xs, m, xl, total, gender, desc, synced_once): (i64, i64, i64, i64, String, String, bool) = conn
            .query_row(
                "SELECT xs, m, xl, total, gender, description, synced_once
                 FROM catalog_items WHERE code = 'T-001'",
                [],
                |row| {
                    Ok((
                        row.get(0)?,
                        row.get(1)?,
                        row.get(2)?,
                        row.get(3)?,
                        row.get(4)?,
                        row.get(5)?,
                        row.get(6)?,
                    ))
                },
            )
            .unwrap();
        assert_eq!((xs, m, xl), (0, 0, 0));
        assert_eq!(total, 6, "total re-derived from clamped buckets");
        assert_eq!(gender, "unisex");
        assert_eq!(desc, "");
        assert!(synced_once, "clean legacy rows count as remote-confirmed");

        let dirty: Vec<(String, i64, String)> = {
            let mut stmt = conn
                .prepare("SELECT id_number, dirty, name FROM customers ORDER BY id_number")
                .unwrap();
            stmt.query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))
                .unwrap()
                .map(|r| r.unwrap())
                .collect()
        };
        assert_eq!(
            dirty,
            vec![
                ("1010".to_string(), 0, "Ana".to_string()),
                ("2020".to_string(), 1, String::new()),
            ]
        );
    }

    #[test]
    fn test_failed_transform_aborts_and_keeps_previous_version() {
        fn broken(tx: &Transaction<'_>) -> rusqlite::Result<()> {
            tx.execute_batch("UPDATE no_such_table SET x = 1;")
        }

        let conn = test_db();
        migrate_to(&conn, 2);

        let bad = Migration {
            version: 3,
            description: "broken",
            schema: "CREATE TABLE scratch (id INTEGER);",
            transform: Some(broken),
        };
        assert!(apply_migration(&conn, &bad).is_err());
        assert_eq!(schema_version(&conn).unwrap(), 2);
        assert!(
            !table_names(&conn).contains(&"scratch".to_string()),
            "schema changes roll back with the failed transform"
        );
    }

    #[test]
    fn test_one_active_shift_per_terminal_index_covers_local_shifts_only() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        let insert = |id: &str, terminal: &str, opened_here: i64| {
            conn.execute(
                "INSERT INTO shifts (id, terminal_id, opened_at, active, opened_here, created_at, updated_at)
                 VALUES (?1, ?2, 'x', 1, ?3, 'x', 'x')",
                params![id, terminal, opened_here],
            )
        };
        insert("a", "T1", 1).unwrap();
        assert!(insert("b", "T1", 1).is_err());
        insert("c", "T2", 1).expect("other terminal may have its own open shift");
        insert("d", "T1", 0).expect("a pulled shift never collides with ours");
        insert("e", "T1", 0).expect("nor with another pulled one");
    }

    #[test]
    fn test_v6_keeps_existing_shifts_local() {
        let conn = test_db();
        migrate_to(&conn, 5);
        conn.execute_batch(
            "INSERT INTO shifts (id, terminal_id, opened_at, active, created_at, updated_at)
             VALUES ('s1', 'T1', 'x', 1, 'x', 'x');",
        )
        .unwrap();
        run_migrations(&conn).unwrap();
        let opened_here: i64 = conn
            .query_row("SELECT opened_here FROM shifts WHERE id = 's1'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(opened_here, 1);
    }

    #[test]
    fn test_v7_keys_sale_lines_by_sale_and_position() {
        let conn = test_db();
        migrate_to(&conn, 6);
        conn.execute_batch(
            "INSERT INTO sale_lines (seq, sale_id, product_code, size, quantity, unit_price,
                dirty, synced_once, created_at, updated_at)
             VALUES (500, 'S1', 'T-001', 'M', 1, 100, 0, 1, 'x', 'x'),
                    (501, 'S1', 'J-002', 'S', 2, 300, 0, 1, 'x', 'x'),
                    (500100, 'S2', 'T-001', 'L', 1, 100, 1, 0, 'x', 'x');",
        )
        .unwrap();
        run_migrations(&conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT line_id, seq, line_no, dirty FROM sale_lines ORDER BY seq")
            .unwrap();
        let rows: Vec<(String, i64, i64, i64)> = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)))
            .unwrap()
            .map(|r| r.unwrap())
            .collect();
        assert_eq!(
            rows,
            vec![
                ("S1:1".to_string(), 500, 1, 0),
                ("S1:2".to_string(), 501, 2, 0),
                ("S2:1".to_string(), 500100, 1, 1),
            ]
        );
    }

    #[test]
    fn test_terminal_id_is_generated_once_and_configured_id_wins() {
        let conn = test_db();
        run_migrations(&conn).unwrap();
        let generated = resolve_terminal_id(&conn, None).unwrap();
        assert!(generated.starts_with("terminal-"));
        assert_eq!(resolve_terminal_id(&conn, None).unwrap(), generated);
        assert_eq!(resolve_terminal_id(&conn, Some(" till-4 ")).unwrap(), "till-4");
        assert_eq!(resolve_terminal_id(&conn, Some("")).unwrap(), generated);

        let other = test_db();
        run_migrations(&other).unwrap();
        assert_ne!(resolve_terminal_id(&other, None).unwrap(), generated);
    }

    #[test]
    fn test_meta_crud() {
        let conn = test_db();
        run_migrations(&conn).expect("migrations");

        set_meta(&conn, META_LAST_SYNCED_AT, "2026-01-01T00:00:00.000Z").expect("set");
        assert_eq!(
            get_meta(&conn, META_LAST_SYNCED_AT).unwrap().as_deref(),
            Some("2026-01-01T00:00:00.000Z")
        );
        set_meta(&conn, META_LAST_SYNCED_AT, "2026-02-01T00:00:00.000Z").expect("update");
        assert_eq!(
            get_meta(&conn, META_LAST_SYNCED_AT).unwrap().as_deref(),
            Some("2026-02-01T00:00:00.000Z")
        );
        delete_meta(&conn, META_LAST_SYNCED_AT).expect("delete");
        assert!(get_meta(&conn, META_LAST_SYNCED_AT).unwrap().is_none());
    }
}
