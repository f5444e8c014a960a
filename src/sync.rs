//! Push-then-pull sync against the shared remote store.
//!
//! One cycle (`SyncEngine::sync_all`):
//! 1. **Push**, table by table in dependency order: tombstones become remote
//!    deletes followed by physical local removal; live dirty rows are upserted
//!    keyed by identity and then marked clean, unless edited again meanwhile.
//! 2. **Pull**: rows the remote wrote after the last recorded sync (minus a
//!    small overlap) are applied as clean writes, last-writer-wins.
//! 3. `lastSyncedAt` advances to the cycle start, only if every pull succeeded.
//!
//! Push and pull of each table are independent attempts. Failures are
//! collected into the returned [`SyncReport`]; nothing is raised to the caller.
//! The supervising scheduler decides when to retry.
//!
//! Pushed rows carry the cycle start as their remote `updated_at`, so the
//! remote timestamp means "last written to the shared store" and the pull
//! cursor cannot skip rows a terminal edited offline and pushed late. Any
//! local edit made while the cycle runs is stamped at or after that instant,
//! so the pull keeps it instead of the snapshot that was just pushed.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use crate::db::{self, DbState, META_LAST_SYNCED_AT};
use crate::error::Result;
use crate::live::{ChangeKind, StoreEvent};
use crate::mappers::RemoteMapping;
use crate::models::{
    format_ts, now_millis, parse_ts, CatalogItem, Customer, Return, Sale, SaleLine, Shift, Table,
};
use crate::remote::{RemoteStore, RowFilter};
use crate::store::{self, Record};

/// Re-read this much before the cursor to absorb clock skew between
/// terminals and pushes that landed just after a select.
pub const PULL_OVERLAP_SECS: i64 = 60;

// ---------------------------------------------------------------------------
// Report types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncPhase {
    Push,
    Pull,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncFailure {
    pub table: Table,
    pub phase: SyncPhase,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableStats {
    pub table: Table,
    /// Live rows upserted remotely and marked clean.
    pub pushed: usize,
    /// Tombstones deleted remotely and purged locally.
    pub deleted: usize,
    /// Remote rows written locally.
    pub pulled: usize,
    /// Remote rows skipped because the local dirty copy is newer.
    pub kept_local: usize,
}

impl TableStats {
    fn new(table: Table) -> Self {
        Self {
            table,
            pushed: 0,
            deleted: 0,
            pulled: 0,
            kept_local: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub tables: Vec<TableStats>,
    pub failures: Vec<SyncFailure>,
    /// Set when this cycle advanced the pull cursor.
    pub last_synced_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn is_success(&self) -> bool {
        self.failures.is_empty()
    }

    /// Rows that changed on either side during the cycle.
    pub fn net_changes(&self) -> usize {
        self.tables
            .iter()
            .map(|t| t.pushed + t.deleted + t.pulled)
            .sum()
    }
}

// ---------------------------------------------------------------------------
// Applying remote data locally
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ApplyOutcome {
    Applied,
    KeptLocal,
    Unchanged,
}

fn same_content<R: Record>(local: &R, incoming: &R) -> bool {
    let mut incoming = incoming.clone();
    incoming.normalize();
    local.bind() == incoming.bind()
}

/// Merge a remote-confirmed record into the local store.
///
/// A dirty local copy at least as new as the incoming row is kept (it goes
/// up on the next push). A clean copy with identical content is left alone.
/// Anything else is overwritten by the remote row as a clean write.
pub(crate) fn apply_remote<R: Record>(db: &DbState, incoming: R) -> Result<ApplyOutcome> {
    let key = incoming.key();
    let outcome = {
        let conn = db.lock()?;
        match store::get_in::<R>(&conn, &key)? {
            Some(local)
                if local.state().dirty
                    && local.state().updated_at >= incoming.state().updated_at =>
            {
                ApplyOutcome::KeptLocal
            }
            Some(local)
                if !local.state().dirty
                    && !local.state().deleted
                    && same_content(&local, &incoming) =>
            {
                ApplyOutcome::Unchanged
            }
            _ => {
                store::upsert_clean_in(&conn, incoming)?;
                ApplyOutcome::Applied
            }
        }
    };
    if outcome == ApplyOutcome::Applied {
        db.emit(StoreEvent::new(R::TABLE, key, ChangeKind::Upsert));
    }
    Ok(outcome)
}

/// Apply a remote delete: clean local copies are removed, locally edited ones
/// survive and will be pushed back.
pub(crate) fn apply_remote_delete<R: Record>(db: &DbState, key: &str) -> Result<ApplyOutcome> {
    let outcome = {
        let conn = db.lock()?;
        match store::get_in::<R>(&conn, key)? {
            None => ApplyOutcome::Unchanged,
            Some(local) if local.state().dirty && !local.state().deleted => ApplyOutcome::KeptLocal,
            Some(_) => {
                conn.execute(
                    &format!(
                        "DELETE FROM {} WHERE {} = ?1",
                        R::TABLE.name(),
                        R::TABLE.key_column()
                    ),
                    rusqlite::params![key],
                )?;
                ApplyOutcome::Applied
            }
        }
    };
    if outcome == ApplyOutcome::Applied {
        db.emit(StoreEvent::new(R::TABLE, key, ChangeKind::Delete));
    }
    Ok(outcome)
}

pub fn last_synced_at(db: &DbState) -> Result<Option<DateTime<Utc>>> {
    let conn = db.lock()?;
    Ok(db::get_meta(&conn, META_LAST_SYNCED_AT)?
        .as_deref()
        .and_then(parse_ts))
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct SyncEngine {
    db: Arc<DbState>,
    remote: Arc<dyn RemoteStore>,
    /// Single-flight: overlapping `sync_all` calls run one after another.
    cycle: AsyncMutex<()>,
}

impl SyncEngine {
    pub fn new(db: Arc<DbState>, remote: Arc<dyn RemoteStore>) -> Self {
        Self {
            db,
            remote,
            cycle: AsyncMutex::new(()),
        }
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    /// Run one full push-then-pull cycle.
    pub async fn sync_all(&self) -> SyncReport {
        let _cycle = self.cycle.lock().await;
        let started_at = now_millis();
        let mut stats: Vec<TableStats> = Table::ALL.iter().map(|t| TableStats::new(*t)).collect();
        let mut failures = Vec::new();

        for table_stats in stats.iter_mut() {
            if let Err(message) = self.push_table(table_stats, started_at).await {
                warn!(table = %table_stats.table, "Push failed: {message}");
                failures.push(SyncFailure {
                    table: table_stats.table,
                    phase: SyncPhase::Push,
                    message,
                });
            }
        }

        let since = match last_synced_at(&self.db) {
            Ok(since) => since.map(|ts| ts - Duration::seconds(PULL_OVERLAP_SECS)),
            Err(e) => {
                warn!("Could not read lastSyncedAt, pulling everything: {e}");
                None
            }
        };
        let mut pull_ok = true;
        for table_stats in stats.iter_mut() {
            if let Err(message) = self.pull_table(table_stats, since).await {
                warn!(table = %table_stats.table, "Pull failed: {message}");
                pull_ok = false;
                failures.push(SyncFailure {
                    table: table_stats.table,
                    phase: SyncPhase::Pull,
                    message,
                });
            }
        }

        let mut last_synced = None;
        if pull_ok {
            match self.db.lock().and_then(|conn| {
                db::set_meta(&conn, META_LAST_SYNCED_AT, &format_ts(&started_at))
            }) {
                Ok(()) => last_synced = Some(started_at),
                Err(e) => warn!("Could not record lastSyncedAt: {e}"),
            }
        }

        let report = SyncReport {
            started_at,
            finished_at: now_millis(),
            tables: stats,
            failures,
            last_synced_at: last_synced,
        };
        if report.is_success() {
            info!(changes = report.net_changes(), "Sync cycle complete");
        } else {
            warn!(
                changes = report.net_changes(),
                failures = report.failures.len(),
                "Sync cycle finished with failures; will retry"
            );
        }
        report
    }

    async fn push_table(
        &self,
        stats: &mut TableStats,
        pushed_at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        match stats.table {
            Table::CatalogItems => self.push::<CatalogItem>(stats, pushed_at).await,
            Table::Customers => self.push::<Customer>(stats, pushed_at).await,
            Table::Shifts => self.push::<Shift>(stats, pushed_at).await,
            Table::Sales => self.push::<Sale>(stats, pushed_at).await,
            Table::SaleLines => self.push::<SaleLine>(stats, pushed_at).await,
            Table::Returns => self.push::<Return>(stats, pushed_at).await,
        }
    }

    async fn pull_table(
        &self,
        stats: &mut TableStats,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), String> {
        match stats.table {
            Table::CatalogItems => self.pull::<CatalogItem>(stats, since).await,
            Table::Customers => self.pull::<Customer>(stats, since).await,
            Table::Shifts => self.pull::<Shift>(stats, since).await,
            Table::Sales => self.pull::<Sale>(stats, since).await,
            Table::SaleLines => self.pull::<SaleLine>(stats, since).await,
            Table::Returns => self.pull::<Return>(stats, since).await,
        }
    }

    /// `pushed_at` must not be later than the moment the dirty set is read.
    async fn push<R: RemoteMapping>(
        &self,
        stats: &mut TableStats,
        pushed_at: DateTime<Utc>,
    ) -> std::result::Result<(), String> {
        let dirty = store::get_dirty::<R>(&self.db).map_err(|e| e.to_string())?;
        if dirty.is_empty() {
            return Ok(());
        }
        let table = R::TABLE;
        let (tombstones, live): (Vec<R>, Vec<R>) =
            dirty.into_iter().partition(|r| r.state().deleted);
        let mut errors = Vec::new();

        if !tombstones.is_empty() {
            // Rows that never reached the remote have nothing to delete there.
            let remote_keys: Vec<String> = tombstones
                .iter()
                .filter(|r| r.state().synced_once)
                .map(Record::key)
                .collect();
            let deleted = if remote_keys.is_empty() {
                Ok(())
            } else {
                self.remote
                    .delete(
                        table.remote_name(),
                        &RowFilter::key_in(table.remote_key(), remote_keys),
                    )
                    .await
            };
            match deleted {
                Ok(()) => {
                    let pushed: Vec<(String, DateTime<Utc>)> = tombstones
                        .iter()
                        .map(|r| (r.key(), r.state().updated_at))
                        .collect();
                    match store::purge_if_unchanged::<R>(&self.db, &pushed) {
                        Ok(n) => stats.deleted += n,
                        Err(e) => errors.push(format!("purge tombstones: {e}")),
                    }
                }
                Err(e) => errors.push(format!("remote delete: {e}")),
            }
        }

        if !live.is_empty() {
            let pushed_at = format_ts(&pushed_at);
            let rows: Vec<Value> = live
                .iter()
                .map(|r| {
                    let mut row = r.to_remote();
                    if let Some(obj) = row.as_object_mut() {
                        obj.insert("updated_at".into(), Value::String(pushed_at.clone()));
                    }
                    row
                })
                .collect();
            match self
                .remote
                .upsert(table.remote_name(), &rows, table.remote_key())
                .await
            {
                Ok(()) => {
                    let pushed: Vec<(String, DateTime<Utc>)> = live
                        .iter()
                        .map(|r| (r.key(), r.state().updated_at))
                        .collect();
                    match store::mark_clean_if_unchanged::<R>(&self.db, &pushed) {
                        Ok(n) => {
                            if n < pushed.len() {
                                debug!(
                                    table = %table,
                                    edited = pushed.len() - n,
                                    "Rows edited during push stay dirty"
                                );
                            }
                            stats.pushed += n;
                        }
                        Err(e) => errors.push(format!("mark clean: {e}")),
                    }
                }
                Err(e) => errors.push(format!("remote upsert: {e}")),
            }
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }

    async fn pull<R: RemoteMapping>(
        &self,
        stats: &mut TableStats,
        since: Option<DateTime<Utc>>,
    ) -> std::result::Result<(), String> {
        let table = R::TABLE;
        let filter = since.map_or(RowFilter::All, RowFilter::UpdatedAfter);
        let rows = self
            .remote
            .select(table.remote_name(), &filter)
            .await
            .map_err(|e| format!("remote select: {e}"))?;

        let mut errors = Vec::new();
        for row in &rows {
            let record = match R::from_remote(row) {
                Ok(record) => record,
                Err(e) => {
                    errors.push(format!("decode row: {e}"));
                    continue;
                }
            };
            match apply_remote(&self.db, record) {
                Ok(ApplyOutcome::Applied) => stats.pulled += 1,
                Ok(ApplyOutcome::KeptLocal) => stats.kept_local += 1,
                Ok(ApplyOutcome::Unchanged) => {}
                Err(e) => errors.push(format!("apply row: {e}")),
            }
        }
        debug!(
            table = %table,
            fetched = rows.len(),
            applied = stats.pulled,
            kept_local = stats.kept_local,
            "Pull complete"
        );

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors.join("; "))
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog;
    use crate::customers;
    use crate::models::{RecordState, SizeBucket};
    use crate::error::RemoteError;
    use crate::remote::memory::MemoryRemote;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn client(remote: &Arc<MemoryRemote>) -> SyncEngine {
        let db = Arc::new(DbState::open_in_memory().expect("open in-memory db"));
        SyncEngine::new(db, remote.clone())
    }

    #[tokio::test]
    async fn test_second_sync_without_mutation_is_a_noop() {
        let remote = Arc::new(MemoryRemote::new());
        let engine = client(&remote);
        catalog::create_item(engine.db(), CatalogItem::new("T-001", "Tee", 25000)).unwrap();
        customers::upsert_customer(engine.db(), Customer::new("1020", "Ana")).unwrap();

        let first = engine.sync_all().await;
        assert!(first.is_success(), "{:?}", first.failures);
        assert_eq!(first.net_changes(), 2);
        assert!(first.last_synced_at.is_some());
        assert_eq!(store::pending_count(engine.db()).unwrap(), 0);

        let second = engine.sync_all().await;
        assert!(second.is_success());
        assert_eq!(second.net_changes(), 0);
        assert_eq!(remote.rows("products").len(), 1);
    }

    #[tokio::test]
    async fn test_two_terminals_converge_after_offline_sale() {
        let remote = Arc::new(MemoryRemote::new());
        let a = client(&remote);
        let b = client(&remote);

        catalog::create_item(
            a.db(),
            CatalogItem::new("T-001", "Tee", 25000).with_stock(SizeBucket::M, 10),
        )
        .unwrap();
        assert!(a.sync_all().await.is_success());
        assert!(b.sync_all().await.is_success());

        let seen_by_b = catalog::find_by_code(b.db(), "T-001").unwrap().unwrap();
        assert_eq!(seen_by_b.stock.m, 10);
        assert_eq!(seen_by_b.price, 25000);
        assert!(!seen_by_b.state.dirty);

        remote.set_online(false);
        let local = catalog::adjust_stock(a.db(), "T-001", SizeBucket::M, -1).unwrap();
        assert_eq!(local.stock.m, 9);
        assert!(local.state.dirty);
        let offline = a.sync_all().await;
        assert!(!offline.is_success());
        assert!(offline.last_synced_at.is_none());
        assert_eq!(store::pending_count(a.db()).unwrap(), 1);

        remote.set_online(true);
        assert!(a.sync_all().await.is_success());
        assert!(b.sync_all().await.is_success());

        for db in [a.db(), b.db()] {
            let item = catalog::find_by_code(db, "T-001").unwrap().unwrap();
            assert_eq!(item.stock.m, 9);
            assert_eq!(item.total, 9);
            assert!(!item.state.dirty);
        }
    }

    #[tokio::test]
    async fn test_deletes_propagate_and_purge_locally() {
        let remote = Arc::new(MemoryRemote::new());
        let a = client(&remote);
        let b = client(&remote);

        catalog::create_item(a.db(), CatalogItem::new("OLD", "Old stock", 100)).unwrap();
        a.sync_all().await;
        b.sync_all().await;
        assert!(catalog::find_by_code(b.db(), "OLD").unwrap().is_some());

        catalog::delete_item(a.db(), "OLD").unwrap();
        let report = a.sync_all().await;
        assert!(report.is_success());
        assert_eq!(report.tables[0].deleted, 1);
        assert!(remote.rows("products").is_empty());
        assert!(store::get_dirty::<CatalogItem>(a.db()).unwrap().is_empty());
        assert_eq!(store::pending_count(a.db()).unwrap(), 0);
    }

    #[tokio::test]
    async fn test_never_synced_tombstone_is_purged_without_remote_call() {
        let remote = Arc::new(MemoryRemote::new());
        let a = client(&remote);
        catalog::create_item(a.db(), CatalogItem::new("TMP", "Typo", 100)).unwrap();
        catalog::delete_item(a.db(), "TMP").unwrap();

        let report = a.sync_all().await;
        assert!(report.is_success());
        assert_eq!(report.tables[0].deleted, 1);
        assert_eq!(report.tables[0].pushed, 0);
        assert!(remote.rows("products").is_empty());
    }

    /// Sells one T-001 (M) while the next remote delete is in flight.
    struct SaleDuringDelete {
        inner: Arc<MemoryRemote>,
        db: Arc<DbState>,
        armed: AtomicBool,
    }

    #[async_trait]
    impl RemoteStore for SaleDuringDelete {
        async fn select(&self, table: &str, filter: &RowFilter) -> std::result::Result<Vec<Value>, RemoteError> {
            self.inner.select(table, filter).await
        }

        async fn upsert(
            &self,
            table: &str,
            rows: &[Value],
            conflict_key: &str,
        ) -> std::result::Result<(), RemoteError> {
            self.inner.upsert(table, rows, conflict_key).await
        }

        async fn delete(&self, table: &str, filter: &RowFilter) -> std::result::Result<(), RemoteError> {
            let result = self.inner.delete(table, filter).await;
            if self.armed.swap(false, Ordering::SeqCst) {
                catalog::adjust_stock(&self.db, "T-001", SizeBucket::M, -1).expect("sale mid-push");
            }
            result
        }
    }

    #[tokio::test]
    async fn test_sale_made_while_pushing_survives_the_pull() {
        let remote = Arc::new(MemoryRemote::new());
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let wrapped = Arc::new(SaleDuringDelete {
            inner: remote.clone(),
            db: db.clone(),
            armed: AtomicBool::new(false),
        });
        let engine = SyncEngine::new(db.clone(), wrapped.clone());

        catalog::create_item(
            &db,
            CatalogItem::new("T-001", "Tee", 25000).with_stock(SizeBucket::M, 10),
        )
        .unwrap();
        catalog::create_item(&db, CatalogItem::new("OLD", "Old stock", 100)).unwrap();
        assert!(engine.sync_all().await.is_success());

        let mut repriced = catalog::find_by_code(&db, "T-001").unwrap().unwrap();
        repriced.price = 27000;
        store::upsert(&db, repriced).unwrap();
        catalog::delete_item(&db, "OLD").unwrap();
        wrapped.armed.store(true, Ordering::SeqCst);

        let report = engine.sync_all().await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(!wrapped.armed.load(Ordering::SeqCst));
        let local = catalog::find_by_code(&db, "T-001").unwrap().unwrap();
        assert_eq!(local.stock.m, 9);
        assert_eq!(local.price, 27000);
        assert!(local.state.dirty);

        assert!(engine.sync_all().await.is_success());
        let pushed = remote.rows("products");
        assert_eq!(pushed.len(), 1);
        assert_eq!(pushed[0]["m"], 9);
        assert!(!catalog::find_by_code(&db, "T-001").unwrap().unwrap().state.dirty);
    }

    #[tokio::test]
    async fn test_terminals_sharing_an_id_still_sync_their_shifts() {
        let remote = Arc::new(MemoryRemote::new());
        let a = client(&remote);
        let b = client(&remote);
        let ctx = crate::context::OperatorContext::new("terminal-1");
        let shift_a = crate::shifts::open_shift(a.db(), &ctx, 100_000).unwrap();
        let shift_b = crate::shifts::open_shift(b.db(), &ctx, 50_000).unwrap();

        assert!(a.sync_all().await.is_success());
        let report = b.sync_all().await;
        assert!(report.is_success(), "{:?}", report.failures);
        assert!(report.last_synced_at.is_some());
        let report = a.sync_all().await;
        assert!(report.is_success(), "{:?}", report.failures);

        assert_eq!(remote.rows("cash_shifts").len(), 2);
        for (engine, own) in [(&a, &shift_a), (&b, &shift_b)] {
            assert_eq!(store::list::<Shift>(engine.db()).unwrap().len(), 2);
            let active = crate::shifts::active_shift(engine.db(), "terminal-1").unwrap().unwrap();
            assert_eq!(active.id, own.id);
        }
    }

    #[test]
    fn test_apply_remote_last_writer_wins() {
        let db = DbState::open_in_memory().unwrap();
        let local = store::upsert(&db, CatalogItem::new("T-001", "Local edit", 200)).unwrap();

        let mut older = CatalogItem::new("T-001", "Remote", 100);
        older.state = RecordState::remote(
            local.state.updated_at - Duration::seconds(10),
            local.state.updated_at - Duration::seconds(10),
        );
        assert_eq!(apply_remote(&db, older).unwrap(), ApplyOutcome::KeptLocal);
        assert_eq!(store::get::<CatalogItem>(&db, "T-001").unwrap().unwrap().price, 200);

        let mut newer = CatalogItem::new("T-001", "Remote", 100);
        newer.state = RecordState::remote(
            local.state.updated_at,
            local.state.updated_at + Duration::seconds(10),
        );
        assert_eq!(apply_remote(&db, newer.clone()).unwrap(), ApplyOutcome::Applied);
        let stored = store::get::<CatalogItem>(&db, "T-001").unwrap().unwrap();
        assert_eq!(stored.price, 100);
        assert!(!stored.state.dirty);

        assert_eq!(apply_remote(&db, newer).unwrap(), ApplyOutcome::Unchanged);
    }

    #[test]
    fn test_apply_remote_delete_keeps_dirty_rows() {
        let db = DbState::open_in_memory().unwrap();
        store::upsert(&db, CatalogItem::new("A", "Dirty", 100)).unwrap();
        assert_eq!(
            apply_remote_delete::<CatalogItem>(&db, "A").unwrap(),
            ApplyOutcome::KeptLocal
        );

        store::mark_clean::<CatalogItem>(&db, &["A".to_string()]).unwrap();
        assert_eq!(
            apply_remote_delete::<CatalogItem>(&db, "A").unwrap(),
            ApplyOutcome::Applied
        );
        assert!(store::get::<CatalogItem>(&db, "A").unwrap().is_none());
        assert_eq!(
            apply_remote_delete::<CatalogItem>(&db, "A").unwrap(),
            ApplyOutcome::Unchanged
        );
    }
}
