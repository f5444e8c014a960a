//! Boutique POS - offline-first sync core
//!
//! Local SQLite store with dirty/tombstone tracking, push-then-pull sync
//! against a shared PostgREST remote, realtime change propagation, stock
//! bookkeeping per size and shift cash reconciliation. UI layers sit on top
//! of [`PosClient`] and the per-entity modules.

pub mod catalog;
pub mod config;
pub mod connectivity;
pub mod context;
pub mod customers;
pub mod db;
pub mod error;
pub mod live;
pub mod mappers;
pub mod models;
pub mod realtime;
pub mod remote;
pub mod returns;
pub mod sales;
pub mod scheduler;
pub mod shifts;
pub mod storage;
pub mod store;
pub mod sync;

use std::path::Path;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

pub use config::{LoggingConfig, PosConfig, RemoteConfig};
pub use connectivity::{ConnectivityMonitor, ConnectivitySubscription};
pub use context::OperatorContext;
pub use db::DbState;
pub use error::{PosError, RemoteError, Result};
pub use realtime::RealtimeListener;
pub use scheduler::{SyncScheduler, SyncStatus};
pub use sync::{SyncEngine, SyncReport};

use crate::remote::realtime_ws::SupabaseRealtime;
use crate::remote::supabase::SupabaseRemote;
use crate::remote::{ChangeFeed, RemoteStore};

const DEFAULT_LOG_FILTER: &str = "info,boutique_pos_lib=debug";
const LOG_FILE_PREFIX: &str = "pos";

/// Install the global tracing subscriber: console output plus, when
/// `config.dir` is set, a daily rolling file. The returned guard flushes the
/// file writer on drop and must be held for the life of the process.
pub fn init_logging(config: &LoggingConfig) -> Result<Option<WorkerGuard>> {
    let env_filter = match &config.filter {
        Some(filter) => EnvFilter::try_new(filter)
            .map_err(|e| PosError::Config(format!("invalid log filter '{filter}': {e}")))?,
        None => EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
    };

    let (file_writer, guard) = match &config.dir {
        Some(dir) => {
            std::fs::create_dir_all(dir)
                .map_err(|e| PosError::Config(format!("create log dir {}: {e}", dir.display())))?;
            let appender = tracing_appender::rolling::daily(dir, LOG_FILE_PREFIX);
            let (writer, guard) = tracing_appender::non_blocking(appender);
            (Some(writer), Some(guard))
        }
        None => (None, None),
    };

    let json = config.json;
    let console_plain = (!json).then(|| fmt::layer().with_target(true));
    let console_json = json.then(|| fmt::layer().json().with_target(true));
    let file_plain = file_writer
        .clone()
        .filter(|_| !json)
        .map(|w| fmt::layer().with_writer(w).with_ansi(false).with_target(true));
    let file_json = file_writer
        .filter(|_| json)
        .map(|w| fmt::layer().json().with_writer(w).with_target(true));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(console_plain)
        .with(console_json)
        .with(file_plain)
        .with(file_json)
        .try_init()
        .map_err(|e| PosError::Config(format!("logging already initialized: {e}")))?;

    info!("Starting Boutique POS v{}", env!("CARGO_PKG_VERSION"));
    Ok(guard)
}

fn open_store(path: &Path) -> Result<DbState> {
    if path.as_os_str() == ":memory:" {
        DbState::open_in_memory()
    } else {
        DbState::open(path)
    }
}

/// A running terminal: local store, sync engine and its background tasks.
pub struct PosClient {
    config: PosConfig,
    terminal_id: String,
    db: Arc<DbState>,
    engine: Arc<SyncEngine>,
    connectivity: ConnectivityMonitor,
    scheduler: SyncScheduler,
    realtime: RealtimeListener,
    background: CancellationToken,
    probe: Option<JoinHandle<()>>,
}

impl PosClient {
    /// Open the store and start sync, realtime and (when a remote URL is
    /// configured) the connectivity probe.
    pub async fn open(
        config: PosConfig,
        remote: Arc<dyn RemoteStore>,
        feed: Arc<dyn ChangeFeed>,
    ) -> Result<Self> {
        let db = Arc::new(open_store(&config.db_path)?);
        let terminal_id = {
            let conn = db.lock()?;
            db::resolve_terminal_id(&conn, config.terminal_id.as_deref())?
        };
        let engine = Arc::new(SyncEngine::new(db.clone(), remote));
        let connectivity = ConnectivityMonitor::new(true);
        let background = CancellationToken::new();
        let probe = config.remote.as_ref().map(|remote| {
            connectivity.spawn_probe(remote, config.probe_interval, background.child_token())
        });
        let mut realtime = RealtimeListener::start(db.clone(), feed).await;
        realtime.follow_connectivity(&connectivity);
        let scheduler =
            SyncScheduler::start(engine.clone(), connectivity.clone(), config.sync_interval);
        info!(terminal = %terminal_id, "Terminal ready");

        Ok(Self {
            config,
            terminal_id,
            db,
            engine,
            connectivity,
            scheduler,
            realtime,
            background,
            probe,
        })
    }

    /// Open against the Supabase backend from the config, falling back to
    /// credentials stored in the OS keyring.
    pub async fn connect(config: PosConfig) -> Result<Self> {
        let config = storage::with_stored_remote(config);
        let remote_config = config.remote.clone().ok_or_else(|| {
            RemoteError::NotConfigured("no remote URL/key in environment or credential store".into())
        })?;
        let remote = Arc::new(SupabaseRemote::new(&remote_config)?);
        let feed = Arc::new(SupabaseRealtime::new(&remote_config));
        Self::open(config, remote, feed).await
    }

    pub fn config(&self) -> &PosConfig {
        &self.config
    }

    pub fn terminal_id(&self) -> &str {
        &self.terminal_id
    }

    pub fn db(&self) -> &Arc<DbState> {
        &self.db
    }

    pub fn connectivity(&self) -> &ConnectivityMonitor {
        &self.connectivity
    }

    /// Operator context for this terminal, tagged with its open shift.
    pub fn context(&self, operator_id: Option<&str>) -> Result<OperatorContext> {
        let mut ctx = OperatorContext::new(&self.terminal_id);
        if let Some(operator) = operator_id {
            ctx = ctx.with_operator(operator);
        }
        if let Some(shift) = shifts::active_shift(&self.db, &self.terminal_id)? {
            ctx = ctx.with_shift(shift.id);
        }
        Ok(ctx)
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.scheduler.status()
    }

    /// Ask the scheduler for a cycle without waiting for it.
    pub fn trigger_sync(&self) {
        self.scheduler.trigger();
    }

    /// Run a cycle now and wait for its report.
    pub async fn sync_now(&self) -> SyncReport {
        self.engine.sync_all().await
    }

    pub async fn shutdown(self) {
        self.background.cancel();
        self.realtime.unsubscribe().await;
        self.scheduler.stop().await;
        if let Some(probe) = self.probe {
            let _ = probe.await;
        }
        info!(terminal = %self.terminal_id, "Terminal shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::Duration;

    use crate::models::{CatalogItem, SizeBucket};
    use crate::remote::memory::MemoryRemote;
    use crate::sales::CartEntry;

    fn terminal(id: Option<&str>) -> PosConfig {
        PosConfig {
            db_path: PathBuf::from(":memory:"),
            terminal_id: id.map(String::from),
            sync_interval: Duration::from_secs(3600),
            ..PosConfig::default()
        }
    }

    #[test]
    fn test_init_logging_rejects_bad_filter() {
        let config = LoggingConfig {
            filter: Some("boutique_pos_lib=loud".into()),
            ..LoggingConfig::default()
        };
        assert!(matches!(init_logging(&config), Err(PosError::Config(_))));
    }

    #[tokio::test]
    async fn test_two_terminals_share_stock() {
        let remote = Arc::new(MemoryRemote::new());
        let a = PosClient::open(terminal(Some("t-a")), remote.clone(), remote.clone())
            .await
            .unwrap();
        let b = PosClient::open(terminal(Some("t-b")), remote.clone(), remote.clone())
            .await
            .unwrap();

        catalog::create_item(
            a.db(),
            CatalogItem::new("T-001", "Tee", 25000).with_stock(SizeBucket::M, 10),
        )
        .unwrap();
        assert!(a.sync_now().await.is_success());

        let ctx = b.context(Some("cashier-1")).unwrap();
        assert!(ctx.shift_id.is_none());
        b.sync_now().await;
        sales::checkout(
            b.db(),
            &ctx,
            &[CartEntry::new("T-001", SizeBucket::M, 2)],
            models::PaymentMethod::Cash,
            None,
        )
        .unwrap();
        assert!(b.sync_now().await.is_success());
        assert!(a.sync_now().await.is_success());

        let item = catalog::find_by_code(a.db(), "T-001").unwrap().unwrap();
        assert_eq!(item.stock.m, 8);
        assert_eq!(sales::list_sales(a.db()).unwrap().len(), 1);

        a.shutdown().await;
        b.shutdown().await;
    }

    #[tokio::test]
    async fn test_unconfigured_terminals_get_distinct_ids() {
        let remote = Arc::new(MemoryRemote::new());
        let a = PosClient::open(terminal(None), remote.clone(), remote.clone())
            .await
            .unwrap();
        let b = PosClient::open(terminal(None), remote.clone(), remote.clone())
            .await
            .unwrap();
        assert_ne!(a.terminal_id(), b.terminal_id());
        assert_eq!(a.context(None).unwrap().terminal_id, a.terminal_id());

        shifts::open_shift(a.db(), &a.context(None).unwrap(), 0).unwrap();
        shifts::open_shift(b.db(), &b.context(None).unwrap(), 0).unwrap();
        assert!(a.sync_now().await.is_success());
        assert!(b.sync_now().await.is_success());
        assert!(a.sync_now().await.is_success());
        assert!(a.context(None).unwrap().shift_id.is_some());

        a.shutdown().await;
        b.shutdown().await;
    }
}
