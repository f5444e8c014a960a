//! Realtime listener: applies remote change notifications to the local store
//! as they arrive, between sync cycles.
//!
//! Inserts and updates go through the same last-writer-wins merge as a pull.
//! Deletes remove clean local copies. Each table has its own task: when its
//! feed closes or cannot be opened, the task resubscribes with backoff until
//! the listener is stopped. A reconnect reported by the connectivity monitor
//! cuts the current wait short.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::db::DbState;
use crate::error::{RemoteError, Result};
use crate::mappers::RemoteMapping;
use crate::models::{CatalogItem, Customer, Return, Sale, SaleLine, Shift, Table};
use crate::remote::{row_key, ChangeFeed, RemoteChange, RemoteChangeKind};
use crate::sync::{apply_remote, apply_remote_delete, ApplyOutcome};

const RESUBSCRIBE_MIN_DELAY: Duration = Duration::from_millis(500);
const RESUBSCRIBE_MAX_DELAY: Duration = Duration::from_secs(60);

/// Handle over the per-table listener tasks.
pub struct RealtimeListener {
    token: CancellationToken,
    retry: Arc<Notify>,
    connected: Arc<AtomicUsize>,
    tasks: Vec<JoinHandle<()>>,
}

impl RealtimeListener {
    /// Subscribe to every synced table. A table whose first subscription
    /// fails is logged and retried in the background.
    pub async fn start(db: Arc<DbState>, feed: Arc<dyn ChangeFeed>) -> Self {
        let token = CancellationToken::new();
        let retry = Arc::new(Notify::new());
        let connected = Arc::new(AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for table in Table::ALL {
            let first = match feed.subscribe(table.remote_name()).await {
                Ok(rx) => {
                    connected.fetch_add(1, Ordering::SeqCst);
                    Some(rx)
                }
                Err(e) => {
                    warn!(table = %table, "Realtime subscription failed: {e}");
                    None
                }
            };
            let task = TableListener {
                db: db.clone(),
                feed: feed.clone(),
                table,
                token: token.child_token(),
                retry: retry.clone(),
                connected: connected.clone(),
            };
            tasks.push(tokio::spawn(task.run(first)));
        }
        info!(
            subscribed = connected.load(Ordering::SeqCst),
            tables = Table::ALL.len(),
            "Realtime listener started"
        );
        Self {
            token,
            retry,
            connected,
            tasks,
        }
    }

    /// A listener with no subscriptions, for terminals without a remote.
    pub fn inactive() -> Self {
        Self {
            token: CancellationToken::new(),
            retry: Arc::new(Notify::new()),
            connected: Arc::new(AtomicUsize::new(0)),
            tasks: Vec::new(),
        }
    }

    /// True while at least one table feed is open.
    pub fn is_active(&self) -> bool {
        !self.token.is_cancelled() && self.connected.load(Ordering::SeqCst) > 0
    }

    /// Skip the backoff of every table currently waiting to resubscribe.
    pub fn retry_now(&self) {
        self.retry.notify_waiters();
    }

    /// Retry closed feeds as soon as `connectivity` reports the network back.
    pub fn follow_connectivity(&mut self, connectivity: &ConnectivityMonitor) {
        let mut network = connectivity.subscribe();
        let retry = self.retry.clone();
        let token = self.token.child_token();
        self.tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    online = network.changed() => match online {
                        Some(true) => retry.notify_waiters(),
                        Some(false) => {}
                        None => break,
                    },
                }
            }
        }));
    }

    /// Stop every listener task and drop the subscriptions.
    pub async fn unsubscribe(self) {
        self.token.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        debug!("Realtime listener stopped");
    }
}

struct TableListener {
    db: Arc<DbState>,
    feed: Arc<dyn ChangeFeed>,
    table: Table,
    token: CancellationToken,
    retry: Arc<Notify>,
    connected: Arc<AtomicUsize>,
}

impl TableListener {
    /// `first` is the subscription opened by `start`, already counted as
    /// connected.
    async fn run(self, first: Option<mpsc::Receiver<RemoteChange>>) {
        let table = self.table;
        let mut delay = RESUBSCRIBE_MIN_DELAY;
        let mut current = first;
        loop {
            let mut rx = match current.take() {
                Some(rx) => rx,
                None => {
                    tokio::select! {
                        _ = self.token.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                        _ = self.retry.notified() => debug!(table = %table, "Realtime retry requested"),
                    }
                    let subscribed = tokio::select! {
                        _ = self.token.cancelled() => break,
                        result = self.feed.subscribe(table.remote_name()) => result,
                    };
                    match subscribed {
                        Ok(rx) => {
                            info!(table = %table, "Realtime feed resubscribed");
                            delay = RESUBSCRIBE_MIN_DELAY;
                            self.connected.fetch_add(1, Ordering::SeqCst);
                            rx
                        }
                        Err(e) => {
                            debug!(table = %table, retry_in_ms = delay.as_millis() as u64, "Realtime resubscribe failed: {e}");
                            delay = (delay * 2).min(RESUBSCRIBE_MAX_DELAY);
                            continue;
                        }
                    }
                }
            };

            let stopped = self.drain(&mut rx).await;
            self.connected.fetch_sub(1, Ordering::SeqCst);
            if stopped {
                break;
            }
            warn!(table = %table, "Realtime feed closed; resubscribing");
        }
    }

    /// Apply changes until the feed closes (`false`) or the listener is
    /// stopped (`true`).
    async fn drain(&self, rx: &mut mpsc::Receiver<RemoteChange>) -> bool {
        let table = self.table;
        loop {
            tokio::select! {
                _ = self.token.cancelled() => return true,
                change = rx.recv() => match change {
                    Some(change) => match apply_change(&self.db, table, &change) {
                        Ok(outcome) => debug!(table = %table, ?outcome, kind = ?change.kind, "Realtime change"),
                        Err(e) => warn!(table = %table, "Could not apply realtime change: {e}"),
                    },
                    None => return false,
                },
            }
        }
    }
}

/// Merge one change notification into the local store.
pub(crate) fn apply_change(
    db: &DbState,
    table: Table,
    change: &RemoteChange,
) -> Result<ApplyOutcome> {
    match table {
        Table::CatalogItems => apply_as::<CatalogItem>(db, change),
        Table::Customers => apply_as::<Customer>(db, change),
        Table::Shifts => apply_as::<Shift>(db, change),
        Table::Sales => apply_as::<Sale>(db, change),
        Table::SaleLines => apply_as::<SaleLine>(db, change),
        Table::Returns => apply_as::<Return>(db, change),
    }
}

fn apply_as<R: RemoteMapping>(db: &DbState, change: &RemoteChange) -> Result<ApplyOutcome> {
    match change.kind {
        RemoteChangeKind::Insert | RemoteChangeKind::Update => {
            let row = change
                .new
                .as_ref()
                .ok_or_else(|| RemoteError::Decode("change without a new row".into()))?;
            apply_remote(db, R::from_remote(row)?)
        }
        RemoteChangeKind::Delete => {
            let key = change
                .old
                .as_ref()
                .and_then(|old| row_key(old, R::TABLE.remote_key()))
                .ok_or_else(|| RemoteError::Decode("delete without the old row key".into()))?;
            apply_remote_delete::<R>(db, &key)
        }
    }
}
