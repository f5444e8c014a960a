//! Background sync supervisor.
//!
//! Runs `sync_all` once at start, then on a fixed interval, whenever the
//! connectivity monitor reports offline→online, and on manual trigger. A
//! failed cycle shortens the wait to an exponential backoff with
//! deterministic jitter; a clean cycle resets it to the interval. Offline
//! cycles are not skipped: they fail fast and count as failures.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::connectivity::ConnectivityMonitor;
use crate::store;
use crate::sync::{SyncEngine, SyncReport};

const DEFAULT_RETRY_DELAY_MS: u64 = 5_000;
const MAX_RETRY_DELAY_MS: u64 = 300_000;

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub running: bool,
    pub last_report: Option<SyncReport>,
    pub last_success: Option<DateTime<Utc>>,
    /// Dirty rows still waiting for a push.
    pub pending: i64,
    pub consecutive_failures: u32,
    /// Delay before the next automatic cycle when the last one failed.
    pub retry_in_ms: Option<u64>,
}

fn deterministic_jitter_ms(seed: i64) -> u64 {
    (seed.unsigned_abs() % 700) + 50
}

/// Wait after `failures` consecutive failed cycles: 5 s doubling per failure,
/// capped at 300 s, plus up to 750 ms of jitter.
pub(crate) fn backoff_delay(failures: u32, seed: i64) -> Duration {
    let exp = failures.saturating_sub(1).min(16);
    let base = DEFAULT_RETRY_DELAY_MS
        .saturating_mul(1u64 << exp)
        .min(MAX_RETRY_DELAY_MS);
    Duration::from_millis(base + deterministic_jitter_ms(seed))
}

pub struct SyncScheduler {
    trigger: Arc<Notify>,
    status: watch::Receiver<SyncStatus>,
    token: CancellationToken,
    task: JoinHandle<()>,
}

impl SyncScheduler {
    pub fn start(
        engine: Arc<SyncEngine>,
        connectivity: ConnectivityMonitor,
        interval: Duration,
    ) -> Self {
        let trigger = Arc::new(Notify::new());
        let token = CancellationToken::new();
        let pending = store::pending_count(engine.db()).unwrap_or_default();
        let (status_tx, status) = watch::channel(SyncStatus {
            pending,
            ..SyncStatus::default()
        });
        let task = tokio::spawn(run(
            engine,
            connectivity,
            interval,
            trigger.clone(),
            status_tx,
            token.clone(),
        ));
        info!("Sync scheduler started (interval: {}s)", interval.as_secs());
        Self {
            trigger,
            status,
            token,
            task,
        }
    }

    /// Request a cycle now. Coalesces with any trigger already waiting.
    pub fn trigger(&self) {
        self.trigger.notify_one();
    }

    pub fn status(&self) -> SyncStatus {
        self.status.borrow().clone()
    }

    pub fn watch_status(&self) -> watch::Receiver<SyncStatus> {
        self.status.clone()
    }

    /// Stop after the in-flight cycle, if any, completes.
    pub async fn stop(self) {
        self.token.cancel();
        if let Err(e) = self.task.await {
            warn!("Sync scheduler task ended abnormally: {e}");
        }
        info!("Sync scheduler stopped");
    }
}

async fn run(
    engine: Arc<SyncEngine>,
    connectivity: ConnectivityMonitor,
    interval: Duration,
    trigger: Arc<Notify>,
    status: watch::Sender<SyncStatus>,
    token: CancellationToken,
) {
    // The monitor clone keeps the sender alive, so `changed()` never ends.
    let mut network = connectivity.subscribe();
    let mut failures: u32 = 0;
    // Only a completed cycle moves the deadline; connectivity noise does not.
    let next_cycle = tokio::time::sleep(Duration::ZERO);
    tokio::pin!(next_cycle);

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            _ = &mut next_cycle => {}
            _ = trigger.notified() => debug!("Manual sync requested"),
            online = network.changed() => {
                if online != Some(true) {
                    continue;
                }
                info!("Network restored; resuming queued sync");
            }
        }

        status.send_modify(|s| s.running = true);
        let report = engine.sync_all().await;
        let pending = match store::pending_count(engine.db()) {
            Ok(n) => Some(n),
            Err(e) => {
                warn!("Could not count pending rows: {e}");
                None
            }
        };

        let (wait, retry_in) = if report.is_success() {
            failures = 0;
            (interval, None)
        } else {
            failures = failures.saturating_add(1);
            let wait = backoff_delay(failures, report.started_at.timestamp_millis()).min(interval);
            (wait, Some(wait))
        };
        next_cycle.as_mut().reset(tokio::time::Instant::now() + wait);

        status.send_modify(|s| {
            s.running = false;
            if report.is_success() {
                s.last_success = Some(report.finished_at);
            }
            if let Some(n) = pending {
                s.pending = n;
            }
            s.consecutive_failures = failures;
            s.retry_in_ms = retry_in.map(|d| d.as_millis() as u64);
            s.last_report = Some(report);
        });
    }
}
