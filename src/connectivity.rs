//! Connectivity monitor.
//!
//! Holds the terminal's current online/offline view and notifies
//! subscribers on every transition. The state is fed either by the platform
//! layer (`set_online`) or by the built-in HTTP probe against the remote.

use std::time::Duration;

use reqwest::Client;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::RemoteConfig;

const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct ConnectivityMonitor {
    state: watch::Sender<bool>,
}

impl ConnectivityMonitor {
    pub fn new(initially_online: bool) -> Self {
        let (state, _) = watch::channel(initially_online);
        Self { state }
    }

    pub fn is_online(&self) -> bool {
        *self.state.borrow()
    }

    /// Record the current state. Subscribers are woken only on a change.
    pub fn set_online(&self, online: bool) {
        let changed = self.state.send_if_modified(|current| {
            if *current == online {
                false
            } else {
                *current = online;
                true
            }
        });
        if changed {
            if online {
                info!("Network restored");
            } else {
                info!("Network offline; local writes stay queued");
            }
        }
    }

    pub fn subscribe(&self) -> ConnectivitySubscription {
        ConnectivitySubscription {
            rx: self.state.subscribe(),
        }
    }

    /// Poll the remote's REST endpoint every `interval` until `token` fires.
    pub fn spawn_probe(
        &self,
        remote: &RemoteConfig,
        interval: Duration,
        token: CancellationToken,
    ) -> JoinHandle<()> {
        let monitor = self.clone();
        let url = format!("{}/", remote.rest_url());
        let api_key = remote.api_key.clone();
        tokio::spawn(async move {
            let client = match Client::builder().timeout(PROBE_TIMEOUT).build() {
                Ok(c) => c,
                Err(e) => {
                    warn!("Connectivity probe disabled: {e}");
                    return;
                }
            };
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = ticker.tick() => {
                        let online = probe(&client, &url, api_key.as_str()).await;
                        monitor.set_online(online);
                    }
                }
            }
            debug!("Connectivity probe stopped");
        })
    }
}

/// Any HTTP answer below 500 means the remote is reachable; auth problems
/// surface in the sync report instead.
async fn probe(client: &Client, url: &str, api_key: &str) -> bool {
    match client
        .head(url)
        .header("apikey", api_key)
        .header("Authorization", format!("Bearer {api_key}"))
        .send()
        .await
    {
        Ok(resp) => !resp.status().is_server_error(),
        Err(e) => {
            debug!("Connectivity probe failed: {e}");
            false
        }
    }
}

/// Receives connectivity transitions. Dropping it unsubscribes.
pub struct ConnectivitySubscription {
    rx: watch::Receiver<bool>,
}

impl ConnectivitySubscription {
    /// Wait for the next transition and return the new state. `None` once
    /// the monitor is gone.
    pub async fn changed(&mut self) -> Option<bool> {
        self.rx.changed().await.ok()?;
        Some(*self.rx.borrow_and_update())
    }

    pub fn current(&self) -> bool {
        *self.rx.borrow()
    }

    pub fn unsubscribe(self) {}
}
