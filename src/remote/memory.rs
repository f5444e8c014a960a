//! In-process remote store.
//!
//! Several local clients can share one `MemoryRemote` to exercise
//! multi-terminal sync. It can be switched offline to simulate partitions.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};
use tracing::debug;

use super::{row_key, ChangeFeed, RemoteChange, RemoteChangeKind, RemoteStore, RowFilter};
use crate::error::RemoteError;
use crate::models::parse_ts;

type Table = BTreeMap<String, Value>;

pub struct MemoryRemote {
    tables: Mutex<HashMap<String, Table>>,
    changes: broadcast::Sender<RemoteChange>,
    online: AtomicBool,
}

impl Default for MemoryRemote {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryRemote {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(1024);
        Self {
            tables: Mutex::new(HashMap::new()),
            changes,
            online: AtomicBool::new(true),
        }
    }

    /// While offline every call fails with a network error.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::SeqCst);
    }

    /// Snapshot of one table's rows, ordered by key.
    pub fn rows(&self, table: &str) -> Vec<Value> {
        self.tables
            .lock()
            .map(|t| t.get(table).map(|rows| rows.values().cloned().collect()).unwrap_or_default())
            .unwrap_or_default()
    }

    fn ensure_online(&self) -> Result<(), RemoteError> {
        if self.online.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(RemoteError::Network("remote unreachable (offline)".into()))
        }
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, HashMap<String, Table>>, RemoteError> {
        self.tables
            .lock()
            .map_err(|_| RemoteError::Network("memory remote poisoned".into()))
    }

    fn publish(&self, change: RemoteChange) {
        let _ = self.changes.send(change);
    }
}

fn matches(key: &str, row: &Value, filter: &RowFilter) -> bool {
    match filter {
        RowFilter::All => true,
        RowFilter::KeyIn { column, values } => row_key(row, column)
            .or_else(|| Some(key.to_string()))
            .is_some_and(|k| values.contains(&k)),
        RowFilter::UpdatedAfter(since) => row
            .get("updated_at")
            .and_then(Value::as_str)
            .and_then(parse_ts)
            .is_some_and(|ts| ts > *since),
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn select(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, RemoteError> {
        self.ensure_online()?;
        let tables = self.lock()?;
        Ok(tables
            .get(table)
            .map(|rows| {
                rows.iter()
                    .filter(|(key, row)| matches(key, row, filter))
                    .map(|(_, row)| row.clone())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn upsert(
        &self,
        table: &str,
        rows: &[Value],
        conflict_key: &str,
    ) -> Result<(), RemoteError> {
        self.ensure_online()?;
        let mut changes = Vec::with_capacity(rows.len());
        {
            let mut tables = self.lock()?;
            let target = tables.entry(table.to_string()).or_default();
            for row in rows {
                let key = row_key(row, conflict_key).ok_or_else(|| {
                    RemoteError::Status {
                        status: 400,
                        body: format!("row without conflict key '{conflict_key}'"),
                    }
                })?;
                let old = target.insert(key, row.clone());
                changes.push(RemoteChange {
                    table: table.to_string(),
                    kind: if old.is_some() {
                        RemoteChangeKind::Update
                    } else {
                        RemoteChangeKind::Insert
                    },
                    new: Some(row.clone()),
                    old,
                });
            }
        }
        debug!(table, rows = rows.len(), "Memory remote upsert");
        for change in changes {
            self.publish(change);
        }
        Ok(())
    }

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<(), RemoteError> {
        self.ensure_online()?;
        let removed: Vec<Value> = {
            let mut tables = self.lock()?;
            let Some(target) = tables.get_mut(table) else {
                return Ok(());
            };
            let keys: Vec<String> = target
                .iter()
                .filter(|(key, row)| matches(key, row, filter))
                .map(|(key, _)| key.clone())
                .collect();
            keys.iter().filter_map(|k| target.remove(k)).collect()
        };
        for old in removed {
            self.publish(RemoteChange {
                table: table.to_string(),
                kind: RemoteChangeKind::Delete,
                new: None,
                old: Some(old),
            });
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeFeed for MemoryRemote {
    async fn subscribe(&self, table: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError> {
        self.ensure_online()?;
        let mut source = self.changes.subscribe();
        let (tx, rx) = mpsc::channel(256);
        let table = table.to_string();
        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(change) if change.table == table => {
                        if tx.send(change).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(_)) => {}
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
        Ok(rx)
    }
}
