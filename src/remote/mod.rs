//! Remote boundary: row-oriented table access plus change notifications.
//!
//! The sync engine and realtime listener only see these traits. Production
//! talks to a PostgREST/Supabase backend ([`supabase`], [`realtime_ws`]);
//! tests share one [`memory::MemoryRemote`] between several clients.

pub mod memory;
pub mod realtime_ws;
pub mod supabase;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::mpsc;

use crate::error::RemoteError;

/// Row selection for `select` and `delete`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RowFilter {
    All,
    /// `column IN (values)`.
    KeyIn { column: String, values: Vec<String> },
    /// Rows whose `updated_at` is strictly after the instant.
    UpdatedAfter(DateTime<Utc>),
}

impl RowFilter {
    pub fn key_in(column: &str, values: Vec<String>) -> Self {
        RowFilter::KeyIn {
            column: column.to_string(),
            values,
        }
    }
}

#[async_trait]
pub trait RemoteStore: Send + Sync {
    async fn select(&self, table: &str, filter: &RowFilter) -> Result<Vec<Value>, RemoteError>;

    /// Insert-or-replace keyed by `conflict_key`. Whole rows are replaced.
    async fn upsert(&self, table: &str, rows: &[Value], conflict_key: &str)
        -> Result<(), RemoteError>;

    async fn delete(&self, table: &str, filter: &RowFilter) -> Result<(), RemoteError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RemoteChangeKind {
    Insert,
    Update,
    Delete,
}

/// One change notification from the remote, with new/old row payloads.
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteChange {
    pub table: String,
    pub kind: RemoteChangeKind,
    pub new: Option<Value>,
    pub old: Option<Value>,
}

/// Per-table change subscription. Dropping the receiver ends it.
#[async_trait]
pub trait ChangeFeed: Send + Sync {
    async fn subscribe(&self, table: &str) -> Result<mpsc::Receiver<RemoteChange>, RemoteError>;
}

/// Row key as text, whatever JSON type the remote used for it.
pub fn row_key(row: &Value, column: &str) -> Option<String> {
    match row.get(column)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}
