//! Change notifications for UI live queries.
//!
//! The store emits a [`StoreEvent`] after every committed write. A
//! [`LiveQuery`] listens for events on one table and re-runs its query,
//! independent of whatever UI framework renders the result.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tracing::debug;

use crate::db::DbState;
use crate::error::Result;
use crate::models::Table;
use crate::store::{self, Record};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Upsert,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StoreEvent {
    pub table: Table,
    pub key: String,
    pub kind: ChangeKind,
}

impl StoreEvent {
    pub fn new(table: Table, key: impl Into<String>, kind: ChangeKind) -> Self {
        Self {
            table,
            key: key.into(),
            kind,
        }
    }
}

/// Re-evaluates `list::<R>()` whenever its table changes.
pub struct LiveQuery<R: Record> {
    db: Arc<DbState>,
    events: broadcast::Receiver<StoreEvent>,
    _record: PhantomData<fn() -> R>,
}

impl<R: Record> LiveQuery<R> {
    pub fn new(db: Arc<DbState>) -> Self {
        let events = db.subscribe();
        Self {
            db,
            events,
            _record: PhantomData,
        }
    }

    /// Current result set.
    pub fn current(&self) -> Result<Vec<R>> {
        store::list(&self.db)
    }

    /// Wait for the next change to this query's table and return the fresh
    /// result set. Returns `None` once the store is gone.
    pub async fn next(&mut self) -> Option<Result<Vec<R>>> {
        loop {
            match self.events.recv().await {
                Ok(event) if event.table == R::TABLE => return Some(self.current()),
                Ok(_) => continue,
                // Missed events only mean we re-query once; nothing to replay.
                Err(RecvError::Lagged(skipped)) => {
                    debug!(table = %R::TABLE, skipped, "Live query lagged, refreshing");
                    return Some(self.current());
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CatalogItem, Customer, RecordState};

    #[tokio::test]
    async fn test_live_query_refreshes_on_own_table_only() {
        let db = Arc::new(DbState::open_in_memory().unwrap());
        let mut live = LiveQuery::<CatalogItem>::new(db.clone());
        assert!(live.current().unwrap().is_empty());

        store::upsert(
            &db,
            Customer {
                id_number: "1".into(),
                customer_type: "CC".into(),
                name: "Ana".into(),
                phone: None,
                email: None,
                address: None,
                state: RecordState::default(),
            },
        )
        .unwrap();
        store::upsert(&db, CatalogItem::new("T-001", "Tee", 100)).unwrap();

        let rows = live.next().await.expect("open").expect("query");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].code, "T-001");
    }
}
