//! Per-peer incremental sync cursors.
//!
//! `sync_meta` maps peer node id to the wall clock of the last successful
//! exchange. A cursor of 0 means "never synced, send full state". The
//! cursor is set to the clock value taken *before* the request was built,
//! so anything written during the exchange is re-sent next round instead of
//! being lost.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::store::{SYNC_META_DOC, Store};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CursorEntry {
    #[serde(default)]
    pub last_sync_time: f64,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

type CursorDoc = BTreeMap<String, CursorEntry>;

pub struct SyncCursors {
    store: Arc<Store>,
}

impl SyncCursors {
    pub fn new(store: Arc<Store>) -> Self {
        Self { store }
    }

    pub async fn get(&self, peer_id: &str) -> f64 {
        let doc: CursorDoc = self.store.read(SYNC_META_DOC, CursorDoc::new()).await;
        doc.get(peer_id).map(|e| e.last_sync_time).unwrap_or(0.0)
    }

    /// Advance the cursor after a fully successful exchange. Never moves
    /// backwards.
    pub async fn set(&self, peer_id: &str, ts: f64) {
        let peer_id = peer_id.to_string();
        let result = self
            .store
            .update(SYNC_META_DOC, CursorDoc::new(), move |mut doc| {
                let entry = doc.entry(peer_id).or_default();
                if ts > entry.last_sync_time {
                    entry.last_sync_time = ts;
                }
                doc
            })
            .await;
        if let Err(e) = result {
            tracing::error!("failed to persist sync cursor: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unknown_peer_reads_zero() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = SyncCursors::new(Arc::new(Store::open(dir.path()).unwrap()));
        assert_eq!(cursors.get("nobody").await, 0.0);
    }

    #[tokio::test]
    async fn cursor_is_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let cursors = SyncCursors::new(Arc::new(Store::open(dir.path()).unwrap()));

        cursors.set("peer-1", 100.0).await;
        assert_eq!(cursors.get("peer-1").await, 100.0);

        // A stale exchange that finished out of order must not rewind it.
        cursors.set("peer-1", 50.0).await;
        assert_eq!(cursors.get("peer-1").await, 100.0);

        cursors.set("peer-1", 150.0).await;
        assert_eq!(cursors.get("peer-1").await, 150.0);
    }
}
