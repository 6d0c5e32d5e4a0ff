//! The shared document store.
//!
//! ```text
//! ┌──────────┐  get / set   ┌──────────────┐
//! │ Worker 1 │ ───────────► │              │
//! ├──────────┤              │ DocumentStore│  one slot: current text
//! │ Worker 2 │ ───────────► │              │  audit slot: snapshots
//! └──────────┘              └──────────────┘  counter: participants
//! ```
//!
//! Concurrent `set`s never merge: the last one to complete wins.
//!
//! - [`MemoryStore`] — in-process, for tests and standalone mode
//! - [`RocksStore`] — durable, owned by the hub
//! - [`RemoteStore`] — a worker's view of the hub's store

pub mod remote;
pub mod rocks;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicI64, Ordering};
use tokio::sync::{Mutex, RwLock};

use crate::error::Result;

pub use remote::RemoteStore;
pub use rocks::{RocksStore, StoreConfig};

/// A saved copy of the document, written on `save-text`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Snapshot {
    pub timestamp: String,
    pub text: String,
}

/// Key-value slot holding the current document, plus the audit and presence
/// side slots.
#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Current document text. A never-written store yields `""`.
    async fn get(&self) -> Result<String>;

    /// Overwrite the document.
    async fn set(&self, text: &str) -> Result<()>;

    /// Persist a timestamped copy. Never read back by the live path.
    async fn save_snapshot(&self, text: &str, timestamp: &str) -> Result<()>;

    /// Add `delta` to the participant counter and return the new value.
    async fn adjust_participants(&self, delta: i64) -> Result<i64>;

    async fn participants(&self) -> Result<i64>;
}

/// In-process store.
#[derive(Default)]
pub struct MemoryStore {
    text: RwLock<String>,
    snapshots: Mutex<Vec<Snapshot>>,
    participants: AtomicI64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Saved snapshots in write order.
    pub async fn snapshots(&self) -> Vec<Snapshot> {
        self.snapshots.lock().await.clone()
    }
}

#[async_trait]
impl DocumentStore for MemoryStore {
    async fn get(&self) -> Result<String> {
        Ok(self.text.read().await.clone())
    }

    async fn set(&self, text: &str) -> Result<()> {
        *self.text.write().await = text.to_string();
        Ok(())
    }

    async fn save_snapshot(&self, text: &str, timestamp: &str) -> Result<()> {
        self.snapshots.lock().await.push(Snapshot {
            timestamp: timestamp.to_string(),
            text: text.to_string(),
        });
        Ok(())
    }

    async fn adjust_participants(&self, delta: i64) -> Result<i64> {
        Ok(self.participants.fetch_add(delta, Ordering::SeqCst) + delta)
    }

    async fn participants(&self) -> Result<i64> {
        Ok(self.participants.load(Ordering::SeqCst))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_never_written_is_empty() {
        let store = MemoryStore::new();
        assert_eq!(store.get().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_set_then_get() {
        let store = MemoryStore::new();
        store.set("hello").await.unwrap();
        assert_eq!(store.get().await.unwrap(), "hello");
        store.set("").await.unwrap();
        assert_eq!(store.get().await.unwrap(), "");
    }

    #[tokio::test]
    async fn test_concurrent_sets_leave_one_whole_value() {
        let store = Arc::new(MemoryStore::new());
        let mut tasks = Vec::new();
        for i in 0..32 {
            let store = store.clone();
            tasks.push(tokio::spawn(async move {
                store.set(&format!("writer-{i}")).await.unwrap();
            }));
        }
        for t in tasks {
            t.await.unwrap();
        }

        let value = store.get().await.unwrap();
        let n: usize = value.strip_prefix("writer-").unwrap().parse().unwrap();
        assert!(n < 32);
    }

    #[tokio::test]
    async fn test_snapshots_do_not_touch_document() {
        let store = MemoryStore::new();
        store.set("live").await.unwrap();
        store.save_snapshot("saved", "2024-05-01T10:00:00Z").await.unwrap();

        assert_eq!(store.get().await.unwrap(), "live");
        let snaps = store.snapshots().await;
        assert_eq!(snaps.len(), 1);
        assert_eq!(snaps[0].text, "saved");
        assert_eq!(snaps[0].timestamp, "2024-05-01T10:00:00Z");
    }

    #[tokio::test]
    async fn test_participant_counter() {
        let store = MemoryStore::new();
        assert_eq!(store.adjust_participants(1).await.unwrap(), 1);
        assert_eq!(store.adjust_participants(1).await.unwrap(), 2);
        assert_eq!(store.adjust_participants(-1).await.unwrap(), 1);
        assert_eq!(store.participants().await.unwrap(), 1);
    }
}
