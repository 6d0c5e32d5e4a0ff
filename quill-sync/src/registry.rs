//! Live connections on this worker, plus an approximate global count.
//!
//! The global count lives in the shared store as a counter bumped on
//! connect and disconnect. Decrements lost to a crashed worker leave it
//! drifting upward until the hub restarts; it is only used for display.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::store::DocumentStore;

/// Lifecycle of one connection. `Disconnected` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Active,
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    pub id: Uuid,
    pub worker_id: Uuid,
    pub state: ConnectionState,
    /// Last reported cursor offset
    pub cursor: Option<u64>,
    pub connected_at: Instant,
}

pub struct ConnectionRegistry {
    worker_id: Uuid,
    connections: RwLock<HashMap<Uuid, ConnectionInfo>>,
    store: Arc<dyn DocumentStore>,
}

impl ConnectionRegistry {
    pub fn new(worker_id: Uuid, store: Arc<dyn DocumentStore>) -> Self {
        Self {
            worker_id,
            connections: RwLock::new(HashMap::new()),
            store,
        }
    }

    /// Register a new connection in the `Connecting` state.
    pub async fn add(&self, id: Uuid) -> ConnectionInfo {
        let info = ConnectionInfo {
            id,
            worker_id: self.worker_id,
            state: ConnectionState::Connecting,
            cursor: None,
            connected_at: Instant::now(),
        };
        let inserted = self
            .connections
            .write()
            .await
            .insert(id, info.clone())
            .is_none();

        if inserted {
            if let Err(e) = self.store.adjust_participants(1).await {
                log::debug!("Participant counter not incremented: {e}");
            }
        }
        info
    }

    /// Drop a connection. Returns its last known info, marked `Disconnected`.
    pub async fn remove(&self, id: &Uuid) -> Option<ConnectionInfo> {
        let removed = self.connections.write().await.remove(id);
        if removed.is_some() {
            if let Err(e) = self.store.adjust_participants(-1).await {
                log::debug!("Participant counter not decremented: {e}");
            }
        }
        removed.map(|mut info| {
            info.state = ConnectionState::Disconnected;
            info
        })
    }

    pub async fn set_state(&self, id: &Uuid, state: ConnectionState) -> bool {
        match self.connections.write().await.get_mut(id) {
            Some(info) => {
                info.state = state;
                true
            }
            None => false,
        }
    }

    pub async fn set_cursor(&self, id: &Uuid, cursor: u64) {
        if let Some(info) = self.connections.write().await.get_mut(id) {
            info.cursor = Some(cursor);
        }
    }

    pub async fn get(&self, id: &Uuid) -> Option<ConnectionInfo> {
        self.connections.read().await.get(id).cloned()
    }

    pub async fn count_local(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Approximate participants across all workers. Never below the local
    /// count; falls back to it when the store is unreachable.
    pub async fn count_global(&self) -> u64 {
        let local = self.count_local().await as u64;
        match self.store.participants().await {
            Ok(n) => (n.max(0) as u64).max(local),
            Err(e) => {
                log::debug!("Using local participant count: {e}");
                local
            }
        }
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }
}
