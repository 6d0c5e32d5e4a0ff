//! Error taxonomy for the sync core.
//!
//! Every variant except `Io` at bind time is recoverable: the session layer
//! logs it and keeps serving local edits.

use thiserror::Error;

/// Errors produced by the store, the bus, and the transports around them.
#[derive(Debug, Error)]
pub enum SyncError {
    /// The shared document store could not be reached or refused the request.
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),

    /// The broadcast bus could not be reached.
    #[error("bus unavailable: {0}")]
    BusUnavailable(String),

    /// A client or hub link failed mid-flight.
    #[error("transport error: {0}")]
    Transport(String),

    /// A frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// The durable backend rejected an operation.
    #[error("storage error: {0}")]
    Storage(String),

    /// A supervised worker process exited.
    #[error("worker {slot} exited: {status}")]
    WorkerCrash { slot: usize, status: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, SyncError>;

impl SyncError {
    /// Whether this error leaves the worker in a degraded (but running) state.
    pub fn is_degraded(&self) -> bool {
        matches!(
            self,
            SyncError::StoreUnavailable(_) | SyncError::BusUnavailable(_)
        )
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Transport(e.to_string())
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::Storage(e.to_string())
    }
}

impl From<serde_json::Error> for SyncError {
    fn from(e: serde_json::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}
