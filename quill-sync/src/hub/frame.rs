//! Binary frames exchanged between workers and the hub.
//!
//! Each WebSocket binary message carries exactly one bincode-encoded
//! [`HubFrame`]. Requests carry an `id` chosen by the link; the hub answers
//! with a `Reply` carrying the same `id`.

use serde::{Deserialize, Serialize};

use crate::error::{Result, SyncError};
use crate::protocol::ChangeEvent;

/// Result carried by a `Reply` frame.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubReply {
    Text(String),
    Count(i64),
    Ack,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum HubFrame {
    Get { id: u64 },
    Set { id: u64, text: String },
    SaveSnapshot { id: u64, text: String, timestamp: String },
    AdjustParticipants { id: u64, delta: i64 },
    Participants { id: u64 },
    /// Start receiving `Event` frames on this link.
    Subscribe { id: u64 },
    Publish { id: u64, event: ChangeEvent },
    Reply { id: u64, result: HubReply },
    Event { event: ChangeEvent },
}

impl HubFrame {
    pub fn encode(&self) -> Result<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))
    }

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let (frame, _) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        Ok(frame)
    }
}
