//! Fan-out to every subscriber with bounded per-receiver buffering.
//!
//! Backed by a tokio broadcast channel. A receiver that falls behind by more
//! than `capacity` items skips the oldest ones; since every payload carried
//! here is a full-state snapshot, the newest item is all a lagging receiver
//! needs.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::protocol::ServerMessage;

/// Statistics for monitoring broadcast health.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastStats {
    pub messages_sent: u64,
    pub messages_dropped: u64,
    pub receivers: usize,
}

struct AtomicBroadcastStats {
    messages_sent: AtomicU64,
    messages_dropped: AtomicU64,
}

/// A broadcast group for one kind of payload.
///
/// The worker uses it for outbound client messages, the hub for encoded
/// event frames, and [`LocalBus`](crate::bus::LocalBus) for change events.
pub struct BroadcastGroup<T> {
    sender: broadcast::Sender<T>,
    stats: Arc<AtomicBroadcastStats>,
}

impl<T: Clone> BroadcastGroup<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            stats: Arc::new(AtomicBroadcastStats {
                messages_sent: AtomicU64::new(0),
                messages_dropped: AtomicU64::new(0),
            }),
        }
    }

    /// Send to all current receivers. Returns how many there were.
    pub fn send(&self, item: T) -> usize {
        let count = self.sender.send(item).unwrap_or(0);
        self.stats.messages_sent.fetch_add(1, Ordering::Relaxed);
        count
    }

    pub fn subscribe(&self) -> broadcast::Receiver<T> {
        self.sender.subscribe()
    }

    /// Record items a lagging receiver skipped.
    pub fn record_dropped(&self, n: u64) {
        self.stats.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    pub fn stats(&self) -> BroadcastStats {
        BroadcastStats {
            messages_sent: self.stats.messages_sent.load(Ordering::Relaxed),
            messages_dropped: self.stats.messages_dropped.load(Ordering::Relaxed),
            receivers: self.sender.receiver_count(),
        }
    }
}

/// A message bound for local connections, optionally skipping one of them.
#[derive(Debug, Clone)]
pub struct Outbound {
    pub except: Option<Uuid>,
    pub message: Arc<ServerMessage>,
}

impl Outbound {
    pub fn to_all(message: ServerMessage) -> Self {
        Self {
            except: None,
            message: Arc::new(message),
        }
    }

    pub fn to_others(except: Uuid, message: ServerMessage) -> Self {
        Self {
            except: Some(except),
            message: Arc::new(message),
        }
    }

    /// Whether the connection `id` should receive this message.
    pub fn is_for(&self, id: Uuid) -> bool {
        self.except != Some(id)
    }
}
