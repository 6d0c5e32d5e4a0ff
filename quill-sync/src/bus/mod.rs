//! Publish/subscribe of [`ChangeEvent`]s between workers.
//!
//! Delivery is best-effort and unordered across publishers. Each event is a
//! full snapshot, so receivers apply whatever arrives last.
//!
//! - [`LocalBus`] — in-process, for tests and standalone mode
//! - [`RemoteBus`] — publishes and subscribes through the hub

pub mod relay;
pub mod remote;

use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;

use crate::broadcast::BroadcastGroup;
use crate::error::Result;
use crate::protocol::ChangeEvent;

pub use relay::BusRelay;
pub use remote::RemoteBus;

/// Buffered events per subscription.
const SUBSCRIPTION_CAPACITY: usize = 256;

/// A live subscription. `recv` returns `None` once the bus connection is lost.
pub struct Subscription {
    rx: mpsc::Receiver<ChangeEvent>,
    // Keeps whatever feeds `rx` alive for as long as the subscription is.
    _guard: Option<Box<dyn Any + Send + Sync>>,
}

impl Subscription {
    pub fn new(rx: mpsc::Receiver<ChangeEvent>) -> Self {
        Self { rx, _guard: None }
    }

    pub fn with_guard(rx: mpsc::Receiver<ChangeEvent>, guard: impl Any + Send + Sync) -> Self {
        Self {
            rx,
            _guard: Some(Box::new(guard)),
        }
    }

    pub async fn recv(&mut self) -> Option<ChangeEvent> {
        self.rx.recv().await
    }
}

#[async_trait]
pub trait Bus: Send + Sync {
    async fn publish(&self, event: &ChangeEvent) -> Result<()>;

    async fn subscribe(&self) -> Result<Subscription>;
}

/// In-process bus over a tokio broadcast channel.
pub struct LocalBus {
    group: Arc<BroadcastGroup<ChangeEvent>>,
}

impl LocalBus {
    pub fn new(capacity: usize) -> Self {
        Self {
            group: Arc::new(BroadcastGroup::new(capacity)),
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.group.receiver_count()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(SUBSCRIPTION_CAPACITY)
    }
}

#[async_trait]
impl Bus for LocalBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        self.group.send(event.clone());
        Ok(())
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let mut source = self.group.subscribe();
        let group = self.group.clone();
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);

        tokio::spawn(async move {
            loop {
                match source.recv().await {
                    Ok(event) => {
                        if tx.send(event).await.is_err() {
                            break;
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        group.record_dropped(n);
                        log::warn!("Local bus subscriber lagged by {n} events");
                    }
                    Err(RecvError::Closed) => break,
                }
            }
        });

        Ok(Subscription::new(rx))
    }
}
