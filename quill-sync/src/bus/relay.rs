//! Relays bus events to this worker's connections.
//!
//! One relay per worker. When the subscription is lost the relay reconnects
//! with exponential backoff; in between, the worker is degraded and edits
//! made elsewhere do not reach its clients.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::{Bus, Subscription};
use crate::broadcast::{BroadcastGroup, Outbound};
use crate::config::BackoffConfig;
use crate::error::Result;
use crate::protocol::ServerMessage;

pub struct BusRelay {
    bus: Arc<dyn Bus>,
    fanout: Arc<BroadcastGroup<Outbound>>,
    backoff: BackoffConfig,
    connected: Arc<AtomicBool>,
}

impl BusRelay {
    pub fn new(
        bus: Arc<dyn Bus>,
        fanout: Arc<BroadcastGroup<Outbound>>,
        backoff: BackoffConfig,
        connected: Arc<AtomicBool>,
    ) -> Self {
        Self {
            bus,
            fanout,
            backoff,
            connected,
        }
    }

    /// Make the first subscription attempt, then keep relaying in the
    /// background. Returns once the first attempt has finished, so a worker
    /// that starts with a healthy bus is subscribed before it accepts clients.
    pub async fn start(self) -> JoinHandle<()> {
        let first = self.bus.subscribe().await;
        tokio::spawn(self.run(first))
    }

    async fn run(self, mut next: Result<Subscription>) {
        let mut attempt: u32 = 0;
        loop {
            match next {
                Ok(sub) => {
                    if attempt > 0 {
                        log::info!("Bus subscription restored after {attempt} retries");
                    }
                    attempt = 0;
                    self.connected.store(true, Ordering::SeqCst);
                    self.relay(sub).await;
                    self.connected.store(false, Ordering::SeqCst);
                    log::warn!("Bus subscription lost; edits will not propagate until it is restored");
                }
                Err(e) => {
                    if attempt == 0 {
                        log::warn!("Bus unavailable: {e}");
                    } else {
                        log::debug!("Bus retry {attempt} failed: {e}");
                    }
                }
            }

            let delay = self.backoff.delay(attempt);
            attempt = attempt.saturating_add(1);
            tokio::time::sleep(delay).await;
            next = self.bus.subscribe().await;
        }
    }

    async fn relay(&self, mut sub: Subscription) {
        while let Some(event) = sub.recv().await {
            let receivers = self
                .fanout
                .send(Outbound::to_all(ServerMessage::receive_text(event.text)));
            log::trace!(
                "Relayed change from worker {} to {receivers} connections",
                event.origin
            );
        }
    }
}
