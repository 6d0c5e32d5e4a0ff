//! Bus over the hub.
//!
//! Publishing goes through one lazily (re)opened link; every subscription
//! opens its own link, like a dedicated subscriber connection. A dropped
//! subscriber link closes the [`Subscription`].

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};

use super::{Bus, Subscription};
use crate::error::{Result, SyncError};
use crate::hub::{HubFrame, HubLink, HubReply, DEFAULT_REQUEST_TIMEOUT};
use crate::protocol::ChangeEvent;

const SUBSCRIPTION_CAPACITY: usize = 256;

pub struct RemoteBus {
    url: String,
    timeout: Duration,
    publisher: Mutex<Option<Arc<HubLink>>>,
}

impl RemoteBus {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            publisher: Mutex::new(None),
        }
    }

    async fn publisher(&self) -> Result<Arc<HubLink>> {
        let mut slot = self.publisher.lock().await;
        if let Some(link) = slot.as_ref() {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }

        let link = HubLink::connect(&self.url, self.timeout, None)
            .await
            .map_err(|e| SyncError::BusUnavailable(e.to_string()))?;
        let link = Arc::new(link);
        *slot = Some(link.clone());
        Ok(link)
    }
}

#[async_trait]
impl Bus for RemoteBus {
    async fn publish(&self, event: &ChangeEvent) -> Result<()> {
        let link = self.publisher().await?;
        let event = event.clone();
        match link.request(|id| HubFrame::Publish { id, event }).await {
            Ok(HubReply::Ack) => Ok(()),
            Ok(other) => Err(SyncError::BusUnavailable(format!(
                "publish rejected: {other:?}"
            ))),
            Err(e) => {
                self.publisher.lock().await.take();
                Err(SyncError::BusUnavailable(e.to_string()))
            }
        }
    }

    async fn subscribe(&self) -> Result<Subscription> {
        let (tx, rx) = mpsc::channel(SUBSCRIPTION_CAPACITY);
        let link = HubLink::connect(&self.url, self.timeout, Some(tx))
            .await
            .map_err(|e| SyncError::BusUnavailable(e.to_string()))?;

        match link.request(|id| HubFrame::Subscribe { id }).await {
            Ok(HubReply::Ack) => {
                log::debug!("Subscribed to bus at {}", self.url);
                Ok(Subscription::with_guard(rx, link))
            }
            Ok(other) => Err(SyncError::BusUnavailable(format!(
                "subscribe rejected: {other:?}"
            ))),
            Err(e) => Err(SyncError::BusUnavailable(e.to_string())),
        }
    }
}
