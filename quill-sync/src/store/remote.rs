//! A worker's view of the hub's store.
//!
//! The link is opened lazily and replaced after any failure, so a store
//! outage costs one failed call per operation and recovers on its own.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use super::DocumentStore;
use crate::error::{Result, SyncError};
use crate::hub::{HubFrame, HubLink, HubReply, DEFAULT_REQUEST_TIMEOUT};

pub struct RemoteStore {
    url: String,
    timeout: Duration,
    link: Mutex<Option<Arc<HubLink>>>,
}

impl RemoteStore {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_timeout(url, DEFAULT_REQUEST_TIMEOUT)
    }

    pub fn with_timeout(url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            url: url.into(),
            timeout,
            link: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    async fn link(&self) -> Result<Arc<HubLink>> {
        let mut slot = self.link.lock().await;
        if let Some(link) = slot.as_ref() {
            if !link.is_closed() {
                return Ok(link.clone());
            }
        }

        let link = HubLink::connect(&self.url, self.timeout, None)
            .await
            .map_err(|e| SyncError::StoreUnavailable(e.to_string()))?;
        let link = Arc::new(link);
        *slot = Some(link.clone());
        log::debug!("Store link to {} established", self.url);
        Ok(link)
    }

    async fn call(&self, build: impl FnOnce(u64) -> HubFrame) -> Result<HubReply> {
        let link = self.link().await?;
        match link.request(build).await {
            Ok(HubReply::Failed(msg)) => Err(SyncError::StoreUnavailable(msg)),
            Ok(reply) => Ok(reply),
            Err(e) => {
                self.link.lock().await.take();
                Err(SyncError::StoreUnavailable(e.to_string()))
            }
        }
    }
}

fn unexpected(reply: HubReply) -> SyncError {
    SyncError::Protocol(format!("unexpected hub reply {reply:?}"))
}

#[async_trait]
impl DocumentStore for RemoteStore {
    async fn get(&self) -> Result<String> {
        match self.call(|id| HubFrame::Get { id }).await? {
            HubReply::Text(text) => Ok(text),
            other => Err(unexpected(other)),
        }
    }

    async fn set(&self, text: &str) -> Result<()> {
        let text = text.to_string();
        match self.call(|id| HubFrame::Set { id, text }).await? {
            HubReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn save_snapshot(&self, text: &str, timestamp: &str) -> Result<()> {
        let text = text.to_string();
        let timestamp = timestamp.to_string();
        match self
            .call(|id| HubFrame::SaveSnapshot {
                id,
                text,
                timestamp,
            })
            .await?
        {
            HubReply::Ack => Ok(()),
            other => Err(unexpected(other)),
        }
    }

    async fn adjust_participants(&self, delta: i64) -> Result<i64> {
        match self
            .call(|id| HubFrame::AdjustParticipants { id, delta })
            .await?
        {
            HubReply::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }

    async fn participants(&self) -> Result<i64> {
        match self.call(|id| HubFrame::Participants { id }).await? {
            HubReply::Count(n) => Ok(n),
            other => Err(unexpected(other)),
        }
    }
}
