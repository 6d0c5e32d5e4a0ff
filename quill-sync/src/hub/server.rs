//! The hub: shared store and bus for every worker.
//!
//! ```text
//! Worker 1 ──┐  Get/Set/...  ┌──────────────┐
//!             ├─────────────► │ DocumentStore│ (RocksDB)
//! Worker 2 ──┤               └──────────────┘
//!             │  Publish      ┌──────────────┐   Event
//!             └─────────────► │BroadcastGroup│ ─────────► every subscribed link
//!                             └──────────────┘
//! ```
//!
//! Event frames are encoded once per publish and shared by all subscribers.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use super::frame::{HubFrame, HubReply};
use crate::broadcast::BroadcastGroup;
use crate::config::HubConfig;
use crate::error::{Result, SyncError};
use crate::server::{accept_next, ACCEPT_RETRY_DELAY};
use crate::store::{DocumentStore, RocksStore};

/// Hub statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HubStats {
    pub total_links: u64,
    pub active_links: u64,
    pub requests: u64,
    pub published: u64,
}

#[derive(Default)]
struct AtomicHubStats {
    total_links: AtomicU64,
    active_links: AtomicU64,
    requests: AtomicU64,
    published: AtomicU64,
}

pub struct HubServer {
    config: HubConfig,
    store: Arc<dyn DocumentStore>,
    events: Arc<BroadcastGroup<Arc<Vec<u8>>>>,
    stats: Arc<AtomicHubStats>,
}

impl HubServer {
    /// Hub over an arbitrary store.
    pub fn new(config: HubConfig, store: Arc<dyn DocumentStore>) -> Self {
        let events = Arc::new(BroadcastGroup::new(config.broadcast_capacity));
        Self {
            config,
            store,
            events,
            stats: Arc::new(AtomicHubStats::default()),
        }
    }

    /// Hub over the durable RocksDB store at `config.store.path`.
    pub fn open(config: HubConfig) -> Result<Self> {
        let store = RocksStore::open(config.store.clone())?;
        store.reset_participants()?;
        Ok(Self::new(config, Arc::new(store)))
    }

    pub fn bind_addr(&self) -> &str {
        &self.config.bind_addr
    }

    pub fn store(&self) -> &Arc<dyn DocumentStore> {
        &self.store
    }

    pub fn stats(&self) -> HubStats {
        HubStats {
            total_links: self.stats.total_links.load(Ordering::Relaxed),
            active_links: self.stats.active_links.load(Ordering::Relaxed),
            requests: self.stats.requests.load(Ordering::Relaxed),
            published: self.stats.published.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address and serve forever.
    pub async fn run(&self) -> Result<()> {
        let listener = TcpListener::bind(&self.config.bind_addr).await?;
        self.serve(listener).await
    }

    /// Serve links accepted on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then drop every open link.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        log::info!("Hub listening on {}", listener.local_addr()?);
        let mut links = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = accept_next(|| listener.accept(), ACCEPT_RETRY_DELAY) => accepted,
                _ = &mut shutdown => break,
                // Reap finished links.
                Some(_) = links.join_next(), if !links.is_empty() => continue,
            };
            log::debug!("New hub link from {addr}");

            let store = self.store.clone();
            let events = self.events.clone();
            let stats = self.stats.clone();

            links.spawn(async move {
                if let Err(e) = Self::handle_link(stream, addr, store, events, stats).await {
                    log::warn!("Hub link error from {addr}: {e}");
                }
            });
        }

        log::info!(
            "Hub shutting down, closing {} links ({:?})",
            links.len(),
            self.events.stats()
        );
        links.shutdown().await;
        Ok(())
    }

    async fn handle_link(
        stream: TcpStream,
        addr: SocketAddr,
        store: Arc<dyn DocumentStore>,
        events: Arc<BroadcastGroup<Arc<Vec<u8>>>>,
        stats: Arc<AtomicHubStats>,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_links.fetch_add(1, Ordering::Relaxed);
        stats.active_links.fetch_add(1, Ordering::Relaxed);

        let mut subscription: Option<broadcast::Receiver<Arc<Vec<u8>>>> = None;

        let result: Result<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Binary(data))) => {
                                let frame = match HubFrame::decode(&data) {
                                    Ok(frame) => frame,
                                    Err(e) => {
                                        log::warn!("Bad frame from {addr}: {e}");
                                        continue;
                                    }
                                };
                                stats.requests.fetch_add(1, Ordering::Relaxed);

                                if let HubFrame::Subscribe { .. } = frame {
                                    subscription = Some(events.subscribe());
                                    log::debug!("Link {addr} subscribed");
                                }

                                if let Some(reply) = Self::handle_frame(frame, &*store, &events, &stats).await {
                                    ws_sender.send(Message::Binary(reply.encode()?.into())).await?;
                                }
                            }
                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            Some(Err(e)) => {
                                log::debug!("Hub link {addr} dropped: {e}");
                                break;
                            }
                            _ => {}
                        }
                    }

                    event = async {
                        match subscription {
                            Some(ref mut rx) => rx.recv().await,
                            None => std::future::pending().await,
                        }
                    } => {
                        match event {
                            Ok(bytes) => {
                                ws_sender.send(Message::Binary(bytes.to_vec().into())).await?;
                            }
                            Err(broadcast::error::RecvError::Lagged(n)) => {
                                events.record_dropped(n);
                                log::warn!("Subscriber {addr} lagged by {n} events");
                            }
                            Err(broadcast::error::RecvError::Closed) => break,
                        }
                    }
                }
            }
            Ok::<(), SyncError>(())
        }
        .await;

        stats.active_links.fetch_sub(1, Ordering::Relaxed);
        log::debug!("Hub link {addr} closed");
        result
    }

    /// Execute one request. Store failures become `Failed` replies so the
    /// link stays up.
    async fn handle_frame(
        frame: HubFrame,
        store: &dyn DocumentStore,
        events: &BroadcastGroup<Arc<Vec<u8>>>,
        stats: &AtomicHubStats,
    ) -> Option<HubFrame> {
        let (id, result) = match frame {
            HubFrame::Get { id } => (id, store.get().await.map(HubReply::Text)),
            HubFrame::Set { id, text } => (id, store.set(&text).await.map(|_| HubReply::Ack)),
            HubFrame::SaveSnapshot {
                id,
                text,
                timestamp,
            } => (
                id,
                store
                    .save_snapshot(&text, &timestamp)
                    .await
                    .map(|_| HubReply::Ack),
            ),
            HubFrame::AdjustParticipants { id, delta } => (
                id,
                store.adjust_participants(delta).await.map(HubReply::Count),
            ),
            HubFrame::Participants { id } => (id, store.participants().await.map(HubReply::Count)),
            HubFrame::Subscribe { id } => (id, Ok(HubReply::Ack)),
            HubFrame::Publish { id, event } => {
                let encoded = HubFrame::Event { event }.encode();
                (
                    id,
                    encoded.map(|bytes| {
                        let receivers = events.send(Arc::new(bytes));
                        stats.published.fetch_add(1, Ordering::Relaxed);
                        log::trace!("Published event to {receivers} subscribers");
                        HubReply::Ack
                    }),
                )
            }
            HubFrame::Reply { .. } | HubFrame::Event { .. } => {
                log::debug!("Ignoring worker-bound frame sent to hub");
                return None;
            }
        };

        let result = result.unwrap_or_else(|e| {
            log::error!("Hub request {id} failed: {e}");
            HubReply::Failed(e.to_string())
        });
        Some(HubFrame::Reply { id, result })
    }
}
