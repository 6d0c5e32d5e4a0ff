//! One WebSocket link from a worker to the hub.
//!
//! A writer task drains an outgoing channel into the socket; a reader task
//! routes `Reply` frames to waiting requests and `Event` frames to an
//! optional event channel. When the socket goes away, every pending request
//! fails and the event channel closes.

use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio_tungstenite::tungstenite::Message;

use super::frame::{HubFrame, HubReply};
use crate::error::{Result, SyncError};
use crate::protocol::ChangeEvent;

/// Default time to wait for connect and for each reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(5);

type Pending = Arc<Mutex<HashMap<u64, oneshot::Sender<HubReply>>>>;

pub struct HubLink {
    outgoing: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    next_id: AtomicU64,
    closed: Arc<AtomicBool>,
    timeout: Duration,
}

impl HubLink {
    /// Open a link. Events published on the hub are forwarded to `events`
    /// once the link has subscribed.
    pub async fn connect(
        url: &str,
        timeout: Duration,
        events: Option<mpsc::Sender<ChangeEvent>>,
    ) -> Result<Self> {
        let (ws_stream, _) = tokio::time::timeout(timeout, tokio_tungstenite::connect_async(url))
            .await
            .map_err(|_| SyncError::Transport(format!("connect to {url} timed out")))??;
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        let closed = Arc::new(AtomicBool::new(false));
        let pending: Pending = Arc::new(Mutex::new(HashMap::new()));

        let (out_tx, mut out_rx) = mpsc::channel::<Vec<u8>>(256);
        let writer_closed = closed.clone();
        tokio::spawn(async move {
            while let Some(data) = out_rx.recv().await {
                if ws_writer.send(Message::Binary(data.into())).await.is_err() {
                    break;
                }
            }
            writer_closed.store(true, Ordering::SeqCst);
            let _ = ws_writer.close().await;
        });

        let reader_closed = closed.clone();
        let reader_pending = pending.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                match msg {
                    Ok(Message::Binary(data)) => match HubFrame::decode(&data) {
                        Ok(HubFrame::Reply { id, result }) => {
                            let waiter = reader_pending
                                .lock()
                                .ok()
                                .and_then(|mut p| p.remove(&id));
                            if let Some(tx) = waiter {
                                let _ = tx.send(result);
                            }
                        }
                        Ok(HubFrame::Event { event }) => {
                            if let Some(ref tx) = events {
                                if tx.send(event).await.is_err() {
                                    break;
                                }
                            }
                        }
                        Ok(other) => {
                            log::debug!("Ignoring unexpected hub frame {other:?}");
                        }
                        Err(e) => log::warn!("Undecodable hub frame: {e}"),
                    },
                    Ok(Message::Close(_)) | Err(_) => break,
                    _ => {}
                }
            }

            reader_closed.store(true, Ordering::SeqCst);
            // Dropping the senders fails every request still waiting.
            if let Ok(mut p) = reader_pending.lock() {
                p.clear();
            }
            log::debug!("Hub link closed");
        });

        Ok(Self {
            outgoing: out_tx,
            pending,
            next_id: AtomicU64::new(1),
            closed,
            timeout,
        })
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst) || self.outgoing.is_closed()
    }

    /// Send a request built around a fresh id and wait for its reply.
    pub async fn request(&self, build: impl FnOnce(u64) -> HubFrame) -> Result<HubReply> {
        if self.is_closed() {
            return Err(SyncError::Transport("hub link closed".into()));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let encoded = build(id).encode()?;

        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .map_err(|_| SyncError::Transport("hub link state poisoned".into()))?
            .insert(id, tx);

        if self.outgoing.send(encoded).await.is_err() {
            self.forget(id);
            return Err(SyncError::Transport("hub link closed".into()));
        }

        match tokio::time::timeout(self.timeout, rx).await {
            Ok(Ok(reply)) => Ok(reply),
            Ok(Err(_)) => Err(SyncError::Transport("hub link closed mid-request".into())),
            Err(_) => {
                self.forget(id);
                Err(SyncError::Transport(format!("hub request {id} timed out")))
            }
        }
    }

    fn forget(&self, id: u64) {
        if let Ok(mut p) = self.pending.lock() {
            p.remove(&id);
        }
    }
}
