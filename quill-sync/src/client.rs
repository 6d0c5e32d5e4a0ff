//! WebSocket editor client.
//!
//! Provides:
//! - Connection lifecycle with bounded reconnection (linear backoff)
//! - Local text mirror; remote snapshots equal to it are ignored
//! - text-change / cursor-move / save-text senders
//!
//! Edits made while disconnected are not queued. On reconnect the server's
//! snapshot replaces the local text.

use futures_util::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::Message;

use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, SaveText, ServerMessage, TextChange};

const CHANNEL_CAPACITY: usize = 256;

/// Client connection state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    /// Reconnection attempts exhausted; only an explicit `connect` leaves it.
    GaveUp,
}

/// Events emitted by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Connected,
    Disconnected,
    /// The document changed remotely; carries the new full text.
    Snapshot(String),
    Participants { count: u64, typing: bool },
    /// Server-side error or a local give-up notice.
    Notice(String),
}

/// Reconnection schedule: attempt `n` waits `base_delay * n`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_delay: Duration::from_secs(1),
        }
    }
}

impl ReconnectPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        self.base_delay.saturating_mul(attempt)
    }
}

struct Inner {
    url: String,
    policy: ReconnectPolicy,
    state: RwLock<ConnectionState>,
    text: RwLock<String>,
    outgoing: Mutex<Option<mpsc::Sender<String>>>,
    event_tx: mpsc::Sender<ClientEvent>,
    lost_tx: mpsc::UnboundedSender<()>,
    closing: AtomicBool,
    /// Bumped on every successful open; stale readers leave newer links alone.
    generation: AtomicU64,
}

pub struct EditorClient {
    inner: Arc<Inner>,
    event_rx: Option<mpsc::Receiver<ClientEvent>>,
    lost_rx: Option<mpsc::UnboundedReceiver<()>>,
}

impl EditorClient {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_policy(url, ReconnectPolicy::default())
    }

    pub fn with_policy(url: impl Into<String>, policy: ReconnectPolicy) -> Self {
        let (event_tx, event_rx) = mpsc::channel(CHANNEL_CAPACITY);
        let (lost_tx, lost_rx) = mpsc::unbounded_channel();
        Self {
            inner: Arc::new(Inner {
                url: url.into(),
                policy,
                state: RwLock::new(ConnectionState::Disconnected),
                text: RwLock::new(String::new()),
                outgoing: Mutex::new(None),
                event_tx,
                lost_tx,
                closing: AtomicBool::new(false),
                generation: AtomicU64::new(0),
            }),
            event_rx: Some(event_rx),
            lost_rx: Some(lost_rx),
        }
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ClientEvent>> {
        self.event_rx.take()
    }

    /// Connect once. Later connection losses are retried per the policy.
    pub async fn connect(&mut self) -> Result<()> {
        self.inner.closing.store(false, Ordering::SeqCst);
        self.inner.open().await?;
        self.spawn_reconnector();
        Ok(())
    }

    /// Connect, retrying per the policy if the first attempt fails.
    pub async fn connect_with_retry(&mut self) -> Result<()> {
        self.inner.closing.store(false, Ordering::SeqCst);
        if let Err(e) = self.inner.open().await {
            log::debug!("Initial connect to {} failed: {e}", self.inner.url);
            self.inner.reconnect().await?;
        }
        self.spawn_reconnector();
        Ok(())
    }

    fn spawn_reconnector(&mut self) {
        let Some(mut lost_rx) = self.lost_rx.take() else {
            return;
        };
        let inner = self.inner.clone();
        tokio::spawn(async move {
            while lost_rx.recv().await.is_some() {
                if inner.closing.load(Ordering::SeqCst) {
                    continue;
                }
                // A failed run leaves the client in `GaveUp`.
                let _ = inner.reconnect().await;
            }
        });
    }

    /// Close the connection without reconnecting.
    pub async fn disconnect(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        self.inner.outgoing.lock().await.take();
        *self.inner.state.write().await = ConnectionState::Disconnected;
    }

    /// Replace the local text and send it as a text-change.
    pub async fn send_text(&self, text: impl Into<String>, cursor: Option<u64>) -> Result<()> {
        let text = text.into();
        *self.inner.text.write().await = text.clone();
        let change = TextChange {
            text,
            cursor_position: cursor,
        };
        self.inner.send(ClientMessage::TextChange(change)).await
    }

    pub async fn send_cursor(&self, position: u64) -> Result<()> {
        self.inner.send(ClientMessage::CursorMove(position)).await
    }

    /// Ask the server to snapshot the current local text.
    pub async fn save(&self) -> Result<()> {
        let save = SaveText {
            text: self.text().await,
            timestamp: Some(chrono::Utc::now().to_rfc3339()),
        };
        self.inner.send(ClientMessage::SaveText(save)).await
    }

    /// Adopt a remote snapshot. Returns `false` when it matches the local
    /// text.
    pub async fn apply_remote(&self, text: &str) -> bool {
        self.inner.apply_remote(text).await
    }

    pub async fn text(&self) -> String {
        self.inner.text.read().await.clone()
    }

    pub async fn state(&self) -> ConnectionState {
        *self.inner.state.read().await
    }

}

impl Inner {
    async fn open(self: &Arc<Self>) -> Result<()> {
        {
            let mut state = self.state.write().await;
            if *state != ConnectionState::Reconnecting {
                *state = ConnectionState::Connecting;
            }
        }

        let ws_stream = match tokio_tungstenite::connect_async(self.url.as_str()).await {
            Ok((ws_stream, _)) => ws_stream,
            Err(e) => {
                let mut state = self.state.write().await;
                if *state == ConnectionState::Connecting {
                    *state = ConnectionState::Disconnected;
                }
                return Err(e.into());
            }
        };
        let (mut ws_writer, mut ws_reader) = ws_stream.split();

        // Writer task: forward the outgoing channel to the socket.
        let (out_tx, mut out_rx) = mpsc::channel::<String>(CHANNEL_CAPACITY);
        tokio::spawn(async move {
            while let Some(frame) = out_rx.recv().await {
                if ws_writer.send(Message::text(frame)).await.is_err() {
                    return;
                }
            }
            let _ = ws_writer.send(Message::Close(None)).await;
        });
        *self.outgoing.lock().await = Some(out_tx);
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;

        *self.state.write().await = ConnectionState::Connected;
        self.emit(ClientEvent::Connected);
        log::info!("Connected to {}", self.url);

        // Reader task: apply server events.
        let inner = self.clone();
        tokio::spawn(async move {
            while let Some(msg) = ws_reader.next().await {
                let frame = match msg {
                    Ok(Message::Text(frame)) => frame,
                    Ok(Message::Close(_)) | Err(_) => break,
                    Ok(_) => continue,
                };
                match ServerMessage::decode(frame.as_str()) {
                    Ok(ServerMessage::ReceiveText { text }) => {
                        if inner.apply_remote(&text).await {
                            inner.emit(ClientEvent::Snapshot(text));
                        }
                    }
                    Ok(ServerMessage::UserCount { count, typing }) => {
                        inner.emit(ClientEvent::Participants { count, typing });
                    }
                    Ok(ServerMessage::Error(notice)) => {
                        log::warn!("Server error: {notice}");
                        inner.emit(ClientEvent::Notice(notice));
                    }
                    Err(e) => log::debug!("Ignoring server frame: {e}"),
                }
            }

            if inner.generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Dropping the sender stops the writer.
            inner.outgoing.lock().await.take();
            {
                let mut state = inner.state.write().await;
                if *state == ConnectionState::Connected {
                    *state = ConnectionState::Disconnected;
                }
            }
            log::info!("Disconnected from {}", inner.url);
            inner.emit(ClientEvent::Disconnected);
            let _ = inner.lost_tx.send(());
        });

        Ok(())
    }

    /// Retry `open` per the policy. Ends in `GaveUp` when attempts run out.
    async fn reconnect(self: &Arc<Self>) -> Result<()> {
        let max = self.policy.max_attempts;
        for attempt in 1..=max {
            *self.state.write().await = ConnectionState::Reconnecting;
            tokio::time::sleep(self.policy.delay(attempt)).await;
            if self.closing.load(Ordering::SeqCst) {
                *self.state.write().await = ConnectionState::Disconnected;
                return Err(SyncError::Transport("client closed".into()));
            }
            match self.open().await {
                Ok(()) => return Ok(()),
                Err(e) => log::debug!("Reconnect attempt {attempt}/{max} failed: {e}"),
            }
        }

        *self.state.write().await = ConnectionState::GaveUp;
        let notice = format!("could not reconnect after {max} attempts");
        log::warn!("{notice}");
        self.emit(ClientEvent::Notice(notice.clone()));
        Err(SyncError::Transport(notice))
    }

    /// Never waits on the consumer: a full or untaken receiver drops the
    /// event, while text and state keep tracking the server.
    fn emit(&self, event: ClientEvent) {
        match self.event_tx.try_send(event) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(event)) => {
                log::trace!("Event channel full, dropping {event:?}");
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    async fn send(&self, msg: ClientMessage) -> Result<()> {
        let frame = msg.encode()?;
        let outgoing = self.outgoing.lock().await;
        match outgoing.as_ref() {
            Some(tx) => tx
                .send(frame)
                .await
                .map_err(|_| SyncError::Transport("not connected".into())),
            None => Err(SyncError::Transport("not connected".into())),
        }
    }

    async fn apply_remote(&self, remote: &str) -> bool {
        let mut text = self.text.write().await;
        if *text == remote {
            return false;
        }
        *text = remote.to_string();
        true
    }
}
