//! Client-facing WebSocket server: one per worker process.
//!
//! ```text
//! browser ──JSON frames──► handle_connection ──ClientMessage──► SessionManager
//!    ▲                            │
//!    └──────JSON frames───────────┘◄──ServerMessage────────────────┘
//! ```
//!
//! Every worker binds the same address with `SO_REUSEPORT` so the kernel
//! spreads incoming connections across them. Frames that fail to parse get an
//! `error` event back; the connection stays open.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::task::JoinSet;
use tokio_tungstenite::tungstenite::Message;

use crate::bus::Bus;
use crate::config::WorkerConfig;
use crate::error::{Result, SyncError};
use crate::protocol::{ClientMessage, ServerMessage};
use crate::session::SessionManager;
use crate::store::DocumentStore;

const LISTEN_BACKLOG: u32 = 1024;
/// Pause after a failed `accept` (fd exhaustion, aborted handshake).
pub(crate) const ACCEPT_RETRY_DELAY: Duration = Duration::from_millis(100);

/// Worker statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub frames_in: u64,
    pub rejected_frames: u64,
}

#[derive(Default)]
struct AtomicWorkerStats {
    total_connections: AtomicU64,
    active_connections: AtomicU64,
    frames_in: AtomicU64,
    rejected_frames: AtomicU64,
}

pub struct WorkerServer {
    config: WorkerConfig,
    sessions: Arc<SessionManager>,
    stats: Arc<AtomicWorkerStats>,
}

impl WorkerServer {
    pub fn new(config: WorkerConfig, store: Arc<dyn DocumentStore>, bus: Arc<dyn Bus>) -> Self {
        let sessions = SessionManager::new(config.clone(), store, bus);
        Self {
            config,
            sessions,
            stats: Arc::new(AtomicWorkerStats::default()),
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn stats(&self) -> WorkerStats {
        WorkerStats {
            total_connections: self.stats.total_connections.load(Ordering::Relaxed),
            active_connections: self.stats.active_connections.load(Ordering::Relaxed),
            frames_in: self.stats.frames_in.load(Ordering::Relaxed),
            rejected_frames: self.stats.rejected_frames.load(Ordering::Relaxed),
        }
    }

    /// Bind the configured address, shared with sibling workers.
    pub async fn bind(&self) -> Result<TcpListener> {
        bind_shared(&self.config.bind_addr).await
    }

    pub async fn run(&self) -> Result<()> {
        let listener = self.bind().await?;
        self.serve(listener).await
    }

    /// Serve connections accepted on an already-bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<()> {
        self.serve_with_shutdown(listener, std::future::pending()).await
    }

    /// Serve until `shutdown` resolves, then close every connection.
    pub async fn serve_with_shutdown(
        &self,
        listener: TcpListener,
        shutdown: impl std::future::Future<Output = ()>,
    ) -> Result<()> {
        let relay = self.sessions.start_relay().await;
        log::info!(
            "Worker {} listening on {}",
            self.config.worker_index,
            listener.local_addr()?
        );
        let mut connections = JoinSet::new();
        tokio::pin!(shutdown);

        loop {
            let (stream, addr) = tokio::select! {
                accepted = accept_next(|| listener.accept(), ACCEPT_RETRY_DELAY) => accepted,
                _ = &mut shutdown => break,
                Some(_) = connections.join_next(), if !connections.is_empty() => continue,
            };
            log::debug!("New TCP connection from {addr}");

            let sessions = self.sessions.clone();
            let stats = self.stats.clone();
            connections.spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, sessions, stats).await {
                    log::debug!("Connection error from {addr}: {e}");
                }
            });
        }

        relay.abort();
        connections.shutdown().await;
        log::info!("Worker {} stopped", self.config.worker_index);
        Ok(())
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        sessions: Arc<SessionManager>,
        stats: Arc<AtomicWorkerStats>,
    ) -> Result<()> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        stats.total_connections.fetch_add(1, Ordering::Relaxed);
        stats.active_connections.fetch_add(1, Ordering::Relaxed);

        let session = sessions.connect();
        log::debug!("WebSocket {addr} is connection {}", session.id);
        let (inbound, mut outbound) = session.split();

        let result: Result<()> = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        let frame = match msg {
                            Some(Ok(Message::Text(text))) => text.as_str().to_owned(),
                            Some(Ok(Message::Binary(data))) => {
                                match String::from_utf8(data.to_vec()) {
                                    Ok(text) => text,
                                    Err(_) => {
                                        stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                        let reply = ServerMessage::Error("binary frames are not supported".into());
                                        ws_sender.send(Message::text(reply.encode()?)).await?;
                                        continue;
                                    }
                                }
                            }
                            Some(Ok(Message::Close(_))) | None => break,
                            // Pings are answered by tungstenite on the next write.
                            Some(Ok(_)) => continue,
                            Some(Err(e)) => return Err(e.into()),
                        };

                        stats.frames_in.fetch_add(1, Ordering::Relaxed);
                        match ClientMessage::decode(&frame) {
                            Ok(msg) => {
                                if inbound.send(msg).await.is_err() {
                                    break;
                                }
                            }
                            Err(e) => {
                                stats.rejected_frames.fetch_add(1, Ordering::Relaxed);
                                log::debug!("Rejected frame from {addr}: {e}");
                                let reply = ServerMessage::Error(e.to_string());
                                ws_sender.send(Message::text(reply.encode()?)).await?;
                            }
                        }
                    }

                    out = outbound.recv() => {
                        match out {
                            Some(msg) => ws_sender.send(Message::text(msg.encode()?)).await?,
                            None => break,
                        }
                    }
                }
            }
            Ok(())
        }
        .await;

        drop(inbound);
        stats.active_connections.fetch_sub(1, Ordering::Relaxed);
        log::debug!("WebSocket {addr} closed");
        result
    }
}

/// Accept the next stream. Accept errors are transient (fd exhaustion,
/// connections reset before accept), so they are logged and retried after
/// `retry_delay` instead of ending the accept loop.
pub(crate) async fn accept_next<T, F, Fut>(mut accept: F, retry_delay: Duration) -> T
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = std::io::Result<T>>,
{
    loop {
        match accept().await {
            Ok(accepted) => return accepted,
            Err(e) => {
                log::warn!("Accept failed: {e}; retrying in {retry_delay:?}");
                tokio::time::sleep(retry_delay).await;
            }
        }
    }
}

/// Bind `addr` with address and port reuse so several workers can accept on
/// the same port.
pub async fn bind_shared(addr: &str) -> Result<TcpListener> {
    let addr = tokio::net::lookup_host(addr)
        .await?
        .next()
        .ok_or_else(|| SyncError::Transport(format!("no address for {addr}")))?;

    let socket = if addr.is_ipv4() {
        TcpSocket::new_v4()?
    } else {
        TcpSocket::new_v6()?
    };
    socket.set_reuseaddr(true)?;
    #[cfg(unix)]
    socket.set_reuseport(true)?;
    socket.bind(addr)?;
    Ok(socket.listen(LISTEN_BACKLOG)?)
}
