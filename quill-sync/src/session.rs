//! Worker session manager: the per-connection state machine.
//!
//! ```text
//! client ──text-change──► Connection task ──set──► DocumentStore
//!                               │
//!                               └──publish──► Bus ──► BusRelay (every worker)
//!                                                         │
//!                     BroadcastGroup<Outbound> ◄──────────┘
//!                               │
//!              ┌────────────────┼────────────────┐
//!              ▼                ▼                ▼
//!         Connection A     Connection B     Connection C   ──receive-text──► clients
//! ```
//!
//! Each connection runs in its own task and handles its inbound events one
//! at a time, so one client's `set` → `publish` pairs never reorder. Tasks
//! for different connections interleave freely.
//!
//! Relayed snapshots go to every connection, the editor included. Clients
//! ignore a snapshot equal to what they already show.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::broadcast::{BroadcastGroup, Outbound};
use crate::bus::{Bus, BusRelay};
use crate::config::WorkerConfig;
use crate::error::{Result, SyncError};
use crate::protocol::{ChangeEvent, ClientMessage, SaveText, ServerMessage, TextChange};
use crate::registry::{ConnectionRegistry, ConnectionState};
use crate::store::DocumentStore;

pub struct SessionManager {
    worker_id: Uuid,
    config: WorkerConfig,
    store: Arc<dyn DocumentStore>,
    bus: Arc<dyn Bus>,
    registry: Arc<ConnectionRegistry>,
    fanout: Arc<BroadcastGroup<Outbound>>,
    bus_connected: Arc<AtomicBool>,
}

impl SessionManager {
    pub fn new(
        config: WorkerConfig,
        store: Arc<dyn DocumentStore>,
        bus: Arc<dyn Bus>,
    ) -> Arc<Self> {
        let worker_id = Uuid::new_v4();
        Arc::new(Self {
            worker_id,
            fanout: Arc::new(BroadcastGroup::new(config.broadcast_capacity)),
            registry: Arc::new(ConnectionRegistry::new(worker_id, store.clone())),
            config,
            store,
            bus,
            bus_connected: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Start relaying bus events to local connections.
    pub async fn start_relay(&self) -> JoinHandle<()> {
        BusRelay::new(
            self.bus.clone(),
            self.fanout.clone(),
            self.config.bus_backoff,
            self.bus_connected.clone(),
        )
        .start()
        .await
    }

    pub fn worker_id(&self) -> Uuid {
        self.worker_id
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn bus_connected(&self) -> bool {
        self.bus_connected.load(Ordering::SeqCst)
    }

    /// Open a connection. The returned handle is the transport's side of it:
    /// push client events in, pull server events out. Dropping the sender
    /// disconnects.
    pub fn connect(self: &Arc<Self>) -> SessionHandle {
        let id = Uuid::new_v4();
        let (inbound_tx, inbound_rx) = mpsc::channel(self.config.outbound_capacity);
        let (outbound_tx, outbound_rx) = mpsc::channel(self.config.outbound_capacity);

        let connection = Connection {
            id,
            manager: self.clone(),
            outbound: outbound_tx,
            synced: false,
        };
        let task = tokio::spawn(connection.run(inbound_rx));

        SessionHandle {
            id,
            inbound: inbound_tx,
            outbound: outbound_rx,
            task,
        }
    }

    async fn announce_count(&self, except: Option<Uuid>, typing: bool) {
        let count = self.registry.count_global().await;
        let message = ServerMessage::UserCount { count, typing };
        self.fanout.send(match except {
            Some(id) => Outbound::to_others(id, message),
            None => Outbound::to_all(message),
        });
    }
}

/// Transport-facing end of one connection.
pub struct SessionHandle {
    pub id: Uuid,
    inbound: mpsc::Sender<ClientMessage>,
    outbound: mpsc::Receiver<ServerMessage>,
    task: JoinHandle<()>,
}

impl SessionHandle {
    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.inbound
            .send(msg)
            .await
            .map_err(|_| SyncError::Transport("connection closed".into()))
    }

    pub async fn recv(&mut self) -> Option<ServerMessage> {
        self.outbound.recv().await
    }

    /// Split into the inbound sender and the outbound receiver.
    pub fn split(self) -> (mpsc::Sender<ClientMessage>, mpsc::Receiver<ServerMessage>) {
        (self.inbound, self.outbound)
    }

    /// Disconnect and wait for the connection to be unregistered.
    pub async fn close(self) {
        let SessionHandle { inbound, task, .. } = self;
        drop(inbound);
        let _ = task.await;
    }
}

/// Server-side state of one connection.
struct Connection {
    id: Uuid,
    manager: Arc<SessionManager>,
    outbound: mpsc::Sender<ServerMessage>,
    /// Whether the initial snapshot came from the store. When false, the
    /// next local edit retries the read first.
    synced: bool,
}

impl Connection {
    async fn run(mut self, mut inbound: mpsc::Receiver<ClientMessage>) {
        let manager = self.manager.clone();
        manager.registry.add(self.id).await;
        // Subscribe before reading the snapshot so no relayed change can fall
        // between the two.
        let mut fanout_rx = manager.fanout.subscribe();

        if self.initial_snapshot().await.is_ok() {
            manager
                .registry
                .set_state(&self.id, ConnectionState::Active)
                .await;
            log::info!(
                "Connection {} active on worker {} ({} local)",
                self.id,
                manager.config.worker_index,
                manager.registry.count_local().await
            );
            manager.announce_count(None, false).await;

            loop {
                tokio::select! {
                    msg = inbound.recv() => {
                        match msg {
                            Some(msg) => {
                                if self.handle(msg).await.is_err() {
                                    break;
                                }
                            }
                            None => break,
                        }
                    }

                    out = fanout_rx.recv() => {
                        match out {
                            Ok(out) => {
                                if out.is_for(self.id) && self.deliver((*out.message).clone()).await.is_err() {
                                    break;
                                }
                            }
                            Err(RecvError::Lagged(n)) => {
                                manager.fanout.record_dropped(n);
                                log::warn!("Connection {} lagged by {n} messages", self.id);
                            }
                            Err(RecvError::Closed) => break,
                        }
                    }
                }
            }
        }

        drop(fanout_rx);
        manager.registry.remove(&self.id).await;
        log::info!("Connection {} disconnected", self.id);
        manager.announce_count(None, false).await;
    }

    /// Connecting → Active: send the current document.
    async fn initial_snapshot(&mut self) -> Result<()> {
        let text = match self.manager.store.get().await {
            Ok(text) => {
                self.synced = true;
                text
            }
            Err(e) => {
                log::warn!("Connection {} starts unsynced: {e}", self.id);
                self.deliver(ServerMessage::Error(
                    "document store unavailable; showing an empty document".into(),
                ))
                .await?;
                String::new()
            }
        };
        self.deliver(ServerMessage::receive_text(text)).await
    }

    async fn deliver(&self, msg: ServerMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| SyncError::Transport(format!("connection {} gone", self.id)))
    }

    /// Handle one client event. Only a dead transport is an error here.
    async fn handle(&mut self, msg: ClientMessage) -> Result<()> {
        log::trace!("Connection {} sent {}", self.id, msg.name());
        match msg {
            ClientMessage::TextChange(change) => self.text_change(change).await,
            ClientMessage::CursorMove(pos) => {
                self.manager.registry.set_cursor(&self.id, pos).await;
                Ok(())
            }
            ClientMessage::SaveText(save) => self.save_text(save).await,
        }
    }

    /// Store write, then publish. Not atomic as a pair; a reconnecting client
    /// catches up through the snapshot path.
    async fn text_change(&mut self, change: TextChange) -> Result<()> {
        let manager = self.manager.clone();

        if !self.synced {
            match manager.store.get().await {
                Ok(_) => {
                    self.synced = true;
                    log::info!("Store reachable again for connection {}", self.id);
                }
                Err(e) => log::debug!("Store still unavailable: {e}"),
            }
        }

        if let Err(e) = manager.store.set(&change.text).await {
            if e.is_degraded() {
                // Re-read before the next write.
                self.synced = false;
                log::warn!("Edit from {} not stored: {e}", self.id);
            } else {
                log::error!("Edit from {} rejected by the store: {e}", self.id);
            }
        }

        let event = ChangeEvent::new(manager.worker_id, self.id, change);
        if let Err(e) = manager.bus.publish(&event).await {
            // Degraded: keep this worker's own clients in step.
            log::warn!("Edit from {} not propagated: {e}", self.id);
            manager
                .fanout
                .send(Outbound::to_all(ServerMessage::receive_text(event.text)));
        }

        manager.announce_count(Some(self.id), true).await;
        Ok(())
    }

    async fn save_text(&mut self, save: SaveText) -> Result<()> {
        let timestamp = save
            .timestamp
            .unwrap_or_else(|| chrono::Utc::now().to_rfc3339());
        if let Err(e) = self.manager.store.save_snapshot(&save.text, &timestamp).await {
            log::warn!("Snapshot from {} not saved: {e}", self.id);
        }
        Ok(())
    }
}
