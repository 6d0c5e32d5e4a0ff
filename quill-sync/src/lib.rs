//! # quill-sync — shared plain-text editing across worker processes
//!
//! One document, many browsers. Any client may replace the whole text at
//! any time; the last write to reach the store wins and every connected
//! client converges on it.
//!
//! ## Architecture
//!
//! ```text
//!  browsers ──WebSocket/JSON──► WorkerServer × N  (SO_REUSEPORT, same port)
//!                                   │  SessionManager
//!                                   │  ConnectionRegistry
//!                                   ▼
//!                        ┌──────── hub (WebSocket/bincode) ────────┐
//!                        │  DocumentStore (RocksDB)   Bus (fan-out) │
//!                        └──────────────────────────────────────────┘
//!
//!  Supervisor ── spawns / respawns ──► worker processes
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] — client JSON events and the inter-worker change event
//! - [`store`] — the shared text slot, snapshot list, and participant counter
//! - [`bus`] — publish/subscribe between workers, plus the relay
//! - [`hub`] — the service that hosts store and bus for every worker
//! - [`session`] — per-connection state machine
//! - [`registry`] — local connections and the approximate global count
//! - [`server`] — client-facing WebSocket server
//! - [`client`] — editor client with bounded reconnection
//! - [`supervisor`] — keeps N workers alive
//!
//! Store or bus outages degrade a worker, never stop it: local clients keep
//! editing and the worker catches up once the hub returns.

pub mod broadcast;
pub mod bus;
pub mod client;
pub mod config;
pub mod error;
pub mod hub;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session;
pub mod store;
pub mod supervisor;

// Re-exports for convenience
pub use broadcast::{BroadcastGroup, BroadcastStats, Outbound};
pub use bus::{Bus, BusRelay, LocalBus, RemoteBus, Subscription};
pub use client::{ClientEvent, ConnectionState as ClientState, EditorClient, ReconnectPolicy};
pub use config::{
    BackoffConfig, HubConfig, HubEndpoint, SupervisorConfig, WorkerConfig, DEFAULT_HUB_PORT,
    DEFAULT_PORT,
};
pub use error::{Result, SyncError};
pub use hub::{HubServer, HubStats};
pub use protocol::{ChangeEvent, ClientMessage, SaveText, ServerMessage, TextChange};
pub use registry::{ConnectionInfo, ConnectionRegistry, ConnectionState};
pub use server::{bind_shared, WorkerServer, WorkerStats};
pub use session::{SessionHandle, SessionManager};
pub use store::{DocumentStore, MemoryStore, RemoteStore, RocksStore, Snapshot, StoreConfig};
pub use supervisor::{ProcessLauncher, Supervisor, WorkerHandle, WorkerLauncher, SLOT_ENV};
