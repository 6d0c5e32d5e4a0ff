//! The hub hosts the shared store and bus that all workers coordinate
//! through. Workers talk to it over WebSocket links carrying [`HubFrame`]s.

pub mod frame;
pub mod link;
pub mod server;

pub use frame::{HubFrame, HubReply};
pub use link::{HubLink, DEFAULT_REQUEST_TIMEOUT};
pub use server::{HubServer, HubStats};
