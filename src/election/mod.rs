//! Election Module
//!
//! Decides which node on the LAN hosts the relay.

pub mod engine;
pub mod message;
pub mod transport;

pub use engine::{ElectionEngine, ElectionEvent, Role};
pub use message::{ElectionMessage, MessageKind};
pub use transport::{BroadcastTransport, LocalBus, LocalEndpoint, UdpMulticastTransport};
