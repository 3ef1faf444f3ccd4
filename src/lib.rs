//! DewiCom - LAN Push-to-Talk Intercom Core
//!
//! Every device on the network runs the same node. The nodes elect a single
//! leader with a Bully-style protocol over UDP multicast, and the leader hosts
//! the relay all devices connect to.
//!
//! # Architecture
//!
//! - `election`: ELECTION/LEADER/HEARTBEAT state machine over a broadcast
//!   transport
//! - `relay`: websocket relay grouping sessions into channels, fanning out
//!   presence, push-to-talk state and audio frames
//! - `network`: multicast sockets and the bootstrap announcer
//! - `host`: wires election results to the relay
//!
//! # Features
//!
//! - Leader election and automatic failover with no fixed server
//! - Five preconfigured talk channels plus listen-only monitoring
//! - Binary and text audio paths
//! - Discovery document and status endpoints over HTTP

pub mod config;
pub mod election;
pub mod error;
pub mod host;
pub mod id;
pub mod network;
pub mod relay;

pub use config::DewiComConfig;
pub use error::{Error, Result};

/// Service name carried by discovery documents and announcements
pub const SERVICE_NAME: &str = "DewiCom";

/// Crate version reported on the wire
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export commonly used types
pub mod prelude {
    pub use crate::config::DewiComConfig;
    pub use crate::election::{ElectionEngine, ElectionEvent, Role};
    pub use crate::error::{Error, Result};
    pub use crate::host::Host;
    pub use crate::id::NodeId;
    pub use crate::relay::{ChannelRegistry, RelayServer};
}
