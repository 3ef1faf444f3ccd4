//! Relay Module
//!
//! Push-to-talk relay: sessions grouped into channels, presence and PTT
//! fan-out, audio forwarding.

pub mod handler;
pub mod protocol;
pub mod registry;
pub mod server;

pub use protocol::{decode_frame, ClientEvent, Frame, ServerEvent};
pub use registry::{ChannelRegistry, ConnectionId, Outbound, Outlet, Session, OUTBOUND_QUEUE};
pub use server::{LeaderInfo, RelayAddrs, RelayServer};
