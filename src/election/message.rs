//! Election wire messages
//!
//! Every datagram is ASCII `TYPE:senderNodeId:senderAddress`.

use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{Error, Result};
use crate::id::NodeId;

/// Largest datagram the listener accepts
pub const MAX_DATAGRAM: usize = 256;

/// Election message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// Sender is running for leader
    Election,
    /// Sender won the election
    Leader,
    /// Sender is the live leader
    Heartbeat,
}

impl MessageKind {
    /// Wire tag
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageKind::Election => "ELECTION",
            MessageKind::Leader => "LEADER",
            MessageKind::Heartbeat => "HEARTBEAT",
        }
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A decoded election datagram
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ElectionMessage {
    pub kind: MessageKind,
    pub node_id: NodeId,
    pub address: Ipv4Addr,
}

impl ElectionMessage {
    pub fn new(kind: MessageKind, node_id: NodeId, address: Ipv4Addr) -> Self {
        Self { kind, node_id, address }
    }

    /// Encode to the wire form
    pub fn encode(&self) -> String {
        format!("{}:{}:{}", self.kind, self.node_id, self.address)
    }

    /// Decode a raw datagram
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let text = std::str::from_utf8(bytes)
            .map_err(|_| Error::Protocol("election datagram is not UTF-8".into()))?;
        text.parse()
    }
}

impl FromStr for ElectionMessage {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.trim().split(':');
        let (Some(kind), Some(id), Some(address)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(Error::Protocol(format!("expected TYPE:ID:ADDRESS, got {:?}", s)));
        };

        let kind = match kind {
            "ELECTION" => MessageKind::Election,
            "LEADER" => MessageKind::Leader,
            "HEARTBEAT" => MessageKind::Heartbeat,
            other => return Err(Error::Protocol(format!("unknown election message {:?}", other))),
        };
        let node_id = id
            .parse::<NodeId>()
            .map_err(|e| Error::Protocol(format!("bad node id {:?}: {}", id, e)))?;
        let address = address
            .parse::<Ipv4Addr>()
            .map_err(|e| Error::Protocol(format!("bad sender address {:?}: {}", address, e)))?;

        Ok(Self { kind, node_id, address })
    }
}
