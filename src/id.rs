//! Node Identity
//!
//! Derives the election ordinal of a node from its IPv4 address.
//!
//! ID Structure (64 bits):
//! - bits 0-31: the four address octets, big-endian
//! - bit 32: priority boost (set for hosts that must win over handhelds)
//! - bits 33-63: unused
//!
//! Two distinct addresses always yield distinct ids within the same boost
//! class; nothing else is guaranteed.

use serde::{Deserialize, Serialize};
use std::net::Ipv4Addr;
use std::str::FromStr;

/// Offset added to boosted ids
const PRIORITY_BOOST: u64 = 1 << 32;

/// Election ordinal wrapper type
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

impl NodeId {
    /// Pack the address octets into the low 32 bits
    pub fn from_ipv4(address: Ipv4Addr) -> Self {
        Self(u64::from(u32::from_be_bytes(address.octets())))
    }

    /// Derive an id, optionally boosted above every unboosted id
    pub fn derive(address: Ipv4Addr, priority_boost: bool) -> Self {
        let id = Self::from_ipv4(address);
        if priority_boost {
            id.boosted()
        } else {
            id
        }
    }

    /// Same address, priority class raised
    pub fn boosted(self) -> Self {
        Self(self.0 | PRIORITY_BOOST)
    }

    /// Get the raw u64 value
    pub fn as_u64(&self) -> u64 {
        self.0
    }

    /// Whether the boost bit is set
    pub fn is_boosted(&self) -> bool {
        self.0 & PRIORITY_BOOST != 0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for NodeId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

impl From<NodeId> for u64 {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl From<Ipv4Addr> for NodeId {
    fn from(address: Ipv4Addr) -> Self {
        Self::from_ipv4(address)
    }
}

impl FromStr for NodeId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse::<u64>().map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_packs_octets_big_endian() {
        let id = NodeId::from_ipv4(Ipv4Addr::new(192, 168, 1, 5));
        assert_eq!(id.as_u64(), (192 << 24) | (168 << 16) | (1 << 8) | 5);
        assert_eq!(id.as_u64(), 3_232_235_781);
    }

    #[test]
    fn test_ordering_follows_last_octet() {
        let a = NodeId::from_ipv4(Ipv4Addr::new(192, 168, 1, 5));
        let b = NodeId::from_ipv4(Ipv4Addr::new(192, 168, 1, 9));
        assert!(b > a);
    }

    #[test]
    fn test_boost_outranks_any_plain_address() {
        let handheld = NodeId::from_ipv4(Ipv4Addr::new(255, 255, 255, 254));
        let desktop = NodeId::derive(Ipv4Addr::new(10, 0, 0, 1), true);
        assert!(desktop > handheld);
        assert!(desktop.is_boosted());
        assert!(!handheld.is_boosted());
        assert_eq!(desktop.as_u64() - (1 << 32), NodeId::from_ipv4(Ipv4Addr::new(10, 0, 0, 1)).as_u64());
    }

    #[test]
    fn test_parse_and_display() {
        let id: NodeId = "3232235781".parse().unwrap();
        assert_eq!(id, NodeId::from_ipv4(Ipv4Addr::new(192, 168, 1, 5)));
        assert_eq!(id.to_string(), "3232235781");
        assert!("abc".parse::<NodeId>().is_err());
        assert!("-1".parse::<NodeId>().is_err());
    }
}
