//! Network Module
//!
//! Multicast socket setup shared by the election transport and the
//! bootstrap announcer, plus local address detection.

pub mod discovery;

pub use discovery::{listen_for_announce, AnnounceMessage, Announcer};

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use crate::error::{Error, Result};

/// Multicast TTL for every datagram we send
pub const MULTICAST_TTL: u32 = 4;

/// Bind a UDP socket on `port` that receives traffic for `group`.
///
/// The port is shared (`SO_REUSEADDR`) so several processes on one host can
/// listen to the same group.
pub fn bind_multicast(group: Ipv4Addr, port: u16) -> Result<UdpSocket> {
    let address = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port);

    let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| Error::bind(address, e))?;
    socket
        .set_reuse_address(true)
        .map_err(|e| Error::bind(address, e))?;
    #[cfg(unix)]
    socket
        .set_reuse_port(true)
        .map_err(|e| Error::bind(address, e))?;
    socket
        .set_nonblocking(true)
        .map_err(|e| Error::bind(address, e))?;
    socket
        .bind(&SocketAddr::V4(address).into())
        .map_err(|e| Error::bind(address, e))?;
    socket
        .join_multicast_v4(&group, &Ipv4Addr::UNSPECIFIED)
        .map_err(|e| Error::bind(address, format!("cannot join {}: {}", group, e)))?;

    let socket = UdpSocket::from_std(socket.into()).map_err(|e| Error::bind(address, e))?;
    Ok(socket)
}

/// Ephemeral socket used for sending to a multicast group
pub async fn bind_sender() -> Result<UdpSocket> {
    let socket = UdpSocket::bind("0.0.0.0:0")
        .await
        .map_err(|e| Error::bind("0.0.0.0:0", e))?;
    socket
        .set_multicast_ttl_v4(MULTICAST_TTL)
        .map_err(|e| Error::Network(format!("Failed to set multicast TTL: {}", e)))?;
    socket
        .set_broadcast(true)
        .map_err(|e| Error::Network(format!("Failed to enable broadcast: {}", e)))?;
    Ok(socket)
}

/// Best-effort detection of the LAN address of this host.
///
/// Connecting a UDP socket sends nothing; it only makes the kernel pick the
/// outbound interface for the default route.
pub fn local_ipv4() -> Result<Ipv4Addr> {
    let socket = std::net::UdpSocket::bind("0.0.0.0:0")?;
    socket.connect("8.8.8.8:80")?;
    match socket.local_addr()? {
        SocketAddr::V4(addr) if !addr.ip().is_unspecified() => Ok(*addr.ip()),
        other => Err(Error::Network(format!(
            "no usable IPv4 address for the default route (got {})",
            other
        ))),
    }
}

/// Resolve the configured address, falling back to detection
pub fn resolve_address(configured: Option<Ipv4Addr>) -> Result<Ipv4Addr> {
    match configured {
        Some(addr) => Ok(addr),
        None => local_ipv4(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_address_wins() {
        let addr = Ipv4Addr::new(192, 168, 50, 3);
        assert_eq!(resolve_address(Some(addr)).unwrap(), addr);
    }

    #[tokio::test]
    async fn test_sender_socket_binds() {
        let socket = bind_sender().await.unwrap();
        assert!(socket.local_addr().unwrap().port() > 0);
    }
}
