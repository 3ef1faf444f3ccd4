//! Election transports
//!
//! The engine only needs fire-and-forget group sends and a receive call.
//! `UdpMulticastTransport` is the production transport; `LocalBus` connects
//! engines inside one process for simulations and tests.

use std::net::{IpAddr, Ipv4Addr, SocketAddr, SocketAddrV4};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, Mutex};

use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::network;

/// Group transport for election datagrams
#[async_trait]
pub trait BroadcastTransport: Send + Sync {
    /// Send one datagram to every member of the group
    async fn send(&self, payload: &[u8]) -> Result<()>;

    /// Wait for the next datagram; returns its length and source address
    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, IpAddr)>;
}

/// UDP multicast transport
pub struct UdpMulticastTransport {
    send_socket: UdpSocket,
    recv_socket: UdpSocket,
    group: SocketAddr,
}

impl UdpMulticastTransport {
    /// Join the election group. Failure here is fatal to engine startup.
    pub async fn bind(config: &ElectionConfig) -> Result<Self> {
        let recv_socket = network::bind_multicast(config.group, config.port)?;
        let send_socket = network::bind_sender().await?;

        tracing::info!("Election transport joined {}:{}", config.group, config.port);

        Ok(Self {
            send_socket,
            recv_socket,
            group: SocketAddr::V4(SocketAddrV4::new(config.group, config.port)),
        })
    }
}

#[async_trait]
impl BroadcastTransport for UdpMulticastTransport {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.send_socket
            .send_to(payload, self.group)
            .await
            .map_err(|e| Error::Network(format!("election send to {} failed: {}", self.group, e)))?;
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, IpAddr)> {
        let (len, src) = self.recv_socket.recv_from(buf).await?;
        Ok((len, src.ip()))
    }
}

/// In-process broadcast medium.
///
/// Every endpoint sees every datagram, including its own, like multicast
/// loopback on a real interface.
#[derive(Clone)]
pub struct LocalBus {
    tx: broadcast::Sender<(Ipv4Addr, Vec<u8>)>,
}

impl LocalBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1024);
        Self { tx }
    }

    /// Attach a node with the given source address
    pub fn endpoint(&self, address: Ipv4Addr) -> LocalEndpoint {
        LocalEndpoint {
            address,
            tx: self.tx.clone(),
            rx: Mutex::new(self.tx.subscribe()),
        }
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new()
    }
}

/// One node's attachment to a `LocalBus`
pub struct LocalEndpoint {
    address: Ipv4Addr,
    tx: broadcast::Sender<(Ipv4Addr, Vec<u8>)>,
    rx: Mutex<broadcast::Receiver<(Ipv4Addr, Vec<u8>)>>,
}

#[async_trait]
impl BroadcastTransport for LocalEndpoint {
    async fn send(&self, payload: &[u8]) -> Result<()> {
        // No receivers is not an error on a broadcast medium
        let _ = self.tx.send((self.address, payload.to_vec()));
        Ok(())
    }

    async fn recv(&self, buf: &mut [u8]) -> Result<(usize, IpAddr)> {
        let mut rx = self.rx.lock().await;
        loop {
            match rx.recv().await {
                Ok((src, payload)) => {
                    let len = payload.len().min(buf.len());
                    buf[..len].copy_from_slice(&payload[..len]);
                    return Ok((len, IpAddr::V4(src)));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    tracing::debug!("Local bus endpoint {} dropped {} datagrams", self.address, skipped);
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return Err(Error::Network("local bus closed".into()));
                }
            }
        }
    }
}
