//! Bootstrap Announce Module
//!
//! Nodes willing to be discovered periodically multicast a small JSON
//! document naming their relay endpoint. Legacy scanners consume it; a
//! starting node may also listen briefly and log what it hears as a hint.
//! The election never depends on it.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;

use crate::config::AnnounceConfig;
use crate::error::Result;
use crate::{SERVICE_NAME, VERSION};

/// Largest announcement we accept
const MAX_ANNOUNCE: usize = 1024;

/// Periodic announcement payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AnnounceMessage {
    pub service: String,
    pub version: String,
    pub ip: Ipv4Addr,
    /// Port of the HTTP discovery listener
    pub port: u16,
    pub protocol: String,
    pub mode: String,
}

impl AnnounceMessage {
    /// Announcement for a node serving discovery on `ip:port`
    pub fn new(ip: Ipv4Addr, port: u16, mode: impl Into<String>) -> Self {
        Self {
            service: SERVICE_NAME.to_string(),
            version: VERSION.to_string(),
            ip,
            port,
            protocol: "http".to_string(),
            mode: mode.into(),
        }
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse an announcement, rejecting foreign services
fn parse_announcement(bytes: &[u8]) -> Option<AnnounceMessage> {
    let message: AnnounceMessage = serde_json::from_slice(bytes).ok()?;
    if message.service != SERVICE_NAME {
        return None;
    }
    Some(message)
}

/// Periodic announce broadcaster
pub struct Announcer {
    config: AnnounceConfig,
    message: AnnounceMessage,
    /// Running flag
    running: Arc<RwLock<bool>>,
}

impl Announcer {
    pub fn new(config: AnnounceConfig, message: AnnounceMessage) -> Self {
        Self {
            config,
            message,
            running: Arc::new(RwLock::new(false)),
        }
    }

    /// Start broadcasting. Returns the broadcaster task handle.
    pub async fn start(&self) -> Result<JoinHandle<()>> {
        let socket = super::bind_sender().await?;
        let payload = self.message.to_json()?;
        let target = SocketAddr::V4(SocketAddrV4::new(self.config.group, self.config.port));
        let period = self.config.interval();
        let running = Arc::clone(&self.running);

        *running.write().await = true;

        tracing::info!(
            "Announcing {}:{} to {} every {:?}",
            self.message.ip,
            self.message.port,
            target,
            period
        );

        Ok(tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);

            loop {
                interval.tick().await;

                if !*running.read().await {
                    break;
                }

                if let Err(e) = socket.send_to(payload.as_bytes(), target).await {
                    // Multicast may be filtered on some networks
                    tracing::trace!("Announce send failed: {}", e);
                } else {
                    tracing::trace!("Announce sent");
                }
            }
        }))
    }

    /// Stop the broadcaster after its current tick
    pub async fn stop(&self) {
        *self.running.write().await = false;
    }

    pub async fn is_running(&self) -> bool {
        *self.running.read().await
    }
}

/// Wait up to `timeout` for an announcement from a node other than `ignore`.
///
/// Returns `Ok(None)` when nothing was heard.
pub async fn listen_for_announce(
    group: Ipv4Addr,
    port: u16,
    timeout: Duration,
    ignore: Ipv4Addr,
) -> Result<Option<AnnounceMessage>> {
    if timeout.is_zero() {
        return Ok(None);
    }

    let socket: UdpSocket = super::bind_multicast(group, port)?;
    let mut buf = [0u8; MAX_ANNOUNCE];
    let deadline = tokio::time::Instant::now() + timeout;

    tracing::debug!("Listening for announcements on {}:{} for {:?}", group, port, timeout);

    while tokio::time::Instant::now() < deadline {
        let remaining = deadline - tokio::time::Instant::now();

        let (len, src) = match tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(received)) => received,
            Ok(Err(e)) => {
                tracing::trace!("Announce recv error: {}", e);
                continue;
            }
            Err(_) => break,
        };

        let Some(message) = parse_announcement(&buf[..len]) else {
            tracing::trace!("Ignoring non-announce datagram from {}", src);
            continue;
        };
        if message.ip == ignore {
            continue;
        }

        tracing::info!("Heard announcement from {} at {}:{}", src, message.ip, message.port);
        return Ok(Some(message));
    }

    Ok(None)
}
