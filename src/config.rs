//! DewiCom Configuration
//!
//! This module provides configuration structures for the election engine,
//! the relay server and the bootstrap announcer.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::time::Duration;

/// Main DewiCom configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DewiComConfig {
    /// Node-specific configuration
    #[serde(default)]
    pub node: NodeConfig,

    /// Leader election configuration
    #[serde(default)]
    pub election: ElectionConfig,

    /// Relay server configuration
    #[serde(default)]
    pub relay: RelayConfig,

    /// Bootstrap announce configuration
    #[serde(default)]
    pub announce: AnnounceConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeConfig {
    /// IPv4 address this node advertises; detected when absent
    #[serde(default)]
    pub address: Option<Ipv4Addr>,

    /// Raise this node above every unboosted node in elections
    #[serde(default)]
    pub priority_boost: bool,
}

/// Leader election configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ElectionConfig {
    /// Multicast group carrying election traffic
    #[serde(default = "default_multicast_group")]
    pub group: Ipv4Addr,

    /// UDP port for election traffic
    #[serde(default = "default_election_port")]
    pub port: u16,

    /// Leader heartbeat period in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Silence after which a follower starts a new election
    #[serde(default = "default_leader_timeout_ms")]
    pub leader_timeout_ms: u64,

    /// How long a candidate waits for a stronger candidate before winning
    #[serde(default = "default_election_wait_ms")]
    pub election_wait_ms: u64,

    /// Lower bound of the startup delay before the first election
    #[serde(default = "default_jitter_min_ms")]
    pub jitter_min_ms: u64,

    /// Upper bound of the startup delay before the first election
    #[serde(default = "default_jitter_max_ms")]
    pub jitter_max_ms: u64,
}

/// One preconfigured relay channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelConfig {
    /// Channel identifier used on the wire
    pub id: String,
    /// Display name
    pub name: String,
    /// Display color
    pub color: String,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Websocket relay bind address
    #[serde(default = "default_ws_address")]
    pub ws_bind_address: String,

    /// HTTP discovery bind address
    #[serde(default = "default_http_address")]
    pub http_bind_address: String,

    /// Mode string reported in discovery documents
    #[serde(default = "default_mode")]
    pub mode: String,

    /// Fixed channel set
    #[serde(default = "default_channels")]
    pub channels: Vec<ChannelConfig>,
}

/// Bootstrap announce configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnnounceConfig {
    /// Broadcast announcements for legacy scanners
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Multicast group for announcements
    #[serde(default = "default_multicast_group")]
    pub group: Ipv4Addr,

    /// UDP port for announcements
    #[serde(default = "default_announce_port")]
    pub port: u16,

    /// Announcement period in milliseconds
    #[serde(default = "default_announce_interval_ms")]
    pub interval_ms: u64,

    /// How long to wait for a bootstrap hint at startup (0 = skip)
    #[serde(default = "default_listen_timeout_ms")]
    pub listen_timeout_ms: u64,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Log format (pretty, json)
    #[serde(default = "default_log_format")]
    pub format: String,
}

// Default value functions
fn default_multicast_group() -> Ipv4Addr {
    Ipv4Addr::new(224, 0, 0, 251)
}

fn default_election_port() -> u16 {
    9998
}

fn default_announce_port() -> u16 {
    9999
}

fn default_heartbeat_interval_ms() -> u64 {
    2000
}

fn default_leader_timeout_ms() -> u64 {
    6000
}

fn default_election_wait_ms() -> u64 {
    2000
}

fn default_jitter_min_ms() -> u64 {
    500
}

fn default_jitter_max_ms() -> u64 {
    1500
}

fn default_ws_address() -> String {
    "0.0.0.0:3002".to_string()
}

fn default_http_address() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_mode() -> String {
    "native".to_string()
}

fn default_announce_interval_ms() -> u64 {
    2000
}

fn default_listen_timeout_ms() -> u64 {
    3000
}

fn default_true() -> bool {
    true
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "pretty".to_string()
}

/// Size of the configured channel set
pub const CHANNEL_COUNT: usize = 5;

/// The five channels every installation starts with
pub fn default_channels() -> Vec<ChannelConfig> {
    [
        ("general", "Général", "#4CAF50"),
        ("foh", "FOH", "#2196F3"),
        ("plateau", "Plateau", "#FF9800"),
        ("lumiere", "Lumière", "#9C27B0"),
        ("regie", "Régie", "#F44336"),
    ]
    .into_iter()
    .map(|(id, name, color)| ChannelConfig {
        id: id.to_string(),
        name: name.to_string(),
        color: color.to_string(),
    })
    .collect()
}

impl Default for ElectionConfig {
    fn default() -> Self {
        Self {
            group: default_multicast_group(),
            port: default_election_port(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            leader_timeout_ms: default_leader_timeout_ms(),
            election_wait_ms: default_election_wait_ms(),
            jitter_min_ms: default_jitter_min_ms(),
            jitter_max_ms: default_jitter_max_ms(),
        }
    }
}

impl ElectionConfig {
    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// Get leader timeout as Duration
    pub fn leader_timeout(&self) -> Duration {
        Duration::from_millis(self.leader_timeout_ms)
    }

    /// Watchdog check period (half the leader timeout)
    pub fn watchdog_interval(&self) -> Duration {
        Duration::from_millis((self.leader_timeout_ms / 2).max(1))
    }

    /// Get election wait as Duration
    pub fn election_wait(&self) -> Duration {
        Duration::from_millis(self.election_wait_ms)
    }

    fn validate(&self) -> crate::Result<()> {
        if !self.group.is_multicast() {
            return Err(crate::Error::Config(format!(
                "election.group {} is not a multicast address",
                self.group
            )));
        }
        if self.heartbeat_interval_ms == 0 || self.election_wait_ms == 0 {
            return Err(crate::Error::Config(
                "election intervals must be greater than zero".into(),
            ));
        }
        if self.leader_timeout_ms <= self.heartbeat_interval_ms {
            return Err(crate::Error::Config(
                "election.leader_timeout_ms must exceed election.heartbeat_interval_ms".into(),
            ));
        }
        if self.jitter_min_ms > self.jitter_max_ms {
            return Err(crate::Error::Config(
                "election.jitter_min_ms cannot exceed election.jitter_max_ms".into(),
            ));
        }
        Ok(())
    }
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            ws_bind_address: default_ws_address(),
            http_bind_address: default_http_address(),
            mode: default_mode(),
            channels: default_channels(),
        }
    }
}

impl RelayConfig {
    /// Port clients use for the websocket relay
    pub fn ws_port(&self) -> u16 {
        port_of(&self.ws_bind_address).unwrap_or(3002)
    }

    /// Port serving discovery requests
    pub fn http_port(&self) -> u16 {
        port_of(&self.http_bind_address).unwrap_or(3001)
    }

    fn validate(&self) -> crate::Result<()> {
        if self.ws_bind_address.is_empty() || self.http_bind_address.is_empty() {
            return Err(crate::Error::Config("relay bind addresses cannot be empty".into()));
        }
        if self.channels.len() != CHANNEL_COUNT {
            return Err(crate::Error::Config(format!(
                "relay.channels must list exactly {} channels, found {}",
                CHANNEL_COUNT,
                self.channels.len()
            )));
        }
        let mut seen = HashSet::new();
        for channel in &self.channels {
            if channel.id.is_empty() {
                return Err(crate::Error::Config("relay channel id cannot be empty".into()));
            }
            if !seen.insert(channel.id.as_str()) {
                return Err(crate::Error::Config(format!(
                    "duplicate relay channel id: {}",
                    channel.id
                )));
            }
        }
        Ok(())
    }
}

impl Default for AnnounceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            group: default_multicast_group(),
            port: default_announce_port(),
            interval_ms: default_announce_interval_ms(),
            listen_timeout_ms: default_listen_timeout_ms(),
        }
    }
}

impl AnnounceConfig {
    /// Get announcement interval as Duration
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    /// Get bootstrap listen timeout as Duration
    pub fn listen_timeout(&self) -> Duration {
        Duration::from_millis(self.listen_timeout_ms)
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

fn port_of(address: &str) -> Option<u16> {
    address.rsplit(':').next()?.parse().ok()
}

impl DewiComConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> crate::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> crate::Result<Self> {
        let config: DewiComConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used by `dewicom init`)
    pub fn to_toml(&self) -> crate::Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Validate the configuration
    pub fn validate(&self) -> crate::Result<()> {
        self.election.validate()?;
        self.relay.validate()?;

        if self.announce.enabled {
            if !self.announce.group.is_multicast() {
                return Err(crate::Error::Config(format!(
                    "announce.group {} is not a multicast address",
                    self.announce.group
                )));
            }
            if self.announce.interval_ms == 0 {
                return Err(crate::Error::Config(
                    "announce.interval_ms must be greater than zero".into(),
                ));
            }
        }

        Ok(())
    }

    /// Default config file location
    pub fn default_path() -> PathBuf {
        PathBuf::from("dewicom.toml")
    }
}
