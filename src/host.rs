//! Node host
//!
//! Runs the relay, the bootstrap announcer and the election engine for one
//! node, and points the node's relay target at whichever node leads.

use std::future::Future;
use std::net::Ipv4Addr;
use std::sync::Arc;

use tokio::sync::watch;
use tokio::task::{JoinError, JoinHandle};

use crate::config::DewiComConfig;
use crate::election::{ElectionEngine, ElectionEvent, UdpMulticastTransport};
use crate::error::Result;
use crate::id::NodeId;
use crate::network::{self, AnnounceMessage, Announcer};
use crate::relay::RelayServer;

/// One running DewiCom node
pub struct Host {
    config: DewiComConfig,
    address: Ipv4Addr,
    node_id: NodeId,
    relay: Arc<RelayServer>,
    relay_target: watch::Sender<Option<String>>,
}

impl Host {
    /// Build a host, detecting the LAN address unless one is configured
    pub fn new(config: DewiComConfig) -> Result<Self> {
        let address = network::resolve_address(config.node.address)?;
        Ok(Self::with_address(config, address))
    }

    pub fn with_address(config: DewiComConfig, address: Ipv4Addr) -> Self {
        let node_id = NodeId::derive(address, config.node.priority_boost);
        let relay = Arc::new(RelayServer::new(config.relay.clone()));
        let (relay_target, _) = watch::channel(None);

        Self {
            config,
            address,
            node_id,
            relay,
            relay_target,
        }
    }

    pub fn address(&self) -> Ipv4Addr {
        self.address
    }

    pub fn node_id(&self) -> NodeId {
        self.node_id
    }

    pub fn relay(&self) -> Arc<RelayServer> {
        Arc::clone(&self.relay)
    }

    /// Websocket URL of the relay this node's UI should use
    pub fn relay_target(&self) -> watch::Receiver<Option<String>> {
        self.relay_target.subscribe()
    }

    fn relay_url(&self, address: Ipv4Addr) -> String {
        format!("ws://{}:{}", address, self.config.relay.ws_port())
    }

    /// Run until `shutdown` resolves.
    ///
    /// Relay bind failures and election socket failures abort startup; the
    /// announcer is optional.
    pub async fn run<F>(&self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()>,
    {
        tracing::info!("Starting node {} (node id {})", self.address, self.node_id);

        let addrs = self.relay.start().await?;
        tracing::info!("Relay ready on port {}", addrs.ws.port());

        let announcer = self.start_announcer(addrs.http.port()).await;
        let mut hint = Some(self.spawn_bootstrap_listener());

        let transport = match UdpMulticastTransport::bind(&self.config.election).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!("Cannot join election group: {}", e);
                abort_hint(hint.take());
                self.shutdown_components(None, announcer).await;
                return Err(e);
            }
        };

        let (engine, mut events) = ElectionEngine::new(
            self.address,
            self.node_id,
            self.config.election.clone(),
            Arc::new(transport),
        );
        if let Err(e) = engine.start().await {
            abort_hint(hint.take());
            self.shutdown_components(Some(&engine), announcer).await;
            return Err(e);
        }

        tokio::pin!(shutdown);
        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested");
                    break;
                }
                event = events.recv() => match event {
                    Some(event) => self.apply_event(event).await,
                    None => break,
                },
                heard = wait_hint(&mut hint), if hint.is_some() => {
                    hint = None;
                    match heard {
                        Ok(Ok(Some(announcement))) => {
                            tracing::info!("Bootstrap hint: {} announced a relay", announcement.ip);
                            self.apply_hint(announcement.ip);
                        }
                        Ok(Ok(None)) => tracing::debug!("No bootstrap announcement heard"),
                        Ok(Err(e)) => tracing::debug!("Bootstrap listen failed: {}", e),
                        Err(e) => tracing::debug!("Bootstrap listener ended: {}", e),
                    }
                }
            }
        }

        abort_hint(hint.take());
        self.shutdown_components(Some(&engine), announcer).await;
        Ok(())
    }

    /// Point the relay target at the new leader
    pub async fn apply_event(&self, event: ElectionEvent) {
        let (leader, is_self) = match event {
            ElectionEvent::BecameLeader(address) => {
                tracing::info!("This node hosts the relay");
                (address, true)
            }
            ElectionEvent::LeaderElected(address) => {
                tracing::info!("Relay hosted by {}", address);
                (address, false)
            }
        };

        self.relay.set_leader(Some(leader), is_self).await;
        self.relay_target.send_replace(Some(self.relay_url(leader)));
    }

    async fn start_announcer(&self, http_port: u16) -> Option<(Announcer, JoinHandle<()>)> {
        if !self.config.announce.enabled {
            return None;
        }

        let announcer = Announcer::new(
            self.config.announce.clone(),
            AnnounceMessage::new(self.address, http_port, self.config.relay.mode.clone()),
        );
        match announcer.start().await {
            Ok(handle) => Some((announcer, handle)),
            Err(e) => {
                tracing::warn!("Announcer unavailable: {}", e);
                None
            }
        }
    }

    /// Listen for an announcement alongside the election
    fn spawn_bootstrap_listener(&self) -> BootstrapListener {
        let announce = &self.config.announce;
        tokio::spawn(network::listen_for_announce(
            announce.group,
            announce.port,
            announce.listen_timeout(),
            self.address,
        ))
    }

    /// Seed the relay target from an announcement while no leader is known.
    /// Returns whether the target changed.
    pub fn apply_hint(&self, address: Ipv4Addr) -> bool {
        self.relay_target.send_if_modified(|target| {
            if target.is_none() {
                *target = Some(self.relay_url(address));
                true
            } else {
                false
            }
        })
    }

    async fn shutdown_components(
        &self,
        engine: Option<&ElectionEngine>,
        announcer: Option<(Announcer, JoinHandle<()>)>,
    ) {
        if let Some(engine) = engine {
            engine.stop().await;
        }
        if let Some((announcer, handle)) = announcer {
            announcer.stop().await;
            handle.abort();
        }
        self.relay.stop().await;
    }
}

type BootstrapListener = JoinHandle<Result<Option<AnnounceMessage>>>;

async fn wait_hint(
    hint: &mut Option<BootstrapListener>,
) -> std::result::Result<Result<Option<AnnounceMessage>>, JoinError> {
    match hint {
        Some(handle) => handle.await,
        None => std::future::pending().await,
    }
}

fn abort_hint(hint: Option<BootstrapListener>) {
    if let Some(handle) = hint {
        handle.abort();
    }
}
