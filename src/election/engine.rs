//! Leader Election
//!
//! Bully-style election over a connectionless broadcast transport. The node
//! with the numerically largest id wins; nodes that hear a stronger candidate
//! defer, nodes that hear a weaker one re-assert.
//!
//! All role, leader and heartbeat bookkeeping lives in one `ElectionRecord`
//! behind a single mutex. Timer tasks are started and cancelled inside the
//! same critical section that changes the role, and every timer re-checks
//! the role under the lock before acting, so a stale timer can never act on
//! a newer role. Broadcasts happen after the lock is released.

use std::net::{IpAddr, Ipv4Addr};
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;

use super::message::{ElectionMessage, MessageKind, MAX_DATAGRAM};
use super::transport::BroadcastTransport;
use crate::config::ElectionConfig;
use crate::error::{Error, Result};
use crate::id::NodeId;

/// How often the listener wakes up to observe shutdown
const RECV_POLL: Duration = Duration::from_millis(500);

/// Back-off after a transport receive error
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Role of this node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Following a leader (or waiting for one)
    Follower,
    /// Running for election
    Candidate,
    /// Won the election and hosts the relay
    Leader,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Role::Follower => write!(f, "FOLLOWER"),
            Role::Candidate => write!(f, "CANDIDATE"),
            Role::Leader => write!(f, "LEADER"),
        }
    }
}

/// Notifications for the owner of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElectionEvent {
    /// This node won; carries its own address
    BecameLeader(Ipv4Addr),
    /// Another node leads; carries its address
    LeaderElected(Ipv4Addr),
}

/// Mutable election state, guarded by `Inner::record`
struct ElectionRecord {
    role: Role,
    leader: Option<Ipv4Addr>,
    /// Meaningful only while Follower
    last_heartbeat: Instant,
    running: bool,
    /// Bumped on every candidacy so a superseded timer cannot fire
    election_round: u64,
    listener: Option<JoinHandle<()>>,
    startup: Option<JoinHandle<()>>,
    heartbeat: Option<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    election_timer: Option<JoinHandle<()>>,
}

impl ElectionRecord {
    fn new() -> Self {
        Self {
            role: Role::Follower,
            leader: None,
            last_heartbeat: Instant::now(),
            running: false,
            election_round: 0,
            listener: None,
            startup: None,
            heartbeat: None,
            watchdog: None,
            election_timer: None,
        }
    }

    fn abort_all(&mut self) {
        for task in [
            self.listener.take(),
            self.startup.take(),
            self.heartbeat.take(),
            self.watchdog.take(),
            self.election_timer.take(),
        ]
        .into_iter()
        .flatten()
        {
            task.abort();
        }
    }
}

struct Inner {
    node_id: NodeId,
    address: Ipv4Addr,
    config: ElectionConfig,
    transport: Arc<dyn BroadcastTransport>,
    events: mpsc::UnboundedSender<ElectionEvent>,
    record: Mutex<ElectionRecord>,
    shutdown: CancellationToken,
}

/// Election engine: one per node
pub struct ElectionEngine {
    inner: Arc<Inner>,
}

impl ElectionEngine {
    /// Create an engine; the receiver yields role-change notifications
    pub fn new(
        address: Ipv4Addr,
        node_id: NodeId,
        config: ElectionConfig,
        transport: Arc<dyn BroadcastTransport>,
    ) -> (Self, mpsc::UnboundedReceiver<ElectionEvent>) {
        let (events, events_rx) = mpsc::unbounded_channel();

        tracing::debug!("Election engine for {} with node id {}", address, node_id);

        let inner = Arc::new(Inner {
            node_id,
            address,
            config,
            transport,
            events,
            record: Mutex::new(ElectionRecord::new()),
            shutdown: CancellationToken::new(),
        });

        (Self { inner }, events_rx)
    }

    pub fn node_id(&self) -> NodeId {
        self.inner.node_id
    }

    pub fn address(&self) -> Ipv4Addr {
        self.inner.address
    }

    /// Current role
    pub async fn role(&self) -> Role {
        self.inner.record.lock().await.role
    }

    /// Address of the known leader (ourselves when Leader)
    pub async fn leader_address(&self) -> Option<Ipv4Addr> {
        self.inner.record.lock().await.leader
    }

    pub async fn is_leader(&self) -> bool {
        self.role().await == Role::Leader
    }

    /// Start listening and schedule the first election after a random delay
    pub async fn start(&self) -> Result<()> {
        if self.inner.shutdown.is_cancelled() {
            return Err(Error::ShuttingDown);
        }

        let mut record = self.inner.record.lock().await;
        if record.running {
            return Ok(());
        }
        record.running = true;
        record.listener = Some(self.inner.spawn_listener());

        let delay = self.inner.startup_jitter();
        let inner = Arc::clone(&self.inner);
        record.startup = Some(tokio::spawn(async move {
            time::sleep(delay).await;
            inner.start_election().await;
        }));

        tracing::info!(
            "Election engine started on {} (node id {}), first election in {:?}",
            self.inner.address,
            self.inner.node_id,
            delay
        );
        Ok(())
    }

    /// Cancel every timer and the listener. Safe to call more than once.
    pub async fn stop(&self) {
        self.inner.shutdown.cancel();

        let mut record = self.inner.record.lock().await;
        if !record.running {
            return;
        }
        record.running = false;
        record.abort_all();

        tracing::info!("Election engine stopped ({})", self.inner.address);
    }

    /// Run for leader now
    pub(crate) async fn start_election(&self) {
        self.inner.start_election().await;
    }
}

impl Drop for ElectionEngine {
    fn drop(&mut self) {
        self.inner.shutdown.cancel();
        if let Ok(mut record) = self.inner.record.try_lock() {
            record.running = false;
            record.abort_all();
        }
    }
}

impl Inner {
    fn startup_jitter(&self) -> Duration {
        let ms = rand::thread_rng().gen_range(self.config.jitter_min_ms..=self.config.jitter_max_ms);
        Duration::from_millis(ms)
    }

    fn notify(&self, event: ElectionEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Election event {:?} dropped: no subscriber", event);
        }
    }

    async fn broadcast(&self, kind: MessageKind) {
        let message = ElectionMessage::new(kind, self.node_id, self.address).encode();
        match self.transport.send(message.as_bytes()).await {
            Ok(()) => tracing::debug!("-> {}", message),
            Err(e) => tracing::warn!("Election broadcast {} failed: {}", kind, e),
        }
    }

    async fn send_if(&self, outgoing: Option<MessageKind>) {
        if let Some(kind) = outgoing {
            self.broadcast(kind).await;
        }
    }

    async fn start_election(self: &Arc<Self>) {
        let outgoing = {
            let mut record = self.record.lock().await;
            if !record.running {
                return;
            }
            self.enter_candidate(&mut record)
        };
        self.send_if(outgoing).await;
    }

    async fn handle_datagram(self: &Arc<Self>, payload: &[u8], source: IpAddr) {
        let message = match ElectionMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                tracing::debug!("Dropping election datagram from {}: {}", source, e);
                return;
            }
        };

        // Loopback of our own broadcast
        if message.address == self.address {
            return;
        }

        tracing::debug!("<- {} (from {})", message.encode(), source);

        let outgoing = {
            let mut record = self.record.lock().await;
            if !record.running {
                return;
            }
            self.on_message(&mut record, message)
        };
        self.send_if(outgoing).await;
    }

    fn on_message(self: &Arc<Self>, record: &mut ElectionRecord, message: ElectionMessage) -> Option<MessageKind> {
        match message.kind {
            MessageKind::Election => {
                if message.node_id > self.node_id {
                    if record.role == Role::Candidate {
                        tracing::info!(
                            "Deferring to stronger candidate {} (node id {})",
                            message.address,
                            message.node_id
                        );
                        self.defer(record);
                    }
                    None
                } else if message.node_id < self.node_id {
                    // Discourage the weaker candidate
                    Some(MessageKind::Election)
                } else {
                    None
                }
            }
            MessageKind::Leader => {
                tracing::info!("LEADER announced by {} (node id {})", message.address, message.node_id);
                self.become_follower(record, message.address);
                None
            }
            MessageKind::Heartbeat => {
                if record.leader == Some(message.address) {
                    if record.role == Role::Follower {
                        record.last_heartbeat = Instant::now();
                    }
                } else if message.node_id > self.node_id && record.role == Role::Follower {
                    // Adopting a leader we never heard announce itself
                    tracing::info!(
                        "Heartbeat from unannounced stronger leader {} (node id {})",
                        message.address,
                        message.node_id
                    );
                    self.become_follower(record, message.address);
                }
                None
            }
        }
    }

    fn enter_candidate(self: &Arc<Self>, record: &mut ElectionRecord) -> Option<MessageKind> {
        record.role = Role::Candidate;
        record.election_round += 1;
        if let Some(timer) = record.election_timer.take() {
            timer.abort();
        }
        record.election_timer = Some(self.spawn_election_timer(record.election_round));

        tracing::info!("Starting election (node id {})", self.node_id);
        Some(MessageKind::Election)
    }

    fn defer(self: &Arc<Self>, record: &mut ElectionRecord) {
        record.role = Role::Follower;
        if let Some(timer) = record.election_timer.take() {
            timer.abort();
        }
        // Give the stronger candidate a full timeout to announce itself
        record.last_heartbeat = Instant::now();
        if record.watchdog.is_none() {
            record.watchdog = Some(self.spawn_watchdog());
        }
    }

    fn become_leader(self: &Arc<Self>, record: &mut ElectionRecord) -> Option<MessageKind> {
        let changed = record.leader != Some(self.address);
        record.role = Role::Leader;
        record.leader = Some(self.address);

        if let Some(watchdog) = record.watchdog.take() {
            watchdog.abort();
        }
        if let Some(heartbeat) = record.heartbeat.take() {
            heartbeat.abort();
        }
        record.heartbeat = Some(self.spawn_heartbeat());

        tracing::info!("Node {} (node id {}) is now LEADER", self.address, self.node_id);
        if changed {
            self.notify(ElectionEvent::BecameLeader(self.address));
        }
        Some(MessageKind::Leader)
    }

    fn become_follower(self: &Arc<Self>, record: &mut ElectionRecord, leader: Ipv4Addr) {
        let changed = record.leader != Some(leader);
        record.role = Role::Follower;
        record.leader = Some(leader);
        record.last_heartbeat = Instant::now();

        if let Some(heartbeat) = record.heartbeat.take() {
            heartbeat.abort();
        }
        if let Some(timer) = record.election_timer.take() {
            timer.abort();
        }
        if let Some(watchdog) = record.watchdog.take() {
            watchdog.abort();
        }
        record.watchdog = Some(self.spawn_watchdog());

        if changed {
            tracing::info!("Following leader {}", leader);
            self.notify(ElectionEvent::LeaderElected(leader));
        }
    }

    fn spawn_listener(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM];
            loop {
                if inner.shutdown.is_cancelled() {
                    break;
                }

                // Use timeout to periodically check for shutdown
                let (len, source) = match time::timeout(RECV_POLL, inner.transport.recv(&mut buf)).await {
                    Ok(Ok(received)) => received,
                    Ok(Err(e)) => {
                        if !inner.shutdown.is_cancelled() {
                            tracing::warn!("Election receive error: {}", e);
                        }
                        time::sleep(RECV_ERROR_BACKOFF).await;
                        continue;
                    }
                    Err(_) => continue,
                };

                inner.handle_datagram(&buf[..len], source).await;
            }
            tracing::debug!("Election listener stopped");
        })
    }

    fn spawn_election_timer(self: &Arc<Self>, round: u64) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let wait = self.config.election_wait();
        tokio::spawn(async move {
            time::sleep(wait).await;

            let outgoing = {
                let mut record = inner.record.lock().await;
                if !record.running || record.election_round != round || record.role != Role::Candidate {
                    return;
                }
                // Detach our own handle so the transition cannot abort us
                record.election_timer.take();
                inner.become_leader(&mut record)
            };
            inner.send_if(outgoing).await;
        })
    }

    fn spawn_heartbeat(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let period = self.config.heartbeat_interval();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;
                {
                    let record = inner.record.lock().await;
                    if !record.running || record.role != Role::Leader {
                        break;
                    }
                }
                inner.broadcast(MessageKind::Heartbeat).await;
            }
        })
    }

    fn spawn_watchdog(self: &Arc<Self>) -> JoinHandle<()> {
        let inner = Arc::clone(self);
        let period = self.config.watchdog_interval();
        let timeout = self.config.leader_timeout();
        tokio::spawn(async move {
            let mut ticker = time::interval_at(Instant::now() + period, period);
            loop {
                ticker.tick().await;

                let outgoing = {
                    let mut record = inner.record.lock().await;
                    if !record.running {
                        break;
                    }
                    if record.role != Role::Follower {
                        continue;
                    }
                    let silent = record.last_heartbeat.elapsed();
                    if silent <= timeout {
                        continue;
                    }
                    tracing::warn!("Leader silent for {:?}, starting election", silent);
                    inner.enter_candidate(&mut record)
                };
                inner.send_if(outgoing).await;
            }
        })
    }
}
