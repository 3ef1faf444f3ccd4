//! Channel Registry
//!
//! Owns every session and channel membership of the relay. All mutation goes
//! through one mutex; recipients are snapshotted under it and messages are
//! delivered after it is released, so a slow or dead connection never blocks
//! a mutation.
//!
//! A channel's member set holds both the sessions whose primary channel it is
//! and the sessions listening to it.

use std::collections::{HashMap, HashSet};

use bytes::Bytes;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::protocol::{CallRing, ChannelSummary, Presence, PttState, ServerEvent};
use crate::config::ChannelConfig;
use crate::error::Result;

/// Identifier of one relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Frames queued to a connection's writer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    Text(String),
    Binary(Bytes),
    /// Send a close frame and stop writing
    Close,
}

/// Frames a connection may have queued before new ones are dropped
pub const OUTBOUND_QUEUE: usize = 128;

/// Sending half of one connection's writer queue
#[derive(Debug, Clone)]
pub struct Outlet {
    queue: mpsc::Sender<Outbound>,
    closed: CancellationToken,
}

impl Outlet {
    /// New outlet and the receiver its writer drains
    pub fn channel() -> (Self, mpsc::Receiver<Outbound>) {
        let (queue, rx) = mpsc::channel(OUTBOUND_QUEUE);
        let outlet = Self {
            queue,
            closed: CancellationToken::new(),
        };
        (outlet, rx)
    }

    /// Queue a frame. A full queue drops it, so a stalled reader never
    /// holds more than `OUTBOUND_QUEUE` frames.
    pub fn push(&self, message: Outbound) -> bool {
        match self.queue.try_send(message) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                tracing::trace!("Outbound queue full, dropping frame");
                false
            }
            Err(TrySendError::Closed(_)) => {
                tracing::trace!("Skipping closed connection");
                false
            }
        }
    }

    /// Ask the connection to close. Fires the token even when the queue is
    /// too full to take the close frame.
    pub fn close(&self) {
        self.closed.cancel();
        let _ = self.queue.try_send(Outbound::Close);
    }

    /// Token cancelled once the registry closes this connection
    pub fn closed(&self) -> CancellationToken {
        self.closed.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// One joined client
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Session {
    pub name: String,
    /// Primary channel
    pub channel: String,
    pub client_id: Option<String>,
    /// Extra channels this session receives
    pub listen_channels: HashSet<String>,
    /// Channels this session's audio goes to; empty means the primary
    pub talk_channels: Vec<String>,
}

impl Session {
    /// Whether a join by `name`/`client_id` is this client reconnecting
    fn same_client(&self, name: &str, client_id: Option<&str>) -> bool {
        match client_id {
            Some(id) => self.client_id.as_deref() == Some(id),
            None => self.name == name,
        }
    }
}

/// Channel roster with member names, for status queries
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ChannelRoster {
    pub id: String,
    pub name: String,
    pub color: String,
    pub users: usize,
    pub members: Vec<String>,
}

#[derive(Default)]
struct RegistryState {
    connections: HashMap<ConnectionId, Outlet>,
    sessions: HashMap<ConnectionId, Session>,
    members: HashMap<String, HashSet<ConnectionId>>,
}

impl RegistryState {
    fn add_member(&mut self, channel: &str, id: ConnectionId) {
        self.members.entry(channel.to_string()).or_default().insert(id);
    }

    fn remove_member(&mut self, channel: &str, id: ConnectionId) {
        if let Some(set) = self.members.get_mut(channel) {
            set.remove(&id);
        }
    }

    fn remove_everywhere(&mut self, id: ConnectionId) {
        for set in self.members.values_mut() {
            set.remove(&id);
        }
    }

    /// Senders for every member of `channel` except `except`
    fn channel_recipients(&self, channel: &str, except: ConnectionId) -> Vec<Outlet> {
        self.members
            .get(channel)
            .into_iter()
            .flatten()
            .filter(|id| **id != except)
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }

    /// Members of any of `channels` except `except`, each once
    fn union_recipients(&self, channels: &[String], except: ConnectionId) -> Vec<Outlet> {
        let ids: HashSet<ConnectionId> = channels
            .iter()
            .filter_map(|channel| self.members.get(channel))
            .flatten()
            .copied()
            .filter(|id| *id != except)
            .collect();
        ids.iter()
            .filter_map(|id| self.connections.get(id).cloned())
            .collect()
    }

    fn member_count(&self, channel: &str) -> usize {
        self.members.get(channel).map_or(0, HashSet::len)
    }
}

/// Session and channel registry
pub struct ChannelRegistry {
    channels: Vec<ChannelConfig>,
    state: Mutex<RegistryState>,
}

impl ChannelRegistry {
    pub fn new(channels: Vec<ChannelConfig>) -> Self {
        Self {
            channels,
            state: Mutex::new(RegistryState::default()),
        }
    }

    /// Configured channels
    pub fn channels(&self) -> &[ChannelConfig] {
        &self.channels
    }

    /// Register a new connection's outbound queue
    pub async fn connect(&self, outlet: Outlet) -> ConnectionId {
        let id = ConnectionId::new();
        self.state.lock().await.connections.insert(id, outlet);
        tracing::debug!("Connection {} registered", id);
        id
    }

    /// Join `channel`, replacing any stale session of the same client
    pub async fn join(
        &self,
        id: ConnectionId,
        name: &str,
        channel: &str,
        client_id: Option<&str>,
        listen_channels: &[String],
    ) -> Result<()> {
        let client_id = client_id.filter(|c| !c.is_empty());

        let (own, roster, recipients, evicted) = {
            let mut state = self.state.lock().await;
            if !state.connections.contains_key(&id) {
                tracing::debug!("Ignoring join from closed connection {}", id);
                return Ok(());
            }

            let stale: Vec<ConnectionId> = state
                .sessions
                .iter()
                .filter(|(other, session)| **other != id && session.same_client(name, client_id))
                .map(|(other, _)| *other)
                .collect();
            let mut evicted = Vec::with_capacity(stale.len());
            for other in stale {
                state.sessions.remove(&other);
                state.remove_everywhere(other);
                if let Some(outlet) = state.connections.remove(&other) {
                    evicted.push(outlet);
                }
                tracing::info!("Evicted stale session {} of {}", other, name);
            }

            state.remove_everywhere(id);
            state.add_member(channel, id);
            let listen: HashSet<String> = listen_channels
                .iter()
                .filter(|l| l.as_str() != channel && !l.is_empty())
                .cloned()
                .collect();
            for extra in &listen {
                state.add_member(extra, id);
            }
            state.sessions.insert(
                id,
                Session {
                    name: name.to_string(),
                    channel: channel.to_string(),
                    client_id: client_id.map(str::to_string),
                    listen_channels: listen,
                    talk_channels: Vec::new(),
                },
            );

            (
                state.connections.get(&id).cloned(),
                self.roster_locked(&state),
                state.channel_recipients(channel, id),
                evicted,
            )
        };

        tracing::info!("{} joined {} ({})", name, channel, id);

        for outlet in evicted {
            outlet.close();
        }
        if let Some(outlet) = own {
            deliver(&[outlet], Outbound::Text(ServerEvent::ChannelsInit(roster).encode()?));
        }
        let joined = ServerEvent::UserJoined(Presence {
            name: name.to_string(),
            channel: channel.to_string(),
        });
        deliver(&recipients, Outbound::Text(joined.encode()?));
        Ok(())
    }

    /// Move the session's primary channel. Listen memberships are kept.
    pub async fn switch_channel(&self, id: ConnectionId, channel: &str) -> Result<()> {
        let (name, old, left_recipients, joined_recipients) = {
            let mut state = self.state.lock().await;
            let Some(session) = state.sessions.get(&id) else {
                return Ok(());
            };
            if session.channel == channel {
                return Ok(());
            }
            let name = session.name.clone();
            let old = session.channel.clone();
            let still_listening = session.listen_channels.contains(&old);

            if !still_listening {
                state.remove_member(&old, id);
            }
            let left_recipients = state.channel_recipients(&old, id);

            if let Some(session) = state.sessions.get_mut(&id) {
                session.channel = channel.to_string();
            }
            state.add_member(channel, id);
            let joined_recipients = state.channel_recipients(channel, id);

            (name, old, left_recipients, joined_recipients)
        };

        tracing::debug!("{} switched {} -> {}", name, old, channel);

        let left = ServerEvent::UserLeft(Presence { name: name.clone(), channel: old });
        deliver(&left_recipients, Outbound::Text(left.encode()?));
        let joined = ServerEvent::UserJoined(Presence { name, channel: channel.to_string() });
        deliver(&joined_recipients, Outbound::Text(joined.encode()?));
        Ok(())
    }

    /// Tell the sender's channel whether it is talking
    pub async fn set_talking(&self, id: ConnectionId, speaking: bool) -> Result<()> {
        let (session, recipients) = {
            let state = self.state.lock().await;
            let Some(session) = state.sessions.get(&id) else {
                return Ok(());
            };
            (session.clone(), state.channel_recipients(&session.channel, id))
        };

        tracing::debug!(
            "{} {} talking on {} ({} listeners)",
            session.name,
            if speaking { "started" } else { "stopped" },
            session.channel,
            recipients.len()
        );

        let event = ServerEvent::PttState(PttState {
            from: session.name,
            from_id: id.to_string(),
            channel: session.channel,
            speaking,
        });
        deliver(&recipients, Outbound::Text(event.encode()?));
        Ok(())
    }

    /// Forward a binary audio frame to the sender's talk channels
    pub async fn relay_audio(&self, id: ConnectionId, frame: Bytes) {
        let recipients = self.audio_recipients(id).await;
        tracing::trace!("Relaying {} audio bytes from {} to {} peers", frame.len(), id, recipients.len());
        deliver(&recipients, Outbound::Binary(frame));
    }

    /// Forward a text frame verbatim to the sender's talk channels
    pub async fn relay_text(&self, id: ConnectionId, frame: &str) {
        let recipients = self.audio_recipients(id).await;
        tracing::trace!("Relaying text frame from {} to {} peers", id, recipients.len());
        deliver(&recipients, Outbound::Text(frame.to_string()));
    }

    /// Ring every other joined session regardless of channel
    pub async fn ring_all(&self, id: ConnectionId) -> Result<()> {
        let (session, recipients) = {
            let state = self.state.lock().await;
            let Some(session) = state.sessions.get(&id) else {
                return Ok(());
            };
            let recipients: Vec<Outlet> = state
                .sessions
                .keys()
                .filter(|other| **other != id)
                .filter_map(|other| state.connections.get(other).cloned())
                .collect();
            (session.clone(), recipients)
        };

        tracing::info!("{} is calling everyone from {}", session.name, session.channel);

        let event = ServerEvent::CallRing(CallRing {
            from: session.name,
            from_id: id.to_string(),
            channel: session.channel,
        });
        deliver(&recipients, Outbound::Text(event.encode()?));
        Ok(())
    }

    /// Replace the session's listen channels; the primary is untouched
    pub async fn update_listen_channels(&self, id: ConnectionId, listen_channels: &[String]) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get(&id) else {
            return;
        };
        let primary = session.channel.clone();
        let previous: Vec<String> = session.listen_channels.iter().cloned().collect();

        for old in previous.iter().filter(|c| **c != primary) {
            state.remove_member(old, id);
        }
        let listen: HashSet<String> = listen_channels
            .iter()
            .filter(|l| **l != primary && !l.is_empty())
            .cloned()
            .collect();
        for extra in &listen {
            state.add_member(extra, id);
        }

        tracing::debug!("{} now listening to {:?}", id, listen);
        if let Some(session) = state.sessions.get_mut(&id) {
            session.listen_channels = listen;
        }
    }

    /// Replace the channels this session's audio is sent to. Membership is
    /// unchanged; an empty list sends to the primary channel again.
    pub async fn update_talk_channels(&self, id: ConnectionId, talk_channels: &[String]) {
        let mut state = self.state.lock().await;
        let Some(session) = state.sessions.get_mut(&id) else {
            return;
        };
        let mut talk: Vec<String> = Vec::with_capacity(talk_channels.len());
        for channel in talk_channels.iter().filter(|c| !c.is_empty()) {
            if !talk.contains(channel) {
                talk.push(channel.clone());
            }
        }
        tracing::debug!("{} now talking to {:?}", session.name, talk);
        session.talk_channels = talk;
    }

    /// Drop a closed connection and tell its primary channel
    pub async fn leave(&self, id: ConnectionId) {
        let departed = {
            let mut state = self.state.lock().await;
            state.connections.remove(&id);
            let session = state.sessions.remove(&id);
            state.remove_everywhere(id);
            session.map(|s| {
                let recipients = state.channel_recipients(&s.channel, id);
                (s, recipients)
            })
        };

        let Some((session, recipients)) = departed else {
            tracing::debug!("Connection {} closed before joining", id);
            return;
        };

        tracing::info!("{} left {} ({})", session.name, session.channel, id);

        let left = ServerEvent::UserLeft(Presence {
            name: session.name,
            channel: session.channel,
        });
        match left.encode() {
            Ok(text) => deliver(&recipients, Outbound::Text(text)),
            Err(e) => tracing::warn!("Failed to encode user-left: {}", e),
        }
    }

    /// Close every connection and forget all state
    pub async fn close_all(&self) {
        let connections: Vec<Outlet> = {
            let mut state = self.state.lock().await;
            let connections = state.connections.drain().map(|(_, outlet)| outlet).collect();
            state.sessions.clear();
            state.members.clear();
            connections
        };
        tracing::debug!("Closing {} relay connections", connections.len());
        for outlet in &connections {
            outlet.close();
        }
    }

    /// Configured channels with live member counts
    pub async fn roster(&self) -> Vec<ChannelSummary> {
        let state = self.state.lock().await;
        self.roster_locked(&state)
    }

    /// Configured channels with member names
    pub async fn roster_with_members(&self) -> Vec<ChannelRoster> {
        let state = self.state.lock().await;
        self.channels
            .iter()
            .map(|channel| {
                let mut members: Vec<String> = state
                    .members
                    .get(&channel.id)
                    .into_iter()
                    .flatten()
                    .filter_map(|id| state.sessions.get(id).map(|s| s.name.clone()))
                    .collect();
                members.sort();
                ChannelRoster {
                    id: channel.id.clone(),
                    name: channel.name.clone(),
                    color: channel.color.clone(),
                    users: state.member_count(&channel.id),
                    members,
                }
            })
            .collect()
    }

    pub async fn session(&self, id: ConnectionId) -> Option<Session> {
        self.state.lock().await.sessions.get(&id).cloned()
    }

    /// Connections that are members of `channel`
    pub async fn members(&self, channel: &str) -> HashSet<ConnectionId> {
        self.state
            .lock()
            .await
            .members
            .get(channel)
            .cloned()
            .unwrap_or_default()
    }

    /// Channels `id` is a member of, sorted
    pub async fn memberships(&self, id: ConnectionId) -> Vec<String> {
        let state = self.state.lock().await;
        let mut channels: Vec<String> = state
            .members
            .iter()
            .filter(|(_, set)| set.contains(&id))
            .map(|(channel, _)| channel.clone())
            .collect();
        channels.sort();
        channels
    }

    pub async fn session_count(&self) -> usize {
        self.state.lock().await.sessions.len()
    }

    pub async fn connection_count(&self) -> usize {
        self.state.lock().await.connections.len()
    }

    /// Talk channels when set, otherwise the primary channel
    async fn audio_recipients(&self, id: ConnectionId) -> Vec<Outlet> {
        let state = self.state.lock().await;
        match state.sessions.get(&id) {
            Some(session) if session.talk_channels.is_empty() => {
                state.channel_recipients(&session.channel, id)
            }
            Some(session) => state.union_recipients(&session.talk_channels, id),
            None => Vec::new(),
        }
    }

    fn roster_locked(&self, state: &RegistryState) -> Vec<ChannelSummary> {
        self.channels
            .iter()
            .map(|channel| ChannelSummary {
                id: channel.id.clone(),
                name: channel.name.clone(),
                color: channel.color.clone(),
                users: state.member_count(&channel.id),
            })
            .collect()
    }
}

/// Queue `message` on every outlet; full or closed ones are skipped
fn deliver(recipients: &[Outlet], message: Outbound) {
    for outlet in recipients {
        outlet.push(message.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_channels;
    use crate::relay::protocol::decode_server_frame;
    use serde_json::Value;

    struct Client {
        id: ConnectionId,
        outlet: Outlet,
        rx: mpsc::Receiver<Outbound>,
    }

    impl Client {
        async fn connect(registry: &ChannelRegistry) -> Self {
            let (outlet, rx) = Outlet::channel();
            let id = registry.connect(outlet.clone()).await;
            Self { id, outlet, rx }
        }

        fn drain(&mut self) -> Vec<Outbound> {
            let mut out = Vec::new();
            while let Ok(message) = self.rx.try_recv() {
                out.push(message);
            }
            out
        }

        fn events(&mut self) -> Vec<(String, Value)> {
            self.drain()
                .into_iter()
                .filter_map(|m| match m {
                    Outbound::Text(text) => decode_server_frame(&text).ok(),
                    _ => None,
                })
                .collect()
        }
    }

    fn registry() -> ChannelRegistry {
        ChannelRegistry::new(default_channels())
    }

    async fn joined(registry: &ChannelRegistry, name: &str, channel: &str, client_id: &str) -> Client {
        let mut client = Client::connect(registry).await;
        registry.join(client.id, name, channel, Some(client_id), &[]).await.unwrap();
        client.drain();
        client
    }

    #[tokio::test]
    async fn test_join_sends_roster_and_notifies_channel() {
        let registry = registry();
        let mut alice = joined(&registry, "Alice", "foh", "a").await;

        let mut bob = Client::connect(&registry).await;
        registry.join(bob.id, "Bob", "foh", Some("b"), &[]).await.unwrap();

        let bob_events = bob.events();
        assert_eq!(bob_events.len(), 1);
        let (name, roster) = &bob_events[0];
        assert_eq!(name, "channels-init");
        assert_eq!(roster.as_array().unwrap().len(), 5);
        let foh = roster.as_array().unwrap().iter().find(|c| c["id"] == "foh").unwrap();
        assert_eq!(foh["users"], 2);
        assert_eq!(foh["name"], "FOH");
        assert_eq!(foh["color"], "#2196F3");

        let alice_events = alice.events();
        assert_eq!(alice_events.len(), 1);
        assert_eq!(alice_events[0].0, "user-joined");
        assert_eq!(alice_events[0].1["name"], "Bob");
        assert_eq!(alice_events[0].1["channel"], "foh");
    }

    #[tokio::test]
    async fn test_ptt_start_reaches_channel_peers_only() {
        let registry = registry();
        let mut a = joined(&registry, "Alice", "foh", "a").await;
        let mut b = joined(&registry, "Bob", "foh", "b").await;
        let mut c = joined(&registry, "Carol", "foh", "c").await;
        let mut d = joined(&registry, "Dan", "regie", "d").await;
        a.drain();
        b.drain();

        registry.set_talking(a.id, true).await.unwrap();

        for peer in [&mut b, &mut c] {
            let events = peer.events();
            assert_eq!(events.len(), 1);
            let (name, payload) = &events[0];
            assert_eq!(name, "ptt-state");
            assert_eq!(payload["from"], "Alice");
            assert_eq!(payload["fromId"], a.id.to_string());
            assert_eq!(payload["channel"], "foh");
            assert_eq!(payload["speaking"], true);
        }
        assert!(a.drain().is_empty());
        assert!(d.drain().is_empty());
    }

    #[tokio::test]
    async fn test_reconnect_with_same_client_id_evicts_old_session() {
        let registry = registry();
        let mut first = Client::connect(&registry).await;
        registry
            .join(first.id, "Alice", "foh", Some("tablet-1"), &["plateau".to_string()])
            .await
            .unwrap();
        first.drain();

        let second = joined(&registry, "Alice (2)", "regie", "tablet-1").await;

        assert!(registry.session(first.id).await.is_none());
        assert!(registry.memberships(first.id).await.is_empty());
        assert_eq!(first.drain(), vec![Outbound::Close]);
        assert_eq!(registry.session(second.id).await.unwrap().channel, "regie");
        assert_eq!(registry.session_count().await, 1);
    }

    #[tokio::test]
    async fn test_name_identifies_client_without_client_id() {
        let registry = registry();
        let mut first = Client::connect(&registry).await;
        registry.join(first.id, "Alice", "foh", None, &[]).await.unwrap();

        let second = Client::connect(&registry).await;
        registry.join(second.id, "Alice", "foh", Some(""), &[]).await.unwrap();

        assert!(registry.session(first.id).await.is_none());
        assert!(first.drain().contains(&Outbound::Close));
        assert_eq!(registry.members("foh").await, HashSet::from([second.id]));
    }

    #[tokio::test]
    async fn test_rejoin_on_same_connection_moves_memberships() {
        let registry = registry();
        let client = Client::connect(&registry).await;
        registry
            .join(client.id, "Alice", "foh", Some("a"), &["plateau".to_string()])
            .await
            .unwrap();
        registry.join(client.id, "Alice", "regie", Some("a"), &[]).await.unwrap();

        assert_eq!(registry.memberships(client.id).await, vec!["regie".to_string()]);
    }

    #[tokio::test]
    async fn test_switch_channel_keeps_single_primary() {
        let registry = registry();
        let mut alice = joined(&registry, "Alice", "foh", "a").await;
        let mut bob = joined(&registry, "Bob", "foh", "b").await;
        let mut carol = joined(&registry, "Carol", "regie", "c").await;
        alice.drain();

        registry.switch_channel(bob.id, "regie").await.unwrap();

        assert_eq!(registry.memberships(bob.id).await, vec!["regie".to_string()]);
        assert_eq!(registry.session(bob.id).await.unwrap().channel, "regie");

        let left = alice.events();
        assert_eq!(left.len(), 1);
        assert_eq!(left[0].0, "user-left");
        assert_eq!(left[0].1["channel"], "foh");

        let arrived = carol.events();
        assert_eq!(arrived.len(), 1);
        assert_eq!(arrived[0].0, "user-joined");
        assert_eq!(arrived[0].1["name"], "Bob");
        assert!(bob.drain().is_empty());

        let roster = registry.roster().await;
        let count = |id: &str| roster.iter().find(|c| c.id == id).map(|c| c.users);
        assert_eq!(count("foh"), Some(1));
        assert_eq!(count("regie"), Some(2));
    }

    #[tokio::test]
    async fn test_switch_to_same_channel_is_noop() {
        let registry = registry();
        let mut alice = joined(&registry, "Alice", "foh", "a").await;
        let bob = joined(&registry, "Bob", "foh", "b").await;
        alice.drain();

        registry.switch_channel(bob.id, "foh").await.unwrap();
        assert!(alice.drain().is_empty());
    }

    #[tokio::test]
    async fn test_switch_without_session_is_noop() {
        let registry = registry();
        let stranger = Client::connect(&registry).await;
        registry.switch_channel(stranger.id, "foh").await.unwrap();
        assert!(registry.members("foh").await.is_empty());
    }

    #[tokio::test]
    async fn test_switch_keeps_listen_membership_of_old_channel() {
        let registry = registry();
        let director = Client::connect(&registry).await;
        registry
            .join(director.id, "Director", "general", Some("dir"), &["foh".to_string()])
            .await
            .unwrap();

        registry.switch_channel(director.id, "foh").await.unwrap();
        registry.switch_channel(director.id, "regie").await.unwrap();

        // foh is still a listen channel
        assert_eq!(
            registry.memberships(director.id).await,
            vec!["foh".to_string(), "regie".to_string()]
        );
    }

    #[tokio::test]
    async fn test_audio_stays_in_channel_and_reaches_listeners() {
        let registry = registry();
        let mut talker = joined(&registry, "Alice", "foh", "a").await;
        let mut peer = joined(&registry, "Bob", "foh", "b").await;
        let mut other = joined(&registry, "Carol", "plateau", "c").await;
        let mut director = Client::connect(&registry).await;
        registry
            .join(director.id, "Director", "general", Some("dir"), &["foh".to_string()])
            .await
            .unwrap();
        talker.drain();
        peer.drain();
        director.drain();

        let frame = Bytes::from_static(&[1, 2, 3, 4]);
        registry.relay_audio(talker.id, frame.clone()).await;
        registry.relay_text(talker.id, r#"42["audio-chunk",{"chunk":"AQID"}]"#).await;

        for receiver in [&mut peer, &mut director] {
            assert_eq!(
                receiver.drain(),
                vec![
                    Outbound::Binary(frame.clone()),
                    Outbound::Text(r#"42["audio-chunk",{"chunk":"AQID"}]"#.to_string()),
                ]
            );
        }
        assert!(talker.drain().is_empty());
        assert!(other.drain().is_empty());
    }

    #[tokio::test]
    async fn test_audio_before_join_is_dropped() {
        let registry = registry();
        let mut member = joined(&registry, "Alice", "foh", "a").await;
        let stranger = Client::connect(&registry).await;

        registry.relay_audio(stranger.id, Bytes::from_static(b"xx")).await;
        registry.set_talking(stranger.id, true).await.unwrap();
        assert!(member.drain().is_empty());
    }

    #[tokio::test]
    async fn test_ring_all_crosses_channels() {
        let registry = registry();
        let mut caller = joined(&registry, "Alice", "foh", "a").await;
        let mut b = joined(&registry, "Bob", "regie", "b").await;
        let mut c = joined(&registry, "Carol", "plateau", "c").await;
        let mut lurker = Client::connect(&registry).await;
        caller.drain();

        registry.ring_all(caller.id).await.unwrap();

        for peer in [&mut b, &mut c] {
            let events = peer.events();
            assert_eq!(events.len(), 1);
            assert_eq!(events[0].0, "call-ring");
            assert_eq!(events[0].1["from"], "Alice");
            assert_eq!(events[0].1["channel"], "foh");
        }
        assert!(caller.drain().is_empty());
        assert!(lurker.drain().is_empty());
    }

    #[tokio::test]
    async fn test_update_listen_channels() {
        let registry = registry();
        let director = joined(&registry, "Director", "general", "dir").await;

        registry
            .update_listen_channels(director.id, &["foh".to_string(), "general".to_string()])
            .await;
        assert_eq!(
            registry.memberships(director.id).await,
            vec!["foh".to_string(), "general".to_string()]
        );

        registry.update_listen_channels(director.id, &["regie".to_string()]).await;
        assert_eq!(
            registry.memberships(director.id).await,
            vec!["general".to_string(), "regie".to_string()]
        );
    }

    #[tokio::test]
    async fn test_leave_notifies_primary_channel() {
        let registry = registry();
        let mut alice = joined(&registry, "Alice", "foh", "a").await;
        let bob = joined(&registry, "Bob", "foh", "b").await;
        let mut carol = joined(&registry, "Carol", "regie", "c").await;
        alice.drain();

        registry.leave(bob.id).await;

        let events = alice.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].0, "user-left");
        assert_eq!(events[0].1["name"], "Bob");
        assert!(carol.drain().is_empty());
        assert!(registry.memberships(bob.id).await.is_empty());
        assert_eq!(registry.connection_count().await, 2);

        // Second leave is harmless
        registry.leave(bob.id).await;
    }

    #[tokio::test]
    async fn test_roster_counts_match_member_sets() {
        let registry = registry();
        joined(&registry, "A", "foh", "a").await;
        joined(&registry, "B", "foh", "b").await;
        let director = Client::connect(&registry).await;
        registry
            .join(director.id, "D", "regie", Some("d"), &["foh".to_string()])
            .await
            .unwrap();

        for entry in registry.roster().await {
            assert_eq!(entry.users, registry.members(&entry.id).await.len(), "{}", entry.id);
        }

        let detailed = registry.roster_with_members().await;
        let foh = detailed.iter().find(|c| c.id == "foh").unwrap();
        assert_eq!(foh.members, vec!["A".to_string(), "B".to_string(), "D".to_string()]);
    }

    #[tokio::test]
    async fn test_close_all() {
        let registry = registry();
        let mut a = joined(&registry, "A", "foh", "a").await;
        let mut b = Client::connect(&registry).await;

        registry.close_all().await;

        assert_eq!(a.drain(), vec![Outbound::Close]);
        assert_eq!(b.drain(), vec![Outbound::Close]);
        assert_eq!(registry.session_count().await, 0);
        assert_eq!(registry.connection_count().await, 0);
    }

    #[tokio::test]
    async fn test_stalled_recipient_queue_is_capped() {
        let registry = registry();
        let talker = joined(&registry, "Alice", "foh", "a").await;
        let mut stalled = joined(&registry, "Bob", "foh", "b").await;
        let mut reader = joined(&registry, "Carol", "foh", "c").await;

        for _ in 0..OUTBOUND_QUEUE * 4 {
            registry.relay_audio(talker.id, Bytes::from_static(&[0; 1024])).await;
            reader.drain();
        }

        assert_eq!(stalled.drain().len(), OUTBOUND_QUEUE);

        // Once drained the recipient receives again
        registry.relay_audio(talker.id, Bytes::from_static(b"next")).await;
        assert_eq!(stalled.drain(), vec![Outbound::Binary(Bytes::from_static(b"next"))]);
    }

    #[tokio::test]
    async fn test_close_reaches_a_full_queue() {
        let registry = registry();
        let talker = joined(&registry, "Alice", "foh", "a").await;
        let stalled = joined(&registry, "Bob", "foh", "b").await;
        for _ in 0..OUTBOUND_QUEUE + 1 {
            registry.relay_audio(talker.id, Bytes::from_static(b"x")).await;
        }

        registry.close_all().await;
        assert!(stalled.outlet.is_closed());
    }

    #[tokio::test]
    async fn test_evicted_connection_cannot_rejoin() {
        let registry = registry();
        let mut old = joined(&registry, "Alice", "foh", "tablet-1").await;
        let new = joined(&registry, "Alice", "foh", "tablet-1").await;

        assert!(old.outlet.is_closed());
        assert_eq!(old.drain(), vec![Outbound::Close]);
        assert_eq!(registry.connection_count().await, 1);

        // A late join on the stale socket must not evict the new session
        registry.join(old.id, "Alice", "foh", Some("tablet-1"), &[]).await.unwrap();
        assert!(registry.session(old.id).await.is_none());
        assert_eq!(registry.members("foh").await, HashSet::from([new.id]));
        assert!(!new.outlet.is_closed());
    }

    #[tokio::test]
    async fn test_talk_channels_route_audio() {
        let registry = registry();
        let director = joined(&registry, "Director", "general", "dir").await;
        let mut foh = joined(&registry, "Sound", "foh", "s").await;
        let mut stage = joined(&registry, "Stage", "plateau", "p").await;
        let mut general = joined(&registry, "Crew", "general", "g").await;
        let mut both = Client::connect(&registry).await;
        registry
            .join(both.id, "Light", "foh", Some("l"), &["plateau".to_string()])
            .await
            .unwrap();
        foh.drain();
        stage.drain();
        general.drain();
        both.drain();

        registry
            .update_talk_channels(director.id, &["foh".to_string(), "plateau".to_string(), "foh".to_string()])
            .await;
        assert_eq!(
            registry.session(director.id).await.unwrap().talk_channels,
            vec!["foh".to_string(), "plateau".to_string()]
        );

        let frame = Bytes::from_static(&[7, 7]);
        registry.relay_audio(director.id, frame.clone()).await;

        assert_eq!(foh.drain(), vec![Outbound::Binary(frame.clone())]);
        assert_eq!(stage.drain(), vec![Outbound::Binary(frame.clone())]);
        // Member of both talk channels hears it once
        assert_eq!(both.drain(), vec![Outbound::Binary(frame.clone())]);
        assert!(general.drain().is_empty());

        // Empty list falls back to the primary channel
        registry.update_talk_channels(director.id, &[]).await;
        registry.relay_text(director.id, r#"42["audio-chunk",{}]"#).await;
        assert_eq!(general.drain(), vec![Outbound::Text(r#"42["audio-chunk",{}]"#.to_string())]);
        assert!(foh.drain().is_empty());
    }

    #[tokio::test]
    async fn test_rejoin_resets_talk_channels() {
        let registry = registry();
        let director = joined(&registry, "Director", "general", "dir").await;
        registry.update_talk_channels(director.id, &["foh".to_string()]).await;

        registry.join(director.id, "Director", "regie", Some("dir"), &[]).await.unwrap();
        assert!(registry.session(director.id).await.unwrap().talk_channels.is_empty());
    }
}
