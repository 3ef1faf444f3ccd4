//! Relay wire protocol
//!
//! Text frames carry a short envelope in front of a JSON array
//! `["event-name", {payload}]`:
//!
//! - `"2"` liveness probe, answered with `"3"`
//! - `"3"` liveness reply, ignored
//! - `"42[...]"`, `"4[...]"` or a bare `"[...]"` application event
//!
//! Outbound events are always written as `"42"` followed by the JSON array.
//! Binary frames carry audio and have no envelope.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{Error, Result};

/// Liveness probe
pub const PING: &str = "2";

/// Liveness reply
pub const PONG: &str = "3";

/// Prefix of every outbound event frame
pub const EVENT_PREFIX: &str = "42";

/// A decoded inbound text frame
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ping,
    Pong,
    Event(ClientEvent),
    /// Envelope we do not act on (handshake and upgrade probes)
    Ignored,
}

/// `join` payload
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinPayload {
    pub name: String,
    pub channel: String,
    #[serde(default)]
    pub client_id: Option<String>,
    #[serde(default)]
    pub listen_channels: Option<Vec<String>>,
    #[serde(default)]
    pub talk_channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
struct SwitchPayload {
    channel: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListenPayload {
    #[serde(default)]
    listen_channels: Option<Vec<String>>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TalkPayload {
    #[serde(default)]
    talk_channels: Option<Vec<String>>,
}

/// Events a client may send
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientEvent {
    Join(JoinPayload),
    SwitchChannel { channel: String },
    PttStart,
    PttStop,
    /// Relayed verbatim as the original text frame
    AudioChunk,
    CallRing,
    UpdateListenChannels { listen_channels: Vec<String> },
    /// Director mode: audio goes to these channels instead of the primary
    UpdateTalkChannels { talk_channels: Vec<String> },
    /// Unrecognized event name
    Unknown(String),
}

impl ClientEvent {
    fn from_parts(name: &str, payload: Value) -> Result<Self> {
        let event = match name {
            "join" => ClientEvent::Join(from_payload(name, payload)?),
            "switch-channel" => {
                let SwitchPayload { channel } = from_payload(name, payload)?;
                ClientEvent::SwitchChannel { channel }
            }
            "ptt-start" => ClientEvent::PttStart,
            "ptt-stop" => ClientEvent::PttStop,
            "audio-chunk" => ClientEvent::AudioChunk,
            "call-ring" => ClientEvent::CallRing,
            "update-listen-channels" => {
                let ListenPayload { listen_channels } = from_payload(name, payload)?;
                ClientEvent::UpdateListenChannels {
                    listen_channels: listen_channels.unwrap_or_default(),
                }
            }
            "update-talk-channels" => {
                let TalkPayload { talk_channels } = from_payload(name, payload)?;
                ClientEvent::UpdateTalkChannels {
                    talk_channels: talk_channels.unwrap_or_default(),
                }
            }
            other => ClientEvent::Unknown(other.to_string()),
        };
        Ok(event)
    }
}

fn from_payload<T: serde::de::DeserializeOwned>(event: &str, payload: Value) -> Result<T> {
    serde_json::from_value(payload)
        .map_err(|e| Error::Protocol(format!("invalid {} payload: {}", event, e)))
}

/// Decode one inbound text frame
pub fn decode_frame(text: &str) -> Result<Frame> {
    match text {
        PING => return Ok(Frame::Ping),
        PONG => return Ok(Frame::Pong),
        _ => {}
    }

    let body = text
        .strip_prefix(EVENT_PREFIX)
        .or_else(|| text.strip_prefix('4'))
        .unwrap_or(text);
    if !body.starts_with('[') {
        return Ok(Frame::Ignored);
    }

    let items: Vec<Value> = serde_json::from_str(body)
        .map_err(|e| Error::Protocol(format!("event frame is not a JSON array: {}", e)))?;
    let mut items = items.into_iter();

    let name = match items.next() {
        Some(Value::String(name)) => name,
        _ => return Err(Error::Protocol("event frame has no event name".into())),
    };
    let payload = items.next().unwrap_or(Value::Null);

    Ok(Frame::Event(ClientEvent::from_parts(&name, payload)?))
}

/// Roster entry sent in `channels-init`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSummary {
    pub id: String,
    pub name: String,
    pub color: String,
    /// Live member count
    pub users: usize,
}

/// `user-joined` / `user-left` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Presence {
    pub name: String,
    pub channel: String,
}

/// `ptt-state` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PttState {
    pub from: String,
    pub from_id: String,
    pub channel: String,
    pub speaking: bool,
}

/// `call-ring` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallRing {
    pub from: String,
    pub from_id: String,
    pub channel: String,
}

/// Events the relay sends to clients
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    ChannelsInit(Vec<ChannelSummary>),
    UserJoined(Presence),
    UserLeft(Presence),
    PttState(PttState),
    CallRing(CallRing),
}

impl ServerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ServerEvent::ChannelsInit(_) => "channels-init",
            ServerEvent::UserJoined(_) => "user-joined",
            ServerEvent::UserLeft(_) => "user-left",
            ServerEvent::PttState(_) => "ptt-state",
            ServerEvent::CallRing(_) => "call-ring",
        }
    }

    /// Encode as an outbound text frame
    pub fn encode(&self) -> Result<String> {
        let name = self.name();
        let array = match self {
            ServerEvent::ChannelsInit(roster) => serde_json::to_string(&(name, roster))?,
            ServerEvent::UserJoined(presence) | ServerEvent::UserLeft(presence) => {
                serde_json::to_string(&(name, presence))?
            }
            ServerEvent::PttState(state) => serde_json::to_string(&(name, state))?,
            ServerEvent::CallRing(ring) => serde_json::to_string(&(name, ring))?,
        };
        Ok(format!("{}{}", EVENT_PREFIX, array))
    }
}

/// Split an outbound frame into event name and payload
pub fn decode_server_frame(text: &str) -> Result<(String, Value)> {
    let body = text
        .strip_prefix(EVENT_PREFIX)
        .ok_or_else(|| Error::Protocol(format!("not an event frame: {:?}", text)))?;
    let (name, payload): (String, Value) = serde_json::from_str(body)?;
    Ok((name, payload))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(text: &str) -> ClientEvent {
        match decode_frame(text).unwrap() {
            Frame::Event(event) => event,
            other => panic!("expected event, got {:?}", other),
        }
    }

    #[test]
    fn test_liveness_frames() {
        assert_eq!(decode_frame("2").unwrap(), Frame::Ping);
        assert_eq!(decode_frame("3").unwrap(), Frame::Pong);
    }

    #[test]
    fn test_all_event_envelopes() {
        for text in [
            r#"42["ptt-start"]"#,
            r#"4["ptt-start"]"#,
            r#"["ptt-start"]"#,
        ] {
            assert_eq!(event(text), ClientEvent::PttStart, "{}", text);
        }
    }

    #[test]
    fn test_event_starting_with_two_is_not_a_ping() {
        assert_eq!(event(r#"42["ptt-stop",{}]"#), ClientEvent::PttStop);
    }

    #[test]
    fn test_decode_join() {
        let join = event(
            r#"42["join",{"name":"Alice","channel":"foh","clientId":"c-1","listenChannels":["plateau","foh"],"talkChannels":["foh","regie"]}]"#,
        );
        assert_eq!(
            join,
            ClientEvent::Join(JoinPayload {
                name: "Alice".into(),
                channel: "foh".into(),
                client_id: Some("c-1".into()),
                listen_channels: Some(vec!["plateau".into(), "foh".into()]),
                talk_channels: Some(vec!["foh".into(), "regie".into()]),
            })
        );

        let minimal = event(r#"42["join",{"name":"Bob","channel":"general","clientId":null}]"#);
        let ClientEvent::Join(payload) = minimal else { panic!("not a join") };
        assert_eq!(payload.client_id, None);
        assert_eq!(payload.listen_channels, None);
        assert_eq!(payload.talk_channels, None);
    }

    #[test]
    fn test_decode_other_events() {
        assert_eq!(
            event(r#"42["switch-channel",{"channel":"regie"}]"#),
            ClientEvent::SwitchChannel { channel: "regie".into() }
        );
        assert_eq!(event(r#"42["call-ring"]"#), ClientEvent::CallRing);
        assert_eq!(
            event(r#"42["audio-chunk",{"chunk":"AAAA","_b64":true}]"#),
            ClientEvent::AudioChunk
        );
        assert_eq!(
            event(r#"42["update-listen-channels",{"listenChannels":["foh"]}]"#),
            ClientEvent::UpdateListenChannels { listen_channels: vec!["foh".into()] }
        );
        assert_eq!(
            event(r#"42["update-talk-channels",{"talkChannels":["foh","plateau"]}]"#),
            ClientEvent::UpdateTalkChannels { talk_channels: vec!["foh".into(), "plateau".into()] }
        );
        assert_eq!(
            event(r#"42["update-talk-channels",{}]"#),
            ClientEvent::UpdateTalkChannels { talk_channels: vec![] }
        );
        assert_eq!(event(r#"42["typing",{}]"#), ClientEvent::Unknown("typing".into()));
    }

    #[test]
    fn test_malformed_frames_are_errors_not_panics() {
        for text in [
            r#"42["join",{"name":"NoChannel"}]"#,
            r#"42["switch-channel"]"#,
            r#"42[1,2]"#,
            r#"42[]"#,
            r#"42[broken"#,
        ] {
            assert!(matches!(decode_frame(text), Err(Error::Protocol(_))), "{}", text);
        }
    }

    #[test]
    fn test_non_event_envelopes_ignored() {
        assert_eq!(decode_frame("40").unwrap(), Frame::Ignored);
        assert_eq!(decode_frame(r#"0{"sid":"x"}"#).unwrap(), Frame::Ignored);
        assert_eq!(decode_frame("hello").unwrap(), Frame::Ignored);
        assert_eq!(decode_frame("").unwrap(), Frame::Ignored);
    }

    #[test]
    fn test_encode_server_events() {
        let ptt = ServerEvent::PttState(PttState {
            from: "Alice".into(),
            from_id: "abc".into(),
            channel: "foh".into(),
            speaking: true,
        });
        assert_eq!(
            ptt.encode().unwrap(),
            r#"42["ptt-state",{"from":"Alice","fromId":"abc","channel":"foh","speaking":true}]"#
        );

        let left = ServerEvent::UserLeft(Presence { name: "Bob".into(), channel: "regie".into() });
        assert_eq!(left.encode().unwrap(), r#"42["user-left",{"name":"Bob","channel":"regie"}]"#);

        let init = ServerEvent::ChannelsInit(vec![ChannelSummary {
            id: "foh".into(),
            name: "FOH".into(),
            color: "#2196F3".into(),
            users: 2,
        }]);
        let (name, payload) = decode_server_frame(&init.encode().unwrap()).unwrap();
        assert_eq!(name, "channels-init");
        assert_eq!(payload[0]["users"], 2);
    }
}
