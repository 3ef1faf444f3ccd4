//! Frame dispatch
//!
//! Turns inbound frames of one connection into registry operations. Nothing
//! here may fail the connection: bad frames are logged and dropped.

use bytes::Bytes;

use super::protocol::{decode_frame, ClientEvent, Frame, PONG};
use super::registry::{ChannelRegistry, ConnectionId};
use crate::error::Result;

/// Handle one text frame. Returns a reply for the sender, if any.
pub async fn handle_text(registry: &ChannelRegistry, id: ConnectionId, text: &str) -> Option<String> {
    match decode_frame(text) {
        Ok(Frame::Ping) => return Some(PONG.to_string()),
        Ok(Frame::Pong) | Ok(Frame::Ignored) => {}
        Ok(Frame::Event(event)) => {
            if let Err(e) = dispatch(registry, id, event, text).await {
                tracing::warn!("Event from {} failed: {}", id, e);
            }
        }
        Err(e) => tracing::debug!("Dropping frame from {}: {}", id, e),
    }
    None
}

/// Binary frames are always audio
pub async fn handle_binary(registry: &ChannelRegistry, id: ConnectionId, frame: Bytes) {
    registry.relay_audio(id, frame).await;
}

async fn dispatch(registry: &ChannelRegistry, id: ConnectionId, event: ClientEvent, raw: &str) -> Result<()> {
    match event {
        ClientEvent::Join(join) => {
            let listen = join.listen_channels.unwrap_or_default();
            registry
                .join(id, &join.name, &join.channel, join.client_id.as_deref(), &listen)
                .await?;
            if let Some(talk) = join.talk_channels {
                registry.update_talk_channels(id, &talk).await;
            }
        }
        ClientEvent::SwitchChannel { channel } => registry.switch_channel(id, &channel).await?,
        ClientEvent::PttStart => registry.set_talking(id, true).await?,
        ClientEvent::PttStop => registry.set_talking(id, false).await?,
        ClientEvent::AudioChunk => registry.relay_text(id, raw).await,
        ClientEvent::CallRing => registry.ring_all(id).await?,
        ClientEvent::UpdateListenChannels { listen_channels } => {
            registry.update_listen_channels(id, &listen_channels).await
        }
        ClientEvent::UpdateTalkChannels { talk_channels } => {
            registry.update_talk_channels(id, &talk_channels).await
        }
        ClientEvent::Unknown(name) => tracing::debug!("Ignoring unknown event {:?} from {}", name, id),
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::default_channels;
    use crate::relay::registry::{Outbound, Outlet};
    use tokio::sync::mpsc;

    async fn connect(registry: &ChannelRegistry) -> (ConnectionId, mpsc::Receiver<Outbound>) {
        let (outlet, rx) = Outlet::channel();
        (registry.connect(outlet).await, rx)
    }

    #[tokio::test]
    async fn test_ping_is_answered() {
        let registry = ChannelRegistry::new(default_channels());
        let (id, _rx) = connect(&registry).await;
        assert_eq!(handle_text(&registry, id, "2").await.as_deref(), Some("3"));
        assert_eq!(handle_text(&registry, id, "3").await, None);
    }

    #[tokio::test]
    async fn test_join_then_audio_chunk_text_relayed_verbatim() {
        let registry = ChannelRegistry::new(default_channels());
        let (a, _a_rx) = connect(&registry).await;
        let (b, mut b_rx) = connect(&registry).await;

        handle_text(&registry, a, r#"42["join",{"name":"A","channel":"foh","clientId":"a"}]"#).await;
        handle_text(&registry, b, r#"42["join",{"name":"B","channel":"foh","clientId":"b"}]"#).await;
        while b_rx.try_recv().is_ok() {}

        let chunk = r#"42["audio-chunk",{"chunk":"AAECAw==","_b64":true}]"#;
        assert_eq!(handle_text(&registry, a, chunk).await, None);
        assert_eq!(b_rx.try_recv().unwrap(), Outbound::Text(chunk.to_string()));
    }

    #[tokio::test]
    async fn test_garbage_never_breaks_the_connection() {
        let registry = ChannelRegistry::new(default_channels());
        let (id, _rx) = connect(&registry).await;

        for text in ["42[", r#"42["join",{}]"#, r#"42["dance"]"#, "40", "", r#"42[{"a":1}]"#] {
            assert_eq!(handle_text(&registry, id, text).await, None);
        }

        handle_text(&registry, id, r#"["join",{"name":"A","channel":"foh"}]"#).await;
        assert_eq!(registry.session(id).await.unwrap().channel, "foh");
    }

    #[tokio::test]
    async fn test_switch_and_listen_events() {
        let registry = ChannelRegistry::new(default_channels());
        let (id, _rx) = connect(&registry).await;

        handle_text(&registry, id, r#"42["join",{"name":"A","channel":"foh","listenChannels":["regie"]}]"#).await;
        handle_text(&registry, id, r#"42["switch-channel",{"channel":"plateau"}]"#).await;
        handle_text(&registry, id, r#"42["update-listen-channels",{"listenChannels":["lumiere"]}]"#).await;

        assert_eq!(
            registry.memberships(id).await,
            vec!["lumiere".to_string(), "plateau".to_string()]
        );
    }

    #[tokio::test]
    async fn test_director_talk_channels() {
        let registry = ChannelRegistry::new(default_channels());
        let (director, _rx) = connect(&registry).await;
        let (sound, mut sound_rx) = connect(&registry).await;
        let (crew, mut crew_rx) = connect(&registry).await;

        handle_text(&registry, sound, r#"42["join",{"name":"S","channel":"foh"}]"#).await;
        handle_text(&registry, crew, r#"42["join",{"name":"C","channel":"general"}]"#).await;
        handle_text(
            &registry,
            director,
            r#"42["join",{"name":"D","channel":"general","talkChannels":["foh"]}]"#,
        )
        .await;
        while sound_rx.try_recv().is_ok() {}
        while crew_rx.try_recv().is_ok() {}

        let chunk = r#"42["audio-chunk",{"chunk":"AQ=="}]"#;
        handle_text(&registry, director, chunk).await;
        assert_eq!(sound_rx.try_recv().unwrap(), Outbound::Text(chunk.to_string()));
        assert!(crew_rx.try_recv().is_err());

        handle_text(&registry, director, r#"42["update-talk-channels",{"talkChannels":[]}]"#).await;
        handle_text(&registry, director, chunk).await;
        assert_eq!(crew_rx.try_recv().unwrap(), Outbound::Text(chunk.to_string()));
        assert!(sound_rx.try_recv().is_err());
    }
}
