//! Liaison to the parent Discord gateway client.
//!
//! The parent gateway is an external collaborator: it owns the main
//! websocket, its event stream, and the user cache. This module wraps the
//! two primitives the voice system needs from it (an independently
//! duplicable view of the event stream, and the op-4 Update Voice State
//! command) without holding any state of its own.

use crate::error::{JoinError, JoinResult};
use crate::id::{ChannelId, GuildId, UserId};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tracing::warn;

/// Events from the parent gateway which the voice system consumes.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum GatewayEvent {
    /// The parent gateway completed a fresh identify.
    ///
    /// Voice sessions negotiated before this point are stale and must
    /// resume.
    Ready,
    /// The gateway acknowledged a voice state change for some user.
    VoiceStateUpdate(VoiceStateUpdate),
    /// The gateway allocated (or moved) the guild's voice server.
    VoiceServerUpdate(VoiceServerUpdate),
    /// A dispatch this library has no interest in.
    Unknown {
        name: String,
        raw: Value,
    },
}

impl GatewayEvent {
    /// Classifies a named gateway dispatch into the variants the voice
    /// system cares about, falling back to [`GatewayEvent::Unknown`].
    pub fn from_raw(name: &str, raw: Value) -> Self {
        match name {
            "READY" => GatewayEvent::Ready,
            "VOICE_STATE_UPDATE" => match serde_json::from_value(raw.clone()) {
                Ok(update) => GatewayEvent::VoiceStateUpdate(update),
                Err(why) => {
                    warn!("Malformed VOICE_STATE_UPDATE: {:?}.", why);
                    GatewayEvent::Unknown {
                        name: name.into(),
                        raw,
                    }
                },
            },
            "VOICE_SERVER_UPDATE" => match serde_json::from_value(raw.clone()) {
                Ok(update) => GatewayEvent::VoiceServerUpdate(update),
                Err(why) => {
                    warn!("Malformed VOICE_SERVER_UPDATE: {:?}.", why);
                    GatewayEvent::Unknown {
                        name: name.into(),
                        raw,
                    }
                },
            },
            _ => GatewayEvent::Unknown {
                name: name.into(),
                raw,
            },
        }
    }
}

/// Body of a `VOICE_STATE_UPDATE` dispatch.
#[derive(Clone, Debug, Deserialize)]
pub struct VoiceStateUpdate {
    /// Guild whose voice state changed, absent for direct calls.
    #[serde(default)]
    pub guild_id: Option<GuildId>,
    /// Channel the user now occupies; `None` on disconnect.
    #[serde(default)]
    pub channel_id: Option<ChannelId>,
    /// The user whose state changed.
    pub user_id: UserId,
    /// Session handle to present to the voice gateway during Identify.
    pub session_id: String,
}

/// Body of a `VOICE_SERVER_UPDATE` dispatch.
#[derive(Clone, Debug, Deserialize)]
pub struct VoiceServerUpdate {
    /// Ephemeral token to present to the voice gateway during Identify.
    pub token: String,
    /// Guild the allocation belongs to.
    pub guild_id: GuildId,
    /// Hostname (and port) of the allocated voice gateway.
    ///
    /// `None` while the guild's voice server is being reallocated; no
    /// session can be opened until a later update names one.
    #[serde(default)]
    pub endpoint: Option<String>,
}

/// Handle onto the parent gateway.
#[derive(Clone, Debug)]
pub struct GatewayHandle {
    events: broadcast::Sender<GatewayEvent>,
    commands: flume::Sender<Value>,
    user_id: UserId,
}

impl GatewayHandle {
    /// Wraps the parent gateway's event broadcaster and command sink.
    ///
    /// `user_id` is the bot's own id, read from the parent's cache.
    pub fn new(
        events: broadcast::Sender<GatewayEvent>,
        commands: flume::Sender<Value>,
        user_id: UserId,
    ) -> Self {
        Self {
            events,
            commands,
            user_id,
        }
    }

    /// Returns an independent view of the gateway event stream.
    pub fn subscribe(&self) -> broadcast::Receiver<GatewayEvent> {
        self.events.subscribe()
    }

    /// The bot's own user id.
    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    /// Posts an op-4 Update Voice State command to the gateway.
    ///
    /// `channel_id: None` disconnects from voice within the guild.
    pub async fn update_voice_state(
        &self,
        guild_id: GuildId,
        channel_id: Option<ChannelId>,
    ) -> JoinResult<()> {
        let map = json!({
            "op": 4,
            "d": {
                "channel_id": channel_id.map(|c| c.0),
                "guild_id": guild_id.0,
                "self_deaf": false,
                "self_mute": false,
            }
        });

        self.commands
            .send_async(map)
            .await
            .map_err(|_| JoinError::NoSender)
    }
}
