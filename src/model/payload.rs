//! Bodies of the voice gateway's `{op, d}` messages.
//!
//! Field names and value shapes are dictated by the wire protocol; fields
//! are declared in the order Discord's documentation lists them.

use bitflags::bitflags;
use serde::de::Deserializer;
use serde::ser::Serializer;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

use crate::id::{snowflake, GuildId, UserId};

/// Opens a brand-new voice session (opcode 0).
///
/// Carries the credentials handed out by the parent gateway's
/// `VOICE_STATE_UPDATE` (session) and `VOICE_SERVER_UPDATE` (token) answers.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Identify {
    /// Guild owning the voice channel being joined.
    pub server_id: GuildId,
    /// The connecting bot's own user ID.
    pub user_id: UserId,
    /// Session handle from the parent gateway.
    pub session_id: String,
    /// Ephemeral token from the parent gateway.
    pub token: String,
}

/// Picks the media transport and encryption mode (opcode 1).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SelectProtocol {
    /// Always `"udp"` for this library.
    pub protocol: String,
    /// Where and how the server should expect our media.
    pub data: ProtocolData,
}

/// The `data` half of [`SelectProtocol`]: our externally visible socket
/// address (learned through IP discovery) and the chosen encryption mode.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct ProtocolData {
    /// Our address as the voice server saw the discovery packet.
    pub address: IpAddr,
    /// Our UDP source port, likewise as seen by the server.
    pub port: u16,
    /// One of the modes the server offered in [`Ready`].
    pub mode: String,
}

/// The server's half of session setup (opcode 2): where to send RTP, under
/// which synchronisation source, and the encryption modes on offer.
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Ready {
    /// RTP synchronisation source assigned to this client.
    pub ssrc: u32,
    /// Address of the RTP server handling this call.
    pub ip: IpAddr,
    /// UDP port of the RTP server.
    pub port: u16,
    /// Encryption modes the server is willing to negotiate.
    pub modes: Vec<String>,
}

/// Connection liveness probe (opcode 3).
///
/// This client stamps outgoing heartbeats with epoch seconds; whatever
/// nonce arrives must be echoed back unchanged in the matching ack.
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Heartbeat {
    #[serde(with = "snowflake")]
    pub nonce: u64,
}

/// Delivers the session's secret key once the transport is agreed
/// (opcode 4).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct SessionDescription {
    /// The encryption mode the server settled on.
    pub mode: String,
    /// 32-byte key for sealing RTP payloads.
    pub secret_key: Vec<u8>,
}

/// Announces a speaker, ours or somebody else's (opcode 5).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Speaking {
    /// What kind of audio the speaker is sending, as a bitfield; all flags
    /// clear means silence.
    pub speaking: SpeakingState,
    /// Of unclear purpose; clients are advised to send `Some(0)`.
    pub delay: Option<u32>,
    /// RTP synchronisation source the audio will arrive under.
    pub ssrc: u32,
    /// Which user is speaking. Present on server-sent frames only.
    pub user_id: Option<UserId>,
}

/// Answer to a [`Heartbeat`], echoing its nonce (opcode 6).
#[derive(Clone, Copy, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
#[serde(transparent)]
pub struct HeartbeatAck {
    #[serde(with = "snowflake")]
    pub nonce: u64,
}

/// Re-enters an interrupted session without a fresh Identify (opcode 7).
#[derive(Clone, Debug, Deserialize, Eq, Hash, PartialEq, Serialize)]
pub struct Resume {
    /// Guild owning the voice channel.
    pub server_id: GuildId,
    /// Session handle of the connection being resumed.
    pub session_id: String,
    /// Token of the connection being resumed.
    pub token: String,
}

/// Tells the client how often to heartbeat (opcode 8).
#[derive(Clone, Copy, Debug, Deserialize, Serialize)]
pub struct Hello {
    /// Milliseconds between client heartbeats.
    pub heartbeat_interval: f64,
}

bitflags! {
    /// How a user is transmitting audio.
    ///
    /// Wire format is the raw bit pattern in a JSON number.
    pub struct SpeakingState: u8 {
        /// Ordinary voice audio.
        const MICROPHONE = 1;
        /// Audio accompanying a video share; draws no speaking indicator.
        const SOUNDSHARE = 1 << 1;
        /// Priority speaker, ducking everyone else.
        const PRIORITY = 1 << 2;
    }
}

impl Serialize for SpeakingState {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        self.bits().serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SpeakingState {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        // Unknown bits from newer API revisions are dropped, not an error.
        let bits = u8::deserialize(deserializer)?;

        Ok(SpeakingState::from_bits_truncate(bits))
    }
}
