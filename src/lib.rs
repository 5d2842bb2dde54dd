//! # Lyrebird
//!
//! Lyrebird is a client-side voice system for Discord, written in Rust. On
//! top of a parent gateway client (which owns the main websocket and user
//! cache), the library:
//!
//! * joins voice channels through the two-event gateway handshake;
//! * negotiates media sessions on the voice gateway (v4): Identify, Hello,
//!   Ready, Select Protocol, Session Description, with heartbeats and a
//!   Resume/Restart reconnection state machine;
//! * streams 48 kHz stereo PCM sources as Opus over encrypted RTP/UDP, with
//!   paced transmission and IP discovery for NAT traversal;
//! * fans one audio source out to any number of joined channels under a
//!   single playback lock.
//!
//! The parent gateway is reached through [`GatewayHandle`]; voice activity
//! happens inside a [`Voice`] scope, which guarantees that every joined
//! guild is left cleanly when the scope ends.

pub mod constants;
mod broadcast;
pub mod driver;
pub mod error;
pub mod gateway;
pub mod id;
mod info;
pub mod input;
mod manager;
pub mod model;
mod ws;

pub use audiopus as opus;
pub use discortp as packet;

pub use crate::driver::{IpDiscovery, SessionInfo, UdpItem, WsItem};
pub use crate::error::{JoinError, JoinResult, PlayError};
pub use crate::gateway::{GatewayEvent, GatewayHandle};
pub use crate::id::{ChannelId, GuildId, UserId};
pub use crate::info::ConnectionInfo;
pub use crate::input::OpusStream;
pub use crate::manager::{Config, Voice};
