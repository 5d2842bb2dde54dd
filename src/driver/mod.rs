//! Per-session machinery: the session descriptor and the tasks behind it.

pub(crate) mod connection;
pub mod error;
pub(crate) mod tasks;

pub use self::tasks::message::{IpDiscovery, UdpItem, WsItem};

use self::tasks::message::{UdpEndpoint, WsEndpoint};
use self::tasks::{TaskGuard, WsLaunch};
use crate::constants::*;
use crate::gateway::GatewayHandle;
use crate::id::{ChannelId, GuildId};
use crate::info::ConnectionInfo;

/// A live voice session: one negotiated websocket plus its UDP transport.
///
/// The descriptor owns the websocket task; dropping it aborts that task,
/// which in turn tears down the heartbeat generator, sender, watchdog, and
/// UDP transport.
pub(crate) struct Session {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    /// Synchronisation source assigned by the server. Set exactly once, at
    /// the first completed handshake.
    pub ssrc: u32,
    pub ws: WsEndpoint,
    pub udp: UdpEndpoint,
    _task: TaskGuard,
}

/// A read-only snapshot of a session's identity.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct SessionInfo {
    pub guild_id: GuildId,
    pub channel_id: ChannelId,
    pub ssrc: u32,
}

impl Session {
    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            guild_id: self.guild_id,
            channel_id: self.channel_id,
            ssrc: self.ssrc,
        }
    }
}

/// Allocates a session's channels and spawns its websocket task.
///
/// Returns the rendezvous on which the task reports the session's ssrc once
/// the handshake reaches Session Description; the rendezvous is dropped
/// unfilled if the handshake fails.
pub(crate) fn launch(
    info: ConnectionInfo,
    channel_id: ChannelId,
    gateway: GatewayHandle,
    frame_buffer: usize,
) -> (flume::Receiver<u32>, impl FnOnce(u32) -> Session) {
    let guild_id = info.guild_id;

    // Bounded: inbound traffic is informational, and nothing obliges the
    // session owner to drain it.
    let (ws_events_tx, ws_events_rx) = flume::bounded::<WsItem>(INBOUND_PACKET_BUFFER);
    let (ws_frames_tx, ws_frames_rx) = flume::unbounded();
    let (udp_events_tx, udp_events_rx) = flume::bounded::<UdpItem>(INBOUND_PACKET_BUFFER);
    let (udp_frames_tx, udp_frames_rx) = flume::bounded(frame_buffer);
    let (ssrc_tx, ssrc_rx) = flume::bounded(1);

    let task = TaskGuard::new(tokio::spawn(tasks::runner(WsLaunch {
        info,
        gateway,
        events: ws_events_tx,
        frames: ws_frames_rx,
        udp_events: udp_events_tx,
        udp_events_rx: udp_events_rx.clone(),
        udp_frames: udp_frames_rx,
        ssrc: ssrc_tx,
    })));

    let build = move |ssrc| Session {
        guild_id,
        channel_id,
        ssrc,
        ws: WsEndpoint {
            events: ws_events_rx,
            frames: ws_frames_tx,
        },
        udp: UdpEndpoint {
            events: udp_events_rx,
            frames: udp_frames_tx,
        },
        _task: task,
    };

    (ssrc_rx, build)
}
