//! Channel endpoints connecting a session's tasks to their owner.

use crate::model::Event;
use crate::ws::Error as WsError;
use std::net::IpAddr;

/// Item surfaced on a session's websocket inbound channel: a parsed frame,
/// or the transport error that interrupted the stream.
pub type WsItem = Result<Event, WsError>;

/// Result of Discord's IP discovery round, surfaced on the UDP inbound
/// channel exactly once per session.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct IpDiscovery {
    /// Synchronisation source the discovery ran for.
    pub ssrc: u32,
    /// This client's address, as the voice server saw it.
    pub address: IpAddr,
    /// This client's UDP source port, as the voice server saw it.
    pub port: u16,
}

/// Traffic surfaced on a session's UDP inbound channel.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum UdpItem {
    /// The session's IP discovery response.
    Discovery(IpDiscovery),
    /// A raw RTP packet received from the voice server.
    ///
    /// Not decoded or decrypted by this library.
    Rtp(Vec<u8>),
}

/// The session-facing halves of a live websocket connection's channels.
pub(crate) struct WsEndpoint {
    /// Parsed frames (or the stream-breaking error) read off the socket.
    pub events: flume::Receiver<WsItem>,
    /// User-originated frames, e.g. Speaking updates, to be written out.
    pub frames: flume::Sender<Event>,
}

/// The session-facing halves of a UDP transport's channels.
pub(crate) struct UdpEndpoint {
    /// Discovery responses and received RTP traffic.
    pub events: flume::Receiver<UdpItem>,
    /// Encoded Opus frames awaiting transmission.
    ///
    /// Bounded; a full queue blocks the producer by design.
    pub frames: flume::Sender<Vec<u8>>,
}
