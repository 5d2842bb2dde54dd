//! The UDP transport task: IP discovery, secret-key wait, paced encrypted
//! transmission, and keepalives.

use super::message::{IpDiscovery, UdpItem};
use super::TaskGuard;
use crate::constants::*;
use crate::driver::error::{Error, Result};
use discortp::{
    discord::{
        IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket, MutableKeepalivePacket,
    },
    rtp::{MutableRtpPacket, RtpPacket},
    MutablePacket, Packet,
};
use flume::{Receiver, Sender};
use rand::random;
use std::{net::SocketAddr, str::FromStr, sync::Arc};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::time::{sleep_until, timeout_at, Instant};
use tracing::{error, info, instrument, trace, warn};
use xsalsa20poly1305::{
    aead::{AeadInPlace, KeyInit},
    Key, Nonce, XSalsa20Poly1305 as Cipher, TAG_SIZE,
};

/// Everything a UDP transport needs to run, prepared by the websocket task.
pub(crate) struct UdpLaunch {
    /// Synchronisation source assigned by the server in Ready.
    pub ssrc: u32,
    /// The voice server's RTP endpoint.
    pub destination: SocketAddr,
    /// Inbound traffic (discovery result, received packets).
    pub events: Sender<UdpItem>,
    /// Encoded Opus frames to transmit.
    pub frames: Receiver<Vec<u8>>,
    /// Session secret key, filled after Session Description.
    pub key: watch::Receiver<Option<[u8; 32]>>,
    /// Whether IP discovery still needs to run.
    ///
    /// Discovery happens exactly once per session; transports respawned for
    /// a Resume skip it.
    pub run_discovery: bool,
}

#[instrument(skip(launch), fields(ssrc = launch.ssrc))]
pub(crate) async fn runner(launch: UdpLaunch) {
    info!("UDP transport started.");

    match run(launch).await {
        Ok(()) => info!("UDP transport finished."),
        Err(e) => error!("Fatal UDP transport error: {:?}.", e),
    }
}

async fn run(mut launch: UdpLaunch) -> Result<()> {
    let udp = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
    udp.connect(launch.destination).await?;

    if launch.run_discovery {
        let discovery = discover(&udp, launch.ssrc).await?;
        let _ = launch.events.try_send(UdpItem::Discovery(discovery));
    }

    let _listener = TaskGuard::new(tokio::spawn(listen(
        Arc::clone(&udp),
        launch.events.clone(),
    )));

    // No audio may leave this socket before the session key is known.
    let key = match await_key(&mut launch.key).await {
        Some(key) => key,
        None => return Ok(()),
    };
    let cipher = Cipher::new(Key::from_slice(&key));

    transmit(&udp, &cipher, launch.ssrc, &launch.frames).await
}

/// Follows Discord's IP discovery procedure, in case NAT tunnelling is
/// needed.
async fn discover(udp: &UdpSocket, ssrc: u32) -> Result<IpDiscovery> {
    let mut bytes = [0; IpDiscoveryPacket::const_packet_size()];
    {
        let mut view = MutableIpDiscoveryPacket::new(&mut bytes[..])
            .expect("buffer is sized for exactly one discovery packet");
        view.set_pkt_type(IpDiscoveryType::Request);
        view.set_length(70);
        view.set_ssrc(ssrc);
    }

    udp.send(&bytes).await?;

    let len = udp.recv(&mut bytes).await?;

    parse_discovery(&bytes[..len]).ok_or(Error::IllegalDiscoveryResponse)
}

/// Parses a discovery response, rejecting anything of the wrong shape.
fn parse_discovery(packet: &[u8]) -> Option<IpDiscovery> {
    let view = IpDiscoveryPacket::new(packet)?;

    if view.get_pkt_type() != IpDiscoveryType::Response {
        return None;
    }

    // The address bytes come straight off the wire; scan for the first
    // terminator rather than trusting anything about the padding.
    let terminator = view.get_address_raw().iter().position(|&b| b == 0)?;

    let address_str = std::str::from_utf8(&view.get_address_raw()[..terminator]).ok()?;
    let address = std::net::IpAddr::from_str(address_str).ok()?;

    Some(IpDiscovery {
        ssrc: view.get_ssrc(),
        address,
        port: view.get_port(),
    })
}

/// Blocks until the websocket delivers the session key, or the session is
/// torn down with the key still unset.
async fn await_key(rx: &mut watch::Receiver<Option<[u8; 32]>>) -> Option<[u8; 32]> {
    loop {
        let current = *rx.borrow();
        if let Some(key) = current {
            return Some(key);
        }

        if rx.changed().await.is_err() {
            return None;
        }
    }
}

/// Inbound side: surface discovery echoes and raw RTP, drop everything else.
async fn listen(udp: Arc<UdpSocket>, events: Sender<UdpItem>) {
    let mut buffer = [0u8; VOICE_PACKET_MAX];

    loop {
        let len = match udp.recv(&mut buffer).await {
            Ok(len) => len,
            Err(e) => {
                warn!("UDP read error: {:?}.", e);
                break;
            },
        };

        let packet = &buffer[..len];

        if let Some(discovery) = parse_discovery(packet) {
            let _ = events.try_send(UdpItem::Discovery(discovery));
            continue;
        }

        if let Some(rtp) = RtpPacket::new(packet) {
            if rtp.get_version() == RTP_VERSION {
                // Not decoding peer audio; hand the raw packet upward.
                let _ = events.try_send(UdpItem::Rtp(packet.to_vec()));
                continue;
            }
        }

        trace!("Discarded unrecognised UDP packet ({} bytes).", len);
    }
}

async fn transmit(
    udp: &UdpSocket,
    cipher: &Cipher,
    ssrc: u32,
    frames: &Receiver<Vec<u8>>,
) -> Result<()> {
    let mut packet = [0u8; VOICE_PACKET_MAX];
    {
        let mut rtp = MutableRtpPacket::new(&mut packet[..])
            .expect("packet buffer always fits an RTP header");
        rtp.set_version(RTP_VERSION);
        rtp.set_payload_type(RTP_PROFILE_TYPE);
        rtp.set_sequence(random::<u16>().into());
        rtp.set_timestamp(random::<u32>().into());
        rtp.set_ssrc(ssrc);
    }

    let mut keepalive_bytes = [0u8; MutableKeepalivePacket::minimum_packet_size()];
    MutableKeepalivePacket::new(&mut keepalive_bytes[..])
        .expect("buffer is sized for exactly one keepalive")
        .set_ssrc(ssrc);

    let mut ka_time = Instant::now() + UDP_KEEPALIVE_GAP;
    let mut deadline = Instant::now();

    loop {
        match timeout_at(ka_time, frames.recv_async()).await {
            Err(_) => {
                trace!("Sending UDP keepalive.");
                udp.send(&keepalive_bytes[..]).await?;
                ka_time += UDP_KEEPALIVE_GAP;
            },
            // All producers gone: the session is over.
            Ok(Err(_)) => break,
            Ok(Ok(frame)) => {
                let len = prepare_packet(&mut packet, &frame, cipher)?;

                // Pace against the wall clock so scheduling jitter does not
                // accumulate; a stalled producer restarts the cadence.
                let now = Instant::now();
                if now > deadline + TIMESTEP_LENGTH {
                    deadline = now;
                }
                sleep_until(deadline).await;

                udp.send(&packet[..len]).await?;

                deadline += TIMESTEP_LENGTH;
                ka_time = Instant::now() + UDP_KEEPALIVE_GAP;
                advance_rtp(&mut packet);
            },
        }
    }

    Ok(())
}

/// Stamps one Opus frame into the RTP packet body, encrypting in place.
///
/// The nonce is the 12-byte RTP header zero-padded to 24 bytes; the payload
/// is laid out as secretbox output, tag first.
fn prepare_packet(
    packet: &mut [u8; VOICE_PACKET_MAX],
    opus_frame: &[u8],
    cipher: &Cipher,
) -> Result<usize> {
    let mut nonce = Nonce::default();

    let mut rtp = MutableRtpPacket::new(&mut packet[..])
        .expect("packet buffer always fits an RTP header");

    let rtp_len = RtpPacket::minimum_packet_size();
    nonce[..rtp_len].copy_from_slice(&rtp.packet()[..rtp_len]);

    let payload = rtp.payload_mut();
    let frame_len = opus_frame.len();
    payload[TAG_SIZE..TAG_SIZE + frame_len].copy_from_slice(opus_frame);

    let tag = cipher.encrypt_in_place_detached(
        &nonce,
        b"",
        &mut payload[TAG_SIZE..TAG_SIZE + frame_len],
    )?;
    payload[..TAG_SIZE].copy_from_slice(&tag[..]);

    Ok(rtp_len + TAG_SIZE + frame_len)
}

fn advance_rtp(packet: &mut [u8; VOICE_PACKET_MAX]) {
    let mut rtp = MutableRtpPacket::new(&mut packet[..])
        .expect("packet buffer always fits an RTP header");
    rtp.set_sequence(rtp.get_sequence() + 1);
    rtp.set_timestamp(rtp.get_timestamp() + TIMESTAMP_STEP);
}
