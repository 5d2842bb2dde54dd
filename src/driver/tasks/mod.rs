//! Long-lived tasks backing a single voice session.
//!
//! Each session runs one websocket task (this module), which owns a sender
//! task, a heartbeat generator, a gateway-reconnect watchdog, and the UDP
//! transport. The websocket task drives the Start/Resume/Closed state
//! machine; every exit path tears its children down through abort-on-drop
//! guards before the next state is entered.

pub(crate) mod message;
pub(crate) mod udp;

use async_tungstenite::tungstenite::{protocol::CloseFrame, Message};
use futures::{stream::SplitSink, SinkExt, StreamExt};
use std::net::SocketAddr;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, sleep_until, timeout, Instant};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::constants::*;
use crate::driver::connection::{self, Handshake};
use crate::driver::error::{Error, Result};
use crate::gateway::{GatewayEvent, GatewayHandle};
use crate::info::ConnectionInfo;
use crate::model::payload::{Heartbeat, HeartbeatAck, Hello};
use crate::model::{CloseCode, Event};
use crate::ws::{Error as WsError, ReceiverExt, SenderExt, WsStream};
use self::message::{IpDiscovery, UdpItem, WsItem};
use self::udp::UdpLaunch;

/// Aborts the wrapped task when dropped, so that no exit path leaks
/// children.
pub(crate) struct TaskGuard {
    handle: JoinHandle<()>,
}

impl TaskGuard {
    pub fn new(handle: JoinHandle<()>) -> Self {
        Self { handle }
    }

    pub fn handle_mut(&mut self) -> &mut JoinHandle<()> {
        &mut self.handle
    }
}

impl Drop for TaskGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Everything the websocket task needs to run one session.
pub(crate) struct WsLaunch {
    pub info: ConnectionInfo,
    pub gateway: GatewayHandle,
    /// Session-bound inbound frames (or the error that broke the stream).
    pub events: flume::Sender<WsItem>,
    /// User-originated frames to write to the socket.
    pub frames: flume::Receiver<Event>,
    /// Inbound side of the UDP transport.
    pub udp_events: flume::Sender<UdpItem>,
    /// Shared view of the UDP inbound channel, read during the handshake to
    /// learn the discovery result.
    pub udp_events_rx: flume::Receiver<UdpItem>,
    /// Encoded frames awaiting transmission, drained by the UDP transport.
    pub udp_frames: flume::Receiver<Vec<u8>>,
    /// Rendezvous used to report the session's ssrc to the join call.
    pub ssrc: flume::Sender<u32>,
}

/// RTP identity of the session, fixed at the last completed handshake and
/// re-used by transports respawned for a Resume.
struct UdpIdentity {
    ssrc: u32,
    destination: SocketAddr,
}

enum Stage {
    Start,
    Resume,
    Closed,
}

/// An outgoing item on the library-internal send queue.
enum OutboundItem {
    Frame(Event),
    Close,
}

#[instrument(skip(launch), fields(guild = %launch.info.guild_id))]
pub(crate) async fn runner(mut launch: WsLaunch) {
    info!("WS task started.");

    let (key_tx, key_rx) = watch::channel(None);
    let mut identity: Option<UdpIdentity> = None;
    let mut stage = Stage::Start;

    loop {
        stage = match stage {
            Stage::Start => match start_session(&mut launch, &key_tx, &key_rx).await {
                Ok((client, hello, id, udp_guard)) => {
                    identity = Some(id);
                    event_loop(&mut launch, client, hello.heartbeat_interval, udp_guard).await
                },
                Err(Error::Ws(WsError::WsClosed(Some(frame)))) if identity.is_some() =>
                    close_stage(&frame),
                Err(e) =>
                    if identity.is_some() {
                        warn!("Voice handshake failed: {:?}; resuming.", e);
                        Stage::Resume
                    } else {
                        error!("Initial voice handshake failed: {:?}.", e);
                        Stage::Closed
                    },
            },
            Stage::Resume => {
                let id = identity
                    .as_ref()
                    .expect("Resume is only reachable after a completed handshake.");
                resume_session(&mut launch, id, &key_rx).await
            },
            Stage::Closed => break,
        };
    }

    info!("WS task finished.");
}

/// Runs the full Start handshake: Identify, Hello + Ready, UDP spawn, IP
/// discovery, Select Protocol, Session Description.
async fn start_session(
    launch: &mut WsLaunch,
    key_tx: &watch::Sender<Option<[u8; 32]>>,
    key_rx: &watch::Receiver<Option<[u8; 32]>>,
) -> Result<(WsStream, Hello, UdpIdentity, TaskGuard)> {
    let Handshake {
        mut client,
        hello,
        ready,
    } = connection::open(&mut launch.info).await?;

    // A restart invalidates any key from the previous incarnation.
    let _ = key_tx.send(None);

    let destination = SocketAddr::new(ready.ip, ready.port);
    let udp_guard = TaskGuard::new(tokio::spawn(udp::runner(UdpLaunch {
        ssrc: ready.ssrc,
        destination,
        events: launch.udp_events.clone(),
        frames: launch.udp_frames.clone(),
        key: key_rx.clone(),
        run_discovery: true,
    })));

    let discovery = await_discovery(&launch.udp_events_rx).await?;

    let key = connection::negotiate_udp(
        &mut client,
        discovery.address,
        discovery.port,
        &launch.events,
    )
    .await?;

    let _ = key_tx.send(Some(key));
    let _ = launch.ssrc.try_send(ready.ssrc);

    Ok((
        client,
        hello,
        UdpIdentity {
            ssrc: ready.ssrc,
            destination,
        },
        udp_guard,
    ))
}

/// Waits for the UDP transport to post its discovery result.
async fn await_discovery(events: &flume::Receiver<UdpItem>) -> Result<IpDiscovery> {
    let wait = async {
        loop {
            match events.recv_async().await {
                Ok(UdpItem::Discovery(d)) => break Ok(d),
                Ok(_) => continue,
                Err(_) => break Err(Error::IllegalDiscoveryResponse),
            }
        }
    };

    timeout(HANDSHAKE_TIMEOUT, wait)
        .await
        .map_err(|_| Error::IllegalDiscoveryResponse)?
}

/// Re-enters an interrupted session: Resume, Hello + Resumed, and a fresh
/// transport over the previous UDP identity (same ssrc, same key).
async fn resume_session(
    launch: &mut WsLaunch,
    identity: &UdpIdentity,
    key_rx: &watch::Receiver<Option<[u8; 32]>>,
) -> Stage {
    loop {
        match connection::reopen(&mut launch.info).await {
            Ok((client, hello)) => {
                let udp_guard = TaskGuard::new(tokio::spawn(udp::runner(UdpLaunch {
                    ssrc: identity.ssrc,
                    destination: identity.destination,
                    events: launch.udp_events.clone(),
                    frames: launch.udp_frames.clone(),
                    key: key_rx.clone(),
                    run_discovery: false,
                })));

                return event_loop(launch, client, hello.heartbeat_interval, udp_guard).await;
            },
            Err(Error::Ws(WsError::WsClosed(Some(frame)))) => match close_stage(&frame) {
                Stage::Resume => sleep(RESUME_BACKOFF).await,
                other => return other,
            },
            Err(e) => {
                warn!("Resume failed: {:?}; retrying in {:?}.", e, RESUME_BACKOFF);
                sleep(RESUME_BACKOFF).await;
            },
        }
    }
}

/// Steady-state frame pump.
///
/// Sibling tasks (sender, heartbeat generator, gateway watchdog) live
/// exactly as long as one pass of this loop; they and the UDP transport are
/// all torn down before the returned stage takes effect.
async fn event_loop(
    launch: &mut WsLaunch,
    client: WsStream,
    heartbeat_interval: f64,
    mut udp: TaskGuard,
) -> Stage {
    let (sink, mut stream) = client.split();

    let (internal_tx, internal_rx) = flume::unbounded();
    let _sender = TaskGuard::new(tokio::spawn(sender(
        sink,
        internal_rx,
        launch.frames.clone(),
    )));
    let _heartbeat = TaskGuard::new(tokio::spawn(heartbeat(
        internal_tx.clone(),
        Duration::from_millis(heartbeat_interval as u64),
    )));

    let (reconnect_tx, reconnect_rx) = flume::bounded(1);
    let _watchdog = TaskGuard::new(tokio::spawn(watchdog(
        launch.gateway.subscribe(),
        reconnect_tx,
    )));

    // Defensive against half-open TCP: if nothing (not even a heartbeat ack)
    // arrives within two intervals, the connection is considered dead.
    let recv_timeout = Duration::from_millis((heartbeat_interval * 2.0) as u64);

    loop {
        tokio::select! {
            frame = timeout(recv_timeout, stream.recv_json()) => match frame {
                Err(_) => {
                    warn!("No voice gateway traffic within two heartbeat intervals.");
                    return Stage::Resume;
                },
                Ok(Err(WsError::WsClosed(Some(frame)))) => return close_stage(&frame),
                Ok(Err(WsError::WsClosed(None))) => {
                    info!("Voice websocket closed without a close frame.");
                    return Stage::Resume;
                },
                Ok(Err(WsError::Json(e))) => {
                    warn!("Unexpected JSON {:?}.", e);
                },
                Ok(Err(e)) => {
                    error!("Error processing ws {:?}.", e);
                    let _ = launch.events.try_send(Err(e));
                    return Stage::Resume;
                },
                Ok(Ok(None)) => {},
                Ok(Ok(Some(value))) => match serde_json::from_value::<Event>(value) {
                    Ok(event) => process_frame(launch, &internal_tx, event),
                    Err(e) => {
                        debug!("Unhandled voice gateway frame: {:?}.", e);
                    },
                },
            },
            _ = reconnect_rx.recv_async() => {
                info!("Parent gateway reconnected; resuming voice session.");
                let _ = internal_tx.send(OutboundItem::Close);

                // Give the sender a beat to flush the courteous close.
                sleep(WS_SEND_GAP).await;
                return Stage::Resume;
            },
            res = udp.handle_mut() => {
                warn!("UDP transport exited early: {:?}.", res);
                return Stage::Resume;
            },
        }
    }
}

/// Handles one parsed inbound frame during the event loop.
fn process_frame(launch: &WsLaunch, internal_tx: &flume::Sender<OutboundItem>, event: Event) {
    match event {
        // Discord deviates from its documentation here: the server sends
        // Heartbeat and expects the nonce echoed back in an ack.
        Event::Heartbeat(hb) => {
            let _ = internal_tx.send(OutboundItem::Frame(Event::from(HeartbeatAck {
                nonce: hb.nonce,
            })));
        },
        Event::HeartbeatAck(ack) => {
            trace!("Heartbeat ACK received ({}).", ack.nonce);
        },
        other => {
            let _ = launch.events.try_send(Ok(other));
        },
    }
}

/// Maps a close frame onto the next state.
fn close_stage(frame: &CloseFrame<'_>) -> Stage {
    let code: u16 = frame.code.into();

    match CloseCode::from_code(code) {
        Some(cc) if cc.should_restart() => {
            info!("Voice gateway closed with {:?}; performing a full restart.", cc);
            Stage::Start
        },
        Some(cc) if cc.should_resume() => {
            info!("Voice gateway closed with {:?}; resuming.", cc);
            Stage::Resume
        },
        Some(cc) => {
            info!("Voice gateway closed the session ({:?}); terminating.", cc);
            Stage::Closed
        },
        None => {
            if code != 1000 {
                warn!("Voice gateway closed with unrecognised code {}; terminating.", code);
            }
            Stage::Closed
        },
    }
}

/// Serialises every outgoing frame, pacing sends so that no two frames leave
/// within [`WS_SEND_GAP`] of one another.
async fn sender(
    mut sink: SplitSink<WsStream, Message>,
    internal: flume::Receiver<OutboundItem>,
    user: flume::Receiver<Event>,
) {
    let mut last_send: Option<Instant> = None;

    loop {
        let item = tokio::select! {
            item = internal.recv_async() => match item {
                Ok(item) => item,
                Err(_) => break,
            },
            frame = user.recv_async() => match frame {
                Ok(frame) => OutboundItem::Frame(frame),
                Err(_) => break,
            },
        };

        if let Some(last) = last_send {
            sleep_until(last + WS_SEND_GAP).await;
        }

        let sent = match item {
            OutboundItem::Frame(event) => sink.send_json(&event).await,
            OutboundItem::Close => sink.send(Message::Close(None)).await.map_err(Into::into),
        };
        last_send = Some(Instant::now());

        if let Err(e) = sent {
            error!("WS send failure: {:?}.", e);
            break;
        }
    }
}

/// Queues a heartbeat every `interval`, stamped with epoch seconds.
async fn heartbeat(queue: flume::Sender<OutboundItem>, interval: Duration) {
    sleep(HEARTBEAT_WARMUP).await;

    let mut next = Instant::now();

    loop {
        sleep_until(next).await;

        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or_default();

        if queue
            .send(OutboundItem::Frame(Event::from(Heartbeat { nonce })))
            .is_err()
        {
            break;
        }

        trace!("Queued heartbeat {}.", nonce);
        next += interval;
    }
}

/// Watches the duplicated gateway stream for a parent-gateway reconnect,
/// which leaves this voice session stale.
async fn watchdog(mut events: broadcast::Receiver<GatewayEvent>, signal: flume::Sender<()>) {
    loop {
        match events.recv().await {
            Ok(GatewayEvent::Ready) => {
                let _ = signal.try_send(());
                break;
            },
            Ok(_) => {},
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!("Gateway watchdog lagged by {} events.", n);
            },
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
