//! End-to-end session behaviour against a local voice gateway and UDP peer.

use async_tungstenite::tokio::{accept_async, TokioAdapter};
use async_tungstenite::tungstenite::protocol::CloseFrame;
use async_tungstenite::tungstenite::Message;
use async_tungstenite::WebSocketStream;
use discortp::discord::{IpDiscoveryPacket, IpDiscoveryType, MutableIpDiscoveryPacket};
use discortp::rtp::RtpPacket;
use futures::{SinkExt, StreamExt};
use lyrebird::{
    ChannelId, GatewayEvent, GatewayHandle, GuildId, JoinError, JoinResult, UserId, Voice,
};
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::sync::broadcast;
use tokio::time::{timeout_at, Instant};

type ServerWs = WebSocketStream<TokioAdapter<TcpStream>>;

const KEY: [u8; 32] = [0u8; 32];
const BOT_USER: UserId = UserId(99);

struct Harness {
    voice: Voice,
    gateway: GatewayHandle,
    /// Every frame the voice gateway saw, plus `{"_handshake": op}` markers
    /// at each connection open.
    frames: flume::Receiver<Value>,
    /// Close codes for the gateway to issue on its live connection.
    close: flume::Sender<u16>,
    /// Frames for the gateway to push to its live connection.
    server_send: flume::Sender<Value>,
    /// Raw RTP captured by the UDP peer.
    rtp: flume::Receiver<Vec<u8>>,
    /// Number of IP discovery requests the UDP peer answered.
    discoveries: Arc<AtomicUsize>,
    /// Every op-4 command the parent gateway processed.
    commands: flume::Receiver<Value>,
}

async fn harness() -> Harness {
    let udp = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let udp_port = udp.local_addr().unwrap().port();

    let (rtp_tx, rtp_rx) = flume::unbounded();
    let discoveries = Arc::new(AtomicUsize::new(0));
    tokio::spawn(udp_peer(udp, rtp_tx, Arc::clone(&discoveries)));

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let endpoint = format!("ws://127.0.0.1:{}", listener.local_addr().unwrap().port());

    let (frames_tx, frames_rx) = flume::unbounded();
    let (close_tx, close_rx) = flume::unbounded();
    let (server_send_tx, server_send_rx) = flume::unbounded();
    tokio::spawn(voice_server(
        listener,
        udp_port,
        frames_tx,
        close_rx,
        server_send_rx,
    ));

    let (events_tx, _) = broadcast::channel(64);
    let (commands_tx, commands_rx) = flume::unbounded();
    let gateway = GatewayHandle::new(events_tx.clone(), commands_tx, BOT_USER);

    let (seen_tx, seen_rx) = flume::unbounded();
    tokio::spawn(parent_gateway(events_tx, commands_rx, seen_tx, endpoint));

    Harness {
        voice: Voice::new(gateway.clone()),
        gateway,
        frames: frames_rx,
        close: close_tx,
        server_send: server_send_tx,
        rtp: rtp_rx,
        discoveries,
        commands: seen_rx,
    }
}

/// Answers op-4 joins with the Voice State + Voice Server pair, echoing each
/// processed command for test assertions.
async fn parent_gateway(
    events: broadcast::Sender<GatewayEvent>,
    commands: flume::Receiver<Value>,
    seen: flume::Sender<Value>,
    endpoint: String,
) {
    while let Ok(cmd) = commands.recv_async().await {
        let joining = cmd["op"] == 4 && !cmd["d"]["channel_id"].is_null();
        let guild = cmd["d"]["guild_id"].clone();
        let channel = cmd["d"]["channel_id"].clone();

        let _ = seen.send(cmd);

        if joining {
            let _ = events.send(GatewayEvent::from_raw(
                "VOICE_STATE_UPDATE",
                json!({
                    "guild_id": guild,
                    "channel_id": channel,
                    "user_id": "99",
                    "session_id": "abc"
                }),
            ));
            let _ = events.send(GatewayEvent::from_raw(
                "VOICE_SERVER_UPDATE",
                json!({
                    "token": "t",
                    "guild_id": guild,
                    "endpoint": endpoint.clone()
                }),
            ));
        }
    }
}

/// Replies to IP discovery and captures all RTP traffic.
async fn udp_peer(socket: UdpSocket, rtp: flume::Sender<Vec<u8>>, discoveries: Arc<AtomicUsize>) {
    let mut buf = [0u8; 1460];

    loop {
        let (len, from) = match socket.recv_from(&mut buf).await {
            Ok(x) => x,
            Err(_) => break,
        };

        if len == IpDiscoveryPacket::const_packet_size() {
            let is_request = IpDiscoveryPacket::new(&buf[..len])
                .map(|view| view.get_pkt_type() == IpDiscoveryType::Request)
                .unwrap_or(false);

            if is_request {
                discoveries.fetch_add(1, Ordering::SeqCst);
                {
                    let mut view = MutableIpDiscoveryPacket::new(&mut buf[..len]).unwrap();
                    view.set_pkt_type(IpDiscoveryType::Response);
                    view.set_port(from.port());
                }
                buf[8..8 + 9].copy_from_slice(b"127.0.0.1");
                let _ = socket.send_to(&buf[..len], from).await;
                continue;
            }
        }

        if len >= 12 && buf[0] == 0x80 {
            let _ = rtp.send(buf[..len].to_vec());
        }
        // Keepalives and anything else are dropped.
    }
}

async fn voice_server(
    listener: TcpListener,
    udp_port: u16,
    frames: flume::Sender<Value>,
    close: flume::Receiver<u16>,
    push: flume::Receiver<Value>,
) {
    loop {
        let (stream, _) = match listener.accept().await {
            Ok(conn) => conn,
            Err(_) => break,
        };

        tokio::spawn(serve_connection(
            stream,
            udp_port,
            frames.clone(),
            close.clone(),
            push.clone(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    udp_port: u16,
    frames: flume::Sender<Value>,
    close: flume::Receiver<u16>,
    push: flume::Receiver<Value>,
) {
    let mut ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(_) => return,
    };

    let first = match next_json(&mut ws).await {
        Some(v) => v,
        None => return,
    };

    let op = first["op"].as_u64().unwrap_or(255);
    let _ = frames.send(json!({ "_handshake": op }));

    match op {
        // Identify: Hello + Ready, then Select Protocol -> Session Description.
        0 => {
            assert_eq!(first["d"]["session_id"], "abc");
            assert_eq!(first["d"]["token"], "t");

            send_json(&mut ws, &json!({ "op": 8, "d": { "heartbeat_interval": 45000.0 } })).await;
            send_json(
                &mut ws,
                &json!({ "op": 2, "d": {
                    "ssrc": 12345,
                    "ip": "127.0.0.1",
                    "port": udp_port,
                    "modes": ["xsalsa20_poly1305", "xsalsa20_poly1305_suffix"]
                }}),
            )
            .await;

            loop {
                match next_json(&mut ws).await {
                    Some(v) if v["op"] == 1 => {
                        assert_eq!(v["d"]["protocol"], "udp");
                        assert_eq!(v["d"]["data"]["mode"], "xsalsa20_poly1305");
                        assert_eq!(v["d"]["data"]["address"], "127.0.0.1");
                        break;
                    },
                    Some(_) => continue,
                    None => return,
                }
            }

            send_json(
                &mut ws,
                &json!({ "op": 4, "d": {
                    "mode": "xsalsa20_poly1305",
                    "secret_key": KEY.to_vec()
                }}),
            )
            .await;
        },
        // Resume: Hello + Resumed.
        7 => {
            assert_eq!(first["d"]["session_id"], "abc");

            send_json(&mut ws, &json!({ "op": 8, "d": { "heartbeat_interval": 45000.0 } })).await;
            send_json(&mut ws, &json!({ "op": 9, "d": null })).await;
        },
        _ => return,
    }

    // Steady state: record frames, honour scripted closes.
    loop {
        tokio::select! {
            msg = ws.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    if let Ok(v) = serde_json::from_str::<Value>(&text) {
                        let _ = frames.send(v);
                    }
                },
                Some(Ok(_)) => {},
                _ => break,
            },
            frame = push.recv_async() => match frame {
                Ok(frame) => send_json(&mut ws, &frame).await,
                Err(_) => break,
            },
            code = close.recv_async() => match code {
                Ok(code) => {
                    let _ = ws
                        .send(Message::Close(Some(CloseFrame {
                            code: code.into(),
                            reason: "".into(),
                        })))
                        .await;
                    break;
                },
                Err(_) => break,
            },
        }
    }
}

async fn next_json(ws: &mut ServerWs) -> Option<Value> {
    loop {
        match ws.next().await? {
            Ok(Message::Text(text)) => return serde_json::from_str(&text).ok(),
            Ok(Message::Close(_)) | Err(_) => return None,
            Ok(_) => continue,
        }
    }
}

async fn send_json(ws: &mut ServerWs, value: &Value) {
    ws.send(Message::Text(value.to_string())).await.unwrap();
}

/// Waits out the next `{"_handshake": op}` marker.
async fn next_marker(frames: &flume::Receiver<Value>) -> u64 {
    let deadline = Instant::now() + Duration::from_secs(10);

    loop {
        let frame = timeout_at(deadline, frames.recv_async())
            .await
            .expect("Timed out waiting for a handshake marker.")
            .unwrap();

        if let Some(op) = frame["_handshake"].as_u64() {
            return op;
        }
    }
}

/// Collects up to `n` RTP packets within `window`.
async fn collect_rtp(rtp: &flume::Receiver<Vec<u8>>, n: usize, window: Duration) -> Vec<Vec<u8>> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();

    while out.len() < n {
        match timeout_at(deadline, rtp.recv_async()).await {
            Ok(Ok(packet)) => out.push(packet),
            _ => break,
        }
    }

    out
}

/// Collects the `speaking` bitfields of the next `n` Speaking frames.
async fn collect_speaking(frames: &flume::Receiver<Value>, n: usize, window: Duration) -> Vec<u64> {
    let deadline = Instant::now() + window;
    let mut out = Vec::new();

    while out.len() < n {
        match timeout_at(deadline, frames.recv_async()).await {
            Ok(Ok(frame)) if frame["op"] == 5 => {
                out.push(frame["d"]["speaking"].as_u64().unwrap());
            },
            Ok(Ok(_)) => {},
            _ => break,
        }
    }

    out
}

fn decrypt(packet: &[u8]) -> Option<Vec<u8>> {
    use xsalsa20poly1305::aead::{AeadInPlace, KeyInit};
    use xsalsa20poly1305::{Key, Nonce, Tag, XSalsa20Poly1305};

    let cipher = XSalsa20Poly1305::new(Key::from_slice(&KEY));

    let mut nonce = Nonce::default();
    nonce[..12].copy_from_slice(&packet[..12]);

    let tag = Tag::clone_from_slice(&packet[12..28]);
    let mut body = packet[28..].to_vec();
    cipher
        .decrypt_in_place_detached(&nonce, b"", &mut body, &tag)
        .ok()?;

    Some(body)
}

#[tokio::test]
async fn happy_join_reports_ssrc_and_registers_session() {
    let h = harness().await;

    let ssrc = h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();

    assert_eq!(ssrc, 12345);
    assert_eq!(next_marker(&h.frames).await, 0);

    let sessions = h.voice.sessions();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions[0].guild_id, GuildId(1));
    assert_eq!(sessions[0].channel_id, ChannelId(2));
    assert_eq!(sessions[0].ssrc, 12345);
}

#[tokio::test]
async fn empty_source_flushes_silence_and_clears_speaking() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();

    h.voice.play(&[][..]).await.unwrap();

    let packets = collect_rtp(&h.rtp, 10, Duration::from_secs(3)).await;
    assert_eq!(packets.len(), 10);

    for packet in &packets {
        let rtp = RtpPacket::new(packet).unwrap();
        assert_eq!(rtp.get_ssrc(), 12345);
        assert_eq!(decrypt(packet).unwrap(), vec![0xf8, 0xff, 0xfe]);
    }

    let speaking = collect_speaking(&h.frames, 2, Duration::from_secs(5)).await;
    assert_eq!(speaking, vec![1, 0]);
}

#[tokio::test]
async fn sequences_are_contiguous_and_timestamps_step_by_960() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();

    h.voice.play(&[][..]).await.unwrap();

    let packets = collect_rtp(&h.rtp, 10, Duration::from_secs(3)).await;
    assert_eq!(packets.len(), 10);

    let mut prev: Option<(u16, u32)> = None;
    for packet in &packets {
        let rtp = RtpPacket::new(packet).unwrap();
        let seq: u16 = rtp.get_sequence().into();
        let ts: u32 = rtp.get_timestamp().into();

        if let Some((prev_seq, prev_ts)) = prev {
            assert_eq!(seq, prev_seq.wrapping_add(1));
            assert_eq!(ts, prev_ts.wrapping_add(960));
        }
        prev = Some((seq, ts));
    }
}

#[tokio::test]
async fn close_4015_resumes_with_same_identity() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();
    assert_eq!(next_marker(&h.frames).await, 0);

    h.close.send(4015).unwrap();

    // The client re-enters with Resume, not a fresh Identify.
    assert_eq!(next_marker(&h.frames).await, 7);

    // Audio flows again promptly, with the prior ssrc and key.
    h.voice.play(&[][..]).await.unwrap();
    let packets = collect_rtp(&h.rtp, 10, Duration::from_secs(2)).await;
    assert_eq!(packets.len(), 10);

    for packet in &packets {
        let rtp = RtpPacket::new(packet).unwrap();
        assert_eq!(rtp.get_ssrc(), 12345);
        assert!(decrypt(packet).is_some());
    }

    // IP discovery ran exactly once for the whole session.
    assert_eq!(h.discoveries.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn close_4014_performs_full_restart() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();
    assert_eq!(next_marker(&h.frames).await, 0);

    h.close.send(4014).unwrap();

    // A full restart identifies from scratch.
    assert_eq!(next_marker(&h.frames).await, 0);

    h.voice.play(&[][..]).await.unwrap();
    let packets = collect_rtp(&h.rtp, 10, Duration::from_secs(3)).await;
    assert_eq!(packets.len(), 10);

    // The fresh transport re-ran IP discovery.
    assert_eq!(h.discoveries.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn unconsumed_frames_surface_on_the_session_inbound() {
    use lyrebird::model::Event;

    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();

    // Another user starts speaking; the library forwards the frame.
    h.server_send
        .send(json!({ "op": 5, "d": {
            "speaking": 1,
            "delay": 0,
            "ssrc": 555,
            "user_id": "42"
        }}))
        .unwrap();

    let deadline = Instant::now() + Duration::from_secs(3);
    loop {
        if let Some(item) = h.voice.try_recv_frame(GuildId(1)) {
            match item {
                Ok(Event::Speaking(ev)) => {
                    assert_eq!(ev.ssrc, 555);
                    break;
                },
                other => panic!("Unexpected inbound item: {:?}", other),
            }
        }

        assert!(
            Instant::now() < deadline,
            "Forwarded frame never reached the session inbound."
        );
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
}

#[tokio::test]
async fn play_fans_out_to_every_session() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();
    h.voice.join(GuildId(3), ChannelId(4)).await.unwrap();
    assert_eq!(h.voice.sessions().len(), 2);

    h.voice.play(&[][..]).await.unwrap();

    // Ten silence frames per registered session.
    let packets = collect_rtp(&h.rtp, 20, Duration::from_secs(4)).await;
    assert_eq!(packets.len(), 20);
}

#[tokio::test]
async fn disconnect_all_leaves_every_guild_exactly_once() {
    let h = harness().await;
    h.voice.join(GuildId(1), ChannelId(2)).await.unwrap();
    h.voice.join(GuildId(3), ChannelId(4)).await.unwrap();

    h.voice.disconnect_all().await;
    assert!(h.voice.sessions().is_empty());

    let mut disconnects = Vec::new();
    let deadline = Instant::now() + Duration::from_secs(2);
    while let Ok(Ok(cmd)) = timeout_at(deadline, h.commands.recv_async()).await {
        if cmd["op"] == 4 && cmd["d"]["channel_id"].is_null() {
            disconnects.push(cmd["d"]["guild_id"].as_u64().unwrap());
        }
        if disconnects.len() == 2 {
            break;
        }
    }

    disconnects.sort_unstable();
    assert_eq!(disconnects, vec![1, 3]);
}

#[tokio::test]
async fn scope_cleans_up_even_when_the_body_fails() {
    let h = harness().await;

    let result: JoinResult<()> = Voice::scope(h.gateway.clone(), |voice| async move {
        voice.join(GuildId(1), ChannelId(2)).await?;

        Err(JoinError::NotAvailable)
    })
    .await;

    assert!(matches!(result, Err(JoinError::NotAvailable)));

    // The failed body still left the guild cleanly.
    let deadline = Instant::now() + Duration::from_secs(2);
    loop {
        let cmd = timeout_at(deadline, h.commands.recv_async())
            .await
            .expect("Expected a disconnecting voice state update.")
            .unwrap();

        if cmd["op"] == 4 && cmd["d"]["channel_id"].is_null() {
            assert_eq!(cmd["d"]["guild_id"], 1);
            break;
        }
    }
}
