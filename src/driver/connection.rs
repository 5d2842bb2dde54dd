//! Handshake routines shared by the Start and Resume stages.

use crate::constants::*;
use crate::driver::error::{Error, Result};
use crate::driver::tasks::message::WsItem;
use crate::info::ConnectionInfo;
use crate::model::payload::{Hello, Identify, ProtocolData, Ready, Resume, SelectProtocol};
use crate::model::Event;
use crate::ws::{self, ReceiverExt, SenderExt, WsStream};
use std::net::IpAddr;
use tokio::time::timeout;
use tracing::{debug, info, instrument};
use url::Url;

/// A freshly identified connection, ready for protocol selection.
pub(crate) struct Handshake {
    pub client: WsStream,
    pub hello: Hello,
    pub ready: Ready,
}

/// Opens a new connection and performs Identify → Hello + Ready.
#[instrument(skip(info), fields(endpoint = %info.endpoint))]
pub(crate) async fn open(info: &mut ConnectionInfo) -> Result<Handshake> {
    let url = generate_url(&mut info.endpoint)?;
    let mut client = ws::create_client(url).await?;

    client
        .send_json(&Event::from(Identify {
            server_id: info.guild_id,
            session_id: info.session_id.clone(),
            token: info.token.clone(),
            user_id: info.user_id,
        }))
        .await?;

    let (hello, ready) = timeout(HANDSHAKE_TIMEOUT, await_hello_ready(&mut client))
        .await
        .map_err(|_| Error::ExpectedHandshake)??;

    if !has_valid_mode(&ready.modes) {
        return Err(Error::CryptoModeUnavailable);
    }

    info!("Connected to: {}", info.endpoint);
    info!("WS heartbeat duration {}ms.", hello.heartbeat_interval);

    Ok(Handshake {
        client,
        hello,
        ready,
    })
}

/// Opens a new connection and performs Resume → Hello + Resumed.
#[instrument(skip(info), fields(endpoint = %info.endpoint))]
pub(crate) async fn reopen(info: &mut ConnectionInfo) -> Result<(WsStream, Hello)> {
    let url = generate_url(&mut info.endpoint)?;
    let mut client = ws::create_client(url).await?;

    client
        .send_json(&Event::from(Resume {
            server_id: info.guild_id,
            session_id: info.session_id.clone(),
            token: info.token.clone(),
        }))
        .await?;

    let hello = timeout(HANDSHAKE_TIMEOUT, await_hello_resumed(&mut client))
        .await
        .map_err(|_| Error::ExpectedHandshake)??;

    info!("Reconnected to: {}", info.endpoint);

    Ok((client, hello))
}

/// Sends Select Protocol and waits out the Session Description, yielding the
/// session's secret key.
///
/// The description need not be the very next frame; unrelated traffic seen
/// while waiting is forwarded to the session's inbound channel.
#[instrument(skip(client, inbound))]
pub(crate) async fn negotiate_udp(
    client: &mut WsStream,
    address: IpAddr,
    port: u16,
    inbound: &flume::Sender<WsItem>,
) -> Result<[u8; 32]> {
    client
        .send_json(&Event::from(SelectProtocol {
            protocol: "udp".into(),
            data: ProtocolData {
                address,
                mode: CRYPTO_MODE.into(),
                port,
            },
        }))
        .await?;

    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        let event = match serde_json::from_value::<Event>(value) {
            Ok(event) => event,
            Err(e) => {
                debug!("Unhandled frame while awaiting session description: {:?}.", e);
                continue;
            },
        };

        match event {
            Event::SessionDescription(desc) => {
                if desc.mode != CRYPTO_MODE {
                    return Err(Error::CryptoModeInvalid);
                }

                let mut key = [0u8; 32];
                if desc.secret_key.len() != key.len() {
                    return Err(Error::Crypto(xsalsa20poly1305::aead::Error));
                }
                key.copy_from_slice(&desc.secret_key);

                return Ok(key);
            },
            other => {
                let _ = inbound.try_send(Ok(other));
            },
        }
    }
}

/// Two-slot wait for Hello and Ready, whichever order the server picks.
async fn await_hello_ready(client: &mut WsStream) -> Result<(Hello, Ready)> {
    let mut hello: Option<Hello> = None;
    let mut ready: Option<Ready> = None;

    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        match serde_json::from_value::<Event>(value)? {
            Event::Hello(h) => hello = Some(h),
            Event::Ready(r) => ready = Some(r),
            other => {
                debug!("Start handshake got {:?} before hello/ready.", other);

                return Err(Error::ExpectedHandshake);
            },
        }

        if let Some(h) = hello {
            if let Some(r) = ready.take() {
                return Ok((h, r));
            }
        }
    }
}

/// Two-slot wait for Hello and Resumed, whichever order the server picks.
async fn await_hello_resumed(client: &mut WsStream) -> Result<Hello> {
    let mut hello: Option<Hello> = None;
    let mut resumed = false;

    loop {
        let value = match client.recv_json().await? {
            Some(value) => value,
            None => continue,
        };

        match serde_json::from_value::<Event>(value)? {
            Event::Hello(h) => hello = Some(h),
            Event::Resumed => resumed = true,
            other => {
                debug!("Resume handshake got {:?} before hello/resumed.", other);

                return Err(Error::ExpectedHandshake);
            },
        }

        if resumed {
            if let Some(h) = hello {
                return Ok(h);
            }
        }
    }
}

/// Builds the gateway URL for an endpoint handed over by the parent gateway.
///
/// Endpoints normally arrive as a bare `host:port`; an endpoint that already
/// names a scheme is used as given, which local test gateways rely on.
fn generate_url(endpoint: &mut String) -> Result<Url> {
    // Some endpoints still advertise :80, on which no TLS socket listens.
    if let Some(stripped) = endpoint.strip_suffix(":80") {
        *endpoint = stripped.to_owned();
    }

    let base = if endpoint.contains("://") {
        endpoint.clone()
    } else {
        format!("wss://{}", endpoint)
    };

    Url::parse(&format!("{}/?v={}", base, VOICE_GATEWAY_VERSION)).or(Err(Error::EndpointUrl))
}

fn has_valid_mode(modes: &[String]) -> bool {
    modes.iter().any(|m| m == CRYPTO_MODE)
}
