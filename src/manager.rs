//! The session coordinator: joining channels, broadcasting audio, and
//! guaranteed teardown.

use crate::broadcast::{self, Broadcast};
use crate::constants::*;
use crate::driver::{self, SessionInfo};
use crate::error::{JoinError, JoinResult, PlayError};
use crate::gateway::{GatewayEvent, GatewayHandle};
use crate::id::{ChannelId, GuildId};
use crate::info::JoinHandshake;
use crate::input::OpusStream;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{info, instrument, warn};

/// Tunables for a voice scope.
#[derive(Clone, Debug)]
pub struct Config {
    /// Budget for the Voice State/Voice Server pair answering a join.
    pub join_timeout: Duration,
    /// Capacity, in 20 ms frames, of each session's outbound audio queue.
    pub frame_buffer: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            join_timeout: GATEWAY_JOIN_TIMEOUT,
            frame_buffer: OPUS_FRAME_BUFFER,
        }
    }
}

struct Shared {
    gateway: GatewayHandle,
    config: Config,
    sessions: Broadcast,
    /// Serialises whole `play` calls, so concurrent players cannot
    /// interleave frames into the same UDP peers.
    playback: Mutex<()>,
}

/// A scope for voice activity over one parent gateway.
///
/// Within a `Voice`, joins register sessions into a shared broadcast set and
/// [`play`] fans one audio source out to every registered session. Prefer
/// [`Voice::scope`], which guarantees that every joined guild is left and
/// every session torn down when the body finishes, successfully or not.
///
/// [`play`]: Voice::play
#[derive(Clone)]
pub struct Voice {
    shared: Arc<Shared>,
}

impl Voice {
    /// Creates a standalone voice scope.
    ///
    /// The caller becomes responsible for calling [`Voice::disconnect_all`]
    /// before dropping it.
    pub fn new(gateway: GatewayHandle) -> Self {
        Self::with_config(gateway, Config::default())
    }

    pub fn with_config(gateway: GatewayHandle, config: Config) -> Self {
        Self {
            shared: Arc::new(Shared {
                gateway,
                config,
                sessions: Broadcast::default(),
                playback: Mutex::new(()),
            }),
        }
    }

    /// Runs `body` within a voice scope, then leaves every joined guild.
    ///
    /// Cleanup runs whether or not the body succeeds: each session's guild
    /// receives a disconnecting Update Voice State (best effort), and each
    /// session's tasks are terminated.
    pub async fn scope<F, Fut, T>(gateway: GatewayHandle, body: F) -> JoinResult<T>
    where
        F: FnOnce(Voice) -> Fut,
        Fut: Future<Output = JoinResult<T>>,
    {
        let voice = Voice::new(gateway);
        let result = body(voice.clone()).await;

        voice.disconnect_all().await;

        result
    }

    /// Joins a guild's voice channel and registers the resulting session in
    /// the broadcast set.
    ///
    /// Returns the session's ssrc once the full voice handshake (through
    /// Session Description) has completed.
    #[instrument(skip(self))]
    pub async fn join(&self, guild_id: GuildId, channel_id: ChannelId) -> JoinResult<u32> {
        let shared = &self.shared;

        // Subscribe before asking, so the answer cannot slip past us.
        let events = shared.gateway.subscribe();

        shared
            .gateway
            .update_voice_state(guild_id, Some(channel_id))
            .await?;

        let info = timeout(
            shared.config.join_timeout,
            await_join_events(events, guild_id, &shared.gateway),
        )
        .await
        .map_err(|_| JoinError::NotAvailable)??;

        let (ssrc_rx, build) = driver::launch(
            info,
            channel_id,
            shared.gateway.clone(),
            shared.config.frame_buffer,
        );

        // Block until Session Description fills the ssrc rendezvous; the
        // sender is dropped unfilled if the handshake dies first.
        let ssrc = ssrc_rx
            .recv_async()
            .await
            .map_err(|_| JoinError::InvalidPayloadOrder)?;

        shared.sessions.add(build(ssrc));
        info!("Joined voice channel {} in guild {}.", channel_id, guild_id);

        Ok(ssrc)
    }

    /// Drives one PCM source through the encoder and into every session
    /// registered at the time of the call.
    ///
    /// The playback mutex is held for the full duration, so concurrent play
    /// calls serialise globally.
    #[instrument(skip(self, source))]
    pub async fn play<R: AsyncRead + Unpin>(&self, source: R) -> Result<(), PlayError> {
        let sinks = self.shared.sessions.sinks();

        for sink in &sinks {
            sink.set_speaking(true);
        }

        let guard = self.shared.playback.lock().await;

        let mut stream = OpusStream::new(source)?;
        let mut frame = [0u8; MAX_OPUS_FRAME_SIZE];

        let result = loop {
            match stream.next_frame(&mut frame).await {
                Ok(Some(len)) => broadcast::fan_out(&sinks, &frame[..len]).await,
                Ok(None) => break Ok(()),
                Err(e) => break Err(e),
            }
        };

        drop(guard);

        for sink in &sinks {
            sink.set_speaking(false);
        }

        result
    }

    /// Snapshots the identities of every registered session.
    pub fn sessions(&self) -> Vec<SessionInfo> {
        self.shared.sessions.infos()
    }

    /// Pops a pending inbound websocket frame for a guild's session, if any.
    ///
    /// The voice gateway forwards frames this library does not consume
    /// itself (e.g. other users' Speaking updates) onto a bounded queue.
    pub fn try_recv_frame(&self, guild_id: GuildId) -> Option<crate::driver::WsItem> {
        self.shared.sessions.recv_frame(guild_id)
    }

    /// Pops a pending inbound UDP item for a guild's session, if any: raw
    /// RTP from the voice server, which this library does not decode.
    pub fn try_recv_packet(&self, guild_id: GuildId) -> Option<crate::driver::UdpItem> {
        self.shared.sessions.recv_packet(guild_id)
    }

    /// Leaves one guild's voice channel, tearing its session down.
    #[instrument(skip(self))]
    pub async fn leave(&self, guild_id: GuildId) -> JoinResult<()> {
        match self.shared.sessions.remove(guild_id) {
            Some(session) => {
                self.shared
                    .gateway
                    .update_voice_state(guild_id, None)
                    .await?;
                drop(session);

                Ok(())
            },
            None => Ok(()),
        }
    }

    /// Leaves every joined guild and terminates every session.
    ///
    /// The disconnecting Update Voice State is best effort: if the parent
    /// gateway's send half has already died (e.g. racing process shutdown),
    /// the failure is logged and teardown proceeds.
    pub async fn disconnect_all(&self) {
        for session in self.shared.sessions.drain() {
            if let Err(e) = self
                .shared
                .gateway
                .update_voice_state(session.guild_id, None)
                .await
            {
                warn!(
                    "Failed to send disconnect for guild {}: {:?}.",
                    session.guild_id, e
                );
            }

            // Dropping the descriptor aborts the websocket task, which tears
            // down its sender, heartbeat, watchdog, and UDP transport.
            drop(session);
        }
    }
}

/// Collects the Voice State + Voice Server update pair for `guild_id`,
/// in either order.
async fn await_join_events(
    mut events: tokio::sync::broadcast::Receiver<GatewayEvent>,
    guild_id: GuildId,
    gateway: &GatewayHandle,
) -> JoinResult<crate::info::ConnectionInfo> {
    let mut handshake = JoinHandshake::new(guild_id, gateway.user_id());

    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Join listener lagged by {} gateway events.", n);
                continue;
            },
            Err(RecvError::Closed) => return Err(JoinError::NotAvailable),
        };

        let done = match event {
            GatewayEvent::VoiceStateUpdate(update) => {
                let ours = update.user_id == gateway.user_id()
                    && update.guild_id.map_or(true, |g| g == guild_id);

                if ours {
                    handshake.session(update.session_id)
                } else {
                    None
                }
            },
            GatewayEvent::VoiceServerUpdate(update) if update.guild_id == guild_id => {
                match update.endpoint {
                    Some(endpoint) => handshake.server(endpoint, update.token),
                    None => return Err(JoinError::NoServerAvailable),
                }
            },
            _ => None,
        };

        if let Some(info) = done {
            return Ok(info);
        }
    }
}
