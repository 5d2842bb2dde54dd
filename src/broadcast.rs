//! The broadcast set: every live session, fed frame-by-frame from one
//! encoder.

use crate::driver::{Session, SessionInfo, UdpItem, WsItem};
use crate::id::GuildId;
use crate::model::payload::{Speaking, SpeakingState};
use crate::model::Event;
use futures::future::join_all;
use parking_lot::Mutex;

/// Mutex-guarded set of live sessions.
///
/// Mutation happens under the lock; readers take a snapshot of the sessions'
/// frame senders, so a `play` in flight keeps addressing the sessions it
/// started with.
#[derive(Default)]
pub(crate) struct Broadcast {
    sessions: Mutex<Vec<Session>>,
}

/// The per-session handles one `play` call writes through.
pub(crate) struct Sink {
    frames: flume::Sender<Vec<u8>>,
    ws_frames: flume::Sender<Event>,
    ssrc: u32,
}

impl Broadcast {
    pub fn add(&self, session: Session) {
        self.sessions.lock().push(session);
    }

    pub fn remove(&self, guild_id: GuildId) -> Option<Session> {
        let mut sessions = self.sessions.lock();
        let index = sessions.iter().position(|s| s.guild_id == guild_id)?;

        Some(sessions.remove(index))
    }

    pub fn drain(&self) -> Vec<Session> {
        self.sessions.lock().drain(..).collect()
    }

    pub fn infos(&self) -> Vec<SessionInfo> {
        self.sessions.lock().iter().map(Session::info).collect()
    }

    /// Pops a pending inbound websocket frame for a guild's session.
    pub fn recv_frame(&self, guild_id: GuildId) -> Option<WsItem> {
        let sessions = self.sessions.lock();
        let session = sessions.iter().find(|s| s.guild_id == guild_id)?;

        session.ws.events.try_recv().ok()
    }

    /// Pops a pending inbound UDP item for a guild's session.
    pub fn recv_packet(&self, guild_id: GuildId) -> Option<UdpItem> {
        let sessions = self.sessions.lock();
        let session = sessions.iter().find(|s| s.guild_id == guild_id)?;

        session.udp.events.try_recv().ok()
    }

    /// Snapshots the current sessions' write handles.
    ///
    /// Sessions joined after this point receive audio only from the next
    /// play call.
    pub fn sinks(&self) -> Vec<Sink> {
        self.sessions
            .lock()
            .iter()
            .map(|s| Sink {
                frames: s.udp.frames.clone(),
                ws_frames: s.ws.frames.clone(),
                ssrc: s.ssrc,
            })
            .collect()
    }
}

/// Writes one encoded frame into every sink, in parallel, returning once all
/// writers have finished.
///
/// A full queue anywhere stalls the whole fan-out; the bounded queues are
/// the backpressure mechanism.
pub(crate) async fn fan_out(sinks: &[Sink], frame: &[u8]) {
    join_all(
        sinks
            .iter()
            .map(|sink| sink.frames.send_async(frame.to_vec())),
    )
    .await;
}

impl Sink {
    /// Queues a Speaking update on the session's websocket.
    pub fn set_speaking(&self, speaking: bool) {
        let state = if speaking {
            SpeakingState::MICROPHONE
        } else {
            SpeakingState::empty()
        };

        let _ = self.ws_frames.send(Event::from(Speaking {
            delay: Some(0),
            speaking: state,
            ssrc: self.ssrc,
            user_id: None,
        }));
    }
}
