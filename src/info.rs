use crate::id::{GuildId, UserId};
use std::fmt;

/// Everything needed to open a websocket against a Discord voice server.
///
/// Assembled from the parent gateway's two answers to an Update Voice State
/// command, plus the bot's own identity.
#[derive(Clone)]
pub struct ConnectionInfo {
    /// Hostname (and port) of the assigned voice gateway.
    pub endpoint: String,
    /// Guild the session belongs to. Voice calls outside a guild are not
    /// reachable by bots.
    pub guild_id: GuildId,
    /// Session handle proving who we are to the voice gateway.
    pub session_id: String,
    /// Short-lived secret paired with the session handle.
    pub token: String,
    /// The bot's own user ID.
    pub user_id: UserId,
}

impl fmt::Debug for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // The token stays out of logs.
        f.debug_struct("ConnectionInfo")
            .field("endpoint", &self.endpoint)
            .field("guild_id", &self.guild_id)
            .field("session_id", &self.session_id)
            .field("user_id", &self.user_id)
            .finish_non_exhaustive()
    }
}

/// Collects the `VOICE_STATE_UPDATE` / `VOICE_SERVER_UPDATE` pair answering
/// a join, which may land in either order.
///
/// Each event fills its own slot; once both are occupied the handshake
/// yields a [`ConnectionInfo`].
#[derive(Debug)]
pub(crate) struct JoinHandshake {
    guild_id: GuildId,
    user_id: UserId,
    session_id: Option<String>,
    server: Option<ServerInfo>,
}

/// Slot filled by `VOICE_SERVER_UPDATE`.
struct ServerInfo {
    endpoint: String,
    token: String,
}

impl fmt::Debug for ServerInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerInfo")
            .field("endpoint", &self.endpoint)
            .finish_non_exhaustive()
    }
}

impl JoinHandshake {
    pub fn new(guild_id: GuildId, user_id: UserId) -> Self {
        Self {
            guild_id,
            user_id,
            session_id: None,
            server: None,
        }
    }

    /// Records the session id from our own voice state update.
    pub fn session(&mut self, session_id: String) -> Option<ConnectionInfo> {
        self.session_id = Some(session_id);

        self.try_complete()
    }

    /// Records the endpoint and token from the voice server update.
    pub fn server(&mut self, endpoint: String, token: String) -> Option<ConnectionInfo> {
        self.server = Some(ServerInfo { endpoint, token });

        self.try_complete()
    }

    fn try_complete(&self) -> Option<ConnectionInfo> {
        let session_id = self.session_id.as_ref()?;
        let server = self.server.as_ref()?;

        Some(ConnectionInfo {
            endpoint: server.endpoint.clone(),
            guild_id: self.guild_id,
            session_id: session_id.clone(),
            token: server.token.clone(),
            user_id: self.user_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::JoinHandshake;
    use crate::id::{GuildId, UserId};

    #[test]
    fn state_then_server_completes() {
        let mut handshake = JoinHandshake::new(GuildId(1), UserId(2));

        assert!(handshake.session("abc".into()).is_none());

        let info = handshake
            .server("x.discord.gg:443".into(), "t".into())
            .expect("Both halves seen; join info must be complete.");

        assert_eq!(info.session_id, "abc");
        assert_eq!(info.endpoint, "x.discord.gg:443");
        assert_eq!(info.token, "t");
        assert_eq!(info.guild_id, GuildId(1));
    }

    #[test]
    fn server_then_state_completes() {
        let mut handshake = JoinHandshake::new(GuildId(1), UserId(2));

        assert!(handshake.server("x.discord.gg:443".into(), "t".into()).is_none());
        assert!(handshake.session("abc".into()).is_some());
    }

    #[test]
    fn repeats_of_one_half_never_complete() {
        let mut handshake = JoinHandshake::new(GuildId(1), UserId(2));

        assert!(handshake.session("abc".into()).is_none());
        assert!(handshake.session("def".into()).is_none());
    }

    #[test]
    fn debug_output_omits_the_token() {
        let mut handshake = JoinHandshake::new(GuildId(1), UserId(2));
        let _ = handshake.session("abc".into());
        let info = handshake.server("x.discord.gg:443".into(), "hunter2".into()).unwrap();

        assert!(!format!("{:?}", info).contains("hunter2"));
        assert!(!format!("{:?}", handshake).contains("hunter2"));
    }
}
