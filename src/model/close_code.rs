/// Discord voice gateway websocket close codes.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
#[non_exhaustive]
pub enum CloseCode {
    /// Invalid voice opcode.
    UnknownOpcode = 4001,

    /// Invalid identification payload sent.
    InvalidPayload = 4002,

    /// A payload was sent prior to identifying.
    NotAuthenticated = 4003,

    /// The account token sent with the identify payload was incorrect.
    AuthenticationFailed = 4004,

    /// More than one identify payload was sent.
    AlreadyAuthenticated = 4005,

    /// The session is no longer valid.
    SessionInvalid = 4006,

    /// A session timed out.
    SessionTimeout = 4009,

    /// The server for the last connection attempt could not be found.
    ServerNotFound = 4011,

    /// Discord did not recognise the voice protocol chosen.
    UnknownProtocol = 4012,

    /// Disconnected, either due to channel closure/removal or kicking.
    ///
    /// A fresh handshake against the current channel may still succeed.
    Disconnected = 4014,

    /// Connected voice server crashed.
    ///
    /// Should resume.
    VoiceServerCrash = 4015,

    /// Discord didn't recognise the encryption scheme.
    UnknownEncryptionMode = 4016,
}

impl CloseCode {
    /// Maps a raw websocket close code onto the voice gateway's table.
    pub fn from_code(code: u16) -> Option<Self> {
        use CloseCode::*;
        Some(match code {
            4001 => UnknownOpcode,
            4002 => InvalidPayload,
            4003 => NotAuthenticated,
            4004 => AuthenticationFailed,
            4005 => AlreadyAuthenticated,
            4006 => SessionInvalid,
            4009 => SessionTimeout,
            4011 => ServerNotFound,
            4012 => UnknownProtocol,
            4014 => Disconnected,
            4015 => VoiceServerCrash,
            4016 => UnknownEncryptionMode,
            _ => return None,
        })
    }

    /// Indicates whether a voice client should resume the session in
    /// response to this close code.
    pub fn should_resume(&self) -> bool {
        matches!(self, CloseCode::VoiceServerCrash)
    }

    /// Indicates whether a voice client should perform a complete fresh
    /// handshake in response to this close code.
    pub fn should_restart(&self) -> bool {
        matches!(self, CloseCode::Disconnected)
    }
}
