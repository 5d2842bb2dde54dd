//! Errors surfaced to users of the library.

use audiopus::Error as OpusError;
use std::{error::Error as StdError, fmt, io::Error as IoError};

/// Error returned when joining or leaving a voice channel through the parent
/// gateway fails.
#[derive(Debug)]
#[non_exhaustive]
pub enum JoinError {
    /// The gateway never answered the join request with both of the expected
    /// voice events.
    NotAvailable,
    /// The gateway answered, but no voice server is currently allocated for
    /// the guild.
    NoServerAvailable,
    /// The voice gateway deviated from the documented handshake, so no
    /// session could be established.
    InvalidPayloadOrder,
    /// The command channel to the parent gateway is closed.
    NoSender,
}

impl fmt::Display for JoinError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to join voice channel: ")?;
        match self {
            JoinError::NotAvailable => write!(f, "gateway never responded."),
            JoinError::NoServerAvailable => write!(f, "no voice server available."),
            JoinError::InvalidPayloadOrder => write!(f, "voice handshake was violated."),
            JoinError::NoSender => write!(f, "gateway command channel closed."),
        }
    }
}

impl StdError for JoinError {}

/// Convenience type for join/leave error handling.
pub type JoinResult<T> = Result<T, JoinError>;

/// Error raised while driving a PCM source through the encoder pipeline.
#[derive(Debug)]
#[non_exhaustive]
pub enum PlayError {
    /// The Opus encoder rejected its configuration or a frame of audio.
    Opus(OpusError),
    /// The PCM source failed mid-read.
    Io(IoError),
}

impl From<OpusError> for PlayError {
    fn from(e: OpusError) -> Self {
        PlayError::Opus(e)
    }
}

impl From<IoError> for PlayError {
    fn from(e: IoError) -> Self {
        PlayError::Io(e)
    }
}

impl fmt::Display for PlayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Failed to play audio source: ")?;
        match self {
            PlayError::Opus(e) => write!(f, "opus encoder error ({}).", e),
            PlayError::Io(e) => write!(f, "source I/O failure ({}).", e),
        }
    }
}

impl StdError for PlayError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            PlayError::Opus(e) => Some(e),
            PlayError::Io(e) => Some(e),
        }
    }
}
