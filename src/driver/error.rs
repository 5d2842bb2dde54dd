//! Failures of the voice session driver.

use crate::ws::Error as WsError;
use serde_json::Error as JsonError;
use std::{error::Error as StdError, fmt, io::Error as IoError};
use xsalsa20poly1305::aead::Error as CryptoError;

/// Anything that can go wrong while negotiating or driving a voice session.
#[derive(Debug)]
#[non_exhaustive]
pub enum Error {
    /// Sealing a packet, or deriving the session cipher, failed.
    Crypto(CryptoError),
    /// The Session Description named a different encryption mode than the
    /// one we asked for.
    CryptoModeInvalid,
    /// Ready listed encryption modes, but none that this library speaks.
    CryptoModeUnavailable,
    /// The endpoint handed over by the parent gateway does not form a URL.
    EndpointUrl,
    /// The voice gateway broke the expected handshake sequence.
    ExpectedHandshake,
    /// The IP discovery reply was not shaped like a discovery reply.
    IllegalDiscoveryResponse,
    /// The IP discovery reply carried an address we could not parse.
    IllegalIp,
    /// A socket-level failure, on either transport.
    Io(IoError),
    /// A payload refused to (de)serialise.
    Json(JsonError),
    /// The websocket transport itself failed.
    Ws(WsError),
}

impl From<CryptoError> for Error {
    fn from(e: CryptoError) -> Self {
        Error::Crypto(e)
    }
}

impl From<IoError> for Error {
    fn from(e: IoError) -> Error {
        Error::Io(e)
    }
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<WsError> for Error {
    fn from(e: WsError) -> Error {
        Error::Ws(e)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("voice session failed: ")?;
        use Error::*;
        match self {
            Crypto(e) => write!(f, "packet encryption broke down ({})", e),
            CryptoModeInvalid =>
                f.write_str("server settled on an encryption mode we never requested"),
            CryptoModeUnavailable => f.write_str("server offers no encryption mode we speak"),
            EndpointUrl => f.write_str("assigned endpoint does not parse as a URL"),
            ExpectedHandshake => f.write_str("handshake sequence was violated"),
            IllegalDiscoveryResponse => f.write_str("IP discovery reply was malformed"),
            IllegalIp => f.write_str("IP discovery reply held an unreadable address"),
            Io(e) => write!(f, "socket error ({})", e),
            Json(e) => write!(f, "payload could not be (de)serialised ({})", e),
            Ws(e) => write!(f, "websocket transport error ({:?})", e),
        }
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Error::Io(e) => Some(e),
            Error::Json(e) => Some(e),
            _ => None,
        }
    }
}

/// Convenience alias for driver-internal fallible calls.
pub type Result<T> = std::result::Result<T, Error>;
