//! Thin JSON-speaking wrapper over the voice websocket connection.

use async_trait::async_trait;
use async_tungstenite::{
    tokio::ConnectStream,
    tungstenite::{protocol::CloseFrame, Error as TungsteniteError, Message},
    WebSocketStream,
};
use flate2::read::ZlibDecoder;
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde::Serialize;
use serde_json::{Error as JsonError, Value};
use tracing::{instrument, warn};
use url::Url;

pub type WsStream = WebSocketStream<ConnectStream>;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug)]
pub enum Error {
    /// A frame's body could not be (de)serialised.
    Json(JsonError),
    /// Transport-level websocket failure.
    Ws(TungsteniteError),
    /// The peer closed the connection, with the frame it sent (if any).
    WsClosed(Option<CloseFrame<'static>>),
}

impl From<JsonError> for Error {
    fn from(e: JsonError) -> Error {
        Error::Json(e)
    }
}

impl From<TungsteniteError> for Error {
    fn from(e: TungsteniteError) -> Error {
        Error::Ws(e)
    }
}

#[async_trait]
pub trait ReceiverExt {
    async fn recv_json(&mut self) -> Result<Option<Value>>;
}

#[async_trait]
pub trait SenderExt {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()>;
}

#[async_trait]
impl ReceiverExt for WsStream {
    async fn recv_json(&mut self) -> Result<Option<Value>> {
        match self.next().await {
            Some(Ok(message)) => parse_message(message),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::WsClosed(None)),
        }
    }
}

#[async_trait]
impl ReceiverExt for SplitStream<WsStream> {
    async fn recv_json(&mut self) -> Result<Option<Value>> {
        match self.next().await {
            Some(Ok(message)) => parse_message(message),
            Some(Err(e)) => Err(e.into()),
            None => Err(Error::WsClosed(None)),
        }
    }
}

#[async_trait]
impl SenderExt for WsStream {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send(Message::Text(text)).await?;

        Ok(())
    }
}

#[async_trait]
impl SenderExt for SplitSink<WsStream, Message> {
    async fn send_json<T: Serialize + Sync>(&mut self, value: &T) -> Result<()> {
        let text = serde_json::to_string(value)?;
        self.send(Message::Text(text)).await?;

        Ok(())
    }
}

/// Decodes one websocket message into a JSON value.
///
/// The voice gateway speaks JSON text frames; binary frames carry
/// zlib-compressed JSON. A Close surfaces as [`Error::WsClosed`] so callers
/// can branch on the close code. Everything else (ping/pong is answered by
/// tungstenite itself) decodes to nothing.
pub(crate) fn parse_message(message: Message) -> Result<Option<Value>> {
    match message {
        Message::Text(text) => decode_text(&text).map(Some),
        Message::Binary(bytes) => decode_compressed(&bytes).map(Some),
        Message::Close(frame) => Err(Error::WsClosed(frame)),
        _ => Ok(None),
    }
}

fn decode_text(text: &str) -> Result<Value> {
    serde_json::from_str(text).map_err(|why| {
        warn!("Undecodable text frame: {:?}; text: {}", why, text);

        why.into()
    })
}

fn decode_compressed(bytes: &[u8]) -> Result<Value> {
    serde_json::from_reader(ZlibDecoder::new(bytes)).map_err(|why| {
        warn!("Undecodable binary frame: {:?} ({} bytes).", why, bytes.len());

        why.into()
    })
}

#[instrument]
pub(crate) async fn create_client(url: Url) -> Result<WsStream> {
    let (stream, _) = async_tungstenite::tokio::connect_async(url.as_str().to_owned()).await?;

    Ok(stream)
}
