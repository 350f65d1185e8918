//! WebSocket framing over the local socket
//!
//! Wraps the HTTP upgrade and the binary MessagePack frames so endpoint
//! handlers deal in [`Message`]/[`Reply`] values. Peer disconnects that are
//! just a client going away (normal close, reset mid-stream) surface as
//! end-of-stream rather than errors; anything else is worth a log line.
//!
//! Split-sink variants of the send helpers exist for handlers that read and
//! write from separate tasks.

use std::time::Duration;

use futures_util::{Sink, SinkExt, StreamExt};
use serde::Serialize;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, WebSocketConfig};
use tokio_tungstenite::tungstenite::{Error as WsError, Message as WsMessage};
use tokio_tungstenite::WebSocketStream;
use tracing::debug;

use gangway_core::{from_msgpack, to_msgpack, Message, MAX_FRAME_SIZE};

/// How long a single frame write may block before the peer is written off
pub const WRITE_DEADLINE: Duration = Duration::from_secs(10);

/// Interval between keepalive pings
pub const PING_PERIOD: Duration = Duration::from_secs(54);

/// A peer silent for this long (no frames of any kind) is considered gone
pub const PONG_DEADLINE: Duration = Duration::from_secs(60);

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("decode failed: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("write timed out")]
    WriteTimeout,

    #[error("peer closed with status {0}")]
    UnexpectedClose(u16),

    #[error(transparent)]
    Ws(#[from] WsError),
}

/// Errors that just mean the peer went away without ceremony
pub fn is_benign_ws_error(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed | WsError::AlreadyClosed => true,
        WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::NotConnected
        ),
        _ => false,
    }
}

/// Perform the server side of the WebSocket handshake.
///
/// The routing layer only peeks at the request head, so the full HTTP
/// upgrade is still on the stream for the handshake to consume. Frame and
/// message sizes are capped; an oversized frame fails the read, which ends
/// the session.
pub async fn upgrade<S>(stream: S) -> Result<WebSocketStream<S>, WsError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let config = WebSocketConfig {
        max_message_size: Some(MAX_FRAME_SIZE),
        max_frame_size: Some(MAX_FRAME_SIZE),
        ..Default::default()
    };
    tokio_tungstenite::accept_async_with_config(stream, Some(config)).await
}

/// Request/reply view of one WebSocket session
pub struct MessageChannel<S> {
    ws: WebSocketStream<S>,
}

impl<S> MessageChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }

    /// Next decoded request, or `None` once the peer is done. Control frames
    /// and text frames are consumed here.
    pub async fn recv(&mut self) -> Result<Option<Message>, ChannelError> {
        loop {
            let frame = match self.ws.next().await {
                Some(Ok(frame)) => frame,
                Some(Err(e)) if is_benign_ws_error(&e) => {
                    debug!("peer dropped: {}", e);
                    return Ok(None);
                }
                Some(Err(e)) => return Err(ChannelError::Ws(e)),
                None => return Ok(None),
            };
            match frame {
                WsMessage::Binary(payload) => return Ok(Some(from_msgpack(&payload)?)),
                WsMessage::Close(frame) => {
                    let code = frame.map(|f| f.code).unwrap_or(CloseCode::Normal);
                    return match code {
                        CloseCode::Normal | CloseCode::Away => Ok(None),
                        other => Err(ChannelError::UnexpectedClose(other.into())),
                    };
                }
                // Pings are answered by the protocol layer; text frames
                // carry no file-manager traffic.
                _ => continue,
            }
        }
    }

    /// Encode and send one reply frame
    pub async fn send<T: Serialize>(&mut self, value: &T) -> Result<(), ChannelError> {
        send_frame(&mut self.ws, value).await
    }

    /// Tell the peer we are going away. Failures are ignored; the session is
    /// ending either way.
    pub async fn close(&mut self, reason: &str) {
        let _ = send_close(&mut self.ws, reason).await;
    }
}

/// Send one binary frame on a (possibly split) sink, bounded by
/// [`WRITE_DEADLINE`].
pub async fn send_binary<W>(sink: &mut W, payload: Vec<u8>) -> Result<(), ChannelError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    send_raw(sink, WsMessage::Binary(payload)).await
}

/// Encode `value` and send it as one binary frame
pub async fn send_frame<W, T>(sink: &mut W, value: &T) -> Result<(), ChannelError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
    T: Serialize,
{
    let payload = to_msgpack(value)?;
    send_raw(sink, WsMessage::Binary(payload)).await
}

pub async fn send_ping<W>(sink: &mut W) -> Result<(), ChannelError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    send_raw(sink, WsMessage::Ping(Vec::new())).await
}

/// Send a going-away close frame with `reason`
pub async fn send_close<W>(sink: &mut W, reason: &str) -> Result<(), ChannelError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    let frame = CloseFrame {
        code: CloseCode::Away,
        reason: reason.to_string().into(),
    };
    send_raw(sink, WsMessage::Close(Some(frame))).await
}

async fn send_raw<W>(sink: &mut W, frame: WsMessage) -> Result<(), ChannelError>
where
    W: Sink<WsMessage, Error = WsError> + Unpin,
{
    match tokio::time::timeout(WRITE_DEADLINE, sink.send(frame)).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ChannelError::Ws(e)),
        Err(_) => Err(ChannelError::WriteTimeout),
    }
}
