//! WebSocket transport glue.
//!
//! Connections speak RFC 6455 through tokio-tungstenite. Application payloads
//! travel as text messages (binary when they are not valid UTF-8); ping, pong
//! and close are the protocol's own control frames. This module holds the
//! pieces shared by the handshake helpers and the connection itself: the
//! protocol configuration, the mapping from payloads to messages and the
//! transport error type.

use bytes::Bytes;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::error::{CapacityError, ProtocolError};
use tokio_tungstenite::tungstenite::protocol::WebSocketConfig;

pub use tokio_tungstenite::tungstenite::Error as WsError;
pub use tokio_tungstenite::tungstenite::protocol::Role;

/// Default maximum message size in bytes
pub const DEFAULT_MAX_PAYLOAD: usize = 512;

/// Protocol settings for a connection whose messages are capped at
/// `max_message_size` bytes. Larger inbound messages fail the read.
#[must_use]
pub fn websocket_config(max_message_size: usize) -> WebSocketConfig {
    let mut config = WebSocketConfig::default();
    config.max_message_size = Some(max_message_size);
    config.max_frame_size = Some(max_message_size);
    config
}

/// Errors raised by the WebSocket layer while a connection is open
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("WebSocket error: {0}")]
    WebSocket(#[source] WsError),

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },
}

impl From<WsError> for TransportError {
    fn from(err: WsError) -> Self {
        match err {
            WsError::Capacity(CapacityError::MessageTooLong { size, max_size }) => {
                Self::MessageTooLarge {
                    size,
                    max: max_size,
                }
            }
            other => Self::WebSocket(other),
        }
    }
}

/// Wrap an application payload as one data message.
pub(crate) fn data_message(data: Bytes) -> Message {
    match std::str::from_utf8(&data) {
        Ok(text) => Message::Text(text.into()),
        Err(_) => Message::Binary(data),
    }
}

/// Whether `err` means the peer went away rather than misbehaved.
pub(crate) fn is_hangup(err: &WsError) -> bool {
    match err {
        WsError::ConnectionClosed
        | WsError::AlreadyClosed
        | WsError::Protocol(ProtocolError::ResetWithoutClosingHandshake) => true,
        WsError::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::UnexpectedEof
                | std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::BrokenPipe
        ),
        _ => false,
    }
}
