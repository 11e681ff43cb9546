//! Error types for the tether crate.

use crate::transport::{TransportError, WsError};

/// Unified error type for connection, hub and request operations
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Establishing the transport failed (retried until success, cancellation
    /// or the retry cap)
    #[error("Dial failed for {addr}: {source}")]
    Dial {
        addr: String,
        #[source]
        source: WsError,
    },

    /// The WebSocket opening handshake was rejected or broke off
    #[error("Handshake failed: {0}")]
    Handshake(#[source] WsError),

    #[error("Cancelled")]
    Cancelled,

    #[error("Read failed: {0}")]
    Read(#[source] TransportError),

    #[error("Read deadline exceeded")]
    DeadlineExceeded,

    #[error("Peer closed the connection")]
    PeerClosed,

    #[error("Write failed: {0}")]
    Write(#[source] TransportError),

    #[error("Send timed out")]
    SendTimeout,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Hub closed")]
    HubClosed,

    #[error("Decode failed: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("Encode failed: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Config error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config(message.into())
    }

    /// Whether the error ended the connection that produced it.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Error::Cancelled
                | Error::Read(_)
                | Error::DeadlineExceeded
                | Error::PeerClosed
                | Error::Write(_)
                | Error::SendTimeout
                | Error::ConnectionClosed
        )
    }

    /// Whether retrying the same operation may succeed.
    #[must_use]
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Dial { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
