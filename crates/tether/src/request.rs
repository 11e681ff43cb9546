//! Inbound message envelope.

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

use crate::connection::{Connection, WeakConnection};
use crate::error::{Error, Result};
use crate::hub::WeakHub;

/// One message received by a hub, with enough context to answer it.
///
/// A request holds only weak references: it never keeps its connection or hub
/// alive. When the read that produced it failed, [`Request::error`] is set and
/// the payload is empty.
#[derive(Debug)]
pub struct Request {
    payload: Bytes,
    origin: WeakConnection,
    hub: WeakHub,
    error: Option<Error>,
}

impl Request {
    pub(crate) fn new(payload: Bytes, origin: &Connection, hub: WeakHub) -> Self {
        Self {
            payload,
            origin: origin.downgrade(),
            hub,
            error: None,
        }
    }

    pub(crate) fn failed(error: Error, origin: &Connection, hub: WeakHub) -> Self {
        Self {
            payload: Bytes::new(),
            origin: origin.downgrade(),
            hub,
            error: Some(error),
        }
    }

    #[must_use]
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    #[must_use]
    pub fn as_raw(&self) -> &[u8] {
        &self.payload
    }

    /// Decode the payload from JSON. The request is left untouched on failure.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the payload is not a valid `T`.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T> {
        serde_json::from_slice(&self.payload).map_err(Error::Decode)
    }

    #[must_use]
    pub fn error(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    #[must_use]
    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    #[must_use]
    pub fn origin_id(&self) -> &str {
        self.origin.id()
    }

    /// The originating connection, if any handle to it is still alive.
    #[must_use]
    pub fn origin(&self) -> Option<Connection> {
        self.origin.upgrade()
    }

    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` if the origin is gone, otherwise the
    /// same errors as [`Connection::write`].
    pub async fn reply(&self, data: impl Into<Bytes>) -> Result<()> {
        let origin = self.origin().ok_or(Error::ConnectionClosed)?;
        origin.write(data).await
    }

    /// # Errors
    ///
    /// Returns `Error::Encode` if `value` cannot be serialized, otherwise the
    /// same errors as [`Request::reply`].
    pub async fn reply_encoded<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let origin = self.origin().ok_or(Error::ConnectionClosed)?;
        origin.write_encoded(value).await
    }

    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub is gone or stopped.
    pub async fn broadcast(&self, data: impl Into<Bytes>) -> Result<()> {
        let hub = self.hub.upgrade().ok_or(Error::HubClosed)?;
        hub.broadcast(data).await
    }

    /// # Errors
    ///
    /// Returns `Error::Encode` if `value` cannot be serialized, otherwise the
    /// same errors as [`Request::broadcast`].
    pub async fn broadcast_encoded<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let hub = self.hub.upgrade().ok_or(Error::HubClosed)?;
        hub.broadcast_encoded(value).await
    }
}
