//! Duplex message connection over a WebSocket.
//!
//! A [`Connection`] owns both halves of one WebSocket. It keeps the peer alive
//! with periodic pings, fails reads once no pong has arrived within the
//! keepalive window, and tears itself down on any transport failure.
//!
//! All outbound messages (application data, pings and the final close) go
//! through a single write lock, so the socket never has two writers. Pong
//! replies are queued by the protocol engine and flushed inside the same
//! stream state. Teardown is idempotent: only the caller that moves the
//! connection out of [`ConnectionState::Open`] starts the close, and `Closed`
//! is published once.

use std::pin::Pin;
use std::sync::{Arc, PoisonError, Weak};
use std::time::Duration;

use bytes::Bytes;
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, watch};
use tokio::time::{Instant, MissedTickBehavior, timeout, timeout_at};
use tokio_tungstenite::WebSocketStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::ConnectionConfig;
use crate::error::{Error, Result};
use crate::ids::{CONNECTION_KIND, IdGenerator};
use crate::transport::{self, Role, TransportError, WsError, websocket_config};

type MessageSink = Pin<Box<dyn Sink<Message, Error = WsError> + Send>>;
type MessageStream = Pin<Box<dyn Stream<Item = std::result::Result<Message, WsError>> + Send>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Open,
    Closing,
    Closed,
}

/// Cloneable handle to one duplex connection
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

/// Non-owning reference to a [`Connection`]
#[derive(Clone)]
pub struct WeakConnection {
    id: String,
    inner: Weak<Inner>,
}

struct Inner {
    id: String,
    config: ConnectionConfig,
    cancel: CancellationToken,
    writer: Mutex<Option<MessageSink>>,
    reader: Mutex<Option<MessageStream>>,
    read_deadline: std::sync::Mutex<Instant>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    /// Wrap an established WebSocket and start its heartbeat.
    ///
    /// The connection's cancellation scope is a child of `parent`. Reads are
    /// driven by the caller.
    ///
    /// # Panics
    ///
    /// Panics if called outside a Tokio runtime.
    pub fn wrap<S>(
        ws: WebSocketStream<S>,
        parent: &CancellationToken,
        ids: &IdGenerator,
        config: &ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let (sink, stream) = ws.split();
        let sink: MessageSink = Box::pin(sink);
        let stream: MessageStream = Box::pin(stream);
        let (state, _) = watch::channel(ConnectionState::Open);

        let inner = Arc::new(Inner {
            id: ids.next(CONNECTION_KIND),
            config: config.clone(),
            cancel: parent.child_token(),
            writer: Mutex::new(Some(sink)),
            reader: Mutex::new(Some(stream)),
            read_deadline: std::sync::Mutex::new(Instant::now() + config.pong_wait()),
            state,
        });

        debug!("[{}] connection open", inner.id);

        tokio::spawn(heartbeat(
            Arc::downgrade(&inner),
            inner.cancel.clone(),
            config.ping_period(),
        ));

        Self { inner }
    }

    /// Wrap a socket whose WebSocket handshake already happened elsewhere,
    /// such as an upgraded HTTP connection.
    pub async fn from_raw_socket<S>(
        socket: S,
        role: Role,
        parent: &CancellationToken,
        ids: &IdGenerator,
        config: &ConnectionConfig,
    ) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ws_config = websocket_config(config.max_message_size);
        let ws = WebSocketStream::from_raw_socket(socket, role, Some(ws_config)).await;
        Self::wrap(ws, parent, ids, config)
    }

    /// Run the server side of the opening handshake on `socket`, then wrap it.
    ///
    /// # Errors
    ///
    /// Returns `Error::Handshake` if the peer's upgrade request is rejected,
    /// `Error::SendTimeout` if it does not complete within the send timeout,
    /// or `Error::Cancelled` if `parent` fires first.
    pub async fn accept<S>(
        socket: S,
        parent: &CancellationToken,
        ids: &IdGenerator,
        config: &ConnectionConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ws_config = websocket_config(config.max_message_size);
        let handshake = tokio_tungstenite::accept_async_with_config(socket, Some(ws_config));
        let ws = handshake_within(parent, config, handshake).await?;
        Ok(Self::wrap(ws, parent, ids, config))
    }

    /// Run the client side of the opening handshake for `url` over an
    /// established `socket`, then wrap it.
    ///
    /// # Errors
    ///
    /// Same as [`Connection::accept`].
    pub async fn connect<S>(
        url: &str,
        socket: S,
        parent: &CancellationToken,
        ids: &IdGenerator,
        config: &ConnectionConfig,
    ) -> Result<Self>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let ws_config = websocket_config(config.max_message_size);
        let handshake = async move {
            tokio_tungstenite::client_async_with_config(url, socket, Some(ws_config))
                .await
                .map(|(ws, _response)| ws)
        };
        let ws = handshake_within(parent, config, handshake).await?;
        Ok(Self::wrap(ws, parent, ids, config))
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    #[must_use]
    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// True once the connection has been told to stop, even if the close
    /// handshake is still in progress.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    #[must_use]
    pub fn downgrade(&self) -> WeakConnection {
        WeakConnection {
            id: self.inner.id.clone(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Resolves once the connection's cancellation scope has fired.
    pub async fn done(&self) {
        self.inner.cancel.cancelled().await;
    }

    /// Resolves once teardown has finished and the state is `Closed`.
    pub async fn closed(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == ConnectionState::Closed).await;
    }

    /// Send raw bytes as one data message.
    ///
    /// # Errors
    ///
    /// Returns `Error::ConnectionClosed` without touching the socket if the
    /// connection is stopping or stopped. Returns `Error::Write` or
    /// `Error::SendTimeout` if transmission fails; the connection is torn down
    /// before the error is returned.
    pub async fn write(&self, data: impl Into<Bytes>) -> Result<()> {
        let data = data.into();
        let max = self.inner.config.max_message_size;
        if data.len() <= max {
            return self.send_message(transport::data_message(data)).await;
        }
        if self.is_cancelled() {
            return Err(Error::ConnectionClosed);
        }

        let err = Error::Write(TransportError::MessageTooLarge {
            size: data.len(),
            max,
        });
        debug!("[{}] write error: {}", self.id(), err);
        self.teardown(&err.to_string()).await;
        Err(err)
    }

    /// Encode `value` as JSON and send it as one data message.
    ///
    /// # Errors
    ///
    /// Returns `Error::Encode` if serialization fails (the connection stays
    /// open), otherwise the same errors as [`Connection::write`].
    pub async fn write_encoded<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(Error::Encode)?;
        self.write(data).await
    }

    /// Wait for the next data message.
    ///
    /// Control frames are handled inline: pings are answered by the protocol
    /// engine, pongs extend the read deadline, a close frame ends the
    /// connection.
    ///
    /// # Errors
    ///
    /// Every error except `Error::ConnectionClosed` (already closed) tears the
    /// connection down: `Cancelled`, `DeadlineExceeded`, `PeerClosed` or
    /// `Read`.
    pub async fn read(&self) -> Result<Bytes> {
        let cancel = &self.inner.cancel;

        let mut reader = tokio::select! {
            biased;
            () = cancel.cancelled() => {
                self.teardown("cancelled").await;
                return Err(Error::Cancelled);
            }
            guard = self.inner.reader.lock() => guard,
        };

        let err = loop {
            let Some(stream) = reader.as_mut() else {
                return Err(Error::ConnectionClosed);
            };

            let deadline = self.read_deadline();
            let next = tokio::select! {
                biased;
                () = cancel.cancelled() => break Error::Cancelled,
                next = timeout_at(deadline, stream.next()) => next,
            };

            let message = match next {
                Err(_) => break Error::DeadlineExceeded,
                Ok(None) => break Error::PeerClosed,
                Ok(Some(Err(e))) if transport::is_hangup(&e) => break Error::PeerClosed,
                Ok(Some(Err(e))) => break Error::Read(e.into()),
                Ok(Some(Ok(message))) => message,
            };

            match message {
                Message::Text(text) => {
                    trace!("[{}] read {} bytes", self.id(), text.len());
                    return Ok(Bytes::copy_from_slice(text.as_bytes()));
                }
                Message::Binary(data) => {
                    trace!("[{}] read {} bytes", self.id(), data.len());
                    return Ok(data);
                }
                // The pong reply is already queued and goes out with the next flush
                Message::Ping(_) => trace!("[{}] handle ping", self.id()),
                Message::Pong(_) => {
                    let pong_wait = self.inner.config.pong_wait();
                    trace!("[{}] handle pong, deadline in {:?}", self.id(), pong_wait);
                    self.set_read_deadline(Instant::now() + pong_wait);
                }
                Message::Close(frame) => {
                    trace!("[{}] close frame: {:?}", self.id(), frame);
                    break Error::PeerClosed;
                }
                Message::Frame(_) => {}
            }
        };

        *reader = None;
        drop(reader);

        debug!("[{}] read error: {}", self.id(), err);
        self.teardown(&err.to_string()).await;
        Err(err)
    }

    /// Wait for the next data message and decode it from JSON.
    ///
    /// # Errors
    ///
    /// Returns `Error::Decode` if the message is not a valid `T`; the
    /// connection stays open. Otherwise the same errors as [`Connection::read`].
    pub async fn read_decoded<T: DeserializeOwned>(&self) -> Result<T> {
        let data = self.read().await?;
        serde_json::from_slice(&data).map_err(Error::Decode)
    }

    /// Stop the connection and wait until it is closed.
    pub async fn stop(&self) {
        debug!("[{}] stop", self.id());
        self.teardown("stopped").await;
        self.closed().await;
    }

    async fn send_message(&self, message: Message) -> Result<()> {
        let err = {
            let mut writer = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => return Err(Error::ConnectionClosed),
                guard = self.inner.writer.lock() => guard,
            };

            if self.inner.cancel.is_cancelled() {
                return Err(Error::ConnectionClosed);
            }
            let Some(sink) = writer.as_mut() else {
                return Err(Error::ConnectionClosed);
            };

            match timeout(self.inner.config.send_timeout(), sink.send(message)).await {
                Ok(Ok(())) => return Ok(()),
                Ok(Err(e)) => Error::Write(e.into()),
                Err(_) => Error::SendTimeout,
            }
        };

        debug!("[{}] write error: {}", self.id(), err);
        self.teardown(&err.to_string()).await;
        Err(err)
    }

    /// Cancel the scope and, for the first caller only, close the socket.
    async fn teardown(&self, reason: &str) {
        self.inner.cancel.cancel();

        let first = self.inner.state.send_if_modified(|state| {
            if *state == ConnectionState::Open {
                *state = ConnectionState::Closing;
                true
            } else {
                false
            }
        });
        if !first {
            return;
        }

        debug!("[{}] close: {}", self.id(), reason);

        // Detached so `Closed` is still published if this caller is dropped
        let closing = Self {
            inner: Arc::clone(&self.inner),
        };
        let close = tokio::spawn(async move { closing.close_transport().await });
        let _ = close.await;
    }

    /// Send the close frame and release both halves, bounded by the send
    /// timeout, then publish `Closed`.
    async fn close_transport(&self) {
        let send_timeout = self.inner.config.send_timeout();

        let closing = timeout(send_timeout, async {
            let Some(mut sink) = self.inner.writer.lock().await.take() else {
                return;
            };
            if let Err(e) = sink.close().await {
                trace!("[{}] close frame not sent: {}", self.id(), e);
            }
        });
        if closing.await.is_err() {
            trace!("[{}] close timed out", self.id());
        }

        // An in-flight read releases its half itself once it sees cancellation.
        if let Ok(mut reader) = self.inner.reader.try_lock() {
            reader.take();
        }

        self.inner.state.send_replace(ConnectionState::Closed);
        debug!("[{}] connection closed", self.id());
    }

    fn read_deadline(&self) -> Instant {
        *self
            .inner
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn set_read_deadline(&self, deadline: Instant) {
        *self
            .inner
            .read_deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = deadline;
    }
}

impl PartialEq for Connection {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Connection {}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.inner.id)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl WeakConnection {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub fn upgrade(&self) -> Option<Connection> {
        self.inner.upgrade().map(|inner| Connection { inner })
    }
}

impl std::fmt::Debug for WeakConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("WeakConnection").field(&self.id).finish()
    }
}

/// Drive an opening handshake, bounded by the send timeout and `parent`.
async fn handshake_within<S>(
    parent: &CancellationToken,
    config: &ConnectionConfig,
    handshake: impl Future<Output = std::result::Result<WebSocketStream<S>, WsError>>,
) -> Result<WebSocketStream<S>> {
    tokio::select! {
        biased;
        () = parent.cancelled() => Err(Error::Cancelled),
        result = timeout(config.send_timeout(), handshake) => match result {
            Ok(Ok(ws)) => Ok(ws),
            Ok(Err(e)) => Err(Error::Handshake(e)),
            Err(_) => Err(Error::SendTimeout),
        },
    }
}

/// Ping the peer every `period` until the scope fires, then close the socket.
async fn heartbeat(inner: Weak<Inner>, cancel: CancellationToken, period: Duration) {
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => {
                if let Some(inner) = inner.upgrade() {
                    Connection { inner }.teardown("cancelled").await;
                }
                return;
            }
            _ = ticker.tick() => {
                let Some(inner) = inner.upgrade() else {
                    return;
                };
                let conn = Connection { inner };
                trace!("[{}] write ping", conn.id());
                if let Err(e) = conn.send_message(Message::Ping(Bytes::new())).await {
                    debug!("[{}] heartbeat stopped: {}", conn.id(), e);
                    conn.teardown(&e.to_string()).await;
                    return;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{DuplexStream, duplex};

    async fn wrap_with(config: &ConnectionConfig) -> (Connection, DuplexStream, CancellationToken) {
        let (local, remote) = duplex(4096);
        let parent = CancellationToken::new();
        let conn =
            Connection::from_raw_socket(local, Role::Server, &parent, &IdGenerator::new(), config)
                .await;
        (conn, remote, parent)
    }

    async fn wrap_pair() -> (Connection, DuplexStream, CancellationToken) {
        wrap_with(&ConnectionConfig::default()).await
    }

    #[tokio::test]
    async fn test_new_connection_is_open() {
        let (conn, _remote, _parent) = wrap_pair().await;
        assert_eq!(conn.state(), ConnectionState::Open);
        assert_eq!(conn.id(), "conn-1");
        assert!(!conn.is_cancelled());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let (conn, _remote, _parent) = wrap_pair().await;
        conn.stop().await;
        conn.stop().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
        assert!(conn.is_cancelled());
    }

    #[tokio::test]
    async fn test_parent_cancel_closes_connection() {
        let (conn, _remote, parent) = wrap_pair().await;
        parent.cancel();
        conn.closed().await;
        assert_eq!(conn.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_weak_reference_does_not_keep_connection() {
        let (conn, _remote, _parent) = wrap_pair().await;
        let weak = conn.downgrade();
        assert_eq!(weak.upgrade().as_ref(), Some(&conn));
        assert_eq!(weak.id(), conn.id());

        conn.stop().await;
        drop(conn);
        assert!(weak.upgrade().is_none());
    }

    #[tokio::test]
    async fn test_write_after_stop_is_connection_closed() {
        let (conn, _remote, _parent) = wrap_pair().await;
        conn.stop().await;
        let err = conn.write(Bytes::from_static(b"late")).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));

        let err = conn.write(vec![0u8; 4096]).await.unwrap_err();
        assert!(matches!(err, Error::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_huge_pong_wait_is_clamped() {
        let config = ConnectionConfig {
            pong_wait_ms: u64::MAX,
            ..ConnectionConfig::default()
        };
        let (conn, _remote, _parent) = wrap_with(&config).await;
        assert_eq!(conn.state(), ConnectionState::Open);
        assert!(conn.read_deadline() > Instant::now() + Duration::from_secs(3600));

        conn.stop().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_handshake_cancelled_by_parent() {
        let (local, _remote) = duplex(4096);
        let parent = CancellationToken::new();
        parent.cancel();

        let err = Connection::accept(local, &parent, &IdGenerator::new(), &ConnectionConfig::default())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_handshake_rejects_non_websocket_peer() {
        use tokio::io::AsyncWriteExt;

        let (local, mut remote) = duplex(4096);
        remote
            .write_all(b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n")
            .await
            .unwrap();

        let err = Connection::accept(
            local,
            &CancellationToken::new(),
            &IdGenerator::new(),
            &ConnectionConfig::default(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Handshake(_)), "got {err:?}");
    }
}
