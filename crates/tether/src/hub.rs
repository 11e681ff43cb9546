//! Connection registry and broadcast hub.
//!
//! A [`Hub`] tracks every connection accepted through [`Hub::serve`] and merges
//! their inbound messages into one stream of [`Request`]s. Registration,
//! unregistration, broadcasts and snapshots all travel over one command queue
//! and are applied by a single control loop ([`Hub::run`]), which is the only
//! code that touches the registry. Commands take effect in the order they were
//! issued.

use std::collections::HashMap;
use std::sync::{Arc, Weak};

use bytes::Bytes;
use futures_util::future::join_all;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Mutex, mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::config::{Config, ConnectionConfig};
use crate::connection::Connection;
use crate::emitter::Emitter;
use crate::error::{Error, Result};
use crate::ids::{HUB_KIND, IdGenerator};
use crate::request::Request;

/// Registry lifecycle events, emitted from the control loop in processing order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HubEvent {
    Registered { connection_id: String },
    Unregistered { connection_id: String },
    Stopped,
}

enum Command {
    Register(Connection),
    Unregister(Connection),
    Broadcast(Bytes),
    Snapshot(oneshot::Sender<Vec<String>>),
}

/// Cloneable handle to a hub
#[derive(Clone)]
pub struct Hub {
    inner: Arc<HubInner>,
}

#[derive(Clone)]
pub(crate) struct WeakHub {
    inner: Weak<HubInner>,
}

struct HubInner {
    id: String,
    ids: IdGenerator,
    config: ConnectionConfig,
    cancel: CancellationToken,
    commands: mpsc::Sender<Command>,
    control: Mutex<mpsc::Receiver<Command>>,
    requests: mpsc::Sender<Request>,
    events: Emitter<HubEvent>,
}

impl Hub {
    /// Create a hub and the receiving end of its request stream.
    ///
    /// The hub's scope is a child of `parent` and is the parent of every
    /// connection it serves. Nothing is processed until [`Hub::run`] is polled.
    #[must_use]
    pub fn new(
        parent: &CancellationToken,
        ids: IdGenerator,
        config: &Config,
    ) -> (Self, mpsc::Receiver<Request>) {
        let (commands, control) = mpsc::channel(config.hub.command_capacity.max(1));
        let (requests, requests_rx) = mpsc::channel(config.hub.request_capacity.max(1));

        let inner = HubInner {
            id: ids.next(HUB_KIND),
            ids,
            config: config.connection.clone(),
            cancel: parent.child_token(),
            commands,
            control: Mutex::new(control),
            requests,
            events: Emitter::new(),
        };

        (
            Self {
                inner: Arc::new(inner),
            },
            requests_rx,
        )
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Registry lifecycle events. Handlers run inside the control loop and
    /// should return quickly.
    #[must_use]
    pub fn events(&self) -> &Emitter<HubEvent> {
        &self.inner.events
    }

    #[must_use]
    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.inner.cancel.is_cancelled()
    }

    /// Cancel the hub's scope. The control loop exits and every connection it
    /// served closes through its own cancellation.
    pub fn stop(&self) {
        debug!("[{}] stop", self.id());
        self.inner.cancel.cancel();
    }

    pub(crate) fn downgrade(&self) -> WeakHub {
        WeakHub {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Run the control loop until the hub is stopped.
    ///
    /// Only one loop runs per hub; a second call returns at once.
    pub async fn run(&self) {
        let Ok(mut control) = self.inner.control.try_lock() else {
            warn!("[{}] control loop already running", self.id());
            return;
        };
        let mut registry: HashMap<String, Connection> = HashMap::new();
        info!("[{}] hub running", self.id());

        loop {
            let command = tokio::select! {
                biased;
                () = self.inner.cancel.cancelled() => break,
                command = control.recv() => command,
            };
            let Some(command) = command else {
                break;
            };

            match command {
                Command::Register(conn) => self.handle_register(&mut registry, conn),
                Command::Unregister(conn) => self.handle_unregister(&mut registry, &conn).await,
                Command::Broadcast(data) => self.handle_broadcast(&registry, &data).await,
                Command::Snapshot(reply) => {
                    let mut ids: Vec<String> = registry.keys().cloned().collect();
                    ids.sort();
                    let _ = reply.send(ids);
                }
            }
        }

        info!(
            "[{}] hub stopped with {} connections registered",
            self.id(),
            registry.len()
        );
        self.inner.events.emit(&HubEvent::Stopped);
    }

    fn handle_register(&self, registry: &mut HashMap<String, Connection>, conn: Connection) {
        if conn.is_cancelled() {
            debug!(
                "[{}] skip register of stopped conn: {}",
                self.id(),
                conn.id()
            );
            return;
        }
        if let Some(existing) = registry.get(conn.id()) {
            if *existing != conn {
                warn!(
                    "[{}] refusing conn {}: id already registered by another connection",
                    self.id(),
                    conn.id()
                );
            }
            return;
        }

        info!("[{}] register conn: {}", self.id(), conn.id());
        let connection_id = conn.id().to_string();
        registry.insert(connection_id.clone(), conn);
        self.inner
            .events
            .emit(&HubEvent::Registered { connection_id });
    }

    async fn handle_unregister(&self, registry: &mut HashMap<String, Connection>, conn: &Connection) {
        // Ids come from the caller's generator, so match the instance too
        if registry.get(conn.id()) != Some(conn) {
            return;
        }
        let Some(conn) = registry.remove(conn.id()) else {
            return;
        };

        info!("[{}] unregister conn: {}", self.id(), conn.id());
        conn.stop().await;
        self.inner.events.emit(&HubEvent::Unregistered {
            connection_id: conn.id().to_string(),
        });
    }

    /// Write to every member concurrently and wait for all attempts, so two
    /// broadcasts never overtake each other on any connection. A failed write
    /// tears down only its own connection.
    async fn handle_broadcast(&self, registry: &HashMap<String, Connection>, data: &Bytes) {
        trace!(
            "[{}] broadcast {} bytes to {} connections",
            self.id(),
            data.len(),
            registry.len()
        );

        let sends = registry.values().map(|conn| async move {
            if let Err(e) = conn.write(data.clone()).await {
                debug!("[{}] broadcast to {} failed: {}", self.id(), conn.id(), e);
            }
        });
        join_all(sends).await;
    }

    /// Accept an established socket: run the WebSocket upgrade, start the
    /// receive pump and unregister-on-close watcher, then register it.
    ///
    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped, or the handshake
    /// error (`Error::Handshake`, `Error::SendTimeout`) if the upgrade fails.
    /// The socket is closed in both cases.
    pub async fn serve<S>(&self, socket: S) -> Result<Connection>
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        if self.is_stopped() {
            return Err(Error::HubClosed);
        }
        let upgraded =
            Connection::accept(socket, &self.inner.cancel, &self.inner.ids, &self.inner.config)
                .await;
        let conn = match upgraded {
            Ok(conn) => conn,
            Err(Error::Cancelled) => return Err(Error::HubClosed),
            Err(e) => {
                debug!("[{}] upgrade failed: {}", self.id(), e);
                return Err(e);
            }
        };
        debug!("[{}] new connection: {}", self.id(), conn.id());

        let hub = self.clone();
        let watched = conn.clone();
        tokio::spawn(async move {
            watched.done().await;
            debug!("[{}] conn done: {}", hub.id(), watched.id());
            let _ = hub.unregister(watched).await;
        });

        tokio::spawn(self.clone().pump(conn.clone()));

        self.register(conn.clone()).await?;
        Ok(conn)
    }

    /// Read from `conn` until it fails, forwarding every message as a request.
    async fn pump(self, conn: Connection) {
        loop {
            match conn.read().await {
                Ok(data) => {
                    let request = Request::new(data, &conn, self.downgrade());
                    if !self.push_request(request).await {
                        break;
                    }
                }
                Err(Error::Cancelled) => break,
                Err(e) => {
                    debug!("[{}] read error on {}: {}", self.id(), conn.id(), e);
                    let request = Request::failed(e, &conn, self.downgrade());
                    self.push_request(request).await;
                    break;
                }
            }
        }

        let _ = self.unregister(conn).await;
    }

    async fn push_request(&self, request: Request) -> bool {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => false,
            sent = self.inner.requests.send(request) => sent.is_ok(),
        }
    }

    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped.
    pub async fn register(&self, conn: Connection) -> Result<()> {
        self.send_command(Command::Register(conn)).await
    }

    /// Remove `conn` and stop it. Unregistering a connection that is not
    /// registered does nothing.
    ///
    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped.
    pub async fn unregister(&self, conn: Connection) -> Result<()> {
        self.send_command(Command::Unregister(conn)).await
    }

    /// Queue `data` for delivery to every registered connection.
    ///
    /// Delivery is fire-and-forget per connection.
    ///
    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped.
    pub async fn broadcast(&self, data: impl Into<Bytes>) -> Result<()> {
        self.send_command(Command::Broadcast(data.into())).await
    }

    /// # Errors
    ///
    /// Returns `Error::Encode` if `value` cannot be serialized, or
    /// `Error::HubClosed` if the hub has stopped.
    pub async fn broadcast_encoded<T: Serialize + ?Sized>(&self, value: &T) -> Result<()> {
        let data = serde_json::to_vec(value).map_err(Error::Encode)?;
        self.broadcast(data).await
    }

    /// Ids of the registered connections, sorted.
    ///
    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped.
    pub async fn connection_ids(&self) -> Result<Vec<String>> {
        let (tx, rx) = oneshot::channel();
        self.send_command(Command::Snapshot(tx)).await?;
        rx.await.map_err(|_| Error::HubClosed)
    }

    /// # Errors
    ///
    /// Returns `Error::HubClosed` if the hub has stopped.
    pub async fn connection_count(&self) -> Result<usize> {
        Ok(self.connection_ids().await?.len())
    }

    async fn send_command(&self, command: Command) -> Result<()> {
        tokio::select! {
            biased;
            () = self.inner.cancel.cancelled() => Err(Error::HubClosed),
            sent = self.inner.commands.send(command) => sent.map_err(|_| Error::HubClosed),
        }
    }
}

impl std::fmt::Debug for Hub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("id", &self.inner.id)
            .field("stopped", &self.is_stopped())
            .finish_non_exhaustive()
    }
}

impl WeakHub {
    pub(crate) fn upgrade(&self) -> Option<Hub> {
        self.inner.upgrade().map(|inner| Hub { inner })
    }
}

impl std::fmt::Debug for WeakHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("WeakHub")
    }
}
