//! Duplex message connections with heartbeat liveness and a broadcast hub.
//!
//! # Architecture
//!
//! - [`connection`]: [`Connection`], a duplex WebSocket with ping/pong
//!   keepalive, serialized writes and idempotent teardown
//! - [`dial`]: initiator side, opens a `ws://` URL with a configurable retry policy
//! - [`hub`]: [`Hub`], a registry of served connections that merges their
//!   messages into one [`Request`] stream and fans broadcasts out to all of them
//! - [`request`]: the envelope handed to application handlers
//! - [`transport`]: WebSocket protocol settings and transport errors
//! - [`config`], [`error`], [`ids`], [`emitter`]: supporting types
//!
//! # Example
//!
//! ```no_run
//! use tether::{Config, Hub, IdGenerator};
//! use tokio::net::TcpListener;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> tether::Result<()> {
//! let shutdown = CancellationToken::new();
//! let (hub, mut requests) = Hub::new(&shutdown, IdGenerator::new(), &Config::default());
//! tokio::spawn({
//!     let hub = hub.clone();
//!     async move { hub.run().await }
//! });
//!
//! // Echo every message back to its sender
//! tokio::spawn(async move {
//!     while let Some(request) = requests.recv().await {
//!         if !request.is_error() {
//!             let _ = request.reply(request.payload().clone()).await;
//!         }
//!     }
//! });
//!
//! let listener = TcpListener::bind("127.0.0.1:8080").await?;
//! loop {
//!     let (socket, _) = listener.accept().await?;
//!     let hub = hub.clone();
//!     tokio::spawn(async move { hub.serve(socket).await });
//! }
//! # }
//! ```

pub mod config;
pub mod connection;
pub mod dial;
pub mod emitter;
pub mod error;
pub mod hub;
pub mod ids;
pub mod request;
pub mod transport;

pub use config::{Config, ConnectionConfig, HubConfig, MAX_PONG_WAIT_MS, RetryPolicy};
pub use connection::{Connection, ConnectionState, WeakConnection};
pub use dial::dial;
pub use emitter::{Emitter, Subscription};
pub use error::{Error, Result};
pub use hub::{Hub, HubEvent};
pub use ids::IdGenerator;
pub use request::Request;
pub use transport::{DEFAULT_MAX_PAYLOAD, Role, TransportError, WsError, websocket_config};
