//! Initiator side: open a WebSocket to a `ws://` URL, retrying until it succeeds.

use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::ConnectionConfig;
use crate::connection::Connection;
use crate::error::{Error, Result};
use crate::ids::IdGenerator;
use crate::transport::{WsError, websocket_config};

/// Connect to `url` and wrap the WebSocket in a [`Connection`].
///
/// The first attempt is immediate. Failed attempts are retried according to
/// `config.retry`; by default that is forever, once per second. A malformed
/// URL is not retried.
///
/// # Errors
///
/// Returns `Error::Cancelled` if `parent` fires before a connection is made,
/// or `Error::Dial` with the last failure once the retry policy gives up or
/// the URL cannot be used.
pub async fn dial(
    url: &str,
    parent: &CancellationToken,
    ids: &IdGenerator,
    config: &ConnectionConfig,
) -> Result<Connection> {
    let policy = &config.retry;
    let mut attempts: u32 = 0;

    loop {
        attempts = attempts.saturating_add(1);
        debug!("dial: {} (attempt {})", url, attempts);

        let ws_config = websocket_config(config.max_message_size);
        let connected = tokio::select! {
            biased;
            () = parent.cancelled() => return Err(Error::Cancelled),
            result = tokio_tungstenite::connect_async_with_config(url, Some(ws_config), true) => result,
        };

        let err = match connected {
            Ok((ws, _response)) => {
                info!("connected to: {}", url);
                return Ok(Connection::wrap(ws, parent, ids, config));
            }
            Err(e) => e,
        };

        let malformed = matches!(err, WsError::Url(_) | WsError::HttpFormat(_));
        if malformed || !policy.allows_attempt(attempts) {
            return Err(Error::Dial {
                addr: url.to_string(),
                source: err,
            });
        }

        let delay = policy.delay(attempts);
        debug!("dial: {} failed: {}, retrying in {:?}", url, err, delay);

        tokio::select! {
            biased;
            () = parent.cancelled() => return Err(Error::Cancelled),
            () = tokio::time::sleep(delay) => {}
        }
    }
}
