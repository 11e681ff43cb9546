//! WebSocket acceptor and counter request handler.

use tether::{Config, Error, Hub, IdGenerator, Request, Result};
use tether_types::CounterMessage;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Serve counter sessions on `listener` until `shutdown` fires.
///
/// Every accepted socket is upgraded on its own task, so a slow or broken
/// handshake never holds up the accept loop.
///
/// # Errors
///
/// Returns an error only if the hub stops unexpectedly while accepting.
pub async fn run(listener: TcpListener, config: Config, shutdown: CancellationToken) -> Result<()> {
    let (hub, requests) = Hub::new(&shutdown, IdGenerator::new(), &config);

    let control = tokio::spawn({
        let hub = hub.clone();
        async move { hub.run().await }
    });
    let handler = tokio::spawn(handle_counter_requests(requests));

    if let Ok(addr) = listener.local_addr() {
        info!("Listening on {}", addr);
    }

    let result = loop {
        let accepted = tokio::select! {
            () = shutdown.cancelled() => break Ok(()),
            accepted = listener.accept() => accepted,
        };

        match accepted {
            Ok((stream, peer)) => {
                debug!("Accepted connection from {}", peer);
                if let Err(e) = stream.set_nodelay(true) {
                    warn!("Failed to set TCP_NODELAY for {}: {}", peer, e);
                }
                if hub.is_stopped() {
                    break if shutdown.is_cancelled() {
                        Ok(())
                    } else {
                        Err(Error::HubClosed)
                    };
                }
                let hub = hub.clone();
                tokio::spawn(async move {
                    match hub.serve(stream).await {
                        Ok(conn) => debug!("Serving {} as {}", peer, conn.id()),
                        Err(Error::HubClosed) => debug!("Dropped {}: hub closed", peer),
                        Err(e) => warn!("Upgrade for {} failed: {}", peer, e),
                    }
                });
            }
            Err(e) => error!("Accept error: {}", e),
        }
    };

    hub.stop();
    drop(hub);
    let _ = control.await;
    // The handler ends once every pump has released the hub
    let _ = handler.await;
    info!("Server stopped");
    result
}

/// Answer every counter message with the incremented count.
///
/// Error requests and undecodable payloads are skipped. Returns once the hub
/// drops its request stream.
pub async fn handle_counter_requests(mut requests: mpsc::Receiver<Request>) {
    while let Some(request) = requests.recv().await {
        if let Some(e) = request.error() {
            debug!("Skipping failed read from {}: {}", request.origin_id(), e);
            continue;
        }

        let msg: CounterMessage = match request.decode() {
            Ok(msg) => msg,
            Err(e) => {
                warn!("Unmarshal message from {} failed: {}", request.origin_id(), e);
                continue;
            }
        };

        debug!("Server received: {}", msg.count);
        let reply = msg.incremented();
        debug!("Server send: {}", reply.count);

        if let Err(e) = request.reply_encoded(&reply).await {
            debug!("Reply to {} failed: {}", request.origin_id(), e);
        }
    }
}
