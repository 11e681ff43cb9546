//! tether counter client.
//!
//! Dials the server, sends `{count: 0}` and keeps answering with the next
//! count until it reaches `--max-count`, the session times out, or Ctrl-C.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use clap::Parser;
use tether::{Config, Connection, IdGenerator, dial};
use tether_types::CounterMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Counter client - plays the counting game against tether-server
#[derive(Parser, Debug)]
#[command(name = "tether")]
#[command(version, about, long_about = None)]
struct Args {
    /// Server WebSocket URL
    #[arg(long, default_value = "ws://127.0.0.1:8080")]
    addr: String,

    /// Stop once the server's count reaches this value
    #[arg(long, default_value_t = 100_000)]
    max_count: u64,

    /// Give up after this many seconds
    #[arg(long, default_value_t = 10)]
    timeout_secs: u64,

    /// JSON config file (defaults are used when absent)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,
}

fn setup_logging() {
    let level = if std::env::var("DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tether={level}")));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Read, increment and write until the count reaches `max_count`.
async fn count_up(conn: &Connection, max_count: u64) -> tether::Result<u64> {
    conn.write_encoded(&CounterMessage::default()).await?;

    loop {
        debug!("waiting for message");
        let msg: CounterMessage = conn.read_decoded().await?;
        debug!("count: {}", msg.count);
        if msg.reached(max_count) {
            return Ok(msg.count);
        }
        conn.write_encoded(&msg.incremented()).await?;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    setup_logging();

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let scope = CancellationToken::new();
    tokio::spawn({
        let scope = scope.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted");
            }
            scope.cancel();
        }
    });

    let conn = dial(&args.addr, &scope, &IdGenerator::new(), &config.connection)
        .await
        .with_context(|| format!("Failed to connect to {}", args.addr))?;

    let session = tokio::time::timeout(
        Duration::from_secs(args.timeout_secs),
        count_up(&conn, args.max_count),
    );

    match session.await {
        Ok(Ok(count)) => info!("client received {} messages, exit", count),
        Ok(Err(e)) => warn!("session ended: {}", e),
        Err(_) => info!("timeout after {}s", args.timeout_secs),
    }

    conn.stop().await;
    info!("client exit");
    Ok(())
}
