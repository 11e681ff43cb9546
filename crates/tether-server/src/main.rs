//! tether-server entry point.

use std::path::{Path, PathBuf};

use anyhow::Context;
use clap::Parser;
use tether::Config;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Counter server - answers every count with the next one
#[derive(Parser, Debug)]
#[command(name = "tether-server")]
#[command(version, about, long_about = None)]
struct Args {
    /// Address to listen on
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: String,

    /// JSON config file (defaults are used when absent)
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Also write logs to a timestamped file in this directory
    #[arg(long, value_name = "DIR")]
    log_dir: Option<PathBuf>,
}

/// Set up logging to stderr, plus a log file when `log_dir` is given.
/// `RUST_LOG` wins; otherwise `DEBUG=1` selects debug level.
fn setup_logging(log_dir: Option<&Path>) -> Option<WorkerGuard> {
    let level = if std::env::var("DEBUG").is_ok_and(|v| v == "1") {
        "debug"
    } else {
        "info"
    };

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("tether={level},tether_server={level}")));

    let stderr_layer = fmt::layer()
        .with_writer(std::io::stderr)
        .with_target(true);

    let Some(dir) = log_dir else {
        tracing_subscriber::registry()
            .with(stderr_layer)
            .with(filter)
            .init();
        return None;
    };

    let timestamp = chrono::Local::now().format("%Y%m%d_%H%M%S");
    let log_filename = format!("tether-server-{timestamp}.log");
    let file_appender = tracing_appender::rolling::never(dir, &log_filename);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let file_layer = fmt::layer()
        .with_writer(non_blocking)
        .with_ansi(false)
        .with_target(true)
        .with_line_number(true);

    tracing_subscriber::registry()
        .with(stderr_layer)
        .with(file_layer)
        .with(filter)
        .init();

    eprintln!("Logging to: {} (and stderr)", dir.join(&log_filename).display());
    Some(guard)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let _guard = setup_logging(args.log_dir.as_deref());

    let config = match &args.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => Config::default(),
    };

    let listener = TcpListener::bind(&args.addr)
        .await
        .with_context(|| format!("Failed to listen on {}", args.addr))?;

    let shutdown = CancellationToken::new();
    tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, shutting down");
            }
            shutdown.cancel();
        }
    });

    tether_server::run(listener, config, shutdown).await?;
    Ok(())
}
