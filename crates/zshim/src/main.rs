//! zshim - registration shim binary.
//!
//! Loads the workload list from a YAML configuration document, starts the
//! registration listener, and blocks until shutdown completes. SIGINT and
//! SIGTERM both initiate shutdown; the process exits only once the accept
//! loop has fully stopped.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use zshim::{Config, ShimConfig};

/// Workload registration shim for a shared-mode traffic proxy.
#[derive(Parser, Debug)]
#[command(name = "zshim")]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file enumerating workloads.
    config: PathBuf,

    /// Override the socket path from the configuration file.
    #[arg(long)]
    socket: Option<PathBuf>,

    /// Log level filter when RUST_LOG is not set (trace, debug, info, warn,
    /// error).
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(&args.log_level);

    let mut config = Config::load(&args.config)
        .with_context(|| format!("failed to load config from {}", args.config.display()))?;
    if let Some(socket) = args.socket {
        config.socket_path = socket;
    }

    info!(
        socket_path = %config.socket_path.display(),
        workloads = config.workloads.len(),
        "starting registration shim"
    );

    let cancel = CancellationToken::new();
    let signal_cancel = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("shutdown signal received");
        signal_cancel.cancel();
    });

    let handle = zshim::start(ShimConfig::new(config.socket_path), config.workloads, cancel)
        .context("failed to start registration shim")?;

    // Cancellation only stops the listener; actual termination is the accept
    // loop finishing.
    handle.wait().await;

    Ok(())
}

async fn shutdown_signal() {
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                term.recv().await;
            }
            Err(err) => {
                error!(error = %err, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(err) = result {
                error!(error = %err, "failed to listen for shutdown signal");
            }
        }
        () = term => {}
    }
}

fn init_tracing(default_level: &str) {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
