//! Gateway Daemon - Streamed Chat Inference over WebSocket
//!
//! Entry point for the chat gateway. Clients connect with a WebSocket,
//! send `message` frames and receive `start` / `chunk` / `end` events while
//! the model runtime generates on worker threads.
//!
//! # Usage
//!
//! ```bash
//! # Start with defaults (127.0.0.1:8765, Ollama at localhost:11434)
//! gateway-daemon
//!
//! # Scripted runtime, no model server required
//! gateway-daemon --runtime scripted
//!
//! # Custom listen address and config file
//! gateway-daemon --bind 0.0.0.0:9000 --config /etc/chat-gateway/gateway.toml
//!
//! # Verbose logging
//! RUST_LOG=debug gateway-daemon
//! ```
//!
//! # Signals
//!
//! - `SIGTERM` / `SIGINT`: Graceful shutdown
//! - `SIGHUP`: Log a reload request with current load

mod server;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::{error, info};

use gateway_core::{load_config, load_config_from_path, ConfigOverrides, RuntimeKind};
use server::DaemonServer;

/// Gateway Daemon - streamed chat inference over WebSocket
#[derive(Parser, Debug)]
#[command(name = "gateway-daemon")]
#[command(author, version, about, long_about = None)]
pub struct Args {
    /// Listen address for WebSocket clients
    #[arg(short = 'b', long, value_name = "ADDR")]
    bind: Option<SocketAddr>,

    /// Configuration file path
    #[arg(short = 'c', long, env = "GATEWAY_CONFIG", value_name = "FILE")]
    config: Option<PathBuf>,

    /// Model runtime (ollama, scripted)
    #[arg(short = 'r', long, value_name = "RUNTIME")]
    runtime: Option<RuntimeKind>,

    /// Model name
    #[arg(short = 'm', long, value_name = "NAME")]
    model: Option<String>,

    /// Maximum concurrent generation calls
    #[arg(long, value_name = "N")]
    max_concurrent: Option<usize>,

    /// Disable heartbeat monitoring
    #[arg(long)]
    no_heartbeat: bool,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short = 'l', long, env = "GATEWAY_LOG_LEVEL", default_value = "info")]
    log_level: String,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        let mut overrides = ConfigOverrides::new();
        if let Some(bind) = self.bind {
            overrides = overrides.with_bind(bind);
        }
        if let Some(runtime) = self.runtime {
            overrides = overrides.with_runtime(runtime);
        }
        if let Some(ref model) = self.model {
            overrides = overrides.with_model(model.clone());
        }
        if let Some(n) = self.max_concurrent {
            overrides = overrides.with_max_concurrent(n);
        }
        if self.no_heartbeat {
            overrides = overrides.with_heartbeat_enabled(false);
        }
        overrides
    }
}

/// Initialize logging with the specified level
fn init_logging(level: &str) -> Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!("gateway_daemon={level},gateway_core={level}"))
    });

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .try_init()
        .map_err(|e| anyhow::anyhow!("Failed to install log subscriber: {e}"))
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args.log_level)?;

    info!("Gateway daemon starting");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!("PID: {}", std::process::id());

    let mut config = match args.config.clone() {
        Some(path) => load_config_from_path(Some(path)),
        None => load_config(),
    }
    .context("Failed to load configuration")?;
    args.overrides()
        .apply(&mut config)
        .context("Invalid command-line option")?;

    info!(
        source = %config.source(),
        config_file = ?config.config_file_path,
        bind = %config.server.bind,
        heartbeat = config.heartbeat.enabled,
        "Configuration resolved"
    );

    // Setup signal handlers
    let shutdown = Arc::new(AtomicBool::new(false));
    let reload_config = Arc::new(AtomicBool::new(false));

    let mut sigterm = signal(SignalKind::terminate()).context("Failed to install SIGTERM handler")?;
    let mut sigint = signal(SignalKind::interrupt()).context("Failed to install SIGINT handler")?;
    let mut sighup = signal(SignalKind::hangup()).context("Failed to install SIGHUP handler")?;

    let shutdown_clone = Arc::clone(&shutdown);
    let reload_clone = Arc::clone(&reload_config);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, initiating shutdown");
                    shutdown_clone.store(true, Ordering::SeqCst);
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, marking config for reload");
                    reload_clone.store(true, Ordering::SeqCst);
                }
            }
        }
    });

    let mut server = DaemonServer::new(config);
    let result = server.run(shutdown, reload_config).await;

    match result {
        Ok(()) => {
            info!(
                remaining = server.connection_count(),
                "Gateway daemon stopped cleanly"
            );
            Ok(())
        }
        Err(e) => {
            error!(error = %e, "Daemon stopped with error");
            Err(e)
        }
    }
}
