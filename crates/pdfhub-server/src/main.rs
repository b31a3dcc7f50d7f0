//! PDF Hub WebSocket backend: entry point.
//!
//! Listens for the embedded viewer's WebSocket connection and answers its
//! JSON requests.  The PDF, library and bookmark handlers are registered by
//! the application embedding this server; the binary itself ships the
//! built-in `ping`, `echo` and `server_info` handlers so the channel can be
//! exercised on its own.
//!
//! # Usage
//!
//! ```text
//! pdfhub-server [OPTIONS]
//!
//! Options:
//!   --host            <IP>    Listen address [default: 127.0.0.1]
//!   --port            <PORT>  Listen port [default: 8765]
//!   --heartbeat-secs  <SECS>  Heartbeat interval [default: 30]
//!   --max-frame-bytes <N>     Largest accepted message [default: 16777216]
//!   --config          <PATH>  Optional TOML config file
//! ```
//!
//! # Precedence
//!
//! Command-line flag, then environment variable, then config file, then the
//! built-in default.
//!
//! | Variable                  | Flag                |
//! |---------------------------|---------------------|
//! | `PDFHUB_HOST`             | `--host`            |
//! | `PDFHUB_PORT`             | `--port`            |
//! | `PDFHUB_HEARTBEAT_SECS`   | `--heartbeat-secs`  |
//! | `PDFHUB_MAX_FRAME_BYTES`  | `--max-frame-bytes` |
//! | `PDFHUB_CONFIG`           | `--config`          |

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::Parser;
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use pdfhub_server::application::{handler_fn, HandlerRegistry, MessageRouter};
use pdfhub_server::domain::{ConnectionEvent, ServerConfig};
use pdfhub_server::infrastructure::{load_config, ConnectionManager};

// ── CLI argument definitions ──────────────────────────────────────────────────

/// PDF Hub WebSocket backend.
#[derive(Debug, Parser)]
#[command(
    name = "pdfhub-server",
    about = "Local WebSocket backend for the PDF Hub viewer",
    version
)]
struct Cli {
    /// IP address to listen on.  Keep the loopback default unless the viewer
    /// runs on another machine; the channel is unauthenticated.
    #[arg(long, env = "PDFHUB_HOST")]
    host: Option<String>,

    /// TCP port to listen on.  `0` picks a free port.
    #[arg(long, env = "PDFHUB_PORT")]
    port: Option<u16>,

    /// Seconds between `{"type":"ping"}` heartbeats on each connection.
    #[arg(long, env = "PDFHUB_HEARTBEAT_SECS")]
    heartbeat_secs: Option<u64>,

    /// Largest accepted message payload in bytes.
    #[arg(long, env = "PDFHUB_MAX_FRAME_BYTES")]
    max_frame_bytes: Option<usize>,

    /// Path to a TOML config file with a `[server]` table.
    #[arg(long, env = "PDFHUB_CONFIG")]
    config: Option<PathBuf>,
}

impl Cli {
    /// Builds the effective [`ServerConfig`]: file values over defaults, then
    /// CLI values over both.
    ///
    /// # Errors
    ///
    /// Returns an error if the config file cannot be loaded, `--host` is not
    /// an IP address, or `--heartbeat-secs` is zero.
    fn into_server_config(self) -> anyhow::Result<ServerConfig> {
        let mut config = match &self.config {
            Some(path) => load_config(path)
                .with_context(|| format!("failed to load config file '{}'", path.display()))?
                .server
                .into(),
            None => ServerConfig::default(),
        };

        let host: IpAddr = match &self.host {
            Some(host) => host
                .parse()
                .with_context(|| format!("invalid listen address: '{host}'"))?,
            None => config.bind_addr.ip(),
        };
        let port = self.port.unwrap_or(config.bind_addr.port());
        config.bind_addr = SocketAddr::new(host, port);

        if let Some(secs) = self.heartbeat_secs {
            config.heartbeat_interval = Duration::from_secs(secs);
        }
        if let Some(bytes) = self.max_frame_bytes {
            config.max_frame_size = bytes;
        }

        anyhow::ensure!(
            !config.heartbeat_interval.is_zero(),
            "heartbeat interval must be at least one second"
        );
        Ok(config)
    }
}

// ── Built-in handlers ─────────────────────────────────────────────────────────

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Handlers that ship with the binary itself.
fn builtin_handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "ping",
        handler_fn(|_data, _ctx| async move { Ok(json!({ "pong": true, "timestamp": unix_millis() })) }),
    );
    handlers.register("echo", handler_fn(|data, _ctx| async move { Ok(data) }));
    handlers.register(
        "server_info",
        handler_fn(|_data, ctx| async move {
            Ok(json!({
                "name": env!("CARGO_PKG_NAME"),
                "version": env!("CARGO_PKG_VERSION"),
                "connections": ctx.live_connections(),
            }))
        }),
    );
    handlers
}

// ── Entry point ───────────────────────────────────────────────────────────────

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `RUST_LOG` controls verbosity; `info` when unset or invalid.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = Cli::parse().into_server_config()?;
    info!(
        "PDF Hub backend starting: bind={}, heartbeat={:?}, max_frame={} bytes",
        config.bind_addr, config.heartbeat_interval, config.max_frame_size
    );

    let router = MessageRouter::new(builtin_handlers());
    info!("registered handlers: {:?}", router.handlers().kinds());

    let (manager, mut events) = ConnectionManager::new(config.clone(), router);
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            match event {
                ConnectionEvent::Connected { id, peer } => info!("event: {id} connected ({peer})"),
                ConnectionEvent::Disconnected { id, reason } => {
                    info!("event: {id} disconnected ({reason})")
                }
            }
        }
    });

    let addr = manager
        .start(config.bind_addr)
        .await
        .with_context(|| format!("failed to start server on {}", config.bind_addr))?;
    info!("ready on ws://{addr}");

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("received Ctrl+C; shutting down"),
        Err(e) => warn!("failed to listen for Ctrl+C: {e}; shutting down"),
    }

    manager.stop().await;
    info!("PDF Hub backend stopped");
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────
