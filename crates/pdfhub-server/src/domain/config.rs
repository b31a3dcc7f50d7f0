//! Server configuration types.
//!
//! [`ServerConfig`] is the single source of truth for all runtime settings.
//! `main.rs` populates it from defaults, an optional TOML file and CLI flags;
//! tests build it directly, usually with a short heartbeat and port 0.

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use pdfhub_core::protocol::{DEFAULT_MAX_PAYLOAD, DEFAULT_MAX_REQUEST};

/// Default WebSocket port the viewer connects to.
pub const DEFAULT_PORT: u16 = 8765;

/// All runtime configuration for the WebSocket backend.
///
/// # Example
///
/// ```rust
/// use pdfhub_server::domain::ServerConfig;
///
/// let cfg = ServerConfig::default();
/// assert_eq!(cfg.bind_addr.port(), 8765);
/// assert!(cfg.bind_addr.ip().is_loopback());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Address the listener binds to.  Loopback only by default: the backend
    /// serves a single local viewer and performs no authentication.
    pub bind_addr: SocketAddr,

    /// How often each connection receives the `{"type":"ping"}` message.
    pub heartbeat_interval: Duration,

    /// Largest accepted frame payload, and the cap on a reassembled
    /// fragmented message.
    pub max_frame_size: usize,

    /// Largest accepted HTTP upgrade request.
    pub max_handshake_size: usize,

    /// Outbound messages that may queue per connection before `send`
    /// starts returning `false`.
    pub outbound_queue: usize,

    /// Capacity of the lifecycle event channel.
    pub event_capacity: usize,
}

impl Default for ServerConfig {
    /// | Field              | Default            |
    /// |--------------------|--------------------|
    /// | bind_addr          | `127.0.0.1:8765`   |
    /// | heartbeat_interval | 30 seconds         |
    /// | max_frame_size     | 16 MiB             |
    /// | max_handshake_size | 8 KiB              |
    /// | outbound_queue     | 256                |
    /// | event_capacity     | 64                 |
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from((Ipv4Addr::LOCALHOST, DEFAULT_PORT)),
            heartbeat_interval: Duration::from_secs(30),
            max_frame_size: DEFAULT_MAX_PAYLOAD,
            max_handshake_size: DEFAULT_MAX_REQUEST,
            outbound_queue: 256,
            event_capacity: 64,
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
