//! Optional TOML configuration file.
//!
//! ```toml
//! [server]
//! host = "127.0.0.1"
//! port = 8765
//! heartbeat_secs = 30
//! max_frame_bytes = 16777216
//! max_handshake_bytes = 8192
//! outbound_queue = 256
//! event_capacity = 64
//! ```
//!
//! Every field is optional; an absent field keeps the [`ServerConfig`]
//! default.  Command-line flags are applied on top of the file in `main.rs`.

use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::ServerConfig;

/// Error type for configuration file operations.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A file system I/O error occurred.
    #[error("I/O error accessing config at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The TOML content could not be parsed.
    #[error("failed to parse config TOML: {0}")]
    Parse(#[from] toml::de::Error),
}

// ── Config schema types ───────────────────────────────────────────────────────

/// Top-level layout of the config file.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct FileConfig {
    #[serde(default)]
    pub server: ServerSection,
}

/// The `[server]` table.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ServerSection {
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_secs: u64,
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    #[serde(default = "default_max_handshake_bytes")]
    pub max_handshake_bytes: usize,
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

// ── Default helpers ───────────────────────────────────────────────────────────

fn default_host() -> IpAddr {
    ServerConfig::default().bind_addr.ip()
}
fn default_port() -> u16 {
    ServerConfig::default().bind_addr.port()
}
fn default_heartbeat_secs() -> u64 {
    ServerConfig::default().heartbeat_interval.as_secs()
}
fn default_max_frame_bytes() -> usize {
    ServerConfig::default().max_frame_size
}
fn default_max_handshake_bytes() -> usize {
    ServerConfig::default().max_handshake_size
}
fn default_outbound_queue() -> usize {
    ServerConfig::default().outbound_queue
}
fn default_event_capacity() -> usize {
    ServerConfig::default().event_capacity
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            heartbeat_secs: default_heartbeat_secs(),
            max_frame_bytes: default_max_frame_bytes(),
            max_handshake_bytes: default_max_handshake_bytes(),
            outbound_queue: default_outbound_queue(),
            event_capacity: default_event_capacity(),
        }
    }
}

impl From<ServerSection> for ServerConfig {
    fn from(section: ServerSection) -> Self {
        Self {
            bind_addr: SocketAddr::new(section.host, section.port),
            heartbeat_interval: Duration::from_secs(section.heartbeat_secs),
            max_frame_size: section.max_frame_bytes,
            max_handshake_size: section.max_handshake_bytes,
            outbound_queue: section.outbound_queue,
            event_capacity: section.event_capacity,
        }
    }
}

// ── Loading ───────────────────────────────────────────────────────────────────

/// Parses config file contents.
///
/// # Errors
///
/// Returns [`ConfigError::Parse`] if the TOML is malformed or a field has
/// the wrong type.
pub fn parse_config(content: &str) -> Result<FileConfig, ConfigError> {
    Ok(toml::from_str(content)?)
}

/// Reads and parses the config file at `path`.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] if the file cannot be read (including when it
/// does not exist) and [`ConfigError::Parse`] if the TOML is malformed.
pub fn load_config(path: &Path) -> Result<FileConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse_config(&content)
}

// ── Tests ─────────────────────────────────────────────────────────────────────
