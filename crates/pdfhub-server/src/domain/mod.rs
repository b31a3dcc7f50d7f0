//! Domain layer for the WebSocket backend.
//!
//! Contains pure data types with no I/O: the server configuration,
//! connection identifiers, the context handed to handlers and the lifecycle
//! events the manager emits.

pub mod config;
pub mod connection;

pub use config::{ServerConfig, DEFAULT_PORT};
pub use connection::{ConnectionContext, ConnectionEvent, ConnectionId, DisconnectReason};
