//! Infrastructure layer for pdfhub-server.
//!
//! The infrastructure layer handles all I/O: binding the listener, owning
//! sockets, running per-connection tasks and reading the config file.
//!
//! # What does NOT belong here?
//!
//! - Message decoding and dispatch (that is the application layer)
//! - Frame and handshake byte rules (that is `pdfhub-core`)

pub mod config_file;
pub mod connection;
pub mod manager;

pub use config_file::{load_config, ConfigError, FileConfig};
pub use connection::{Connection, ConnectionAction, ConnectionHandle, ConnectionState};
pub use manager::{ConnectionManager, ServerError};
