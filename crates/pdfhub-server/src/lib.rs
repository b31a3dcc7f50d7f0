//! pdfhub-server library crate.
//!
//! The local backend the PDF Hub viewer talks to over a private WebSocket
//! channel.  It accepts connections, performs the upgrade handshake, keeps
//! each connection alive with a heartbeat and routes JSON requests to the
//! handlers the composing application registers.
//!
//! # Architecture
//!
//! ```text
//! Embedded browser view (JSON over WebSocket)
//!         ↕
//! [pdfhub-server]
//!   ├── domain/           ServerConfig, ConnectionId, lifecycle events
//!   ├── application/      MessageRouter + handler registry
//!   └── infrastructure/
//!         ├── connection/ per-peer state machine and socket task
//!         ├── manager/    accept loop, registry, unicast/broadcast
//!         └── config_file/ optional TOML settings
//! ```
//!
//! # Layer rules
//!
//! - `domain` has no I/O.
//! - `application` depends on `domain` and `pdfhub-core` only.
//! - `infrastructure` depends on all other layers plus `tokio`.
//!
//! # Example
//!
//! ```no_run
//! use pdfhub_server::application::{handler_fn, HandlerRegistry, MessageRouter};
//! use pdfhub_server::domain::ServerConfig;
//! use pdfhub_server::infrastructure::ConnectionManager;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut handlers = HandlerRegistry::new();
//! handlers.register("echo", handler_fn(|data, _ctx| async move { Ok(data) }));
//!
//! let config = ServerConfig::default();
//! let (manager, _events) = ConnectionManager::new(config.clone(), MessageRouter::new(handlers));
//! manager.start(config.bind_addr).await?;
//! # Ok(())
//! # }
//! ```

/// Domain layer: pure types (no I/O).
pub mod domain;

/// Application layer: message routing.
pub mod application;

/// Infrastructure layer: sockets, tasks, config file.
pub mod infrastructure;
