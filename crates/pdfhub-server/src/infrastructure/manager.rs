//! ConnectionManager: accept loop, connection registry and delivery fan-out.
//!
//! The manager is the single owner of the registry.  Every mutation (insert
//! on accept, removal on disconnect) and every broadcast read goes through
//! one `RwLock`, so a broadcast never observes a half-registered connection.
//!
//! # Task layout
//!
//! ```text
//! accept loop ──spawn──► connection task (socket, buffer, heartbeat)
//!                              │ text messages, in order
//!                              ▼
//!                        dispatch task ──► MessageRouter ──► manager.send()
//! ```
//!
//! `ConnectionManager` is cheap to clone; all clones share the same server.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::task::{AbortHandle, JoinHandle};
use tracing::{debug, error, info, warn};

use crate::application::router::{MessageRouter, MessageSink};
use crate::domain::{ConnectionContext, ConnectionEvent, ConnectionId, DisconnectReason, ServerConfig};
use crate::infrastructure::connection::{spawn_dispatcher, Connection, ConnectionHandle};

/// How long `stop` waits for connection tasks to finish before aborting them.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Pause after the first failed `accept`; doubles per consecutive failure.
const ACCEPT_BACKOFF_BASE: Duration = Duration::from_millis(10);
const ACCEPT_BACKOFF_MAX: Duration = Duration::from_secs(1);

/// Delay before retrying `accept` after `consecutive_failures` errors in a
/// row (EMFILE and friends persist until a descriptor is freed).
fn accept_backoff(consecutive_failures: u32) -> Duration {
    let doublings = consecutive_failures.saturating_sub(1).min(16);
    ACCEPT_BACKOFF_BASE
        .saturating_mul(1u32 << doublings)
        .min(ACCEPT_BACKOFF_MAX)
}

/// Error type for server lifecycle operations.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("bind failed on {addr}: {source}")]
    BindFailed {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("server is already running on {0}")]
    AlreadyRunning(SocketAddr),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

struct ConnectionEntry {
    handle: ConnectionHandle,
    task: Option<JoinHandle<()>>,
}

struct RunningServer {
    local_addr: SocketAddr,
    shutdown: watch::Sender<bool>,
    accept_task: JoinHandle<()>,
}

struct Inner {
    config: ServerConfig,
    router: Arc<MessageRouter>,
    registry: RwLock<HashMap<ConnectionId, ConnectionEntry>>,
    live: Arc<AtomicUsize>,
    accepting: AtomicBool,
    events: mpsc::Sender<ConnectionEvent>,
    server: Mutex<Option<RunningServer>>,
}

/// Owns the listening socket and every live connection.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    /// Creates a manager and the receiver for its lifecycle events.
    ///
    /// Events are sent with `try_send`: if the receiver is dropped or falls
    /// behind, events are discarded and the server carries on.
    pub fn new(config: ServerConfig, router: MessageRouter) -> (Self, mpsc::Receiver<ConnectionEvent>) {
        let (events, events_rx) = mpsc::channel(config.event_capacity.max(1));
        let manager = Self {
            inner: Arc::new(Inner {
                config,
                router: Arc::new(router),
                registry: RwLock::new(HashMap::new()),
                live: Arc::new(AtomicUsize::new(0)),
                accepting: AtomicBool::new(false),
                events,
                server: Mutex::new(None),
            }),
        };
        (manager, events_rx)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.inner.config
    }

    pub fn router(&self) -> &MessageRouter {
        &self.inner.router
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    /// Binds `addr` and starts accepting connections.  Returns the bound
    /// address, which differs from `addr` when port 0 was requested.
    ///
    /// # Errors
    ///
    /// - [`ServerError::AlreadyRunning`] if the server was already started;
    ///   the running server is left untouched.
    /// - [`ServerError::BindFailed`] if the port cannot be bound.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr, ServerError> {
        let mut server = self.inner.server.lock().await;
        if let Some(running) = server.as_ref() {
            warn!("start ignored: already listening on {}", running.local_addr);
            return Err(ServerError::AlreadyRunning(running.local_addr));
        }

        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| ServerError::BindFailed { addr, source })?;
        let local_addr = listener.local_addr()?;

        let (shutdown, shutdown_rx) = watch::channel(false);
        self.inner.accepting.store(true, Ordering::Release);
        let manager = self.clone();
        let accept_task = tokio::spawn(async move {
            manager.accept_loop(listener, shutdown_rx).await;
        });

        *server = Some(RunningServer {
            local_addr,
            shutdown,
            accept_task,
        });
        info!("WebSocket server listening on {local_addr}");
        Ok(local_addr)
    }

    /// Closes every connection, waits for their tasks, then stops listening.
    ///
    /// Returns `true` if the server was running, `false` otherwise.
    pub async fn stop(&self) -> bool {
        let mut server = self.inner.server.lock().await;
        let Some(running) = server.take() else {
            debug!("stop ignored: server not running");
            return false;
        };
        self.inner.accepting.store(false, Ordering::Release);

        let tasks: Vec<JoinHandle<()>> = {
            let mut registry = self.inner.registry.write().await;
            registry
                .values_mut()
                .filter_map(|entry| {
                    entry.handle.request_close(DisconnectReason::ServerShutdown);
                    entry.task.take()
                })
                .collect()
        };
        info!("stopping server: closing {} connection(s)", tasks.len());

        let aborts: Vec<AbortHandle> = tasks.iter().map(JoinHandle::abort_handle).collect();
        if tokio::time::timeout(SHUTDOWN_GRACE, futures_util::future::join_all(tasks))
            .await
            .is_err()
        {
            warn!("connections did not close within {SHUTDOWN_GRACE:?}; aborting");
            for abort in aborts {
                abort.abort();
            }
        }

        let leftovers: Vec<ConnectionId> = {
            let mut registry = self.inner.registry.write().await;
            registry.drain().map(|(id, _)| id).collect()
        };
        for id in leftovers {
            self.inner.live.fetch_sub(1, Ordering::AcqRel);
            self.emit(ConnectionEvent::Disconnected {
                id,
                reason: DisconnectReason::ServerShutdown,
            });
        }

        // Connections are gone; now release the port.
        let _ = running.shutdown.send(true);
        if let Err(e) = running.accept_task.await {
            warn!("accept loop ended abnormally: {e}");
        }
        info!("WebSocket server on {} stopped", running.local_addr);
        true
    }

    pub async fn is_running(&self) -> bool {
        self.inner.server.lock().await.is_some()
    }

    /// The bound listening address while running.
    pub async fn local_addr(&self) -> Option<SocketAddr> {
        self.inner
            .server
            .lock()
            .await
            .as_ref()
            .map(|running| running.local_addr)
    }

    // ── Delivery ──────────────────────────────────────────────────────────────

    /// Sends a text message to one connection.  Returns `false` if the
    /// connection does not exist or would not accept the message.
    pub async fn send(&self, id: ConnectionId, text: impl Into<String>) -> bool {
        let registry = self.inner.registry.read().await;
        match registry.get(&id) {
            Some(entry) => entry.handle.send_text(text),
            None => {
                debug!("send to unknown connection {id}");
                false
            }
        }
    }

    pub async fn send_json<T: Serialize + ?Sized>(&self, id: ConnectionId, value: &T) -> bool {
        let registry = self.inner.registry.read().await;
        registry
            .get(&id)
            .map(|entry| entry.handle.send_json(value))
            .unwrap_or(false)
    }

    /// Sends `text` to every registered connection and returns how many
    /// accepted it.  A peer that fails does not stop delivery to the others.
    pub async fn broadcast(&self, text: &str) -> usize {
        let registry = self.inner.registry.read().await;
        let delivered = registry
            .values()
            .filter(|entry| entry.handle.send_text(text))
            .count();
        debug!("broadcast delivered to {delivered}/{} connection(s)", registry.len());
        delivered
    }

    /// Requests a close of one connection.
    pub async fn close(&self, id: ConnectionId) -> bool {
        let registry = self.inner.registry.read().await;
        registry
            .get(&id)
            .map(|entry| entry.handle.close())
            .unwrap_or(false)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.registry.read().await.len()
    }

    pub async fn connection_ids(&self) -> Vec<ConnectionId> {
        self.inner.registry.read().await.keys().copied().collect()
    }

    /// A handle for one connection, if it is registered.
    pub async fn connection(&self, id: ConnectionId) -> Option<ConnectionHandle> {
        self.inner
            .registry
            .read()
            .await
            .get(&id)
            .map(|entry| entry.handle.clone())
    }

    // ── Internals ─────────────────────────────────────────────────────────────

    async fn accept_loop(self, listener: TcpListener, mut shutdown: watch::Receiver<bool>) {
        let mut failures: u32 = 0;
        loop {
            tokio::select! {
                _ = shutdown.changed() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        failures = 0;
                        self.on_accept(stream, peer).await;
                    }
                    Err(e) => {
                        failures = failures.saturating_add(1);
                        let delay = accept_backoff(failures);
                        error!("accept error: {e}; retrying in {delay:?}");
                        tokio::select! {
                            _ = shutdown.changed() => break,
                            _ = tokio::time::sleep(delay) => {}
                        }
                    }
                },
            }
        }
        debug!("accept loop stopped");
    }

    async fn on_accept(&self, stream: TcpStream, peer: SocketAddr) {
        let config = &self.inner.config;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("could not set TCP_NODELAY for {peer}: {e}");
        }

        // Checked under the write lock so `stop` cannot miss a connection.
        let mut registry = self.inner.registry.write().await;
        if !self.inner.accepting.load(Ordering::Acquire) {
            debug!("server stopping; dropping connection from {peer}");
            return;
        }

        let id = ConnectionId::new();
        let (connection, handle) = Connection::new(stream, id, peer, config);
        let ctx = ConnectionContext::with_live_counter(id, peer, Arc::clone(&self.inner.live));
        let sink: Arc<dyn MessageSink> = Arc::new(self.clone());
        let inbound = spawn_dispatcher(Arc::clone(&self.inner.router), sink, ctx, config.outbound_queue);

        let manager = self.clone();
        let task = tokio::spawn(async move {
            let reason = connection.run(inbound).await;
            manager.on_disconnect(id, reason).await;
        });
        registry.insert(
            id,
            ConnectionEntry {
                handle,
                task: Some(task),
            },
        );
        let live = self.inner.live.fetch_add(1, Ordering::AcqRel) + 1;
        info!("client {id} connected from {peer} ({live} live)");
        self.emit(ConnectionEvent::Connected { id, peer });
    }

    async fn on_disconnect(&self, id: ConnectionId, reason: DisconnectReason) {
        let mut registry = self.inner.registry.write().await;
        if registry.remove(&id).is_none() {
            return;
        }
        let live = self.inner.live.fetch_sub(1, Ordering::AcqRel) - 1;
        info!("client {id} disconnected: {reason} ({live} live)");
        self.emit(ConnectionEvent::Disconnected { id, reason });
    }

    fn emit(&self, event: ConnectionEvent) {
        if let Err(e) = self.inner.events.try_send(event) {
            debug!("lifecycle event dropped: {e}");
        }
    }
}

#[async_trait]
impl MessageSink for ConnectionManager {
    /// Router replies wait for queue space instead of being dropped.  The
    /// registry lock is released before waiting.
    async fn deliver(&self, connection_id: ConnectionId, text: String) -> bool {
        match self.connection(connection_id).await {
            Some(handle) => handle.deliver(text).await,
            None => {
                debug!("reply for unknown connection {connection_id}");
                false
            }
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
