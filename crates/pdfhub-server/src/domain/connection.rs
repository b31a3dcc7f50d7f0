//! Connection identity, per-message context and lifecycle events.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use uuid::Uuid;

/// Opaque identifier assigned to each accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    /// Generates a fresh random identifier.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Why a connection ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The peer sent a close frame or closed the TCP stream.
    PeerClosed,
    /// The upgrade request was malformed or lacked a key.
    HandshakeRejected,
    /// An unparseable frame, oversized length or invalid UTF-8 payload.
    ProtocolError,
    /// A socket read or write failed.
    Transport,
    /// The server is stopping.
    ServerShutdown,
    /// Closed locally through its handle.
    Closed,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            DisconnectReason::PeerClosed => "peer closed",
            DisconnectReason::HandshakeRejected => "handshake rejected",
            DisconnectReason::ProtocolError => "protocol error",
            DisconnectReason::Transport => "transport error",
            DisconnectReason::ServerShutdown => "server shutdown",
            DisconnectReason::Closed => "closed locally",
        };
        f.write_str(text)
    }
}

/// Lifecycle notifications emitted by the connection manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected {
        id: ConnectionId,
        peer: SocketAddr,
    },
    Disconnected {
        id: ConnectionId,
        reason: DisconnectReason,
    },
}

impl ConnectionEvent {
    pub fn id(&self) -> ConnectionId {
        match self {
            ConnectionEvent::Connected { id, .. } | ConnectionEvent::Disconnected { id, .. } => *id,
        }
    }
}

/// What a handler knows about the connection its request arrived on.
#[derive(Debug, Clone)]
pub struct ConnectionContext {
    pub connection_id: ConnectionId,
    pub peer_addr: SocketAddr,
    live_connections: Arc<AtomicUsize>,
}

impl ConnectionContext {
    /// Creates a context that is not attached to a running server.
    pub fn new(connection_id: ConnectionId, peer_addr: SocketAddr) -> Self {
        Self::with_live_counter(connection_id, peer_addr, Arc::new(AtomicUsize::new(0)))
    }

    pub(crate) fn with_live_counter(
        connection_id: ConnectionId,
        peer_addr: SocketAddr,
        live_connections: Arc<AtomicUsize>,
    ) -> Self {
        Self {
            connection_id,
            peer_addr,
            live_connections,
        }
    }

    /// Number of connections registered with the server right now.
    pub fn live_connections(&self) -> usize {
        self.live_connections.load(Ordering::Relaxed)
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
