//! Connection: full-duplex state for one WebSocket peer.
//!
//! Split in two parts:
//!
//! - [`ConnectionState`] is a socket-free state machine.  It takes raw bytes
//!   and returns the [`ConnectionAction`]s the socket side must perform:
//!   write the upgrade response, deliver a text message, answer a ping, or
//!   disconnect.  The handshake, buffering and fragment-assembly rules live
//!   here and are tested without a network.
//!
//! - [`Connection`] owns the `TcpStream` and runs as a single tokio task:
//!   it reads, feeds [`ConnectionState`], writes queued outbound messages,
//!   sends the periodic heartbeat and reacts to close requests.  Because one
//!   task owns the socket, the buffer and the flags, the heartbeat and the
//!   read path can never race.
//!
//! [`ConnectionHandle`] is the cloneable sender side kept in the registry.
//!
//! # Streaming
//!
//! TCP may split a frame across reads or glue several frames together.
//! Inbound bytes are appended to one buffer, `parse_frame` is called until it
//! reports `NeedMoreData`, and exactly the bytes of each complete frame are
//! drained from the front.  A partial frame is never consumed.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use pdfhub_core::envelope::heartbeat_message;
use pdfhub_core::protocol::{
    build_close_frame, build_pong_frame, build_text_frame, parse_frame, try_handshake, Frame,
    Opcode,
};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Notify;
use tokio::time::{self, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::application::router::{MessageRouter, MessageSink};
use crate::domain::{ConnectionContext, ConnectionId, DisconnectReason, ServerConfig};

/// Size of each individual socket read.
const READ_CHUNK: usize = 8 * 1024;

/// Most queued messages written back to back before the socket is read again.
const WRITE_BATCH: usize = 64;

/// Upper bound on the final close-frame write.  The close is send-and-drop,
/// so a peer that stopped reading must not hold the task open.
const CLOSE_WRITE_TIMEOUT: Duration = Duration::from_secs(1);

// ── State machine ─────────────────────────────────────────────────────────────

/// Work the socket side must do after feeding bytes to [`ConnectionState`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    /// Write these bytes to the peer unchanged.
    Write(Vec<u8>),
    /// The upgrade succeeded; messages may now be queued and the heartbeat
    /// starts.  Always followed by the `Write` of the upgrade response, so
    /// anything queued meanwhile is written after it.
    HandshakeComplete,
    /// A complete text message for the router.
    Deliver(String),
    /// Disconnect.  Always the last action of a batch.
    Close(DisconnectReason),
}

/// Per-connection protocol state with no I/O.
#[derive(Debug)]
pub struct ConnectionState {
    handshake_complete: bool,
    closed: bool,
    inbound: Vec<u8>,
    /// Payload of a fragmented message still waiting for its final frame.
    fragments: Option<Vec<u8>>,
    max_frame_size: usize,
    max_handshake_size: usize,
}

impl ConnectionState {
    pub fn new(max_frame_size: usize, max_handshake_size: usize) -> Self {
        Self {
            handshake_complete: false,
            closed: false,
            inbound: Vec::with_capacity(READ_CHUNK),
            fragments: None,
            max_frame_size,
            max_handshake_size,
        }
    }

    pub fn from_config(config: &ServerConfig) -> Self {
        Self::new(config.max_frame_size, config.max_handshake_size)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.handshake_complete
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Bytes received but not yet consumed by a complete frame.
    pub fn buffered(&self) -> usize {
        self.inbound.len()
    }

    /// Feeds newly received bytes and returns the resulting actions in order.
    ///
    /// Before the handshake completes, bytes accumulate until the upgrade
    /// request is complete.  Frame bytes pipelined behind the request are
    /// processed in the same call.  Once a `Close` action has been returned
    /// every later call is a no-op.
    pub fn on_data_received(&mut self, bytes: &[u8]) -> Vec<ConnectionAction> {
        let mut actions = Vec::new();
        if self.closed {
            return actions;
        }
        self.inbound.extend_from_slice(bytes);

        if !self.handshake_complete {
            match try_handshake(&self.inbound, self.max_handshake_size) {
                Ok(handshake) => {
                    self.inbound.drain(..handshake.consumed);
                    self.handshake_complete = true;
                    actions.push(ConnectionAction::HandshakeComplete);
                    actions.push(ConnectionAction::Write(handshake.response));
                }
                Err(e) if e.is_incomplete() => return actions,
                Err(e) => {
                    warn!("upgrade rejected: {e}");
                    self.close_with(&mut actions, DisconnectReason::HandshakeRejected);
                    return actions;
                }
            }
        }

        while !self.closed {
            let (frame, consumed) = match parse_frame(&self.inbound, self.max_frame_size) {
                Ok(parsed) => parsed,
                Err(e) if e.is_need_more_data() => break,
                Err(e) => {
                    warn!("frame rejected: {e}");
                    self.close_with(&mut actions, DisconnectReason::ProtocolError);
                    break;
                }
            };
            self.inbound.drain(..consumed);
            self.on_frame(frame, &mut actions);
        }

        actions
    }

    fn on_frame(&mut self, frame: Frame, actions: &mut Vec<ConnectionAction>) {
        if frame.is_control() && !frame.fin {
            warn!("fragmented control frame");
            self.close_with(actions, DisconnectReason::ProtocolError);
            return;
        }

        match frame.opcode {
            Opcode::Close => self.close_with(actions, DisconnectReason::PeerClosed),
            Opcode::Ping => actions.push(ConnectionAction::Write(build_pong_frame(&frame.payload))),
            Opcode::Pong => {}
            Opcode::Text | Opcode::Binary => {
                if self.fragments.is_some() {
                    warn!("new data frame while a fragmented message is in progress");
                    self.close_with(actions, DisconnectReason::ProtocolError);
                } else if frame.fin {
                    self.deliver(frame.payload, actions);
                } else {
                    self.fragments = Some(frame.payload);
                }
            }
            Opcode::Continuation => {
                let Some(mut message) = self.fragments.take() else {
                    warn!("continuation frame without a message in progress");
                    self.close_with(actions, DisconnectReason::ProtocolError);
                    return;
                };
                if message.len() + frame.payload.len() > self.max_frame_size {
                    warn!("fragmented message exceeds {} bytes", self.max_frame_size);
                    self.close_with(actions, DisconnectReason::ProtocolError);
                    return;
                }
                message.extend_from_slice(&frame.payload);
                if frame.fin {
                    self.deliver(message, actions);
                } else {
                    self.fragments = Some(message);
                }
            }
        }
    }

    fn deliver(&mut self, payload: Vec<u8>, actions: &mut Vec<ConnectionAction>) {
        match String::from_utf8(payload) {
            Ok(text) => actions.push(ConnectionAction::Deliver(text)),
            Err(_) => {
                warn!("message payload is not valid UTF-8");
                self.close_with(actions, DisconnectReason::ProtocolError);
            }
        }
    }

    fn close_with(&mut self, actions: &mut Vec<ConnectionAction>, reason: DisconnectReason) {
        self.closed = true;
        self.inbound.clear();
        self.fragments = None;
        actions.push(ConnectionAction::Close(reason));
    }
}

// ── Handle ────────────────────────────────────────────────────────────────────

#[derive(Debug)]
struct Shared {
    open: AtomicBool,
    handshake_complete: AtomicBool,
    close_reason: Mutex<Option<DisconnectReason>>,
    close_requested: Notify,
}

impl Shared {
    fn take_close_reason(&self) -> DisconnectReason {
        self.close_reason
            .lock()
            .ok()
            .and_then(|mut slot| slot.take())
            .unwrap_or(DisconnectReason::Closed)
    }
}

/// Cloneable sender side of one connection.
///
/// Messages are queued for the connection task, which writes them in order.
/// Every method except [`ConnectionHandle::deliver`] is non-blocking.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: ConnectionId,
    peer_addr: SocketAddr,
    connected_at: SystemTime,
    outbound: mpsc::Sender<String>,
    shared: Arc<Shared>,
}

impl ConnectionHandle {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn connected_at(&self) -> SystemTime {
        self.connected_at
    }

    /// `false` once the connection has closed or a close was requested.
    pub fn is_open(&self) -> bool {
        self.shared.open.load(Ordering::Acquire)
    }

    pub fn is_handshake_complete(&self) -> bool {
        self.shared.handshake_complete.load(Ordering::Acquire)
    }

    /// Queues a text message.
    ///
    /// Returns `false` without sending if the handshake has not completed,
    /// the connection is closed, or its outbound queue is full.
    pub fn send_text(&self, text: impl Into<String>) -> bool {
        if !self.is_open() || !self.is_handshake_complete() {
            return false;
        }
        match self.outbound.try_send(text.into()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!("connection {}: outbound queue full, message dropped", self.id);
                false
            }
            Err(TrySendError::Closed(_)) => false,
        }
    }

    /// Queues a reply, waiting for room in the outbound queue rather than
    /// dropping it.
    ///
    /// Returns `false` if the handshake has not completed or the connection
    /// is closed, including when it closes while waiting.
    pub async fn deliver(&self, text: String) -> bool {
        if !self.is_open() || !self.is_handshake_complete() {
            return false;
        }
        self.outbound.send(text).await.is_ok()
    }

    /// Serialises `value` to JSON and queues it as a text message.
    pub fn send_json<T: Serialize + ?Sized>(&self, value: &T) -> bool {
        match serde_json::to_string(value) {
            Ok(text) => self.send_text(text),
            Err(e) => {
                warn!("connection {}: failed to serialise message: {e}", self.id);
                false
            }
        }
    }

    /// Requests a close.  Returns `true` only for the call that initiated it,
    /// so the peer receives at most one close frame.
    pub fn close(&self) -> bool {
        self.request_close(DisconnectReason::Closed)
    }

    pub(crate) fn request_close(&self, reason: DisconnectReason) -> bool {
        if !self.shared.open.swap(false, Ordering::AcqRel) {
            return false;
        }
        if let Ok(mut slot) = self.shared.close_reason.lock() {
            *slot = Some(reason);
        }
        self.shared.close_requested.notify_one();
        true
    }
}

// ── Socket task ───────────────────────────────────────────────────────────────

/// The socket-owning half of a connection.  Consumed by [`Connection::run`].
pub struct Connection {
    stream: TcpStream,
    state: ConnectionState,
    handle: ConnectionHandle,
    outbound_rx: mpsc::Receiver<String>,
    heartbeat_interval: Duration,
}

impl Connection {
    /// Wraps an accepted socket.  Nothing is read until [`Connection::run`].
    pub fn new(
        stream: TcpStream,
        id: ConnectionId,
        peer_addr: SocketAddr,
        config: &ServerConfig,
    ) -> (Self, ConnectionHandle) {
        let (outbound, outbound_rx) = mpsc::channel(config.outbound_queue.max(1));
        let handle = ConnectionHandle {
            id,
            peer_addr,
            connected_at: SystemTime::now(),
            outbound,
            shared: Arc::new(Shared {
                open: AtomicBool::new(true),
                handshake_complete: AtomicBool::new(false),
                close_reason: Mutex::new(None),
                close_requested: Notify::new(),
            }),
        };
        let connection = Self {
            stream,
            state: ConnectionState::from_config(config),
            handle: handle.clone(),
            outbound_rx,
            heartbeat_interval: config.heartbeat_interval,
        };
        (connection, handle)
    }

    /// Drives the connection until it closes and returns why.
    ///
    /// Every delivered text message is forwarded to `inbound` in arrival
    /// order.  The heartbeat only runs once the handshake has completed and
    /// stops with the task.
    pub async fn run(mut self, inbound: mpsc::Sender<String>) -> DisconnectReason {
        let id = self.handle.id;
        let shared = Arc::clone(&self.handle.shared);
        // tokio intervals panic on a zero period
        let period = self.heartbeat_interval.max(Duration::from_millis(1));
        let mut heartbeat = time::interval_at(Instant::now() + period, period);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut read_buf = vec![0u8; READ_CHUNK];

        let reason = loop {
            tokio::select! {
                read = self.stream.read(&mut read_buf) => {
                    let n = match read {
                        Ok(0) => {
                            debug!("connection {id}: peer closed the stream");
                            break DisconnectReason::PeerClosed;
                        }
                        Ok(n) => n,
                        Err(e) => {
                            warn!("connection {id}: read failed: {e}");
                            break DisconnectReason::Transport;
                        }
                    };
                    if let Some(reason) = self.apply(&read_buf[..n], &inbound, &mut heartbeat).await {
                        break reason;
                    }
                }
                Some(text) = self.outbound_rx.recv() => {
                    if let Err(reason) = self.write_queued(text).await {
                        break reason;
                    }
                }
                _ = heartbeat.tick(), if self.state.is_handshake_complete() => {
                    debug!("connection {id}: heartbeat");
                    if let Err(e) = self.stream.write_all(&build_text_frame(&heartbeat_message())).await {
                        warn!("connection {id}: heartbeat write failed: {e}");
                        break DisconnectReason::Transport;
                    }
                }
                _ = shared.close_requested.notified() => {
                    break shared.take_close_reason();
                }
            }
        };

        shared.open.store(false, Ordering::Release);
        self.finish(reason).await;
        reason
    }

    /// Performs the actions produced by one read.  Returns a reason when the
    /// connection must end.
    async fn apply(
        &mut self,
        data: &[u8],
        inbound: &mpsc::Sender<String>,
        heartbeat: &mut Interval,
    ) -> Option<DisconnectReason> {
        let id = self.handle.id;
        for action in self.state.on_data_received(data) {
            match action {
                ConnectionAction::Write(bytes) => {
                    if let Err(e) = self.stream.write_all(&bytes).await {
                        warn!("connection {id}: write failed: {e}");
                        return Some(DisconnectReason::Transport);
                    }
                }
                ConnectionAction::HandshakeComplete => {
                    self.handle
                        .shared
                        .handshake_complete
                        .store(true, Ordering::Release);
                    heartbeat.reset();
                    info!("connection {id}: WebSocket session established");
                }
                ConnectionAction::Deliver(text) => {
                    if let Err(reason) = self.forward(text, inbound).await {
                        return Some(reason);
                    }
                }
                ConnectionAction::Close(reason) => return Some(reason),
            }
        }
        None
    }

    /// Hands one message to the dispatcher.  While the dispatcher queue is
    /// full, queued replies keep being written so the dispatcher can finish
    /// the message it is working on.
    async fn forward(
        &mut self,
        text: String,
        inbound: &mpsc::Sender<String>,
    ) -> Result<(), DisconnectReason> {
        loop {
            tokio::select! {
                permit = inbound.reserve() => {
                    match permit {
                        Ok(permit) => permit.send(text),
                        Err(_) => debug!("connection {}: dispatcher gone, message dropped", self.handle.id),
                    }
                    return Ok(());
                }
                Some(reply) = self.outbound_rx.recv() => self.write_queued(reply).await?,
            }
        }
    }

    /// Writes `first` plus whatever else is already queued, up to
    /// [`WRITE_BATCH`] messages.
    async fn write_queued(&mut self, first: String) -> Result<(), DisconnectReason> {
        self.write_text(&first).await?;
        for _ in 1..WRITE_BATCH {
            match self.outbound_rx.try_recv() {
                Ok(text) => self.write_text(&text).await?,
                Err(_) => break,
            }
        }
        Ok(())
    }

    async fn write_text(&mut self, text: &str) -> Result<(), DisconnectReason> {
        let id = self.handle.id;
        let frame = build_text_frame(text);
        self.stream.write_all(&frame).await.map_err(|e| {
            warn!("connection {id}: write failed: {e}");
            DisconnectReason::Transport
        })
    }

    /// Send-and-drop close: one close frame if the session was established,
    /// then the socket is shut down without waiting for the peer's reply.
    async fn finish(&mut self, reason: DisconnectReason) {
        let id = self.handle.id;
        if self.state.is_handshake_complete() && reason != DisconnectReason::Transport {
            let close = build_close_frame();
            match time::timeout(CLOSE_WRITE_TIMEOUT, self.stream.write_all(&close)).await {
                Ok(Ok(())) => debug!("connection {id}: close frame sent"),
                Ok(Err(e)) => debug!("connection {id}: close frame not sent: {e}"),
                Err(_) => debug!("connection {id}: close frame timed out"),
            }
        }
        let _ = time::timeout(CLOSE_WRITE_TIMEOUT, self.stream.shutdown()).await;
    }
}

/// Spawns the task that feeds one connection's messages to the router, one
/// at a time, and returns the sender for [`Connection::run`].
///
/// A slow handler delays replies on its own connection only.
pub fn spawn_dispatcher(
    router: Arc<MessageRouter>,
    sink: Arc<dyn MessageSink>,
    ctx: ConnectionContext,
    capacity: usize,
) -> mpsc::Sender<String> {
    let (tx, mut rx) = mpsc::channel::<String>(capacity.max(1));
    tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            router.on_message(sink.as_ref(), &ctx, &text).await;
        }
        debug!("connection {}: dispatcher finished", ctx.connection_id);
    });
    tx
}

// ── Tests ─────────────────────────────────────────────────────────────────────
