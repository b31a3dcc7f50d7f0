//! Integration tests for pdfhub-server.
//!
//! Each test starts a real server on an ephemeral port and talks to it with
//! `tokio-tungstenite`, an independent WebSocket client.  The client verifies
//! the `Sec-WebSocket-Accept` token and the frame format on every exchange.
//! Tests that need exact control of the bytes on the wire (a malformed
//! upgrade, a burst of coalesced frames) use a raw `TcpStream` instead.

use std::net::SocketAddr;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use pdfhub_core::protocol::{build_masked_frame, parse_frame, Opcode, DEFAULT_MAX_PAYLOAD};
use pdfhub_server::application::{handler_fn, HandlerError, HandlerRegistry, MessageRouter};
use pdfhub_server::domain::{ConnectionEvent, ConnectionId, DisconnectReason, ServerConfig};
use pdfhub_server::infrastructure::ConnectionManager;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

const WAIT: Duration = Duration::from_secs(5);

// ── Helpers ───────────────────────────────────────────────────────────────────

fn handlers() -> HandlerRegistry {
    let mut handlers = HandlerRegistry::new();
    handlers.register("echo", handler_fn(|data, _ctx| async move { Ok(data) }));
    handlers.register(
        "slow",
        handler_fn(|data, _ctx| async move {
            tokio::time::sleep(Duration::from_millis(300)).await;
            Ok(data)
        }),
    );
    handlers.register(
        "open_pdf",
        handler_fn(|_data, _ctx| async move {
            Err(HandlerError::new("FILE_NOT_FOUND", "no such file"))
        }),
    );
    handlers
}

async fn start_server(
    config: ServerConfig,
) -> (ConnectionManager, mpsc::Receiver<ConnectionEvent>, SocketAddr) {
    let (manager, events) = ConnectionManager::new(config, MessageRouter::new(handlers()));
    let addr = manager
        .start("127.0.0.1:0".parse().unwrap())
        .await
        .expect("server must start");
    (manager, events, addr)
}

async fn connect(addr: SocketAddr) -> Client {
    let (client, response) = connect_async(format!("ws://{addr}/"))
        .await
        .expect("WebSocket handshake must succeed");
    assert_eq!(response.status().as_u16(), 101);
    client
}

async fn send(client: &mut Client, value: Value) {
    client
        .send(Message::Text(value.to_string()))
        .await
        .expect("send must succeed");
}

/// Next JSON text message, skipping protocol-level control frames.
async fn recv_json(client: &mut Client) -> Value {
    loop {
        let message = timeout(WAIT, client.next())
            .await
            .expect("timed out waiting for a message")
            .expect("stream ended")
            .expect("WebSocket error");
        match message {
            Message::Text(text) => return serde_json::from_str(&text).expect("reply must be JSON"),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("unexpected message: {other:?}"),
        }
    }
}

/// Reads up to the end of the `101` response; returns any frame bytes after it.
async fn read_upgrade_response(reader: &mut OwnedReadHalf) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(end) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
            assert!(buf.starts_with(b"HTTP/1.1 101"));
            return buf.split_off(end + 4);
        }
        let n = timeout(WAIT, reader.read(&mut chunk)).await.unwrap().unwrap();
        assert!(n > 0, "server closed during the upgrade");
        buf.extend_from_slice(&chunk[..n]);
    }
}

const RAW_UPGRADE: &str = "GET / HTTP/1.1\r\n\
    Host: 127.0.0.1\r\n\
    Upgrade: websocket\r\n\
    Connection: Upgrade\r\n\
    Sec-WebSocket-Key: dGhlIHNhbXBsZSBub25jZQ==\r\n\
    Sec-WebSocket-Version: 13\r\n\r\n";

async fn next_event(events: &mut mpsc::Receiver<ConnectionEvent>) -> ConnectionEvent {
    timeout(WAIT, events.recv())
        .await
        .expect("timed out waiting for an event")
        .expect("event channel closed")
}

// ── Request / response ────────────────────────────────────────────────────────

#[tokio::test]
async fn test_request_id_is_echoed_on_reply() {
    // Arrange
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    // Act
    send(&mut client, json!({"type": "echo", "request_id": "abc", "data": {"page": 3}})).await;
    let reply = recv_json(&mut client).await;

    // Assert
    assert_eq!(
        reply,
        json!({
            "type": "success",
            "request_id": "abc",
            "data": {"original_type": "echo", "result": {"page": 3}}
        })
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_reply_without_request_id_omits_it() {
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "echo", "data": {}})).await;
    let reply = recv_json(&mut client).await;

    assert_eq!(reply["type"], "success");
    assert!(reply.get("request_id").is_none());
    manager.stop().await;
}

#[tokio::test]
async fn test_unknown_type_keeps_connection_open() {
    // Arrange
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    // Act
    send(&mut client, json!({"type": "nonexistent-type", "data": {}})).await;
    let error = recv_json(&mut client).await;
    send(&mut client, json!({"type": "echo", "request_id": "after"})).await;
    let follow_up = recv_json(&mut client).await;

    // Assert
    assert_eq!(error["type"], "error");
    assert_eq!(error["data"]["code"], "UNKNOWN_TYPE");
    assert_eq!(error["data"]["original_type"], "nonexistent-type");
    assert_eq!(follow_up["type"], "success");
    assert_eq!(follow_up["request_id"], "after");
    manager.stop().await;
}

#[tokio::test]
async fn test_invalid_json_is_reported_and_connection_stays_open() {
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    client
        .send(Message::Text("this is not json".to_string()))
        .await
        .unwrap();
    let error = recv_json(&mut client).await;
    send(&mut client, json!({"type": "echo"})).await;
    let follow_up = recv_json(&mut client).await;

    assert_eq!(error["data"]["code"], "INVALID_MESSAGE");
    assert_eq!(follow_up["type"], "success");
    manager.stop().await;
}

#[tokio::test]
async fn test_handler_error_code_passes_through() {
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    send(&mut client, json!({"type": "open_pdf", "request_id": "o1", "data": {"path": "/x.pdf"}}))
        .await;
    let reply = recv_json(&mut client).await;

    assert_eq!(reply["request_id"], "o1");
    assert_eq!(reply["data"]["code"], "FILE_NOT_FOUND");
    assert_eq!(reply["data"]["message"], "no such file");
    manager.stop().await;
}

#[tokio::test]
async fn test_replies_follow_request_order() {
    // Arrange: the first request is slow, the rest are instant
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;

    // Act
    send(&mut client, json!({"type": "slow", "request_id": "0"})).await;
    for i in 1..10 {
        send(&mut client, json!({"type": "echo", "request_id": i.to_string()})).await;
    }
    let mut ids = Vec::new();
    for _ in 0..10 {
        let reply = recv_json(&mut client).await;
        ids.push(reply["request_id"].as_str().unwrap().to_string());
    }

    // Assert
    let expected: Vec<String> = (0..10).map(|i| i.to_string()).collect();
    assert_eq!(ids, expected);
    manager.stop().await;
}

#[tokio::test]
async fn test_pipelined_burst_gets_every_reply_in_order() {
    // Arrange: many more requests than the dispatcher and outbound queues hold
    let config = ServerConfig {
        outbound_queue: 8,
        ..ServerConfig::default()
    };
    let (manager, _events, addr) = start_server(config).await;
    let (mut reader, mut writer) = TcpStream::connect(addr).await.unwrap().into_split();
    writer.write_all(RAW_UPGRADE.as_bytes()).await.unwrap();
    let mut buf = read_upgrade_response(&mut reader).await;

    let total = 2000;
    let mut burst = Vec::new();
    for i in 0..total {
        let request = json!({"type": "echo", "request_id": i.to_string()}).to_string();
        burst.extend_from_slice(&build_masked_frame(
            request.as_bytes(),
            Opcode::Text,
            true,
            [0x11, 0x22, 0x33, 0x44],
        ));
    }

    // Act: one coalesced write, replies read concurrently; the write half is
    // kept open so the server never sees EOF
    let write = tokio::spawn(async move {
        writer.write_all(&burst).await.unwrap();
        writer
    });
    let mut ids = Vec::with_capacity(total);
    let mut chunk = vec![0u8; 8 * 1024];
    while ids.len() < total {
        match parse_frame(&buf, DEFAULT_MAX_PAYLOAD) {
            Ok((frame, consumed)) => {
                buf.drain(..consumed);
                let reply: Value = serde_json::from_slice(&frame.payload).unwrap();
                if reply["type"] == "ping" {
                    continue;
                }
                assert_eq!(reply["type"], "success");
                ids.push(reply["request_id"].as_str().unwrap().parse::<usize>().unwrap());
            }
            Err(e) if e.is_need_more_data() => {
                let n = timeout(WAIT, reader.read(&mut chunk))
                    .await
                    .unwrap_or_else(|_| panic!("stalled after {} replies", ids.len()))
                    .unwrap();
                assert!(n > 0, "server closed after {} replies", ids.len());
                buf.extend_from_slice(&chunk[..n]);
            }
            Err(e) => panic!("malformed frame from server: {e}"),
        }
    }
    let _writer = write.await.unwrap();

    // Assert
    assert_eq!(ids, (0..total).collect::<Vec<_>>());
    manager.stop().await;
}

#[tokio::test]
async fn test_slow_handler_does_not_delay_other_connections() {
    // Arrange
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut slow_client = connect(addr).await;
    let mut fast_client = connect(addr).await;

    // Act
    send(&mut slow_client, json!({"type": "slow", "request_id": "s"})).await;
    send(&mut fast_client, json!({"type": "echo", "request_id": "f"})).await;
    let fast = timeout(Duration::from_millis(200), recv_json(&mut fast_client)).await;

    // Assert: the fast reply arrives while the slow handler is still sleeping
    assert_eq!(fast.expect("fast reply must not wait for the slow handler")["request_id"], "f");
    assert_eq!(recv_json(&mut slow_client).await["request_id"], "s");
    manager.stop().await;
}

// ── Fan-out ───────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_broadcast_reaches_every_client() {
    // Arrange
    let (manager, _events, addr) = start_server(ServerConfig::default()).await;
    let mut clients = vec![connect(addr).await, connect(addr).await, connect(addr).await];

    // Act
    let delivered = manager.broadcast(r#"{"type":"library_changed"}"#).await;

    // Assert
    assert_eq!(delivered, 3);
    for client in &mut clients {
        assert_eq!(recv_json(client).await["type"], "library_changed");
    }
    manager.stop().await;
}

#[tokio::test]
async fn test_broadcast_survives_a_disconnecting_peer() {
    // Arrange
    let (manager, mut events, addr) = start_server(ServerConfig::default()).await;
    let mut first = connect(addr).await;
    let mut second = connect(addr).await;
    let third = connect(addr).await;
    for _ in 0..3 {
        next_event(&mut events).await;
    }

    // Act: the third peer vanishes without a close frame, then we broadcast
    drop(third);
    let delivered = manager.broadcast(r#"{"type":"bookmarks_changed"}"#).await;

    // Assert: the other two are neither skipped nor affected
    assert!(delivered >= 2, "delivered to {delivered}");
    assert_eq!(recv_json(&mut first).await["type"], "bookmarks_changed");
    assert_eq!(recv_json(&mut second).await["type"], "bookmarks_changed");

    let gone = next_event(&mut events).await;
    assert!(matches!(gone, ConnectionEvent::Disconnected { .. }));
    assert_eq!(manager.broadcast(r#"{"type":"again"}"#).await, 2);
    manager.stop().await;
}

#[tokio::test]
async fn test_unicast_to_connection_id() {
    // Arrange
    let (manager, mut events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;
    let id = next_event(&mut events).await.id();

    // Act
    let sent = manager.send(id, r#"{"type":"pdf_opened"}"#).await;
    let missing = manager.send(ConnectionId::new(), "nobody").await;

    // Assert
    assert!(sent);
    assert!(!missing);
    assert_eq!(recv_json(&mut client).await["type"], "pdf_opened");
    manager.stop().await;
}

// ── Lifecycle ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn test_heartbeat_is_sent_periodically() {
    // Arrange
    let config = ServerConfig {
        heartbeat_interval: Duration::from_millis(100),
        ..ServerConfig::default()
    };
    let (manager, _events, addr) = start_server(config).await;
    let mut client = connect(addr).await;

    // Act
    let first = recv_json(&mut client).await;
    let second = recv_json(&mut client).await;

    // Assert
    assert_eq!(first, json!({"type": "ping"}));
    assert_eq!(second, json!({"type": "ping"}));
    manager.stop().await;
}

#[tokio::test]
async fn test_client_close_emits_disconnected_event() {
    // Arrange
    let (manager, mut events, addr) = start_server(ServerConfig::default()).await;
    let mut client = connect(addr).await;
    let connected = next_event(&mut events).await;

    // Act
    client.close(None).await.unwrap();
    let disconnected = next_event(&mut events).await;

    // Assert
    assert!(matches!(connected, ConnectionEvent::Connected { .. }));
    assert_eq!(
        disconnected,
        ConnectionEvent::Disconnected {
            id: connected.id(),
            reason: DisconnectReason::PeerClosed
        }
    );
    assert_eq!(manager.connection_count().await, 0);
    manager.stop().await;
}

#[tokio::test]
async fn test_stop_closes_clients_once_and_is_idempotent() {
    // Arrange
    let (manager, mut events, addr) = start_server(ServerConfig::default()).await;
    let mut clients = vec![connect(addr).await, connect(addr).await];
    for _ in 0..2 {
        next_event(&mut events).await;
    }

    // Act
    let first_stop = manager.stop().await;
    let second_stop = manager.stop().await;

    // Assert
    assert!(first_stop);
    assert!(!second_stop);
    assert_eq!(manager.connection_count().await, 0);
    for client in &mut clients {
        let mut close_frames = 0;
        while let Ok(Some(Ok(message))) = timeout(WAIT, client.next()).await {
            if message.is_close() {
                close_frames += 1;
            }
        }
        assert_eq!(close_frames, 1, "exactly one close frame per client");
    }
    for _ in 0..2 {
        assert!(matches!(
            next_event(&mut events).await,
            ConnectionEvent::Disconnected {
                reason: DisconnectReason::ServerShutdown,
                ..
            }
        ));
    }
    assert!(TcpStream::connect(addr).await.is_err(), "port must be released");
}

#[tokio::test]
async fn test_malformed_upgrade_is_dropped() {
    // Arrange
    let (manager, mut events, addr) = start_server(ServerConfig::default()).await;
    let mut socket = TcpStream::connect(addr).await.unwrap();
    let id = next_event(&mut events).await.id();

    // Act: no Sec-WebSocket-Key
    socket
        .write_all(b"GET / HTTP/1.1\r\nHost: x\r\nUpgrade: websocket\r\n\r\n")
        .await
        .unwrap();
    let mut buf = [0u8; 64];
    let n = timeout(WAIT, socket.read(&mut buf)).await.unwrap().unwrap_or(0);

    // Assert: nothing written back, socket closed
    assert_eq!(n, 0);
    assert_eq!(
        next_event(&mut events).await,
        ConnectionEvent::Disconnected {
            id,
            reason: DisconnectReason::HandshakeRejected
        }
    );
    manager.stop().await;
}

#[tokio::test]
async fn test_server_info_style_handler_sees_live_count() {
    // Arrange
    let mut handlers = HandlerRegistry::new();
    handlers.register(
        "count",
        handler_fn(|_data, ctx| async move { Ok(json!({ "connections": ctx.live_connections() })) }),
    );
    let (manager, _events) =
        ConnectionManager::new(ServerConfig::default(), MessageRouter::new(handlers));
    let addr = manager.start("127.0.0.1:0".parse().unwrap()).await.unwrap();
    let mut a = connect(addr).await;
    let _b = connect(addr).await;

    // Act
    send(&mut a, json!({"type": "count"})).await;
    let reply = recv_json(&mut a).await;

    // Assert
    assert_eq!(reply["data"]["result"]["connections"], 2);
    manager.stop().await;
}
