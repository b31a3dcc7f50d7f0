//! MessageRouter: turns one inbound text payload into exactly one reply.
//!
//! For every message the router:
//!
//! 1. Decodes the JSON envelope (`INVALID_MESSAGE` on failure).
//! 2. Looks up the handler registered for `type` (`UNKNOWN_TYPE` if none).
//! 3. Runs the handler with `data` and the connection context.
//! 4. Shapes the outcome into a success or error [`Reply`], echoing
//!    `request_id` when the request carried one.
//!
//! A handler that returns an error, or panics, still produces exactly one
//! reply and never affects the connection itself.
//!
//! # Architecture
//!
//! The router depends only on the [`Handler`] and [`MessageSink`] traits.
//! Handlers are supplied by the composing application; the sink is the
//! connection manager in production and a recording double in tests.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::FutureExt;
use pdfhub_core::{ErrorCode, Reply, Request};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, error, warn};

use crate::domain::{ConnectionContext, ConnectionId};

/// The `INTERNAL_ERROR` text sent when `reply` itself cannot be serialised.
/// Built from plain strings so it always encodes, and keeps `request_id`.
fn encode_failure_reply(reply: &Reply) -> String {
    let mut value = serde_json::json!({
        "type": "error",
        "data": {
            "code": ErrorCode::InternalError.as_str(),
            "message": "failed to encode reply",
            "original_type": reply.original_type(),
        },
    });
    if let Some(request_id) = reply.request_id() {
        value["request_id"] = Value::String(request_id.to_string());
    }
    value.to_string()
}

// ── Handler seam ──────────────────────────────────────────────────────────────

/// A business-level failure reported back to the client as `{code, message}`.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{code}: {message}")]
pub struct HandlerError {
    pub code: String,
    pub message: String,
}

impl HandlerError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn with_code(code: ErrorCode, message: impl Into<String>) -> Self {
        Self::new(code.as_str(), message)
    }

    pub fn invalid_params(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InvalidParams, message)
    }

    pub fn internal(message: impl Into<String>) -> Self {
        Self::with_code(ErrorCode::InternalError, message)
    }
}

/// Business logic for one message `type`.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, data: Value, ctx: &ConnectionContext) -> Result<Value, HandlerError>;
}

struct FnHandler<F>(F);

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(Value, ConnectionContext) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value, HandlerError>> + Send,
{
    async fn handle(&self, data: Value, ctx: &ConnectionContext) -> Result<Value, HandlerError> {
        (self.0)(data, ctx.clone()).await
    }
}

/// Wraps an async closure as a [`Handler`].
///
/// ```rust
/// use pdfhub_server::application::router::{handler_fn, HandlerRegistry};
///
/// let mut handlers = HandlerRegistry::new();
/// handlers.register("echo", handler_fn(|data, _ctx| async move { Ok(data) }));
/// assert!(handlers.contains("echo"));
/// ```
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, ConnectionContext) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
{
    Arc::new(FnHandler(f))
}

struct BlockingHandler<F>(Arc<F>);

#[async_trait]
impl<F> Handler for BlockingHandler<F>
where
    F: Fn(Value, ConnectionContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    async fn handle(&self, data: Value, ctx: &ConnectionContext) -> Result<Value, HandlerError> {
        let f = Arc::clone(&self.0);
        let ctx = ctx.clone();
        match tokio::task::spawn_blocking(move || f(data, ctx)).await {
            Ok(result) => result,
            Err(e) if e.is_panic() => Err(HandlerError::internal("handler panicked")),
            Err(e) => Err(HandlerError::internal(format!("handler task failed: {e}"))),
        }
    }
}

/// Wraps a synchronous closure as a [`Handler`] that runs on the blocking
/// thread pool.  Use it for file parsing, database access and anything else
/// that would otherwise stall the runtime.
pub fn blocking_handler<F>(f: F) -> Arc<dyn Handler>
where
    F: Fn(Value, ConnectionContext) -> Result<Value, HandlerError> + Send + Sync + 'static,
{
    Arc::new(BlockingHandler(Arc::new(f)))
}

// ── Registry ──────────────────────────────────────────────────────────────────

/// Mapping from message `type` to its handler.  Built once at startup.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `handler` for `kind`, returning the handler it replaced.
    pub fn register(
        &mut self,
        kind: impl Into<String>,
        handler: Arc<dyn Handler>,
    ) -> Option<Arc<dyn Handler>> {
        self.handlers.insert(kind.into(), handler)
    }

    pub fn get(&self, kind: &str) -> Option<Arc<dyn Handler>> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }

    /// Registered message types, sorted.
    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("kinds", &self.kinds())
            .finish()
    }
}

// ── Delivery seam ─────────────────────────────────────────────────────────────

/// Where replies go.  Implemented by the connection manager.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait MessageSink: Send + Sync {
    /// Delivers `text` to one connection.  Returns `false` if the connection
    /// is gone or would not accept the message.
    async fn deliver(&self, connection_id: ConnectionId, text: String) -> bool;
}

// ── Router ────────────────────────────────────────────────────────────────────

/// Decodes, dispatches and answers inbound messages.
#[derive(Debug, Clone, Default)]
pub struct MessageRouter {
    handlers: HandlerRegistry,
}

impl MessageRouter {
    pub fn new(handlers: HandlerRegistry) -> Self {
        Self { handlers }
    }

    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Produces the reply for one raw text payload without delivering it.
    pub async fn route(&self, ctx: &ConnectionContext, raw: &str) -> Reply {
        let Request {
            kind,
            request_id,
            data,
        } = match Request::decode(raw) {
            Ok(request) => request,
            Err(invalid) => {
                warn!(
                    "connection {}: invalid message: {}",
                    ctx.connection_id, invalid.reason
                );
                return Reply::invalid(invalid);
            }
        };

        let Some(handler) = self.handlers.get(&kind) else {
            debug!("connection {}: no handler for {kind:?}", ctx.connection_id);
            let message = format!("no handler registered for type {kind:?}");
            return Reply::error(request_id, kind, ErrorCode::UnknownType.as_str(), message);
        };

        debug!("connection {}: dispatching {kind:?}", ctx.connection_id);
        let outcome = AssertUnwindSafe(handler.handle(data, ctx))
            .catch_unwind()
            .await;

        match outcome {
            Ok(Ok(result)) => Reply::success(request_id, kind, result),
            Ok(Err(e)) => {
                debug!("connection {}: {kind:?} failed: {e}", ctx.connection_id);
                Reply::error(request_id, kind, e.code, e.message)
            }
            Err(_) => {
                error!("connection {}: handler for {kind:?} panicked", ctx.connection_id);
                Reply::error(
                    request_id,
                    kind,
                    ErrorCode::InternalError.as_str(),
                    "handler panicked",
                )
            }
        }
    }

    /// Routes `raw` and delivers the single reply through `sink`.
    ///
    /// Returns whether the sink accepted the reply.
    pub async fn on_message(
        &self,
        sink: &dyn MessageSink,
        ctx: &ConnectionContext,
        raw: &str,
    ) -> bool {
        let reply = self.route(ctx, raw).await;
        let text = match reply.to_json() {
            Ok(text) => text,
            Err(e) => {
                error!("connection {}: failed to encode reply: {e}", ctx.connection_id);
                encode_failure_reply(&reply)
            }
        };

        let delivered = sink.deliver(ctx.connection_id, text).await;
        if !delivered {
            debug!("connection {}: reply not delivered", ctx.connection_id);
        }
        delivered
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────
