//! Application layer for the WebSocket backend.
//!
//! - **`router`** – The Message Router: decodes each inbound text payload,
//!   dispatches it by `type` to a registered handler and shapes exactly one
//!   success or error reply.  Depends only on the `Handler` and
//!   `MessageSink` traits, so it is fully unit-testable without sockets.

pub mod router;

pub use router::{
    blocking_handler, handler_fn, Handler, HandlerError, HandlerRegistry, MessageRouter,
    MessageSink,
};
