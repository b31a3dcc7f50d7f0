//! # pdfhub-core
//!
//! Shared protocol library for the PDF Hub backend: the WebSocket wire format
//! spoken between the embedded browser view and the local backend process.
//!
//! This crate has zero dependencies on sockets, async runtimes, or the file
//! system.  Every function takes bytes (or strings) in and hands bytes (or
//! typed values) back, which keeps the binary-format rules easy to test.
//!
//! # Architecture overview
//!
//! - **`protocol::frame`** – The Frame Codec.  Parses RFC 6455 frames out of
//!   an accumulating byte buffer and builds unmasked server-to-client frames.
//!
//! - **`protocol::handshake`** – The Handshake Negotiator.  Turns the HTTP
//!   `Upgrade` request into a `101 Switching Protocols` response.
//!
//! - **`envelope`** – The JSON application envelope carried inside text
//!   frames: inbound requests, success/error replies, and the stable error
//!   codes clients branch on.

pub mod envelope;
pub mod protocol;

// Re-export the most-used types at the crate root so callers can write
// `pdfhub_core::Frame` instead of `pdfhub_core::protocol::frame::Frame`.
pub use envelope::{heartbeat_message, ErrorCode, ErrorData, InvalidMessage, Reply, Request, SuccessData};
pub use protocol::frame::{
    build_close_frame, build_frame, build_text_frame, parse_frame, Frame, FrameError, Opcode,
};
pub use protocol::handshake::{compute_accept_token, try_handshake, Handshake, HandshakeError};
