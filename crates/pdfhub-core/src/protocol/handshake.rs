//! HTTP → WebSocket upgrade handshake (RFC 6455 §4.2).
//!
//! The browser opens a plain TCP connection and sends an HTTP/1.1 `GET`
//! request carrying a random `Sec-WebSocket-Key`.  The server proves it speaks
//! WebSocket by answering with
//!
//! ```text
//! Sec-WebSocket-Accept = base64( SHA-1( key + "258EAFA5-E914-47DA-95CA-C5AB0DC85B11" ) )
//! ```
//!
//! Browsers recompute the same value and refuse the connection on any
//! mismatch, so the GUID and the algorithm must match byte-for-byte.
//!
//! Like the frame codec, [`try_handshake`] works on an accumulating buffer:
//! until the blank line that ends the HTTP headers has arrived it reports
//! [`HandshakeError::Incomplete`].

use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;
use tracing::debug;

/// The fixed GUID every RFC 6455 server appends to the client key.
pub const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default upper bound on the size of the upgrade request.
pub const DEFAULT_MAX_REQUEST: usize = 8 * 1024;

const HEADER_TERMINATOR: &[u8] = b"\r\n\r\n";

/// Reasons an upgrade request cannot (yet) be accepted.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// The blank line ending the headers has not arrived yet.
    #[error("incomplete upgrade request ({received} bytes so far)")]
    Incomplete { received: usize },

    /// The request grew past the limit without finishing its headers.
    #[error("upgrade request exceeds {limit} bytes")]
    RequestTooLarge { limit: usize },

    /// The request is not a well-formed HTTP `GET`.
    #[error("malformed upgrade request: {0}")]
    Malformed(String),

    /// The request has no (or an empty) `Sec-WebSocket-Key` header.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

impl HandshakeError {
    /// `true` when the caller should read more bytes and retry.
    pub fn is_incomplete(&self) -> bool {
        matches!(self, HandshakeError::Incomplete { .. })
    }
}

/// A successfully negotiated upgrade.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    /// The computed `Sec-WebSocket-Accept` value.
    pub accept_token: String,
    /// The complete `101 Switching Protocols` response to write back.
    pub response: Vec<u8>,
    /// Length of the HTTP request in the input buffer.  Bytes past this
    /// point already belong to the WebSocket frame stream.
    pub consumed: usize,
}

/// Computes the `Sec-WebSocket-Accept` token for a client key.
///
/// # Examples
///
/// ```rust
/// use pdfhub_core::protocol::handshake::compute_accept_token;
///
/// // The sample nonce from RFC 6455 §1.3
/// assert_eq!(
///     compute_accept_token("dGhlIHNhbXBsZSBub25jZQ=="),
///     "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
/// );
/// ```
pub fn compute_accept_token(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WEBSOCKET_GUID.as_bytes());
    base64::engine::general_purpose::STANDARD.encode(hasher.finalize())
}

/// Attempts to complete the upgrade handshake from the bytes received so far.
///
/// # Errors
///
/// - [`HandshakeError::Incomplete`] – keep reading, then call again.
/// - [`HandshakeError::RequestTooLarge`], [`HandshakeError::Malformed`],
///   [`HandshakeError::MissingKey`] – reject; the socket must be dropped.
pub fn try_handshake(buf: &[u8], max_request: usize) -> Result<Handshake, HandshakeError> {
    let Some(head_len) = find_terminator(buf) else {
        if buf.len() > max_request {
            return Err(HandshakeError::RequestTooLarge { limit: max_request });
        }
        return Err(HandshakeError::Incomplete {
            received: buf.len(),
        });
    };

    let consumed = head_len + HEADER_TERMINATOR.len();
    if consumed > max_request {
        return Err(HandshakeError::RequestTooLarge { limit: max_request });
    }

    let head = std::str::from_utf8(&buf[..head_len])
        .map_err(|_| HandshakeError::Malformed("request head is not UTF-8".to_string()))?;

    let mut lines = head.split("\r\n");
    let request_line = lines.next().unwrap_or_default();
    validate_request_line(request_line)?;

    let mut key = None;
    for line in lines {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| HandshakeError::Malformed(format!("invalid header line: {line:?}")))?;
        if name.trim().eq_ignore_ascii_case("sec-websocket-key") {
            key = Some(value.trim());
        }
    }

    let key = key.filter(|k| !k.is_empty()).ok_or(HandshakeError::MissingKey)?;
    let accept_token = compute_accept_token(key);
    debug!("upgrade request accepted ({consumed} bytes)");

    Ok(Handshake {
        response: upgrade_response(&accept_token).into_bytes(),
        accept_token,
        consumed,
    })
}

// ── Helpers ───────────────────────────────────────────────────────────────────

fn find_terminator(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_TERMINATOR.len())
        .position(|window| window == HEADER_TERMINATOR)
}

fn validate_request_line(line: &str) -> Result<(), HandshakeError> {
    let mut parts = line.split_whitespace();
    match (parts.next(), parts.next(), parts.next()) {
        (Some("GET"), Some(_target), Some(version)) if version.starts_with("HTTP/1.") => Ok(()),
        _ => Err(HandshakeError::Malformed(format!(
            "unexpected request line: {line:?}"
        ))),
    }
}

fn upgrade_response(accept_token: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {accept_token}\r\n\r\n"
    )
}

// ── Tests ─────────────────────────────────────────────────────────────────────
