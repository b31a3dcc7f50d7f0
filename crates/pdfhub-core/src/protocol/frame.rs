//! RFC 6455 frame codec: parse inbound frames, build outbound frames.
//!
//! Wire format:
//! ```text
//!  byte 0: [FIN:1][RSV:3][OPCODE:4]
//!  byte 1: [MASK:1][LEN:7]
//!  LEN == 126 → next 2 bytes are the real length (big-endian)
//!  LEN == 127 → next 8 bytes are the real length (big-endian)
//!  MASK == 1  → next 4 bytes are the masking key
//!  then the payload
//! ```
//!
//! # Streaming (for beginners)
//!
//! TCP delivers a byte *stream*, not frames.  One `read()` may return half a
//! frame, or three frames glued together.  [`parse_frame`] therefore works on
//! an accumulating buffer: it either returns one complete frame plus the
//! number of bytes it used, or [`FrameError::NeedMoreData`] to say "keep the
//! bytes, read some more, and call me again".  It never consumes a partial
//! frame.
//!
//! Clients must mask every frame they send; servers never mask.  Both rules
//! are handled here so the connection layer only ever sees plain payloads.

use thiserror::Error;

/// Upper bound on a single frame's payload unless the caller supplies another.
///
/// A garbled or hostile 64-bit length field could otherwise make us reserve
/// gigabytes before a single payload byte arrives.
pub const DEFAULT_MAX_PAYLOAD: usize = 16 * 1024 * 1024;

/// Largest payload that fits the 7-bit length field.
const MAX_SHORT_LEN: usize = 125;

/// Errors produced while parsing frames.
///
/// Only [`FrameError::NeedMoreData`] is recoverable; every other variant is a
/// protocol violation and the connection must be dropped.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FrameError {
    /// The buffer does not yet hold the complete header or payload.
    #[error("need more data: frame requires {needed} bytes, buffer holds {available}")]
    NeedMoreData { needed: usize, available: usize },

    /// An RSV bit is set; no extension is ever negotiated.
    #[error("reserved bits set: 0x{0:X}")]
    ReservedBits(u8),

    /// The opcode nibble is one of the reserved values.
    #[error("unknown opcode: 0x{0:X}")]
    UnknownOpcode(u8),

    /// The declared payload length exceeds the configured limit.
    #[error("payload length {declared} exceeds limit of {limit} bytes")]
    PayloadTooLarge { declared: u64, limit: usize },

    /// A text payload is not valid UTF-8.
    #[error("payload is not valid UTF-8")]
    InvalidUtf8,
}

impl FrameError {
    /// Returns `true` for the "wait for more bytes" signal.
    pub fn is_need_more_data(&self) -> bool {
        matches!(self, FrameError::NeedMoreData { .. })
    }
}

/// Frame opcodes understood by the codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    /// Control opcodes have the high bit of the nibble set.
    pub fn is_control(self) -> bool {
        (self as u8) & 0x08 != 0
    }
}

impl TryFrom<u8> for Opcode {
    type Error = FrameError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(FrameError::UnknownOpcode(other)),
        }
    }
}

/// One logical frame with its payload already unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// `true` when this is the final fragment of a message.
    pub fin: bool,
    pub opcode: Opcode,
    pub payload: Vec<u8>,
}

impl Frame {
    /// Creates a final (unfragmented) frame.
    pub fn new(opcode: Opcode, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            fin: true,
            opcode,
            payload: payload.into(),
        }
    }

    /// Creates a final text frame.
    pub fn text(text: impl Into<String>) -> Self {
        Self::new(Opcode::Text, text.into().into_bytes())
    }

    /// Whether the peer asked to terminate the connection.
    pub fn is_close(&self) -> bool {
        self.opcode == Opcode::Close
    }

    pub fn is_control(&self) -> bool {
        self.opcode.is_control()
    }

    /// Consumes the frame and decodes its payload as UTF-8.
    ///
    /// # Errors
    ///
    /// Returns [`FrameError::InvalidUtf8`] if the bytes are not valid UTF-8.
    pub fn into_text(self) -> Result<String, FrameError> {
        String::from_utf8(self.payload).map_err(|_| FrameError::InvalidUtf8)
    }
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Parses one frame from the start of `buf`.
///
/// On success returns the frame and the exact number of bytes it occupied so
/// the caller can drain them from its buffer.  Masked payloads are unmasked.
///
/// # Errors
///
/// - [`FrameError::NeedMoreData`] when `buf` ends before the frame does.
/// - [`FrameError::ReservedBits`] when any RSV bit is set.
/// - [`FrameError::UnknownOpcode`] for reserved opcodes.
/// - [`FrameError::PayloadTooLarge`] when the length field exceeds `max_payload`.
///
/// # Examples
///
/// ```rust
/// use pdfhub_core::protocol::frame::{build_text_frame, parse_frame, DEFAULT_MAX_PAYLOAD};
///
/// let bytes = build_text_frame("hello");
/// let (frame, consumed) = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
/// assert_eq!(frame.payload, b"hello");
/// assert_eq!(consumed, bytes.len());
/// ```
pub fn parse_frame(buf: &[u8], max_payload: usize) -> Result<(Frame, usize), FrameError> {
    require(buf, 2)?;

    let fin = buf[0] & 0x80 != 0;
    let rsv = buf[0] & 0x70;
    if rsv != 0 {
        return Err(FrameError::ReservedBits(rsv));
    }
    let opcode = Opcode::try_from(buf[0] & 0x0F)?;
    let masked = buf[1] & 0x80 != 0;
    let base_len = buf[1] & 0x7F;

    let (declared, mut offset) = match base_len {
        126 => {
            require(buf, 4)?;
            (u64::from(u16::from_be_bytes([buf[2], buf[3]])), 4)
        }
        127 => {
            require(buf, 10)?;
            let mut raw = [0u8; 8];
            raw.copy_from_slice(&buf[2..10]);
            (u64::from_be_bytes(raw), 10)
        }
        short => (u64::from(short), 2),
    };

    if declared > max_payload as u64 {
        return Err(FrameError::PayloadTooLarge {
            declared,
            limit: max_payload,
        });
    }
    // Bounded by `max_payload` above, so the cast cannot truncate.
    let payload_len = declared as usize;

    let mask = if masked {
        require(buf, offset + 4)?;
        let key = [buf[offset], buf[offset + 1], buf[offset + 2], buf[offset + 3]];
        offset += 4;
        Some(key)
    } else {
        None
    };

    let total = offset + payload_len;
    require(buf, total)?;

    let mut payload = buf[offset..total].to_vec();
    if let Some(key) = mask {
        apply_mask(&mut payload, key);
    }

    Ok((
        Frame {
            fin,
            opcode,
            payload,
        },
        total,
    ))
}

/// Builds an unmasked, final server-to-client frame.
pub fn build_frame(payload: &[u8], opcode: Opcode) -> Vec<u8> {
    let mut buf = Vec::with_capacity(10 + payload.len());
    buf.push(0x80 | opcode as u8);
    write_length(&mut buf, payload.len(), 0x00);
    buf.extend_from_slice(payload);
    buf
}

/// Builds a text frame carrying `text`.
pub fn build_text_frame(text: &str) -> Vec<u8> {
    build_frame(text.as_bytes(), Opcode::Text)
}

/// Builds a zero-length close frame.
pub fn build_close_frame() -> Vec<u8> {
    build_frame(&[], Opcode::Close)
}

/// Builds the pong reply to a ping carrying `payload`.
pub fn build_pong_frame(payload: &[u8]) -> Vec<u8> {
    build_frame(payload, Opcode::Pong)
}

/// Builds a masked client-to-server frame.
///
/// The server never sends these; they are what a browser puts on the wire,
/// and what tests and tooling need to feed into [`parse_frame`].
pub fn build_masked_frame(payload: &[u8], opcode: Opcode, fin: bool, mask: [u8; 4]) -> Vec<u8> {
    let mut buf = Vec::with_capacity(14 + payload.len());
    let fin_bit: u8 = if fin { 0x80 } else { 0x00 };
    buf.push(fin_bit | opcode as u8);
    write_length(&mut buf, payload.len(), 0x80);
    buf.extend_from_slice(&mask);
    let start = buf.len();
    buf.extend_from_slice(payload);
    apply_mask(&mut buf[start..], mask);
    buf
}

/// XORs `payload` with the 4-byte masking key.  Applying it twice restores
/// the original bytes.
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}

// ── Helpers ───────────────────────────────────────────────────────────────────

/// Writes the 7-bit / 16-bit / 64-bit length field, OR-ing `mask_bit` into
/// the second header byte.
fn write_length(buf: &mut Vec<u8>, len: usize, mask_bit: u8) {
    if len <= MAX_SHORT_LEN {
        buf.push(mask_bit | len as u8);
    } else if len <= u16::MAX as usize {
        buf.push(mask_bit | 126);
        buf.extend_from_slice(&(len as u16).to_be_bytes());
    } else {
        buf.push(mask_bit | 127);
        buf.extend_from_slice(&(len as u64).to_be_bytes());
    }
}

fn require(buf: &[u8], needed: usize) -> Result<(), FrameError> {
    if buf.len() < needed {
        return Err(FrameError::NeedMoreData {
            needed,
            available: buf.len(),
        });
    }
    Ok(())
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    const MASK: [u8; 4] = [0x37, 0xFA, 0x21, 0x3D];

    #[test]
    fn test_build_text_frame_short_header_layout() {
        // Act
        let bytes = build_text_frame("Hello");

        // Assert: FIN + text opcode, unmasked 7-bit length, then the payload
        assert_eq!(bytes[0], 0x81);
        assert_eq!(bytes[1], 5);
        assert_eq!(&bytes[2..], b"Hello");
    }

    #[test]
    fn test_build_frame_uses_16_bit_length_at_126() {
        let payload = vec![b'x'; 126];
        let bytes = build_frame(&payload, Opcode::Text);
        assert_eq!(bytes[1], 126);
        assert_eq!(u16::from_be_bytes([bytes[2], bytes[3]]), 126);
        assert_eq!(bytes.len(), 4 + 126);
    }

    #[test]
    fn test_build_frame_uses_64_bit_length_above_u16_max() {
        let payload = vec![0u8; 65_536];
        let bytes = build_frame(&payload, Opcode::Binary);
        assert_eq!(bytes[1], 127);
        assert_eq!(&bytes[2..10], &65_536u64.to_be_bytes());
        assert_eq!(bytes.len(), 10 + 65_536);
    }

    #[test]
    fn test_build_close_frame_is_two_bytes() {
        assert_eq!(build_close_frame(), vec![0x88, 0x00]);
    }

    #[test]
    fn test_parse_rfc_masked_hello_example() {
        // Arrange: RFC 6455 §5.7 "a single-frame masked text message"
        let bytes = [
            0x81, 0x85, 0x37, 0xFA, 0x21, 0x3D, 0x7F, 0x9F, 0x4D, 0x51, 0x58,
        ];

        // Act
        let (frame, consumed) = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();

        // Assert
        assert!(frame.fin);
        assert_eq!(frame.opcode, Opcode::Text);
        assert_eq!(frame.into_text().unwrap(), "Hello");
        assert_eq!(consumed, bytes.len());
    }

    #[test]
    fn test_parse_empty_payload_yields_empty_string() {
        let bytes = build_masked_frame(b"", Opcode::Text, true, MASK);
        let (frame, consumed) = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert_eq!(consumed, 6);
        assert_eq!(frame.into_text().unwrap(), "");
    }

    #[test]
    fn test_parse_single_byte_reports_need_more_data() {
        let result = parse_frame(&[0x81], DEFAULT_MAX_PAYLOAD);
        assert_eq!(
            result,
            Err(FrameError::NeedMoreData {
                needed: 2,
                available: 1
            })
        );
    }

    #[test]
    fn test_parse_truncated_extended_length_reports_need_more_data() {
        // 127 announces an 8-byte length but only 3 of them are present
        let result = parse_frame(&[0x82, 127, 0, 0, 0], DEFAULT_MAX_PAYLOAD);
        assert!(result.unwrap_err().is_need_more_data());
    }

    #[test]
    fn test_parse_truncated_mask_key_reports_need_more_data() {
        let bytes = build_masked_frame(b"abc", Opcode::Text, true, MASK);
        let result = parse_frame(&bytes[..4], DEFAULT_MAX_PAYLOAD);
        assert!(result.unwrap_err().is_need_more_data());
    }

    #[test]
    fn test_parse_truncated_payload_reports_total_needed() {
        let bytes = build_text_frame("abcdef");
        let result = parse_frame(&bytes[..5], DEFAULT_MAX_PAYLOAD);
        assert_eq!(
            result,
            Err(FrameError::NeedMoreData {
                needed: bytes.len(),
                available: 5
            })
        );
    }

    #[test]
    fn test_parse_consumes_only_first_of_two_frames() {
        // Arrange: two frames coalesced into one read
        let mut buf = build_masked_frame(b"one", Opcode::Text, true, MASK);
        let first_len = buf.len();
        buf.extend_from_slice(&build_masked_frame(b"two", Opcode::Text, true, MASK));

        // Act
        let (first, consumed) = parse_frame(&buf, DEFAULT_MAX_PAYLOAD).unwrap();
        let (second, _) = parse_frame(&buf[consumed..], DEFAULT_MAX_PAYLOAD).unwrap();

        // Assert
        assert_eq!(consumed, first_len);
        assert_eq!(first.payload, b"one");
        assert_eq!(second.payload, b"two");
    }

    #[test]
    fn test_parse_rejects_reserved_bits() {
        // Arrange: FIN + RSV1 on a text frame, as a compressed frame would be
        let mut bytes = build_text_frame("hi");
        bytes[0] |= 0x40;

        // Act
        let result = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD);

        // Assert
        assert_eq!(result.unwrap_err(), FrameError::ReservedBits(0x40));
    }

    #[test]
    fn test_parse_rejects_reserved_opcode() {
        let result = parse_frame(&[0x83, 0x00], DEFAULT_MAX_PAYLOAD);
        assert_eq!(result, Err(FrameError::UnknownOpcode(0x3)));
    }

    #[test]
    fn test_parse_rejects_oversized_length_before_payload_arrives() {
        // Arrange: header claims 2^63 bytes; no payload follows
        let mut bytes = vec![0x82, 127];
        bytes.extend_from_slice(&(1u64 << 63).to_be_bytes());

        // Act
        let result = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD);

        // Assert: rejected on the header alone, not reported as NeedMoreData
        assert_eq!(
            result,
            Err(FrameError::PayloadTooLarge {
                declared: 1u64 << 63,
                limit: DEFAULT_MAX_PAYLOAD
            })
        );
    }

    #[test]
    fn test_parse_respects_custom_limit() {
        let bytes = build_text_frame("0123456789");
        assert!(matches!(
            parse_frame(&bytes, 9),
            Err(FrameError::PayloadTooLarge { declared: 10, limit: 9 })
        ));
        assert!(parse_frame(&bytes, 10).is_ok());
    }

    #[test]
    fn test_parse_reports_fin_clear_on_fragment() {
        let bytes = build_masked_frame(b"part", Opcode::Text, false, MASK);
        let (frame, _) = parse_frame(&bytes, DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(!frame.fin);
    }

    #[test]
    fn test_close_frame_is_recognised() {
        let (frame, _) = parse_frame(&build_close_frame(), DEFAULT_MAX_PAYLOAD).unwrap();
        assert!(frame.is_close());
        assert!(frame.is_control());
    }

    #[test]
    fn test_apply_mask_twice_restores_payload() {
        let original = b"masking is its own inverse".to_vec();
        let mut data = original.clone();
        apply_mask(&mut data, MASK);
        assert_ne!(data, original);
        apply_mask(&mut data, MASK);
        assert_eq!(data, original);
    }

    #[test]
    fn test_into_text_rejects_invalid_utf8() {
        let frame = Frame::new(Opcode::Text, vec![0xFF, 0xFE]);
        assert_eq!(frame.into_text(), Err(FrameError::InvalidUtf8));
    }

    #[test]
    fn test_opcode_control_classification() {
        assert!(Opcode::Close.is_control());
        assert!(Opcode::Ping.is_control());
        assert!(Opcode::Pong.is_control());
        assert!(!Opcode::Text.is_control());
        assert!(!Opcode::Continuation.is_control());
    }
}
