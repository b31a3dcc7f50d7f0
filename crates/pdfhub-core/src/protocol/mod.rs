//! Protocol module containing the frame codec and the upgrade handshake.

pub mod frame;
pub mod handshake;

pub use frame::{
    apply_mask, build_close_frame, build_frame, build_masked_frame, build_pong_frame,
    build_text_frame, parse_frame,
    Frame, FrameError, Opcode, DEFAULT_MAX_PAYLOAD,
};
pub use handshake::{
    compute_accept_token, try_handshake, Handshake, HandshakeError, DEFAULT_MAX_REQUEST,
    WEBSOCKET_GUID,
};
