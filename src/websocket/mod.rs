//! WebSocket frame codec implementation conforming to RFC 6455.
//!
//! This module provides frame parsing, encoding, and masking, plus stream
//! wrappers that read client frames and write server frames using
//! tokio_util::codec.

mod codec;
mod frame;
mod wrapper;

pub use codec::{DEFAULT_MAX_FRAME_SIZE, WebSocketCodec};
pub use frame::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, Frame, FrameHeader, OpCode, WebSocketError, apply_mask,
};
pub use wrapper::{WebSocketDecoder, WebSocketEncoder};
