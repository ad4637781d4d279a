//! WebSocket codec for use with tokio_util::codec.
//!
//! The decoder turns raw client bytes into frames one at a time. Every frame is
//! returned as soon as it is complete; continuation frames are not reassembled.

use super::frame::{Frame, FrameHeader, WebSocketError, apply_mask};
use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

/// Default upper bound on a single frame payload (16 MiB).
pub const DEFAULT_MAX_FRAME_SIZE: u64 = 16 * 1024 * 1024;

/// Most the decoder reserves ahead of a partial frame at once.
const MAX_RESERVE: usize = 64 * 1024;

/// WebSocket codec that implements tokio_util's Decoder and Encoder traits.
///
/// Decoding expects masked client frames; encoding writes unmasked server frames.
#[derive(Debug, Clone)]
pub struct WebSocketCodec {
    max_frame_size: u64,
}

impl WebSocketCodec {
    /// Create a new WebSocket codec with the default frame size limit.
    pub fn new() -> Self {
        Self::with_max_frame_size(DEFAULT_MAX_FRAME_SIZE)
    }

    /// Create a codec that refuses frames whose payload exceeds `max_frame_size`.
    pub fn with_max_frame_size(max_frame_size: u64) -> Self {
        Self { max_frame_size }
    }

}

impl Default for WebSocketCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for WebSocketCodec {
    type Item = Frame;
    type Error = WebSocketError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let header = match FrameHeader::parse(&src[..], self.max_frame_size) {
            Ok(header) => header,
            Err(WebSocketError::IncompleteFrame) => return Ok(None),
            Err(e) => return Err(e),
        };

        let payload_len = header.payload_len as usize;
        let total = header.frame_len();
        if src.len() < total {
            // Grow with the bytes that actually arrive, not the declared length
            src.reserve((total - src.len()).min(MAX_RESERVE));
            return Ok(None);
        }

        src.advance(header.header_len);
        let mut payload = src.split_to(payload_len);
        apply_mask(&mut payload, header.mask);

        Ok(Some(Frame {
            fin: header.fin,
            opcode: header.opcode,
            payload: payload.freeze(),
        }))
    }
}

impl Encoder<Frame> for WebSocketCodec {
    type Error = WebSocketError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        // No masking for server->client frames
        dst.reserve(14 + frame.payload.len());
        frame.encode_header(None, dst);
        dst.extend_from_slice(&frame.payload);

        Ok(())
    }
}
