//! WebSocket frame parsing and encoding conforming to RFC 6455.

use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Close status code for a normal closure (RFC 6455 Section 7.4.1).
pub const CLOSE_NORMAL: u16 = 1000;

/// Close status code sent when the server is going away.
pub const CLOSE_GOING_AWAY: u16 = 1001;

/// WebSocket opcodes as defined in RFC 6455 Section 5.2.
///
/// Every 4-bit value decodes; values without an assigned meaning are kept as
/// [`OpCode::Reserved`] so they can be surfaced like any other data frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    /// Continuation frame (0x0)
    Continuation,
    /// Text data frame (0x1)
    Text,
    /// Binary data frame (0x2)
    Binary,
    /// Connection close frame (0x8)
    Close,
    /// Ping frame (0x9)
    Ping,
    /// Pong frame (0xA)
    Pong,
    /// Any unassigned opcode (0x3-0x7, 0xB-0xF)
    Reserved(u8),
}

impl OpCode {
    /// Decode the low 4 bits of the first header byte.
    pub fn from_bits(value: u8) -> Self {
        match value & 0x0F {
            0x0 => OpCode::Continuation,
            0x1 => OpCode::Text,
            0x2 => OpCode::Binary,
            0x8 => OpCode::Close,
            0x9 => OpCode::Ping,
            0xA => OpCode::Pong,
            other => OpCode::Reserved(other),
        }
    }

    /// The 4-bit wire value of this opcode.
    pub fn bits(self) -> u8 {
        match self {
            OpCode::Continuation => 0x0,
            OpCode::Text => 0x1,
            OpCode::Binary => 0x2,
            OpCode::Close => 0x8,
            OpCode::Ping => 0x9,
            OpCode::Pong => 0xA,
            OpCode::Reserved(value) => value & 0x0F,
        }
    }
}

/// Errors that can occur during WebSocket frame parsing/encoding.
#[derive(Debug)]
pub enum WebSocketError {
    /// Incomplete frame data
    IncompleteFrame,
    /// A client frame arrived with the MASK bit cleared
    UnmaskedFrame,
    /// Declared payload length exceeds the configured limit
    FrameTooLarge(u64),
    /// I/O error
    IoError(String),
}

impl fmt::Display for WebSocketError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WebSocketError::IncompleteFrame => write!(f, "Incomplete WebSocket frame"),
            WebSocketError::UnmaskedFrame => write!(f, "Client frame is not masked"),
            WebSocketError::FrameTooLarge(len) => {
                write!(f, "Frame payload of {} bytes exceeds limit", len)
            }
            WebSocketError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for WebSocketError {}

impl From<std::io::Error> for WebSocketError {
    fn from(err: std::io::Error) -> Self {
        WebSocketError::IoError(err.to_string())
    }
}

/// Decoded frame header: everything that precedes the payload on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameHeader {
    /// FIN bit
    pub fin: bool,
    /// Frame opcode
    pub opcode: OpCode,
    /// Masking key carried by the frame
    pub mask: [u8; 4],
    /// Decoded payload length
    pub payload_len: u64,
    /// Number of header bytes, including the masking key
    pub header_len: usize,
}

impl FrameHeader {
    /// Parse a client frame header from the start of `data`.
    ///
    /// Returns `Err(WebSocketError::IncompleteFrame)` if more data is needed.
    /// The MASK bit is checked as soon as the first two bytes are available,
    /// and the declared length is checked against `max_payload` before the
    /// masking key is looked at, so an oversized frame is refused without
    /// waiting for (or allocating) its payload.
    ///
    /// # RFC 6455 Frame Format
    ///
    /// ```text
    ///  0                   1                   2                   3
    ///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
    /// +-+-+-+-+-------+-+-------------+-------------------------------+
    /// |F|R|R|R| opcode|M| Payload len |    Extended payload length    |
    /// |I|S|S|S|  (4)  |A|     (7)     |             (16/64)           |
    /// |N|V|V|V|       |S|             |   (if payload len==126/127)   |
    /// | |1|2|3|       |K|             |                               |
    /// +-+-+-+-+-------+-+-------------+ - - - - - - - - - - - - - - - +
    /// |     Extended payload length continued, if payload len == 127  |
    /// + - - - - - - - - - - - - - - - +-------------------------------+
    /// |                               |Masking-key, if MASK set to 1  |
    /// +-------------------------------+-------------------------------+
    /// | Masking-key (continued)       |          Payload Data         |
    /// +-------------------------------- - - - - - - - - - - - - - - - +
    /// ```
    pub fn parse(data: &[u8], max_payload: u64) -> Result<Self, WebSocketError> {
        if data.len() < 2 {
            return Err(WebSocketError::IncompleteFrame);
        }

        let byte1 = data[0];
        let fin = (byte1 & 0b1000_0000) != 0;
        let opcode = OpCode::from_bits(byte1);

        let byte2 = data[1];
        if (byte2 & 0b1000_0000) == 0 {
            return Err(WebSocketError::UnmaskedFrame);
        }
        let mut payload_len = (byte2 & 0b0111_1111) as u64;

        let mut offset = 2;

        if payload_len == 126 {
            if data.len() < offset + 2 {
                return Err(WebSocketError::IncompleteFrame);
            }
            payload_len = u16::from_be_bytes([data[offset], data[offset + 1]]) as u64;
            offset += 2;
        } else if payload_len == 127 {
            let Some(ext) = data.get(offset..offset + 8) else {
                return Err(WebSocketError::IncompleteFrame);
            };
            let mut be = [0u8; 8];
            be.copy_from_slice(ext);
            payload_len = u64::from_be_bytes(be);
            offset += 8;
        }

        // The whole frame, masking key included, must be addressable
        let fits = usize::try_from(payload_len)
            .ok()
            .and_then(|len| len.checked_add(offset + 4))
            .is_some();
        if payload_len > max_payload || !fits {
            return Err(WebSocketError::FrameTooLarge(payload_len));
        }

        let Some(key) = data.get(offset..offset + 4) else {
            return Err(WebSocketError::IncompleteFrame);
        };
        let mask = [key[0], key[1], key[2], key[3]];
        offset += 4;

        Ok(FrameHeader {
            fin,
            opcode,
            mask,
            payload_len,
            header_len: offset,
        })
    }

    /// Header plus payload length. Cannot overflow for a parsed header.
    pub fn frame_len(&self) -> usize {
        self.header_len + self.payload_len as usize
    }
}

/// A single WebSocket frame. The payload is always stored unmasked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// FIN bit: indicates this is the final fragment of a message
    pub fin: bool,
    /// Opcode: identifies the frame type
    pub opcode: OpCode,
    /// Payload data
    pub payload: Bytes,
}

impl Frame {
    /// Parse one complete masked client frame from bytes.
    ///
    /// Returns the parsed frame and the number of bytes consumed.
    /// Returns `Err(WebSocketError::IncompleteFrame)` if more data is needed.
    pub fn parse(data: &[u8], max_payload: u64) -> Result<(Self, usize), WebSocketError> {
        let header = FrameHeader::parse(data, max_payload)?;
        let end = header.frame_len();
        if data.len() < end {
            return Err(WebSocketError::IncompleteFrame);
        }

        let mut payload = BytesMut::from(&data[header.header_len..end]);
        apply_mask(&mut payload, header.mask);

        Ok((
            Frame {
                fin: header.fin,
                opcode: header.opcode,
                payload: payload.freeze(),
            },
            end,
        ))
    }

    /// Payload length as carried in the length field.
    pub fn len(&self) -> u64 {
        self.payload.len() as u64
    }

    /// Check if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    /// Write the frame header into `dst`, using the shortest length tier.
    pub fn encode_header(&self, mask: Option<[u8; 4]>, dst: &mut BytesMut) {
        let mut byte1 = self.opcode.bits();
        if self.fin {
            byte1 |= 0b1000_0000;
        }
        dst.put_u8(byte1);

        let payload_len = self.payload.len();
        let byte2 = if mask.is_some() {
            0b1000_0000
        } else {
            0b0000_0000
        };

        if payload_len < 126 {
            dst.put_u8(byte2 | payload_len as u8);
        } else if payload_len <= 65535 {
            dst.put_u8(byte2 | 126);
            dst.put_u16(payload_len as u16);
        } else {
            dst.put_u8(byte2 | 127);
            dst.put_u64(payload_len as u64);
        }

        if let Some(masking_key) = mask {
            dst.put_slice(&masking_key);
        }
    }

    /// Encode the whole frame to bytes.
    ///
    /// # Arguments
    ///
    /// * `mask` - Optional masking key. If provided, the payload will be masked.
    ///   Server frames are sent unmasked; clients must pass a key.
    pub fn encode(&self, mask: Option<[u8; 4]>) -> BytesMut {
        let mut frame = BytesMut::with_capacity(14 + self.payload.len());
        self.encode_header(mask, &mut frame);

        let start = frame.len();
        frame.extend_from_slice(&self.payload);
        if let Some(masking_key) = mask {
            apply_mask(&mut frame[start..], masking_key);
        }

        frame
    }

    /// Create a final binary frame.
    pub fn binary(payload: impl Into<Bytes>) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Binary,
            payload: payload.into(),
        }
    }

    /// Create a close frame carrying only a status code.
    pub fn close(code: u16) -> Self {
        Frame {
            fin: true,
            opcode: OpCode::Close,
            payload: Bytes::copy_from_slice(&code.to_be_bytes()),
        }
    }

    /// Status code of a close frame, if it carries one.
    pub fn close_code(&self) -> Option<u16> {
        if self.opcode != OpCode::Close || self.payload.len() < 2 {
            return None;
        }
        Some(u16::from_be_bytes([self.payload[0], self.payload[1]]))
    }
}

/// Apply XOR mask to payload data per RFC 6455 Section 5.3.
///
/// This operation is reversible (applying the same mask twice yields the original data).
pub fn apply_mask(payload: &mut [u8], mask: [u8; 4]) {
    for (i, byte) in payload.iter_mut().enumerate() {
        *byte ^= mask[i % 4];
    }
}
