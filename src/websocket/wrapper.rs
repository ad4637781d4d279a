//! WebSocket decoder and encoder wrappers that use WebSocketCodec.
//!
//! These types drive the codec over any async byte stream. Each connection owns
//! one of each, over the two halves of its socket.

use super::{Frame, WebSocketCodec, WebSocketError};
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::codec::{Decoder, Encoder};

const READ_CHUNK: usize = 8192;

/// WebSocket frame decoder that reads frames from a stream.
pub struct WebSocketDecoder<R> {
    reader: R,
    codec: WebSocketCodec,
    buffer: BytesMut,
}

impl<R: AsyncRead + Unpin> WebSocketDecoder<R> {
    /// Create a new WebSocketDecoder from any AsyncRead type.
    pub fn new(reader: R, codec: WebSocketCodec) -> Self {
        Self::with_buffer(reader, codec, BytesMut::with_capacity(READ_CHUNK))
    }

    /// Create a decoder that starts from bytes already read off the stream,
    /// such as frame data that arrived together with the handshake.
    pub fn with_buffer(reader: R, codec: WebSocketCodec, buffer: BytesMut) -> Self {
        WebSocketDecoder {
            reader,
            codec,
            buffer,
        }
    }

    /// Read the next WebSocket frame.
    ///
    /// Returns `Ok(Some(frame))` if a complete frame was read,
    /// `Ok(None)` if the stream ended on a frame boundary, or `Err` on error.
    /// A stream that ends in the middle of a frame is an
    /// [`WebSocketError::IncompleteFrame`] error.
    ///
    /// Cancel safe: bytes are only appended to the internal buffer once a read
    /// has completed, so dropping this future loses nothing.
    pub async fn read_frame(&mut self) -> Result<Option<Frame>, WebSocketError> {
        loop {
            if let Some(frame) = self.codec.decode(&mut self.buffer)? {
                return Ok(Some(frame));
            }

            self.buffer.reserve(READ_CHUNK);
            match self.reader.read_buf(&mut self.buffer).await {
                Ok(0) if self.buffer.is_empty() => return Ok(None),
                Ok(0) => return Err(WebSocketError::IncompleteFrame),
                Ok(_) => {}
                Err(e) => return Err(WebSocketError::IoError(e.to_string())),
            }
        }
    }
}

/// WebSocket frame encoder that writes unmasked server frames.
pub struct WebSocketEncoder<W> {
    writer: W,
    codec: WebSocketCodec,
}

impl<W: AsyncWrite + Unpin> WebSocketEncoder<W> {
    /// Create a new WebSocketEncoder from any AsyncWrite type.
    pub fn new(writer: W) -> Self {
        WebSocketEncoder {
            writer,
            codec: WebSocketCodec::new(),
        }
    }

    /// Write a single frame.
    pub async fn write_frame(&mut self, frame: Frame) -> Result<(), WebSocketError> {
        let mut buffer = BytesMut::new();
        self.codec.encode(frame, &mut buffer)?;

        self.writer.write_all(&buffer).await?;
        self.writer.flush().await?;

        Ok(())
    }

    /// Write a final binary message.
    pub async fn write_binary(&mut self, data: Bytes) -> Result<(), WebSocketError> {
        self.write_frame(Frame::binary(data)).await
    }

    /// Send a close frame carrying `code` and no reason.
    pub async fn write_close(&mut self, code: u16) -> Result<(), WebSocketError> {
        self.write_frame(Frame::close(code)).await
    }

    /// Shut down the write side of the stream.
    pub async fn end(&mut self) -> Result<(), WebSocketError> {
        self.writer.shutdown().await?;
        Ok(())
    }
}
