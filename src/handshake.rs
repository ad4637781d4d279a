//! WebSocket opening handshake (RFC 6455 §4.2), server side.
//!
//! Reads the client's upgrade request up to the blank line, pulls out
//! `Sec-WebSocket-Key`, and answers with `101 Switching Protocols`. Version,
//! origin, and subprotocol headers are not inspected.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::{BufMut, Bytes, BytesMut};
use http::StatusCode;
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use sha1::{Digest, Sha1};
use std::{fmt, io};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Magic string for Sec-WebSocket-Accept (RFC 6455 §4.2.2).
const WS_ACCEPT_MAGIC: &[u8] = b"258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Default cap on the size of the upgrade request head.
pub const DEFAULT_MAX_REQUEST_SIZE: usize = 2048;

const HEADER_END: &[u8] = b"\r\n\r\n";

/// Errors that end a connection before it is upgraded.
#[derive(Debug)]
pub enum HandshakeError {
    /// The peer closed the stream before the request head was complete
    ConnectionClosed,
    /// The request head did not fit in the buffer
    RequestTooLarge(usize),
    /// The request has no `Sec-WebSocket-Key` header
    MissingKey,
    /// The request head did not arrive in time
    TimedOut,
    /// The server shut down while the handshake was in progress
    Cancelled,
    /// I/O error
    IoError(String),
}

impl fmt::Display for HandshakeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HandshakeError::ConnectionClosed => write!(f, "Connection closed during handshake"),
            HandshakeError::RequestTooLarge(limit) => {
                write!(f, "Upgrade request exceeds {} bytes", limit)
            }
            HandshakeError::MissingKey => write!(f, "Missing Sec-WebSocket-Key header"),
            HandshakeError::TimedOut => write!(f, "Handshake timed out"),
            HandshakeError::Cancelled => write!(f, "Server shutting down"),
            HandshakeError::IoError(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for HandshakeError {}

impl From<io::Error> for HandshakeError {
    fn from(err: io::Error) -> Self {
        HandshakeError::IoError(err.to_string())
    }
}

/// A parsed client upgrade request.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request target from the request line, e.g. `/chat`
    pub path: String,
    /// Request headers that parsed as valid HTTP header lines
    pub headers: HeaderMap,
}

impl UpgradeRequest {
    /// Parse a request head (everything before the blank line).
    ///
    /// Parsing is lenient: lines that are not valid `name: value` pairs are
    /// skipped rather than rejected. Leading colons, spaces, and tabs are
    /// stripped from values; the rest of the line is kept as-is.
    pub fn parse(head: &[u8]) -> Self {
        let mut lines = head.split(|&b| b == b'\n').map(trim_cr);

        let path = lines
            .next()
            .and_then(|line| line.split(|&b| b == b' ').nth(1))
            .map(|target| String::from_utf8_lossy(target).into_owned())
            .unwrap_or_default();

        let mut headers = HeaderMap::new();
        for line in lines {
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            let name = line[..colon].trim_ascii();
            let value = trim_value_start(&line[colon..]);

            let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name),
                HeaderValue::from_bytes(value),
            ) else {
                continue;
            };
            headers.append(name, value);
        }

        UpgradeRequest { path, headers }
    }

    /// The client's `Sec-WebSocket-Key`, if present.
    pub fn key(&self) -> Option<&[u8]> {
        self.headers
            .get(header::SEC_WEBSOCKET_KEY)
            .map(HeaderValue::as_bytes)
    }
}

fn trim_cr(line: &[u8]) -> &[u8] {
    line.strip_suffix(b"\r").unwrap_or(line)
}

fn trim_value_start(value: &[u8]) -> &[u8] {
    let start = value
        .iter()
        .position(|&b| !matches!(b, b':' | b' ' | b'\t'))
        .unwrap_or(value.len());
    &value[start..]
}

/// Compute Sec-WebSocket-Accept from the client's Sec-WebSocket-Key.
pub fn compute_accept(key: &[u8]) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key);
    hasher.update(WS_ACCEPT_MAGIC);
    let digest = hasher.finalize();
    BASE64.encode(digest.as_slice())
}

/// Build the 101 response for the given accept token.
pub fn build_response(accept: &str) -> Bytes {
    let status = StatusCode::SWITCHING_PROTOCOLS;
    let mut res = BytesMut::with_capacity(160);
    res.put_slice(b"HTTP/1.1 ");
    res.put_slice(status.as_str().as_bytes());
    res.put_u8(b' ');
    res.put_slice(status.canonical_reason().unwrap_or("").as_bytes());
    res.put_slice(b"\r\nUpgrade: websocket\r\nConnection: Upgrade\r\nSec-WebSocket-Accept: ");
    res.put_slice(accept.as_bytes());
    res.put_slice(b"\r\n\r\n");
    res.freeze()
}

/// Read the request head, up to and including `\r\n\r\n`.
///
/// Returns the head (without the terminator) and any bytes that arrived after
/// it. At most `max_len` bytes are buffered.
pub async fn read_request<R>(
    reader: &mut R,
    max_len: usize,
) -> Result<(BytesMut, BytesMut), HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let mut buf = BytesMut::with_capacity(max_len);
    let mut searched = 0;

    loop {
        if buf.len() >= max_len {
            return Err(HandshakeError::RequestTooLarge(max_len));
        }

        let room = max_len - buf.len();
        let n = reader.read_buf(&mut (&mut buf).limit(room)).await?;
        if n == 0 {
            return Err(HandshakeError::ConnectionClosed);
        }

        if let Some(pos) = find_header_end(&buf[searched..]) {
            let end = searched + pos;
            let leftover = buf.split_off(end + HEADER_END.len());
            buf.truncate(end);
            return Ok((buf, leftover));
        }
        // The terminator may straddle two reads
        searched = buf.len().saturating_sub(HEADER_END.len() - 1);
    }
}

/// Find \r\n\r\n in buffer. Returns the offset of the first \r.
fn find_header_end(buf: &[u8]) -> Option<usize> {
    buf.windows(HEADER_END.len())
        .position(|window| window == HEADER_END)
}

/// Outcome of a successful handshake.
#[derive(Debug)]
pub struct Handshake {
    /// The parsed upgrade request
    pub request: UpgradeRequest,
    /// Bytes received after the request head; the start of frame data
    pub leftover: BytesMut,
}

/// Run the server side of the opening handshake on `stream`.
pub async fn accept<S>(stream: &mut S, max_len: usize) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (head, leftover) = read_request(stream, max_len).await?;
    let request = UpgradeRequest::parse(&head);
    let key = request.key().ok_or(HandshakeError::MissingKey)?;

    let response = build_response(&compute_accept(key));
    stream.write_all(&response).await?;
    stream.flush().await?;

    Ok(Handshake { request, leftover })
}
