//! Per-connection worker.
//!
//! A connection moves through `Init → Connected → Closing → Closed`:
//!
//! - `Init` runs the opening handshake. On failure the stream is dropped and
//!   the handler never hears about the connection.
//! - `Connected` registers the session, emits `Connect`, then turns each
//!   incoming frame into a `Message` and writes frames queued through
//!   [`Sessions`]. A close frame is answered with status 1000; a server
//!   shutdown sends 1001. Any read or write failure also leaves this state.
//! - `Closing` unregisters the session and emits exactly one `Disconnect`,
//!   whatever the cause. It runs from a drop guard, so a panicking worker
//!   still passes through it.
//! - `Closed` shuts the stream down.

use crate::config::ServerConfig;
use crate::event::{ConnectionId, Event, EventHandler};
use crate::handshake::{self, Handshake, HandshakeError};
use crate::sessions::Sessions;
use crate::websocket::{
    CLOSE_GOING_AWAY, CLOSE_NORMAL, OpCode, WebSocketCodec, WebSocketDecoder, WebSocketEncoder,
    WebSocketError,
};
use bytes::Bytes;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::time;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Why a connection left the `Connected` state.
#[derive(Debug)]
enum CloseCause {
    /// The peer sent a close frame, with its status code if any
    PeerClose(Option<u16>),
    /// The stream ended between frames
    EndOfStream,
    /// The server is shutting down
    Shutdown,
    /// A read or write failed, including protocol violations
    Failed(WebSocketError),
}

/// Unregisters the session and emits `Disconnect` when dropped.
struct Closing<H: EventHandler> {
    id: ConnectionId,
    handler: Arc<H>,
    sessions: Sessions,
}

impl<H: EventHandler> Drop for Closing<H> {
    fn drop(&mut self) {
        self.sessions.unregister(self.id);
        self.handler.on_event(Event::Disconnect { id: self.id });
    }
}

pub(crate) struct Connection<S, H> {
    stream: S,
    handler: Arc<H>,
    sessions: Sessions,
    config: Arc<ServerConfig>,
    shutdown: CancellationToken,
}

impl<S, H> Connection<S, H>
where
    S: AsyncRead + AsyncWrite + Unpin,
    H: EventHandler,
{
    pub(crate) fn new(
        stream: S,
        handler: Arc<H>,
        sessions: Sessions,
        config: Arc<ServerConfig>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            stream,
            handler,
            sessions,
            config,
            shutdown,
        }
    }

    /// Drive the connection to completion.
    pub(crate) async fn run(self) {
        let Connection {
            mut stream,
            handler,
            sessions,
            config,
            shutdown,
        } = self;

        // Init
        let handshake = match negotiate(&mut stream, &config, &shutdown).await {
            Ok(handshake) => handshake,
            Err(e) => {
                debug!(error = %e, "handshake failed");
                return;
            }
        };

        // Connected
        let id = ConnectionId::next();
        let mut outbound = sessions.register(id);
        let closing = Closing {
            id,
            handler: handler.clone(),
            sessions,
        };
        debug!(%id, path = %handshake.request.path, "connected");
        handler.on_event(Event::Connect { id });

        let (read_half, write_half) = tokio::io::split(stream);
        let codec = WebSocketCodec::with_max_frame_size(config.max_frame_size);
        let mut decoder = WebSocketDecoder::with_buffer(read_half, codec, handshake.leftover);
        let mut encoder = WebSocketEncoder::new(write_half);

        let cause = pump(
            id,
            &*handler,
            &mut decoder,
            &mut encoder,
            &mut outbound,
            &shutdown,
        )
        .await;

        // Closing
        match &cause {
            CloseCause::Failed(
                e @ (WebSocketError::UnmaskedFrame | WebSocketError::FrameTooLarge(_)),
            ) => warn!(%id, error = %e, "rejected frame"),
            CloseCause::Failed(e) => debug!(%id, error = %e, "connection failed"),
            cause => debug!(%id, ?cause, "connection closed"),
        }
        drop(closing);

        // Closed
        if let Err(e) = encoder.end().await {
            debug!(%id, error = %e, "shutdown failed");
        }
    }
}

/// Run the handshake, bounded by the configured deadline and the shutdown signal.
async fn negotiate<S>(
    stream: &mut S,
    config: &ServerConfig,
    shutdown: &CancellationToken,
) -> Result<Handshake, HandshakeError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let max_len = config.handshake_buffer_size;
    let accept = async {
        match config.handshake_timeout {
            Some(limit) => {
                match time::timeout(limit, handshake::accept(&mut *stream, max_len)).await {
                    Ok(result) => result,
                    Err(_) => Err(HandshakeError::TimedOut),
                }
            }
            None => handshake::accept(&mut *stream, max_len).await,
        }
    };

    tokio::select! {
        result = accept => result,
        _ = shutdown.cancelled() => Err(HandshakeError::Cancelled),
    }
}

/// The `Connected` loop: read frames, write queued frames, watch for shutdown.
async fn pump<H, R, W>(
    id: ConnectionId,
    handler: &H,
    decoder: &mut WebSocketDecoder<R>,
    encoder: &mut WebSocketEncoder<W>,
    outbound: &mut mpsc::UnboundedReceiver<Bytes>,
    shutdown: &CancellationToken,
) -> CloseCause
where
    H: EventHandler,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    loop {
        tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                if let Err(e) = encoder.write_close(CLOSE_GOING_AWAY).await {
                    debug!(%id, error = %e, "close frame not sent");
                }
                return CloseCause::Shutdown;
            }

            Some(payload) = outbound.recv() => {
                if let Err(e) = encoder.write_binary(payload).await {
                    return CloseCause::Failed(e);
                }
            }

            read = decoder.read_frame() => match read {
                Ok(Some(frame)) if frame.opcode == OpCode::Close => {
                    if let Err(e) = encoder.write_close(CLOSE_NORMAL).await {
                        debug!(%id, error = %e, "close reply not sent");
                    }
                    return CloseCause::PeerClose(frame.close_code());
                }
                // Ping, pong, and continuation frames are delivered like data
                Ok(Some(frame)) => handler.on_event(Event::Message {
                    id,
                    payload: frame.payload,
                }),
                Ok(None) => return CloseCause::EndOfStream,
                Err(e) => return CloseCause::Failed(e),
            },
        }
    }
}
