//! A minimal WebSocket server.
//!
//! [`Server`] accepts TCP connections, performs the RFC 6455 opening
//! handshake, and reads client frames, reporting each connection's lifecycle
//! to an [`EventHandler`] as [`Event`]s. Frames are sent back through
//! [`Sessions`].

#![warn(clippy::dbg_macro, clippy::print_stdout)]
#![warn(missing_docs)]

pub mod config;
mod connection;
pub mod event;
pub mod handshake;
pub mod server;
pub mod sessions;

/// WebSocket frame codec for RFC 6455 compliant framing
pub mod websocket;

pub use config::ServerConfig;
pub use event::{ConnectionId, Event, EventHandler};
pub use handshake::HandshakeError;
pub use server::{Server, ServerError, ShutdownHandle};
pub use sessions::{SendError, Sessions};
pub use websocket::{Frame, OpCode, WebSocketError};
