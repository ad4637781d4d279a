//! Server configuration.

use crate::handshake::DEFAULT_MAX_REQUEST_SIZE;
use crate::websocket::DEFAULT_MAX_FRAME_SIZE;
use std::time::Duration;

/// Settings for [`Server::listen`](crate::Server::listen) and the connections
/// it accepts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// TCP port to bind on all IPv4 interfaces. `0` picks an ephemeral port.
    pub port: u16,
    /// Listen backlog
    pub backlog: u32,
    /// Maximum number of connections served at once. When reached, the accept
    /// loop waits for a connection to finish before accepting another.
    pub max_connections: usize,
    /// Cap on the size of the upgrade request head
    pub handshake_buffer_size: usize,
    /// Cap on a single frame payload
    pub max_frame_size: u64,
    /// Deadline for receiving the upgrade request. `None` waits forever.
    pub handshake_timeout: Option<Duration>,
}

impl ServerConfig {
    /// Default settings on the given port.
    pub fn new(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Set the listen backlog.
    pub fn with_backlog(mut self, backlog: u32) -> Self {
        self.backlog = backlog;
        self
    }

    /// Set the concurrent connection cap. Values below 1 are raised to 1.
    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections.max(1);
        self
    }

    /// Set the upgrade request size cap.
    pub fn with_handshake_buffer_size(mut self, size: usize) -> Self {
        self.handshake_buffer_size = size;
        self
    }

    /// Set the frame payload size cap.
    pub fn with_max_frame_size(mut self, size: u64) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Set the handshake deadline.
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = Some(timeout);
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9001,
            backlog: 10,
            max_connections: 1024,
            handshake_buffer_size: DEFAULT_MAX_REQUEST_SIZE,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            handshake_timeout: None,
        }
    }
}
