//! Registry of live connections, used to send frames to a connection by id.

use crate::event::ConnectionId;
use bytes::Bytes;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::mpsc;

/// Error returned by [`Sessions::send`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// No live connection has this id
    UnknownConnection(ConnectionId),
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::UnknownConnection(id) => write!(f, "Unknown connection: {}", id),
        }
    }
}

impl std::error::Error for SendError {}

/// Handle to the set of connections between their `Connect` and `Disconnect`.
///
/// Cloning is cheap and clones share the same registry. Frames queued with
/// [`send`](Sessions::send) are written by the connection's own task, so the
/// socket keeps a single owner.
#[derive(Clone, Default)]
pub struct Sessions {
    inner: Arc<Mutex<HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>>>,
}

impl Sessions {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `payload` as one binary frame to connection `id`.
    ///
    /// Does not wait for the write. Fails if the connection has already
    /// disconnected or never existed.
    pub fn send(&self, id: ConnectionId, payload: impl Into<Bytes>) -> Result<(), SendError> {
        let sessions = self.lock();
        let tx = sessions.get(&id).ok_or(SendError::UnknownConnection(id))?;
        tx.send(payload.into())
            .map_err(|_| SendError::UnknownConnection(id))
    }

    /// Whether connection `id` is live.
    pub fn contains(&self, id: ConnectionId) -> bool {
        self.lock().contains_key(&id)
    }

    /// Number of live connections.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Check if there are no live connections.
    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub(crate) fn register(&self, id: ConnectionId) -> mpsc::UnboundedReceiver<Bytes> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().insert(id, tx);
        rx
    }

    pub(crate) fn unregister(&self, id: ConnectionId) {
        self.lock().remove(&id);
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<ConnectionId, mpsc::UnboundedSender<Bytes>>> {
        // The map stays consistent even if a holder panicked
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Sessions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Sessions").field("live", &self.len()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_send_to_registered_connection() {
        let sessions = Sessions::new();
        let id = ConnectionId::next();
        let mut rx = sessions.register(id);

        sessions.send(id, &b"hello"[..]).unwrap();
        assert_eq!(rx.try_recv().unwrap(), Bytes::from_static(b"hello"));
        assert!(sessions.contains(id));
        assert_eq!(sessions.len(), 1);
    }

    #[test]
    fn test_send_to_unknown_connection() {
        let sessions = Sessions::new();
        let id = ConnectionId::next();
        assert_eq!(
            sessions.send(id, vec![1u8, 2, 3]),
            Err(SendError::UnknownConnection(id))
        );
    }

    #[test]
    fn test_unregister() {
        let sessions = Sessions::new();
        let id = ConnectionId::next();
        let _rx = sessions.register(id);
        let clone = sessions.clone();

        sessions.unregister(id);
        assert!(!clone.contains(id));
        assert!(clone.is_empty());
        assert!(clone.send(id, vec![0u8]).is_err());
    }

    #[test]
    fn test_send_after_receiver_dropped() {
        let sessions = Sessions::new();
        let id = ConnectionId::next();
        drop(sessions.register(id));

        assert_eq!(
            sessions.send(id, vec![0u8]),
            Err(SendError::UnknownConnection(id))
        );
    }
}
