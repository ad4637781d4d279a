//! Connection lifecycle events and the callback contract that receives them.

use bytes::Bytes;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Identifies one upgraded connection.
///
/// Ids are minted from a process-wide counter when the handshake succeeds, so
/// an id is never reused for a later connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub(crate) fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        ConnectionId(NEXT.fetch_add(1, Ordering::Relaxed))
    }

    /// The numeric value of this id.
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Something that happened on a connection.
///
/// For each upgraded connection the handler sees exactly one `Connect`, then
/// any number of `Message`s, then exactly one `Disconnect`, in that order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// The handshake completed
    Connect {
        /// Connection the event belongs to
        id: ConnectionId,
    },
    /// A frame other than close arrived
    Message {
        /// Connection the event belongs to
        id: ConnectionId,
        /// Unmasked frame payload
        payload: Bytes,
    },
    /// The connection is gone
    Disconnect {
        /// Connection the event belongs to
        id: ConnectionId,
    },
}

impl Event {
    /// The connection this event belongs to.
    pub fn id(&self) -> ConnectionId {
        match self {
            Event::Connect { id } | Event::Message { id, .. } | Event::Disconnect { id } => *id,
        }
    }
}

/// Receives events from every connection of a server.
///
/// `on_event` runs synchronously on the connection's own task and is called
/// concurrently from many connections. Any state it touches must be
/// synchronized by the implementation. Blocking here stalls only the calling
/// connection.
pub trait EventHandler: Send + Sync + 'static {
    /// Handle one event.
    fn on_event(&self, event: Event);
}

impl<F> EventHandler for F
where
    F: Fn(Event) + Send + Sync + 'static,
{
    fn on_event(&self, event: Event) {
        self(event)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let a = ConnectionId::next();
        let b = ConnectionId::next();
        assert!(b > a);
        assert_ne!(a.as_u64(), b.as_u64());
    }

    #[test]
    fn test_event_id() {
        let id = ConnectionId::next();
        let message = Event::Message {
            id,
            payload: Bytes::from_static(b"hi"),
        };
        assert_eq!(message.id(), id);
        assert_eq!(Event::Disconnect { id }.id(), id);
    }

    #[test]
    fn test_closure_handler() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let handler = move |event: Event| sink.lock().unwrap().push(event);

        let id = ConnectionId::next();
        handler.on_event(Event::Connect { id });
        assert_eq!(*seen.lock().unwrap(), vec![Event::Connect { id }]);
    }
}
