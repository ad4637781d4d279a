//! Listening socket and accept loop.

use crate::config::ServerConfig;
use crate::connection::Connection;
use crate::event::EventHandler;
use crate::sessions::Sessions;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::{fmt, io};
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{Instrument, debug_span, error, info, warn};

/// Errors reported by [`Server`].
#[derive(Debug)]
pub enum ServerError {
    /// Creating, binding, or listening on the socket failed
    Listen(io::Error),
    /// Accepting failed in a way that retrying will not fix
    Accept(io::Error),
}

impl fmt::Display for ServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ServerError::Listen(err) => write!(f, "Failed to listen: {}", err),
            ServerError::Accept(err) => write!(f, "Failed to accept: {}", err),
        }
    }
}

impl std::error::Error for ServerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            ServerError::Listen(err) | ServerError::Accept(err) => Some(err),
        }
    }
}

/// Stops a running server.
///
/// Closing stops the accept loop, releases the listening socket, and tells
/// every live connection to send a going-away close frame and disconnect.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    token: CancellationToken,
}

impl ShutdownHandle {
    /// Signal shutdown. Idempotent.
    pub fn close(&self) {
        self.token.cancel();
    }

    /// Whether shutdown has been signalled.
    pub fn is_closed(&self) -> bool {
        self.token.is_cancelled()
    }
}

/// A bound, listening WebSocket server.
///
/// # Examples
///
/// ```no_run
/// use ws_server::{Event, Server, ServerConfig};
///
/// # async fn run() -> Result<(), ws_server::ServerError> {
/// let server = Server::listen(ServerConfig::new(9001))?;
/// let sessions = server.sessions();
///
/// server
///     .serve(move |event: Event| {
///         if let Event::Message { id, payload } = event {
///             // Echo every message back
///             let _ = sessions.send(id, payload);
///         }
///     })
///     .await
/// # }
/// ```
pub struct Server {
    listener: TcpListener,
    local_addr: SocketAddr,
    config: Arc<ServerConfig>,
    sessions: Sessions,
    shutdown: CancellationToken,
}

impl Server {
    /// Bind `0.0.0.0:<port>` with address reuse and start listening.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn listen(config: ServerConfig) -> Result<Self, ServerError> {
        let bind = || -> io::Result<TcpListener> {
            let socket = TcpSocket::new_v4()?;
            socket.set_reuseaddr(true)?;
            socket.bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, config.port)))?;
            socket.listen(config.backlog)
        };
        let listener = bind().map_err(ServerError::Listen)?;
        let local_addr = listener.local_addr().map_err(ServerError::Listen)?;

        info!(addr = %local_addr, "listening");

        Ok(Server {
            listener,
            local_addr,
            config: Arc::new(config),
            sessions: Sessions::new(),
            shutdown: CancellationToken::new(),
        })
    }

    /// The address the listening socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Registry of this server's live connections, for sending frames.
    pub fn sessions(&self) -> Sessions {
        self.sessions.clone()
    }

    /// A handle that stops [`serve`](Server::serve).
    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            token: self.shutdown.clone(),
        }
    }

    /// Accept connections until shut down, handing each one to its own task.
    ///
    /// At most `max_connections` connections are served at once. Transient
    /// accept errors are logged and the loop continues; any other accept error
    /// shuts the server down and is returned. Either way, this only returns
    /// once every connection task has finished.
    pub async fn serve<H: EventHandler>(self, handler: H) -> Result<(), ServerError> {
        let Server {
            listener,
            local_addr,
            config,
            sessions,
            shutdown,
        } = self;

        let handler = Arc::new(handler);
        let slots = Arc::new(Semaphore::new(
            config.max_connections.clamp(1, Semaphore::MAX_PERMITS),
        ));
        let tracker = TaskTracker::new();

        let result = loop {
            let permit = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                permit = slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break Ok(()),
                },
            };

            let (stream, peer) = tokio::select! {
                _ = shutdown.cancelled() => break Ok(()),
                accepted = listener.accept() => match accepted {
                    Ok(accepted) => accepted,
                    Err(err) if is_transient(&err) => {
                        warn!(error = %err, "accept failed, retrying");
                        continue;
                    }
                    Err(err) => {
                        error!(error = %err, "accept failed");
                        break Err(ServerError::Accept(err));
                    }
                },
            };

            let connection = Connection::new(
                stream,
                handler.clone(),
                sessions.clone(),
                config.clone(),
                shutdown.child_token(),
            );
            tracker.spawn(
                async move {
                    connection.run().await;
                    drop(permit);
                }
                .instrument(debug_span!("connection", %peer)),
            );
        };

        drop(listener);
        shutdown.cancel();
        tracker.close();
        tracker.wait().await;

        info!(addr = %local_addr, "server stopped");
        result
    }
}

impl fmt::Debug for Server {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Server")
            .field("local_addr", &self.local_addr)
            .field("config", &self.config)
            .finish()
    }
}

/// Accept errors that concern a single incoming connection, or resource
/// exhaustion that may clear up, rather than the listening socket itself.
fn is_transient(err: &io::Error) -> bool {
    use io::ErrorKind::*;

    if matches!(
        err.kind(),
        ConnectionRefused | ConnectionAborted | ConnectionReset | Interrupted | WouldBlock | TimedOut
    ) {
        return true;
    }

    // EMFILE and ENFILE: out of file descriptors
    #[cfg(unix)]
    if matches!(err.raw_os_error(), Some(23) | Some(24)) {
        return true;
    }

    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{ConnectionId, Event};
    use crate::websocket::{Frame, OpCode};
    use bytes::Bytes;
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::mpsc;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    const MASK: [u8; 4] = [0x11, 0x22, 0x33, 0x44];

    fn request(key: Option<&str>) -> Vec<u8> {
        let mut req = b"GET / HTTP/1.1\r\nHost: localhost\r\nUpgrade: websocket\r\n\
            Connection: Upgrade\r\nSec-WebSocket-Version: 13\r\n"
            .to_vec();
        if let Some(key) = key {
            req.extend_from_slice(format!("Sec-WebSocket-Key: {}\r\n", key).as_bytes());
        }
        req.extend_from_slice(b"\r\n");
        req
    }

    fn start(
        config: ServerConfig,
    ) -> (
        SocketAddr,
        ShutdownHandle,
        mpsc::UnboundedReceiver<Event>,
        JoinHandle<Result<(), ServerError>>,
    ) {
        let server = Server::listen(config.with_backlog(128)).unwrap();
        let addr = SocketAddr::from((Ipv4Addr::LOCALHOST, server.local_addr().port()));
        let shutdown = server.shutdown_handle();
        let sessions = server.sessions();
        let (tx, rx) = mpsc::unbounded_channel();

        let handle = tokio::spawn(server.serve(move |event: Event| {
            if let Event::Message { id, payload } = &event {
                if payload.starts_with(b"echo:") {
                    sessions.send(*id, payload.clone()).unwrap();
                }
            }
            let _ = tx.send(event);
        }));

        (addr, shutdown, rx, handle)
    }

    async fn connect(addr: SocketAddr) -> TcpStream {
        let mut stream = TcpStream::connect(addr).await.unwrap();
        stream
            .write_all(&request(Some("dGhlIHNhbXBsZSBub25jZQ==")))
            .await
            .unwrap();

        let mut response = Vec::new();
        while !response.ends_with(b"\r\n\r\n") {
            let mut byte = [0u8; 1];
            assert_eq!(stream.read(&mut byte).await.unwrap(), 1);
            response.push(byte[0]);
        }
        assert!(response.ends_with(b"Sec-WebSocket-Accept: s3pPLMBiTxaQ9kYGzzhZRbK+xOo=\r\n\r\n"));
        stream
    }

    async fn send_frame(stream: &mut TcpStream, opcode: OpCode, payload: &[u8]) {
        let frame = Frame {
            fin: true,
            opcode,
            payload: Bytes::copy_from_slice(payload),
        };
        stream.write_all(&frame.encode(Some(MASK))).await.unwrap();
    }

    async fn next_event(rx: &mut mpsc::UnboundedReceiver<Event>) -> Event {
        timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed")
    }

    #[tokio::test]
    async fn test_listen_reports_bind_failure() {
        let taken = TcpListener::bind((Ipv4Addr::UNSPECIFIED, 0)).await.unwrap();
        let port = taken.local_addr().unwrap().port();

        let result = Server::listen(ServerConfig::new(port));
        assert!(matches!(result, Err(ServerError::Listen(_))));
    }

    #[tokio::test]
    async fn test_echo_round_trip() {
        let (addr, shutdown, mut rx, handle) = start(ServerConfig::new(0));
        let mut client = connect(addr).await;

        let id = match next_event(&mut rx).await {
            Event::Connect { id } => id,
            other => panic!("expected connect, got {:?}", other),
        };

        let payload = [b"echo:".as_slice(), &[7u8; 70000]].concat();
        send_frame(&mut client, OpCode::Binary, &payload).await;
        assert_eq!(
            next_event(&mut rx).await,
            Event::Message {
                id,
                payload: Bytes::from(payload.clone()),
            }
        );

        let mut header = [0u8; 10];
        client.read_exact(&mut header).await.unwrap();
        assert_eq!(header[..2], [0x82, 127]);
        assert_eq!(u64::from_be_bytes(header[2..].try_into().unwrap()), 70005);
        let mut body = vec![0u8; 70005];
        client.read_exact(&mut body).await.unwrap();
        assert_eq!(body, payload);

        send_frame(&mut client, OpCode::Close, &[0x03, 0xE8]).await;
        let mut reply = [0u8; 4];
        client.read_exact(&mut reply).await.unwrap();
        assert_eq!(reply, [0x88, 0x02, 0x03, 0xE8]);
        assert_eq!(next_event(&mut rx).await, Event::Disconnect { id });

        shutdown.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_missing_key_closes_without_events() {
        let (addr, shutdown, mut rx, handle) = start(ServerConfig::new(0));

        let mut client = TcpStream::connect(addr).await.unwrap();
        client.write_all(&request(None)).await.unwrap();
        let mut rest = Vec::new();
        timeout(Duration::from_secs(5), client.read_to_end(&mut rest))
            .await
            .unwrap()
            .unwrap();
        assert!(rest.is_empty());

        shutdown.close();
        handle.await.unwrap().unwrap();
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_connections_keep_messages_apart() {
        const CONNECTIONS: usize = 8;
        const MESSAGES: usize = 25;

        let (addr, shutdown, mut rx, handle) = start(ServerConfig::new(0));

        let mut clients = Vec::new();
        for client_no in 0..CONNECTIONS {
            clients.push(tokio::spawn(async move {
                let mut stream = connect(addr).await;
                for msg_no in 0..MESSAGES {
                    let payload = format!("client {} message {}", client_no, msg_no);
                    send_frame(&mut stream, OpCode::Binary, payload.as_bytes()).await;
                }
                send_frame(&mut stream, OpCode::Close, &[0x03, 0xE8]).await;
                let mut reply = [0u8; 4];
                stream.read_exact(&mut reply).await.unwrap();
            }));
        }
        for client in clients {
            client.await.unwrap();
        }

        let mut received: HashMap<ConnectionId, Vec<String>> = HashMap::new();
        let mut connected = 0;
        let mut disconnected = 0;
        while disconnected < CONNECTIONS {
            match next_event(&mut rx).await {
                Event::Connect { id } => {
                    assert!(received.insert(id, Vec::new()).is_none());
                    connected += 1;
                }
                Event::Message { id, payload } => {
                    let messages = received.get_mut(&id).expect("message before connect");
                    messages.push(String::from_utf8(payload.to_vec()).unwrap());
                }
                Event::Disconnect { id } => {
                    assert!(received.contains_key(&id));
                    disconnected += 1;
                }
            }
        }
        assert_eq!(connected, CONNECTIONS);

        let mut clients_seen = Vec::new();
        for messages in received.values() {
            assert_eq!(messages.len(), MESSAGES);
            let client_no = messages[0]
                .split(' ')
                .nth(1)
                .unwrap()
                .parse::<usize>()
                .unwrap();
            for (msg_no, message) in messages.iter().enumerate() {
                assert_eq!(
                    message,
                    &format!("client {} message {}", client_no, msg_no)
                );
            }
            clients_seen.push(client_no);
        }
        clients_seen.sort();
        assert_eq!(clients_seen, (0..CONNECTIONS).collect::<Vec<_>>());

        shutdown.close();
        handle.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_live_connections() {
        let (addr, shutdown, mut rx, handle) = start(ServerConfig::new(0));
        let mut client = connect(addr).await;
        let id = next_event(&mut rx).await.id();

        shutdown.close();
        assert!(shutdown.is_closed());
        timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(next_event(&mut rx).await, Event::Disconnect { id });
        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert_eq!(reply, [0x88, 0x02, 0x03, 0xE9]);

        assert!(TcpStream::connect(addr).await.is_err());
    }

    #[tokio::test]
    async fn test_connection_cap_defers_accept() {
        let (addr, shutdown, mut rx, handle) = start(ServerConfig::new(0).with_max_connections(1));

        let mut first = connect(addr).await;
        let first_id = next_event(&mut rx).await.id();

        // Accepted by the kernel, but not served until the first one leaves
        let mut second = TcpStream::connect(addr).await.unwrap();
        second
            .write_all(&request(Some("dGhlIHNhbXBsZSBub25jZQ==")))
            .await
            .unwrap();
        assert!(
            timeout(Duration::from_millis(100), rx.recv())
                .await
                .is_err()
        );

        send_frame(&mut first, OpCode::Close, &[]).await;
        assert_eq!(next_event(&mut rx).await, Event::Disconnect { id: first_id });
        let second_id = match next_event(&mut rx).await {
            Event::Connect { id } => id,
            other => panic!("expected connect, got {:?}", other),
        };
        assert_ne!(first_id, second_id);

        let mut response = [0u8; 1];
        second.read_exact(&mut response).await.unwrap();
        assert_eq!(response[0], b'H');

        shutdown.close();
        handle.await.unwrap().unwrap();
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from(io::ErrorKind::Interrupted)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
        #[cfg(unix)]
        assert!(is_transient(&io::Error::from_raw_os_error(24)));
    }
}
