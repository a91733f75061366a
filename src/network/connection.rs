use futures::{SinkExt, StreamExt};
use std::fmt;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, info, instrument, trace, warn};

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Identity of one physical connection within a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn new(id: u64) -> Self {
        Self(id)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Events a socket reports back to the session that owns it
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Open(ConnectionId),
    Message(ConnectionId, String),
    Error(ConnectionId, String),
    Closed(ConnectionId),
}

pub type EventSender = mpsc::UnboundedSender<ConnectionEvent>;

/// Write side of one physical socket. Both calls are fire-and-forget.
pub trait Socket: Send {
    fn send(&mut self, text: String);
    fn close(&mut self);
}

/// Socket factory. Must start connecting immediately and report every
/// lifecycle change of connection `id` through `events`, ending with exactly one
/// `ConnectionEvent::Closed`.
pub trait Connector: Send + Sync {
    fn connect(&self, url: &str, id: ConnectionId, events: EventSender) -> Box<dyn Socket>;
}

/// One physical connection as seen by the session
pub struct Connection {
    id: ConnectionId,
    state: ConnectionState,
    socket: Box<dyn Socket>,
    superseded_at: Option<Instant>,
}

impl Connection {
    pub fn new(id: ConnectionId, socket: Box<dyn Socket>) -> Self {
        Self {
            id,
            state: ConnectionState::Connecting,
            socket,
            superseded_at: None,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_open(&self) -> bool {
        self.state == ConnectionState::Open
    }

    pub fn superseded_at(&self) -> Option<Instant> {
        self.superseded_at
    }

    pub fn mark_open(&mut self) {
        if self.state == ConnectionState::Connecting {
            self.state = ConnectionState::Open;
        }
    }

    pub fn mark_closed(&mut self) {
        self.state = ConnectionState::Closed;
    }

    pub fn mark_superseded(&mut self, at: Instant) {
        self.superseded_at.get_or_insert(at);
    }

    pub fn send(&mut self, text: String) {
        self.socket.send(text);
    }

    /// Request a close. Returns false if the connection was already closing.
    pub fn close(&mut self) -> bool {
        match self.state {
            ConnectionState::Closing | ConnectionState::Closed => false,
            ConnectionState::Connecting | ConnectionState::Open => {
                self.state = ConnectionState::Closing;
                self.socket.close();
                true
            }
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .field("superseded_at", &self.superseded_at)
            .finish()
    }
}

enum Outbound {
    Text(String),
    Close,
}

struct WsSocket {
    outbound: mpsc::UnboundedSender<Outbound>,
}

impl Socket for WsSocket {
    fn send(&mut self, text: String) {
        if self.outbound.send(Outbound::Text(text)).is_err() {
            debug!("Dropping outbound frame, socket task has already exited");
        }
    }

    fn close(&mut self) {
        let _ = self.outbound.send(Outbound::Close);
    }
}

/// Connector backed by `tokio-tungstenite`. Each connection runs in its own task.
#[derive(Debug, Clone)]
pub struct WsConnector {
    connect_timeout: Duration,
}

impl Default for WsConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl WsConnector {
    pub fn with_connect_timeout(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }
}

impl Connector for WsConnector {
    fn connect(&self, url: &str, id: ConnectionId, events: EventSender) -> Box<dyn Socket> {
        let (outbound, outbound_rx) = mpsc::unbounded_channel();
        tokio::spawn(run_socket(
            url.to_string(),
            id,
            outbound_rx,
            events,
            self.connect_timeout,
        ));
        Box::new(WsSocket { outbound })
    }
}

#[instrument(skip(outbound, events, connect_timeout), fields(conn_id = %id))]
async fn run_socket(
    url: String,
    id: ConnectionId,
    mut outbound: mpsc::UnboundedReceiver<Outbound>,
    events: EventSender,
    connect_timeout: Duration,
) {
    debug!("Opening connection to {}", url);

    let stream = match tokio::time::timeout(connect_timeout, connect_async(url.as_str())).await {
        Ok(Ok((stream, _response))) => stream,
        Ok(Err(e)) => {
            warn!("Failed to connect to {}: {}", url, e);
            let _ = events.send(ConnectionEvent::Error(id, e.to_string()));
            let _ = events.send(ConnectionEvent::Closed(id));
            return;
        }
        Err(_) => {
            warn!("Connecting to {} timed out after {:?}", url, connect_timeout);
            let _ = events.send(ConnectionEvent::Error(
                id,
                format!("connect timed out after {:?}", connect_timeout),
            ));
            let _ = events.send(ConnectionEvent::Closed(id));
            return;
        }
    };

    info!("Connected to {}", url);
    let _ = events.send(ConnectionEvent::Open(id));
    let (mut sink, mut stream) = stream.split();

    loop {
        tokio::select! {
            frame = stream.next() => {
                match frame {
                    Some(Ok(WsMessage::Text(text))) => {
                        trace!("Received {} byte text frame", text.len());
                        if events.send(ConnectionEvent::Message(id, text.as_str().to_owned())).is_err() {
                            break;
                        }
                    }
                    Some(Ok(WsMessage::Close(_))) | None => {
                        debug!("Peer closed the connection");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Ping/Pong/Binary are not part of the protocol
                    }
                    Some(Err(e)) => {
                        warn!("WebSocket read error: {}", e);
                        let _ = events.send(ConnectionEvent::Error(id, e.to_string()));
                        break;
                    }
                }
            }
            command = outbound.recv() => {
                match command {
                    Some(Outbound::Text(text)) => {
                        if let Err(e) = sink.send(WsMessage::Text(text.into())).await {
                            warn!("WebSocket write error: {}", e);
                            let _ = events.send(ConnectionEvent::Error(id, e.to_string()));
                            break;
                        }
                    }
                    Some(Outbound::Close) | None => {
                        debug!("Closing connection");
                        let _ = sink.send(WsMessage::Close(None)).await;
                        let _ = sink.close().await;
                        break;
                    }
                }
            }
        }
    }

    let _ = events.send(ConnectionEvent::Closed(id));
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[derive(Default)]
    struct CountingSocket {
        closes: Arc<Mutex<u32>>,
    }

    impl Socket for CountingSocket {
        fn send(&mut self, _text: String) {}

        fn close(&mut self) {
            *self.closes.lock().unwrap() += 1;
        }
    }

    #[test]
    fn test_close_is_requested_once() {
        let closes = Arc::new(Mutex::new(0));
        let socket = CountingSocket {
            closes: closes.clone(),
        };
        let mut conn = Connection::new(ConnectionId::new(1), Box::new(socket));

        assert!(conn.close());
        assert!(!conn.close());
        assert_eq!(conn.state(), ConnectionState::Closing);
        assert_eq!(*closes.lock().unwrap(), 1);
    }

    #[test]
    fn test_open_does_not_resurrect_closing_connection() {
        let mut conn = Connection::new(ConnectionId::new(2), Box::new(CountingSocket::default()));
        conn.close();
        conn.mark_open();
        assert_eq!(conn.state(), ConnectionState::Closing);

        let mut fresh = Connection::new(ConnectionId::new(3), Box::new(CountingSocket::default()));
        fresh.mark_open();
        assert!(fresh.is_open());
    }

    #[test]
    fn test_connection_id_display() {
        assert_eq!(ConnectionId::new(9).to_string(), "conn-9");
    }

    #[tokio::test]
    async fn test_unreachable_endpoint_reports_error_then_closed() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connector = WsConnector::with_connect_timeout(Duration::from_secs(2));
        // port 9 (discard) is essentially never listening on loopback
        let _socket = connector.connect("ws://127.0.0.1:9", ConnectionId::new(1), tx);

        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, ConnectionEvent::Error(_, _)));
        assert_eq!(second, ConnectionEvent::Closed(ConnectionId::new(1)));
    }
}
