use crate::messages::{Operation, RequestId, WireConfig};
use crate::network::backoff::RetryDelay;
use crate::network::callbacks::RequestCallbacks;
use crate::network::connection::{Connector, WsConnector};
use crate::network::driver::{Command, SessionDriver};
use crate::network::error::{ClientError, TransportError};
use crate::network::pending::Registration;
use crate::network::session::{ConnectionInfo, SessionSnapshot};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, trace};

/// Construction options for [`WsClient`]
#[derive(Clone)]
pub struct ClientOptions {
    pub url: String,
    /// Socket factory
    pub connector: Arc<dyn Connector>,
    /// Attempt count to reconnect delay
    pub retry_delay: RetryDelay,
    /// Force-close superseded connections still draining after this long
    pub stale_connection_timeout: Option<Duration>,
    pub wire_config: WireConfig,
}

impl ClientOptions {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            connector: Arc::new(WsConnector::default()),
            retry_delay: RetryDelay::default(),
            stale_connection_timeout: None,
            wire_config: WireConfig::default(),
        }
    }

    pub fn with_connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = connector;
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: RetryDelay) -> Self {
        self.retry_delay = retry_delay;
        self
    }

    /// A zero timeout disables the check, same as `None`
    pub fn with_stale_connection_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stale_connection_timeout = timeout.filter(|t| !t.is_zero());
        self
    }

    pub fn with_wire_config(mut self, wire_config: WireConfig) -> Self {
        self.wire_config = wire_config;
        self
    }
}

impl fmt::Debug for ClientOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientOptions")
            .field("url", &self.url)
            .field("retry_delay", &self.retry_delay)
            .field("stale_connection_timeout", &self.stale_connection_timeout)
            .field("wire_config", &self.wire_config)
            .finish_non_exhaustive()
    }
}

/// Handle to a reconnecting WebSocket RPC session.
///
/// Cheap to clone. The session lives in its own task; it is closed when
/// [`WsClient::close`] is called or once every handle (including outstanding
/// [`Unsubscribe`] handles) has been dropped.
#[derive(Clone)]
pub struct WsClient {
    commands: mpsc::UnboundedSender<Command>,
    registrations: Arc<AtomicU64>,
}

impl WsClient {
    /// Start a session. Must be called from within a tokio runtime.
    pub fn new(options: ClientOptions) -> Self {
        let (commands, rx) = mpsc::unbounded_channel();
        let driver = SessionDriver::new(&options, rx, commands.downgrade());
        tokio::spawn(driver.run());
        info!(url = %options.url, "Started client session");
        Self {
            commands,
            registrations: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Start a session with default options
    pub fn connect(url: impl Into<String>) -> Self {
        Self::new(ClientOptions::new(url))
    }

    /// Issue an operation. Never blocks; results are delivered to `callbacks`.
    pub fn request(
        &self,
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
    ) -> Unsubscribe {
        let registration = self.next_registration();
        self.request_as(operation, callbacks, registration)
    }

    pub(crate) fn next_registration(&self) -> Registration {
        Registration::new(self.registrations.fetch_add(1, Ordering::Relaxed) + 1)
    }

    /// Issue an operation under a registration taken from [`WsClient::next_registration`]
    pub(crate) fn request_as(
        &self,
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
        registration: Registration,
    ) -> Unsubscribe {
        let unsubscribe = Unsubscribe {
            id: operation.id.clone(),
            registration,
            commands: self.commands.clone(),
        };
        let command = Command::Request {
            operation,
            callbacks,
            registration,
        };
        if let Err(mpsc::error::SendError(Command::Request { callbacks, .. })) =
            self.commands.send(command)
        {
            debug!(request_id = %unsubscribe.id, "Session has stopped, rejecting request");
            callbacks.on_error(TransportError::closed_prematurely("session has stopped"));
            callbacks.on_done();
        }
        unsubscribe
    }

    /// Close the session. Returns immediately; in-flight requests drain first.
    pub fn close(&self) {
        if self.commands.send(Command::Close).is_err() {
            trace!("Session already stopped");
        }
    }

    /// True once the session task has exited
    pub fn is_stopped(&self) -> bool {
        self.commands.is_closed()
    }

    pub async fn snapshot(&self) -> Result<SessionSnapshot, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(Command::Snapshot { reply })
            .map_err(|_| ClientError::DriverStopped)?;
        rx.await.map_err(|_| ClientError::DriverStopped)
    }

    /// The connection currently designated for new traffic
    pub async fn current_connection(&self) -> Result<ConnectionInfo, ClientError> {
        Ok(self.snapshot().await?.active)
    }

    /// Unsubscribe handle that does not keep the session alive. Used by
    /// callbacks, which are themselves owned by the session.
    pub(crate) fn weak_unsubscribe(
        &self,
        id: RequestId,
        registration: Registration,
    ) -> WeakUnsubscribe {
        WeakUnsubscribe {
            id,
            registration,
            commands: self.commands.downgrade(),
        }
    }
}

impl fmt::Debug for WsClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WsClient")
            .field("stopped", &self.is_stopped())
            .finish()
    }
}

/// Releases one request. Calling it more than once is harmless, and a handle
/// whose request was rejected releases nothing.
#[derive(Clone)]
pub struct Unsubscribe {
    id: RequestId,
    registration: Registration,
    commands: mpsc::UnboundedSender<Command>,
}

impl Unsubscribe {
    pub fn id(&self) -> &RequestId {
        &self.id
    }

    pub fn unsubscribe(&self) {
        let command = Command::Unsubscribe {
            id: self.id.clone(),
            registration: self.registration,
        };
        if self.commands.send(command).is_err() {
            trace!(request_id = %self.id, "Session already stopped");
        }
    }
}

pub(crate) struct WeakUnsubscribe {
    id: RequestId,
    registration: Registration,
    commands: mpsc::WeakUnboundedSender<Command>,
}

impl WeakUnsubscribe {
    pub(crate) fn unsubscribe(&self) {
        if let Some(commands) = self.commands.upgrade() {
            let _ = commands.send(Command::Unsubscribe {
                id: self.id.clone(),
                registration: self.registration,
            });
        }
    }
}

impl fmt::Debug for Unsubscribe {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unsubscribe")
            .field("id", &self.id)
            .field("registration", &self.registration.value())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::RpcResult;
    use crate::network::callbacks::CallbackSet;
    use crate::network::connection::{
        ConnectionEvent, ConnectionId, ConnectionState, EventSender, Socket,
    };
    use serde_json::{json, Value};
    use std::sync::Mutex;
    use tokio::time::timeout;

    #[derive(Debug)]
    enum SocketOp {
        Sent(ConnectionId, String),
        Close(ConnectionId),
    }

    /// Connects instantly and echoes closes back as `Closed` events
    struct LoopbackConnector {
        ops: mpsc::UnboundedSender<SocketOp>,
        events: Arc<Mutex<Vec<(ConnectionId, EventSender)>>>,
    }

    struct LoopbackSocket {
        id: ConnectionId,
        ops: mpsc::UnboundedSender<SocketOp>,
        events: EventSender,
    }

    impl Socket for LoopbackSocket {
        fn send(&mut self, text: String) {
            let _ = self.ops.send(SocketOp::Sent(self.id, text));
        }

        fn close(&mut self) {
            let _ = self.ops.send(SocketOp::Close(self.id));
            let _ = self.events.send(ConnectionEvent::Closed(self.id));
        }
    }

    impl Connector for LoopbackConnector {
        fn connect(&self, _url: &str, id: ConnectionId, events: EventSender) -> Box<dyn Socket> {
            let _ = events.send(ConnectionEvent::Open(id));
            self.events.lock().unwrap().push((id, events.clone()));
            Box::new(LoopbackSocket {
                id,
                ops: self.ops.clone(),
                events,
            })
        }
    }

    struct Fixture {
        client: WsClient,
        ops: mpsc::UnboundedReceiver<SocketOp>,
        events: Arc<Mutex<Vec<(ConnectionId, EventSender)>>>,
    }

    impl Fixture {
        fn new() -> Self {
            let (ops_tx, ops) = mpsc::unbounded_channel();
            let events = Arc::new(Mutex::new(Vec::new()));
            let connector = LoopbackConnector {
                ops: ops_tx,
                events: events.clone(),
            };
            let options = ClientOptions::new("ws://loopback")
                .with_connector(Arc::new(connector))
                .with_retry_delay(RetryDelay::immediate());
            Self {
                client: WsClient::new(options),
                ops,
                events,
            }
        }

        async fn next_op(&mut self) -> SocketOp {
            timeout(Duration::from_secs(2), self.ops.recv())
                .await
                .expect("socket op within timeout")
                .expect("connector alive")
        }

        fn push(&self, n: usize, value: Value) {
            let events = self.events.lock().unwrap();
            let (id, tx) = &events[n];
            tx.send(ConnectionEvent::Message(*id, value.to_string()))
                .unwrap();
        }
    }

    fn channel_callbacks() -> (Arc<CallbackSet>, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let (next_tx, error_tx, done_tx) = (tx.clone(), tx.clone(), tx);
        let callbacks = CallbackSet::new()
            .with_next(move |result| {
                let label = match result {
                    RpcResult::Data { data } => format!("data:{}", data),
                    other => format!("{:?}", other),
                };
                let _ = next_tx.send(label);
            })
            .with_error(move |err| {
                let _ = error_tx.send(format!("error:{}", err.kind()));
            })
            .with_done(move || {
                let _ = done_tx.send("done".to_string());
            });
        (Arc::new(callbacks), rx)
    }

    async fn recv(rx: &mut mpsc::UnboundedReceiver<String>) -> String {
        timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("callback within timeout")
            .expect("callbacks alive")
    }

    #[tokio::test]
    async fn test_request_round_trip_through_driver() {
        let mut fx = Fixture::new();
        let (callbacks, mut rx) = channel_callbacks();

        let handle = fx
            .client
            .request(Operation::query(1, "greeting", Some(json!("x"))), callbacks);

        match fx.next_op().await {
            SocketOp::Sent(id, text) => {
                assert_eq!(id, ConnectionId::new(1));
                let frame: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["params"]["input"], json!("x"));
            }
            other => panic!("unexpected socket op: {:?}", other),
        }

        fx.push(0, json!({"id": 1, "result": {"type": "data", "data": "hello x"}}));
        assert_eq!(recv(&mut rx).await, "data:\"hello x\"");

        handle.unsubscribe();
        handle.unsubscribe();
        assert_eq!(recv(&mut rx).await, "done");

        let snapshot = fx.client.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 0);
    }

    #[tokio::test]
    async fn test_rejected_duplicate_handle_releases_nothing() {
        let mut fx = Fixture::new();
        let (first_callbacks, mut first_rx) = channel_callbacks();
        let (second_callbacks, mut second_rx) = channel_callbacks();

        let first = fx
            .client
            .request(Operation::subscription(1, "onMessage", None), first_callbacks);
        let duplicate = fx
            .client
            .request(Operation::subscription(1, "onMessage", None), second_callbacks);
        assert_eq!(recv(&mut second_rx).await, "error:duplicate_request_id");
        assert!(matches!(fx.next_op().await, SocketOp::Sent(..)));

        duplicate.unsubscribe();
        let snapshot = fx.client.snapshot().await.unwrap();
        assert_eq!(snapshot.pending, 1);
        assert!(first_rx.try_recv().is_err());

        first.unsubscribe();
        assert_eq!(recv(&mut first_rx).await, "done");
        match fx.next_op().await {
            SocketOp::Sent(_, text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame["method"], json!("subscription.stop"));
            }
            other => panic!("unexpected socket op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_requests_in_one_turn_share_a_frame() {
        let mut fx = Fixture::new();
        for id in 1..=3 {
            let (callbacks, _rx) = channel_callbacks();
            fx.client
                .request(Operation::subscription(id, "onMessage", None), callbacks);
        }

        match fx.next_op().await {
            SocketOp::Sent(_, text) => {
                let frame: Value = serde_json::from_str(&text).unwrap();
                assert_eq!(frame.as_array().map(Vec::len), Some(3));
            }
            other => panic!("unexpected socket op: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_current_connection_reports_active_socket() {
        let fx = Fixture::new();
        let info = fx.client.current_connection().await.unwrap();
        assert_eq!(info.id, ConnectionId::new(1));
        assert!(matches!(
            info.state,
            ConnectionState::Connecting | ConnectionState::Open
        ));
    }

    #[tokio::test]
    async fn test_close_stops_driver_and_rejects_later_requests() {
        let mut fx = Fixture::new();
        fx.client.close();

        assert!(matches!(fx.next_op().await, SocketOp::Close(_)));
        timeout(Duration::from_secs(2), async {
            while !fx.client.is_stopped() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("driver exits after close");

        assert!(matches!(
            fx.client.snapshot().await,
            Err(ClientError::DriverStopped)
        ));

        let (callbacks, mut rx) = channel_callbacks();
        fx.client.request(Operation::query(9, "late", None), callbacks);
        assert_eq!(recv(&mut rx).await, "error:closed_prematurely");
        assert_eq!(recv(&mut rx).await, "done");
    }

    #[tokio::test]
    async fn test_dropping_every_handle_closes_the_session() {
        let Fixture {
            client, mut ops, ..
        } = Fixture::new();
        let clone = client.clone();
        drop(client);
        drop(clone);

        let op = timeout(Duration::from_secs(2), ops.recv())
            .await
            .expect("socket op within timeout");
        assert!(matches!(op, Some(SocketOp::Close(_))));
    }
}
