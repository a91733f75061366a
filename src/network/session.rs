//! Connection and request state machine for one client session.
//!
//! `Session` is synchronous and owns every piece of mutable state: the
//! connections, the pending request table and the outgoing queue. It never
//! sleeps or spawns. Timing needs are exposed as flags that the driver task
//! turns into timers ([`Session::take_flush_tick`],
//! [`Session::take_reconnect_request`]).

use crate::messages::{
    ControlMessage, EnvelopeCodec, IncomingMessage, Operation, OperationKind, OutboundFrame,
    RequestEnvelope, RequestId, ResponseBody, ResponseEnvelope,
};
use crate::network::backoff::RetryDelay;
use crate::network::batcher::OutboundBatcher;
use crate::network::callbacks::RequestCallbacks;
use crate::network::client::ClientOptions;
use crate::network::connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionState, Connector, EventSender,
};
use crate::network::error::{Cause, TransportError};
use crate::network::pending::{PendingRequest, PendingRequestTable, Registration};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Open,
    /// Terminal
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReconnectTimer {
    Idle,
    /// Wanted but not yet armed by the driver
    Requested(Duration),
    Pending,
}

/// The active connection as seen from outside
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub state: ConnectionState,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub active: ConnectionInfo,
    /// Live connections, including draining ones
    pub connections: usize,
    pub pending: usize,
    pub queued: usize,
    pub reconnect_attempt: u32,
}

pub struct Session {
    url: String,
    connector: Arc<dyn Connector>,
    retry_delay: RetryDelay,
    stale_connection_timeout: Option<Duration>,
    codec: EnvelopeCodec,
    events: EventSender,

    state: SessionState,
    connections: HashMap<ConnectionId, Connection>,
    active: ConnectionId,
    next_connection_id: u64,
    connect_attempt: u32,
    reconnect_timer: ReconnectTimer,
    flush_tick: bool,

    pending: PendingRequestTable,
    outgoing: OutboundBatcher,
}

impl Session {
    /// Create a session and start connecting right away
    pub fn new(options: &ClientOptions, events: EventSender) -> Self {
        let mut session = Self {
            url: options.url.clone(),
            connector: options.connector.clone(),
            retry_delay: options.retry_delay.clone(),
            stale_connection_timeout: options.stale_connection_timeout,
            codec: EnvelopeCodec::new(options.wire_config.clone()),
            events,
            state: SessionState::Connecting,
            connections: HashMap::new(),
            active: ConnectionId::new(0),
            next_connection_id: 1,
            connect_attempt: 0,
            reconnect_timer: ReconnectTimer::Idle,
            flush_tick: false,
            pending: PendingRequestTable::new(),
            outgoing: OutboundBatcher::new(),
        };
        session.active = session.open_connection();
        session
    }

    fn open_connection(&mut self) -> ConnectionId {
        let id = ConnectionId::new(self.next_connection_id);
        self.next_connection_id += 1;
        info!(conn_id = %id, url = %self.url, "Opening connection");
        let socket = self.connector.connect(&self.url, id, self.events.clone());
        self.connections.insert(id, Connection::new(id, socket));
        id
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn active_connection(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.active,
            state: self
                .connection_state(self.active)
                .unwrap_or(ConnectionState::Closed),
        }
    }

    pub fn connection_state(&self, id: ConnectionId) -> Option<ConnectionState> {
        self.connections.get(&id).map(Connection::state)
    }

    pub fn pending(&self) -> &PendingRequestTable {
        &self.pending
    }

    pub fn stale_connection_timeout(&self) -> Option<Duration> {
        self.stale_connection_timeout
    }

    /// Closed and every connection has reported `Closed`
    pub fn is_finished(&self) -> bool {
        self.state == SessionState::Closed && self.connections.is_empty()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        SessionSnapshot {
            state: self.state,
            active: self.active_connection(),
            connections: self.connections.len(),
            pending: self.pending.len(),
            queued: self.outgoing.len(),
            reconnect_attempt: self.connect_attempt,
        }
    }

    /// Register an operation and queue it for the next flush
    pub fn request(
        &mut self,
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
        registration: Registration,
    ) {
        if self.state == SessionState::Closed {
            debug!(request_id = %operation.id, "Rejecting request on closed session");
            callbacks.on_error(TransportError::closed_prematurely("session is closed"));
            callbacks.on_done();
            return;
        }
        if self.pending.contains(&operation.id) {
            warn!(request_id = %operation.id, "Rejecting request, id is already in flight");
            callbacks.on_error(TransportError::DuplicateRequestId(operation.id));
            return;
        }
        self.register(operation, callbacks, registration);
    }

    fn register(
        &mut self,
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
        registration: Registration,
    ) {
        trace!(
            request_id = %operation.id,
            kind = %operation.kind,
            path = %operation.path,
            conn_id = %self.active,
            "Registering request"
        );
        let envelope = RequestEnvelope::from_operation(&operation);
        self.outgoing.discard(&operation.id);
        self.pending.insert(PendingRequest::new(
            self.active,
            operation,
            callbacks,
            registration,
        ));
        if self.outgoing.enqueue(envelope) {
            self.trigger_send_if_open();
        }
    }

    /// Release the request `registration` made. Safe to call any number of
    /// times; does nothing once the id belongs to another registration.
    pub fn unsubscribe(&mut self, id: &RequestId, registration: Registration) {
        let Some(entry) = self.pending.remove_registered(id, registration) else {
            trace!(request_id = %id, "Unsubscribe for request that is no longer pending");
            return;
        };
        let discarded = self.outgoing.discard(id);
        debug!(request_id = %id, discarded, "Unsubscribed request");
        entry.callbacks.on_done();

        if entry.operation.is_subscription() && entry.sent {
            self.send_stop(entry.connection, id.clone());
        }
        self.close_if_drained(entry.connection);
    }

    fn send_stop(&mut self, owner: ConnectionId, id: RequestId) {
        let stop = RequestEnvelope::stop(id);
        if owner == self.active && self.state == SessionState::Open {
            if self.outgoing.enqueue(stop) {
                self.trigger_send_if_open();
            }
            return;
        }

        let Some(conn) = self.connections.get_mut(&owner).filter(|c| c.is_open()) else {
            debug!(conn_id = %owner, request_id = %stop.id, "Owning connection is gone, no stop sent");
            return;
        };
        // Draining connection: the server only knows the id there
        match self.codec.encode_frame(&OutboundFrame::Single(stop)) {
            Ok(text) => conn.send(text),
            Err(e) => warn!(conn_id = %owner, error = %e, "Failed to encode stop envelope"),
        }
    }

    /// Close the session. Terminal; pending requests bound to a live connection
    /// are left to drain.
    pub fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        if self.state == SessionState::Open {
            self.flush();
        }
        info!(conn_id = %self.active, pending = self.pending.len(), "Closing session");
        self.state = SessionState::Closed;
        self.reconnect_timer = ReconnectTimer::Idle;
        self.flush_tick = false;
        self.outgoing.clear();

        for entry in self.pending.take_where(|e| !e.sent) {
            entry.callbacks.on_error(TransportError::closed_prematurely(
                "session closed before the request was sent",
            ));
            entry.callbacks.on_done();
        }

        let ids: Vec<ConnectionId> = self.connections.keys().copied().collect();
        for id in ids {
            self.close_if_drained(id);
        }
    }

    fn trigger_send_if_open(&mut self) {
        if self.state != SessionState::Open
            || self.outgoing.is_scheduled()
            || self.outgoing.is_empty()
        {
            return;
        }
        self.outgoing.mark_scheduled();
        self.flush_tick = true;
    }

    /// True once per dirty period: the driver should call [`Session::flush`] on its next turn
    pub fn take_flush_tick(&mut self) -> bool {
        std::mem::take(&mut self.flush_tick)
    }

    /// Send everything queued as one frame. Skipped while not open; items then
    /// wait for the next open.
    pub fn flush(&mut self) {
        self.outgoing.clear_schedule();
        if self.state != SessionState::Open {
            trace!(queued = self.outgoing.len(), "Skipping flush, session is not open");
            return;
        }
        let Some(frame) = self.outgoing.take_frame() else {
            return;
        };

        let active = self.active;
        match self.codec.encode_frame(&frame) {
            Ok(text) => {
                for envelope in frame.envelopes().iter().filter(|e| !e.is_stop()) {
                    self.pending.mark_sent(&envelope.id, active);
                }
                match self.connections.get_mut(&active) {
                    Some(conn) => {
                        debug!(conn_id = %active, envelopes = frame.len(), bytes = text.len(), "Flushing outbound frame");
                        conn.send(text);
                    }
                    None => warn!(conn_id = %active, "Active connection missing, frame dropped"),
                }
            }
            Err(e) => {
                warn!(conn_id = %active, error = %e, "Failed to encode outbound frame");
                let cause: Cause = Arc::new(e);
                for envelope in frame.envelopes().iter().filter(|env| !env.is_stop()) {
                    if let Some(entry) = self.pending.remove(&envelope.id) {
                        entry.callbacks.on_error(
                            TransportError::transport("outbound frame could not be encoded")
                                .with_cause(cause.clone()),
                        );
                    }
                }
            }
        }
    }

    pub fn handle_event(&mut self, event: ConnectionEvent) {
        match event {
            ConnectionEvent::Open(id) => self.on_open(id),
            ConnectionEvent::Message(id, text) => self.on_message(id, &text),
            ConnectionEvent::Error(id, reason) => self.on_error(id, &reason),
            ConnectionEvent::Closed(id) => self.on_closed(id),
        }
    }

    fn on_open(&mut self, id: ConnectionId) {
        let Some(conn) = self.connections.get_mut(&id) else {
            return;
        };
        conn.mark_open();

        if id != self.active || self.state == SessionState::Closed {
            debug!(conn_id = %id, "Connection opened after it was superseded");
            self.close_if_drained(id);
            return;
        }

        info!(conn_id = %id, "Connection open");
        self.connect_attempt = 0;
        self.state = SessionState::Open;
        self.trigger_send_if_open();
    }

    fn on_error(&mut self, id: ConnectionId, reason: &str) {
        warn!(conn_id = %id, error = %reason, "Connection error");
        if id == self.active {
            self.try_reconnect();
        }
    }

    fn on_message(&mut self, id: ConnectionId, text: &str) {
        match self.codec.decode_frame(text) {
            Ok(messages) => {
                for message in messages {
                    match message {
                        IncomingMessage::Control(control) => self.handle_control(id, control),
                        IncomingMessage::Response(response) => self.handle_response(id, response),
                    }
                }
            }
            Err(e) => {
                warn!(conn_id = %id, error = %e, "Dropping undecodable frame");
            }
        }

        if id != self.active || self.state == SessionState::Closed {
            self.close_if_drained(id);
        }
    }

    fn handle_control(&mut self, conn: ConnectionId, control: ControlMessage) {
        if !control.is_reconnect() {
            debug!(conn_id = %conn, method = %control.method, "Ignoring unknown control message");
            return;
        }
        if conn != self.active || self.state == SessionState::Closed {
            debug!(conn_id = %conn, "Ignoring reconnect directive from superseded connection");
            return;
        }

        info!(conn_id = %conn, "Server requested reconnect");
        self.reconnect();
        let subscriptions = self
            .pending
            .take_where(|e| e.kind() == OperationKind::Subscription);
        let mut previous_owners = vec![conn];
        for entry in subscriptions {
            debug!(request_id = %entry.operation.id, "Resubscribing after server reconnect");
            if !previous_owners.contains(&entry.connection) {
                previous_owners.push(entry.connection);
            }
            entry
                .callbacks
                .on_error(TransportError::interrupted("server requested reconnect"));
            self.register(entry.operation, entry.callbacks, entry.registration);
        }
        for owner in previous_owners {
            self.close_if_drained(owner);
        }
    }

    fn handle_response(&mut self, conn: ConnectionId, response: ResponseEnvelope) {
        let Some(id) = response.id else {
            debug!(conn_id = %conn, "Ignoring response without id");
            return;
        };
        let Some(entry) = self.pending.get(&id) else {
            debug!(conn_id = %conn, request_id = %id, "Ignoring response for unknown request");
            return;
        };
        let mut owner = entry.connection;
        let callbacks = entry.callbacks.clone();

        match response.body {
            ResponseBody::Error(shape) => {
                self.pending.remove(&id);
                debug!(request_id = %id, code = shape.code, "Request failed remotely");
                callbacks.on_error(TransportError::Remote(shape));
                self.close_if_drained(owner);
            }
            ResponseBody::Result(result) => {
                let stopped = result.is_stopped();
                callbacks.on_next(result);

                if owner != self.active && conn == self.active {
                    self.pending.rebind(&id, self.active);
                    self.close_if_drained(owner);
                    owner = self.active;
                }
                if stopped {
                    self.pending.remove(&id);
                    debug!(request_id = %id, "Server stopped request");
                    callbacks.on_done();
                    self.close_if_drained(owner);
                }
            }
        }
    }

    fn on_closed(&mut self, id: ConnectionId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            conn.mark_closed();
        }
        info!(conn_id = %id, "Connection closed");

        if id == self.active {
            self.try_reconnect();
        }

        let session_closed = self.state == SessionState::Closed;
        let failed = self
            .pending
            .take_where(|e| e.connection == id && (e.sent || session_closed));
        for entry in failed {
            entry
                .callbacks
                .on_error(TransportError::closed_prematurely(format!("{} closed", id)));
            if entry.operation.is_subscription() && self.state != SessionState::Closed {
                debug!(request_id = %entry.operation.id, "Resubscribing after connection loss");
                self.register(entry.operation, entry.callbacks, entry.registration);
            } else {
                entry.callbacks.on_done();
            }
        }
    }

    fn close_if_drained(&mut self, id: ConnectionId) {
        if id == self.active && self.state != SessionState::Closed {
            return;
        }
        if self.pending.has_bound_to(id) {
            return;
        }
        if let Some(conn) = self.connections.get_mut(&id) {
            if conn.close() {
                debug!(conn_id = %id, "Connection drained, closing");
            }
        }
    }

    fn try_reconnect(&mut self) {
        if self.state == SessionState::Closed || self.reconnect_timer != ReconnectTimer::Idle {
            return;
        }
        let delay = self.retry_delay.delay_for(self.connect_attempt);
        self.connect_attempt = self.connect_attempt.saturating_add(1);
        info!(
            attempt = self.connect_attempt,
            delay_ms = delay.as_millis() as u64,
            "Scheduling reconnect"
        );
        self.state = SessionState::Connecting;
        self.reconnect_timer = ReconnectTimer::Requested(delay);
    }

    /// Delay of a newly requested reconnect timer. The timer counts as in flight
    /// until [`Session::reconnect_timer_fired`].
    pub fn take_reconnect_request(&mut self) -> Option<Duration> {
        match self.reconnect_timer {
            ReconnectTimer::Requested(delay) => {
                self.reconnect_timer = ReconnectTimer::Pending;
                Some(delay)
            }
            ReconnectTimer::Idle | ReconnectTimer::Pending => None,
        }
    }

    pub fn reconnect_pending(&self) -> bool {
        self.reconnect_timer != ReconnectTimer::Idle
    }

    pub fn reconnect_timer_fired(&mut self) {
        if self.reconnect_timer == ReconnectTimer::Idle {
            return;
        }
        self.reconnect();
    }

    /// Graceful replacement: a new connection becomes active at once and the
    /// previous one is closed only after its last bound request resolves.
    pub fn reconnect(&mut self) {
        self.reconnect_timer = ReconnectTimer::Idle;
        if self.state == SessionState::Closed {
            return;
        }
        self.state = SessionState::Connecting;

        let previous = self.active;
        self.active = self.open_connection();
        if let Some(conn) = self.connections.get_mut(&previous) {
            conn.mark_superseded(Instant::now());
        }
        let moved = self.pending.rebind_unsent(self.active);
        info!(
            previous = %previous,
            conn_id = %self.active,
            draining = self.pending.count_bound_to(previous),
            moved,
            "Replaced active connection"
        );
        self.close_if_drained(previous);
    }

    /// Force-close superseded connections that have been draining longer than
    /// the stale timeout. Returns how many were closed.
    pub fn reap_stale_connections(&mut self, now: Instant) -> usize {
        let Some(timeout) = self.stale_connection_timeout else {
            return 0;
        };
        let active = self.active;
        let mut reaped = 0;
        for conn in self.connections.values_mut() {
            if conn.id() == active {
                continue;
            }
            let Some(since) = conn.superseded_at() else {
                continue;
            };
            let waited = now.saturating_duration_since(since);
            if waited >= timeout && conn.close() {
                warn!(
                    conn_id = %conn.id(),
                    waited_ms = waited.as_millis() as u64,
                    "Force-closing stale draining connection"
                );
                reaped += 1;
            }
        }
        reaped
    }
}
