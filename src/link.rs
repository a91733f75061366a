//! Call-site binding over [`WsClient`].
//!
//! A [`Link`] assigns operation ids, runs inputs and outputs through a
//! [`Transformer`], and turns the raw callback protocol into per-operation
//! events: a future for queries and mutations, an event stream for
//! subscriptions.

use crate::messages::{Operation, OperationKind, RequestId, RpcResult};
use crate::network::callbacks::RequestCallbacks;
use crate::network::client::{Unsubscribe, WeakUnsubscribe, WsClient};
use crate::network::error::TransportError;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, trace};

/// Converts application values to and from their wire representation
pub trait Transformer: Send + Sync {
    fn serialize(&self, value: Value) -> Result<Value, TransportError>;
    fn deserialize(&self, value: Value) -> Result<Value, TransportError>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityTransformer;

impl Transformer for IdentityTransformer {
    fn serialize(&self, value: Value) -> Result<Value, TransportError> {
        Ok(value)
    }

    fn deserialize(&self, value: Value) -> Result<Value, TransportError> {
        Ok(value)
    }
}

/// What a call site observes for one operation
#[derive(Debug, Clone)]
pub enum LinkEvent {
    Started,
    Data(Value),
    Stopped,
    Error(TransportError),
}

impl LinkEvent {
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            LinkEvent::Data(value) => Some(value),
            _ => None,
        }
    }
}

type EventFn = Box<dyn Fn(LinkEvent) + Send + Sync>;

struct LinkCallbacks {
    kind: OperationKind,
    transformer: Arc<dyn Transformer>,
    is_done: Arc<AtomicBool>,
    unsubscribe: WeakUnsubscribe,
    emit: EventFn,
}

impl RequestCallbacks for LinkCallbacks {
    fn on_next(&self, result: RpcResult) {
        if self.is_done.load(Ordering::SeqCst) {
            return;
        }
        let event = match result {
            RpcResult::Started => LinkEvent::Started,
            RpcResult::Stopped => LinkEvent::Stopped,
            RpcResult::Data { data } => match self.transformer.deserialize(data) {
                Ok(value) => LinkEvent::Data(value),
                Err(e) => LinkEvent::Error(e),
            },
        };

        if self.kind != OperationKind::Subscription {
            // one answer is all a query or mutation gets
            self.is_done.store(true, Ordering::SeqCst);
            self.unsubscribe.unsubscribe();
        } else if matches!(event, LinkEvent::Stopped) {
            self.is_done.store(true, Ordering::SeqCst);
        }
        (self.emit)(event);
    }

    fn on_error(&self, error: TransportError) {
        if self.is_done.load(Ordering::SeqCst) {
            return;
        }
        // interruptions are followed by a resubscribe or by on_done
        if !(error.is_interrupted() || error.is_closed_prematurely()) {
            self.is_done.store(true, Ordering::SeqCst);
        }
        (self.emit)(LinkEvent::Error(error));
    }

    fn on_done(&self) {
        if self.is_done.swap(true, Ordering::SeqCst) {
            return;
        }
        (self.emit)(LinkEvent::Error(TransportError::SubscriptionEnded));
    }
}

/// Cancels one operation issued through a [`Link`]
#[derive(Debug, Clone)]
pub struct LinkHandle {
    is_done: Arc<AtomicBool>,
    unsubscribe: Unsubscribe,
}

impl LinkHandle {
    pub fn id(&self) -> &RequestId {
        self.unsubscribe.id()
    }

    /// Stop delivering events and release the request
    pub fn cancel(&self) {
        self.is_done.store(true, Ordering::SeqCst);
        self.unsubscribe.unsubscribe();
    }
}

pub struct Link {
    client: WsClient,
    transformer: Arc<dyn Transformer>,
    last_id: AtomicI64,
}

impl Link {
    pub fn new(client: WsClient) -> Self {
        Self {
            client,
            transformer: Arc::new(IdentityTransformer),
            last_id: AtomicI64::new(0),
        }
    }

    pub fn with_transformer(mut self, transformer: Arc<dyn Transformer>) -> Self {
        self.transformer = transformer;
        self
    }

    pub fn client(&self) -> &WsClient {
        &self.client
    }

    /// Issue an operation and hand every event to `on_event`
    pub fn execute(
        &self,
        kind: OperationKind,
        path: impl Into<String>,
        input: Option<Value>,
        on_event: impl Fn(LinkEvent) + Send + Sync + 'static,
    ) -> Result<LinkHandle, TransportError> {
        let input = input
            .map(|value| self.transformer.serialize(value))
            .transpose()?;
        let id = self.last_id.fetch_add(1, Ordering::SeqCst) + 1;
        let operation = Operation::new(id, kind, path, input);
        trace!(request_id = id, kind = %kind, path = %operation.path, "Executing operation");

        let is_done = Arc::new(AtomicBool::new(false));
        let registration = self.client.next_registration();
        let callbacks = LinkCallbacks {
            kind,
            transformer: self.transformer.clone(),
            is_done: is_done.clone(),
            unsubscribe: self
                .client
                .weak_unsubscribe(operation.id.clone(), registration),
            emit: Box::new(on_event),
        };
        let unsubscribe = self
            .client
            .request_as(operation, Arc::new(callbacks), registration);
        Ok(LinkHandle {
            is_done,
            unsubscribe,
        })
    }

    pub async fn query(
        &self,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.call(OperationKind::Query, path, input).await
    }

    pub async fn mutation(
        &self,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Result<Value, TransportError> {
        self.call(OperationKind::Mutation, path, input).await
    }

    async fn call(
        &self,
        kind: OperationKind,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Result<Value, TransportError> {
        let (tx, rx) = oneshot::channel();
        let slot = Mutex::new(Some(tx));
        let _handle = self.execute(kind, path, input, move |event| {
            let Some(tx) = slot.lock().ok().and_then(|mut slot| slot.take()) else {
                return;
            };
            let outcome = match event {
                LinkEvent::Data(value) => Ok(value),
                LinkEvent::Error(e) => Err(e),
                LinkEvent::Started | LinkEvent::Stopped => Ok(Value::Null),
            };
            let _ = tx.send(outcome);
        })?;

        rx.await.unwrap_or_else(|_| {
            debug!("Operation dropped without an outcome");
            Err(TransportError::closed_prematurely(
                "operation dropped without an outcome",
            ))
        })
    }

    /// Start a subscription. Dropping the returned value unsubscribes.
    pub fn subscription(
        &self,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Result<Subscription, TransportError> {
        let (tx, events) = mpsc::unbounded_channel();
        let handle = self.execute(OperationKind::Subscription, path, input, move |event| {
            let _ = tx.send(event);
        })?;
        Ok(Subscription { events, handle })
    }
}

/// Event stream of one subscription
pub struct Subscription {
    events: mpsc::UnboundedReceiver<LinkEvent>,
    handle: LinkHandle,
}

impl Subscription {
    pub fn id(&self) -> &RequestId {
        self.handle.id()
    }

    /// Next event, or `None` once the subscription is over
    pub async fn next(&mut self) -> Option<LinkEvent> {
        self.events.recv().await
    }

    pub fn unsubscribe(&self) {
        self.handle.cancel();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.handle.cancel();
    }
}
