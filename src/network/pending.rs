use crate::messages::{Operation, OperationKind, RequestId};
use crate::network::callbacks::RequestCallbacks;
use crate::network::connection::ConnectionId;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// One call to `request`. Handles carry it so they only ever release the
/// entry they registered, never a later or rejected one reusing the id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Registration(u64);

impl Registration {
    pub fn new(value: u64) -> Self {
        Self(value)
    }

    pub fn value(&self) -> u64 {
        self.0
    }
}

/// Bookkeeping for one in-flight operation
pub struct PendingRequest {
    /// Connection the request was sent on (or will be sent on, while `sent` is false)
    pub connection: ConnectionId,
    /// Whether the envelope has actually been flushed to `connection`
    pub sent: bool,
    pub operation: Operation,
    pub callbacks: Arc<dyn RequestCallbacks>,
    /// Survives resubscription, so the caller's handle keeps working
    pub registration: Registration,
    order: u64,
}

impl PendingRequest {
    pub fn new(
        connection: ConnectionId,
        operation: Operation,
        callbacks: Arc<dyn RequestCallbacks>,
        registration: Registration,
    ) -> Self {
        Self {
            connection,
            sent: false,
            operation,
            callbacks,
            registration,
            order: 0,
        }
    }

    pub fn id(&self) -> &RequestId {
        &self.operation.id
    }

    pub fn kind(&self) -> OperationKind {
        self.operation.kind
    }
}

impl fmt::Debug for PendingRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingRequest")
            .field("id", &self.operation.id)
            .field("kind", &self.operation.kind)
            .field("connection", &self.connection)
            .field("sent", &self.sent)
            .field("registration", &self.registration.0)
            .finish()
    }
}

/// Request id to pending request. At most one entry per id.
#[derive(Debug, Default)]
pub struct PendingRequestTable {
    entries: HashMap<RequestId, PendingRequest>,
    next_order: u64,
}

impl PendingRequestTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a request, replacing any entry with the same id. Returns the replaced entry.
    pub fn insert(&mut self, mut request: PendingRequest) -> Option<PendingRequest> {
        request.order = self.next_order;
        self.next_order += 1;
        self.entries.insert(request.id().clone(), request)
    }

    pub fn get(&self, id: &RequestId) -> Option<&PendingRequest> {
        self.entries.get(id)
    }

    pub fn contains(&self, id: &RequestId) -> bool {
        self.entries.contains_key(id)
    }

    pub fn remove(&mut self, id: &RequestId) -> Option<PendingRequest> {
        self.entries.remove(id)
    }

    /// Remove the entry for `id` only if it belongs to `registration`
    pub fn remove_registered(
        &mut self,
        id: &RequestId,
        registration: Registration,
    ) -> Option<PendingRequest> {
        match self.entries.get(id) {
            Some(entry) if entry.registration == registration => self.entries.remove(id),
            _ => None,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Move an entry to another connection. Returns the previous owner.
    pub fn rebind(&mut self, id: &RequestId, connection: ConnectionId) -> Option<ConnectionId> {
        self.entries
            .get_mut(id)
            .map(|entry| std::mem::replace(&mut entry.connection, connection))
    }

    /// Record that the request went out on `connection`
    pub fn mark_sent(&mut self, id: &RequestId, connection: ConnectionId) {
        if let Some(entry) = self.entries.get_mut(id) {
            entry.connection = connection;
            entry.sent = true;
        }
    }

    /// Point every unsent request at `connection`. Returns how many moved.
    pub fn rebind_unsent(&mut self, connection: ConnectionId) -> usize {
        let mut moved = 0;
        for entry in self.entries.values_mut().filter(|e| !e.sent) {
            if entry.connection != connection {
                entry.connection = connection;
                moved += 1;
            }
        }
        moved
    }

    pub fn has_bound_to(&self, connection: ConnectionId) -> bool {
        self.entries.values().any(|e| e.connection == connection)
    }

    pub fn count_bound_to(&self, connection: ConnectionId) -> usize {
        self.entries
            .values()
            .filter(|e| e.connection == connection)
            .count()
    }

    /// Remove and return every entry matching `predicate`, in registration order
    pub fn take_where(
        &mut self,
        mut predicate: impl FnMut(&PendingRequest) -> bool,
    ) -> Vec<PendingRequest> {
        let ids: Vec<RequestId> = self
            .entries
            .values()
            .filter(|e| predicate(e))
            .map(|e| e.id().clone())
            .collect();
        let mut taken: Vec<PendingRequest> = ids
            .iter()
            .filter_map(|id| self.entries.remove(id))
            .collect();
        taken.sort_by_key(|e| e.order);
        taken
    }
}
