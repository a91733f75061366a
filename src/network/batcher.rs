use crate::messages::{OutboundFrame, RequestEnvelope, RequestId};

/// Outgoing envelopes waiting for the next flush.
///
/// At most one flush is scheduled per dirty period; the owner decides when
/// a scheduled flush actually runs.
#[derive(Debug, Default)]
pub struct OutboundBatcher {
    queue: Vec<RequestEnvelope>,
    flush_scheduled: bool,
}

impl OutboundBatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an envelope. Returns true if this is the first enqueue of a dirty
    /// period, i.e. the caller should schedule a flush.
    pub fn enqueue(&mut self, envelope: RequestEnvelope) -> bool {
        self.queue.push(envelope);
        !self.flush_scheduled
    }

    pub fn is_scheduled(&self) -> bool {
        self.flush_scheduled
    }

    pub fn mark_scheduled(&mut self) {
        self.flush_scheduled = true;
    }

    pub fn clear_schedule(&mut self) {
        self.flush_scheduled = false;
    }

    /// Drain the queue into one frame: unwrapped if it holds a single envelope.
    pub fn take_frame(&mut self) -> Option<OutboundFrame> {
        match self.queue.len() {
            0 => None,
            1 => self.queue.pop().map(OutboundFrame::Single),
            _ => Some(OutboundFrame::Batch(std::mem::take(&mut self.queue))),
        }
    }

    /// Drop queued requests for `id`. A queued stop for an earlier use of the
    /// id is kept. Returns how many were removed.
    pub fn discard(&mut self, id: &RequestId) -> usize {
        let before = self.queue.len();
        self.queue
            .retain(|envelope| &envelope.id != id || envelope.is_stop());
        before - self.queue.len()
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.flush_scheduled = false;
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }
}
