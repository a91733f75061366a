use crate::messages::RpcResult;
use crate::network::error::TransportError;

/// Consumer hooks for one request. All hooks are optional.
///
/// Hooks run on the session's driver task and must not block.
pub trait RequestCallbacks: Send + Sync {
    fn on_next(&self, _result: RpcResult) {}
    fn on_error(&self, _error: TransportError) {}
    fn on_done(&self) {}
}

type NextFn = Box<dyn Fn(RpcResult) + Send + Sync>;
type ErrorFn = Box<dyn Fn(TransportError) + Send + Sync>;
type DoneFn = Box<dyn Fn() + Send + Sync>;

/// Closure-based [`RequestCallbacks`]
#[derive(Default)]
pub struct CallbackSet {
    next: Option<NextFn>,
    error: Option<ErrorFn>,
    done: Option<DoneFn>,
}

impl CallbackSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_next(mut self, f: impl Fn(RpcResult) + Send + Sync + 'static) -> Self {
        self.next = Some(Box::new(f));
        self
    }

    pub fn with_error(mut self, f: impl Fn(TransportError) + Send + Sync + 'static) -> Self {
        self.error = Some(Box::new(f));
        self
    }

    pub fn with_done(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.done = Some(Box::new(f));
        self
    }
}

impl RequestCallbacks for CallbackSet {
    fn on_next(&self, result: RpcResult) {
        if let Some(f) = &self.next {
            f(result);
        }
    }

    fn on_error(&self, error: TransportError) {
        if let Some(f) = &self.error {
            f(error);
        }
    }

    fn on_done(&self) {
        if let Some(f) = &self.done {
            f();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_missing_hooks_are_noops() {
        let done = Arc::new(AtomicUsize::new(0));
        let counter = done.clone();
        let callbacks = CallbackSet::new().with_done(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        callbacks.on_next(RpcResult::Started);
        callbacks.on_error(TransportError::interrupted("test"));
        callbacks.on_done();

        assert_eq!(done.load(Ordering::SeqCst), 1);
    }
}
