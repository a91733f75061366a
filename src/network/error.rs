use crate::messages::{RequestId, RpcErrorShape};
use std::sync::Arc;
use thiserror::Error;

/// Wrapped underlying cause of a transport error
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Errors delivered to a request's `on_error` hook.
///
/// Never thrown across the public API; each request sees its own failures.
#[derive(Error, Debug, Clone)]
pub enum TransportError {
    /// A live subscription was restarted by a connection replacement
    #[error("Operation interrupted: {reason}")]
    Interrupted {
        reason: String,
        #[source]
        cause: Option<Cause>,
    },

    /// The owning connection closed before a terminal response arrived
    #[error("Connection closed prematurely: {reason}")]
    ClosedPrematurely {
        reason: String,
        #[source]
        cause: Option<Cause>,
    },

    /// Synthesized by the call-site layer when an operation is done without completing
    #[error("Operation ended prematurely")]
    SubscriptionEnded,

    #[error("Decode error: {reason}")]
    Decode {
        reason: String,
        #[source]
        cause: Option<Cause>,
    },

    #[error("Transport failure: {reason}")]
    Transport {
        reason: String,
        #[source]
        cause: Option<Cause>,
    },

    /// Error response sent by the server for this request
    #[error("Remote error {}: {}", .0.code, .0.message)]
    Remote(RpcErrorShape),

    #[error("Request id {0} is already in flight")]
    DuplicateRequestId(RequestId),
}

impl TransportError {
    pub fn interrupted(reason: impl Into<String>) -> Self {
        TransportError::Interrupted {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn closed_prematurely(reason: impl Into<String>) -> Self {
        TransportError::ClosedPrematurely {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn decode(reason: impl Into<String>) -> Self {
        TransportError::Decode {
            reason: reason.into(),
            cause: None,
        }
    }

    pub fn transport(reason: impl Into<String>) -> Self {
        TransportError::Transport {
            reason: reason.into(),
            cause: None,
        }
    }

    /// Attach an underlying cause. Variants without a cause slot are returned unchanged.
    pub fn with_cause(mut self, source: Cause) -> Self {
        match &mut self {
            TransportError::Interrupted { cause, .. }
            | TransportError::ClosedPrematurely { cause, .. }
            | TransportError::Decode { cause, .. }
            | TransportError::Transport { cause, .. } => *cause = Some(source),
            TransportError::SubscriptionEnded
            | TransportError::Remote(_)
            | TransportError::DuplicateRequestId(_) => {}
        }
        self
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, TransportError::Interrupted { .. })
    }

    pub fn is_closed_prematurely(&self) -> bool {
        matches!(self, TransportError::ClosedPrematurely { .. })
    }

    /// Short classification used in logs
    pub fn kind(&self) -> &'static str {
        match self {
            TransportError::Interrupted { .. } => "interrupted",
            TransportError::ClosedPrematurely { .. } => "closed_prematurely",
            TransportError::SubscriptionEnded => "subscription_ended",
            TransportError::Decode { .. } => "decode",
            TransportError::Transport { .. } => "transport",
            TransportError::Remote(_) => "remote",
            TransportError::DuplicateRequestId(_) => "duplicate_request_id",
        }
    }
}

/// Errors returned by the client handle itself
#[derive(Error, Debug)]
pub enum ClientError {
    #[error("Session driver has stopped")]
    DriverStopped,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::messages::WireProtocolError;
    use std::error::Error as _;

    #[test]
    fn test_cause_is_exposed_as_source() {
        let wire = WireProtocolError::CorruptedData {
            reason: "bad".to_string(),
        };
        let err = TransportError::transport("flush failed").with_cause(Arc::new(wire));

        assert_eq!(err.kind(), "transport");
        let source = err.source().expect("cause should be the source");
        assert!(source.to_string().contains("Corrupted data"));
    }

    #[test]
    fn test_variants_without_cause_slot_ignore_it() {
        let err = TransportError::SubscriptionEnded.with_cause(Arc::new(std::fmt::Error));
        assert!(err.source().is_none());
        assert_eq!(err.to_string(), "Operation ended prematurely");
    }

    #[test]
    fn test_classification_helpers() {
        assert!(TransportError::interrupted("server reconnect").is_interrupted());
        assert!(TransportError::closed_prematurely("socket closed").is_closed_prematurely());
        assert!(!TransportError::decode("x").is_interrupted());

        let remote = TransportError::Remote(RpcErrorShape::new(-32600, "bad input"));
        assert_eq!(remote.to_string(), "Remote error -32600: bad input");
    }
}
