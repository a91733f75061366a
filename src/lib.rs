pub mod cli;
pub mod link;
pub mod messages;
pub mod network;

// Re-export key types for easy testing
pub use link::{IdentityTransformer, Link, LinkEvent, Subscription, Transformer};
pub use messages::{Operation, OperationKind, RequestId, RpcResult};
pub use network::{
    CallbackSet, ClientOptions, RequestCallbacks, RetryDelay, TransportError, Unsubscribe,
    WsClient,
};
