pub mod backoff;
pub mod batcher;
pub mod callbacks;
pub mod client;
pub mod connection;
mod driver;
pub mod error;
pub mod pending;
pub mod session;

pub use backoff::{RetryConfig, RetryDelay};
pub use callbacks::{CallbackSet, RequestCallbacks};
pub use client::{ClientOptions, Unsubscribe, WsClient};
pub use connection::{
    Connection, ConnectionEvent, ConnectionId, ConnectionState, Connector, EventSender, Socket,
    WsConnector,
};
pub use error::{ClientError, TransportError};
pub use session::{ConnectionInfo, Session, SessionSnapshot, SessionState};
