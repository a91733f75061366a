pub mod types;
pub mod wire;

pub use types::{Operation, OperationKind, RequestId, RpcErrorShape, RpcResult};
pub use wire::{
    // Envelope types
    ControlMessage,
    EnvelopeCodec,
    IncomingMessage,
    Method,
    OutboundFrame,
    RequestEnvelope,
    RequestParams,
    ResponseBody,
    ResponseEnvelope,
    WireConfig,
    WireProtocolError,

    // Wire protocol constants
    JSONRPC_VERSION,
    MAX_MESSAGE_SIZE,
    RECONNECT_METHOD,
};
