use crate::messages::types::{Operation, OperationKind, RequestId, RpcErrorShape, RpcResult};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, instrument, trace, warn};

// Wire protocol constants
pub const JSONRPC_VERSION: &str = "2.0";
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024 * 1024; // 16MB
pub const RECONNECT_METHOD: &str = "reconnect";

/// Configuration for envelope encoding and decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireConfig {
    pub max_message_size: usize,
}

impl Default for WireConfig {
    fn default() -> Self {
        Self {
            max_message_size: MAX_MESSAGE_SIZE,
        }
    }
}

impl WireConfig {
    pub fn with_max_message_size(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

/// Custom error types for wire protocol operations
#[derive(Error, Debug)]
pub enum WireProtocolError {
    #[error("Message too large: {size} bytes exceeds maximum of {max_size} bytes")]
    MessageTooLarge { size: usize, max_size: usize },

    #[error("Empty frame")]
    EmptyFrame,

    #[error("Corrupted data: {reason}")]
    CorruptedData { reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Method field of an outbound envelope
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Method {
    #[serde(rename = "query")]
    Query,
    #[serde(rename = "mutation")]
    Mutation,
    #[serde(rename = "subscription")]
    Subscription,
    #[serde(rename = "subscription.stop")]
    SubscriptionStop,
}

impl From<OperationKind> for Method {
    fn from(kind: OperationKind) -> Self {
        match kind {
            OperationKind::Query => Method::Query,
            OperationKind::Mutation => Method::Mutation,
            OperationKind::Subscription => Method::Subscription,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestParams {
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

/// Outbound request envelope
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub jsonrpc: String,
    pub method: Method,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<RequestParams>,
}

impl RequestEnvelope {
    pub fn from_operation(operation: &Operation) -> Self {
        Self {
            id: operation.id.clone(),
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: operation.kind.into(),
            params: Some(RequestParams {
                path: operation.path.clone(),
                input: operation.input.clone(),
            }),
        }
    }

    /// Envelope asking the remote side to release a subscription
    pub fn stop(id: RequestId) -> Self {
        Self {
            id,
            jsonrpc: JSONRPC_VERSION.to_string(),
            method: Method::SubscriptionStop,
            params: None,
        }
    }

    pub fn is_stop(&self) -> bool {
        self.method == Method::SubscriptionStop
    }
}

/// A flushed unit: one envelope, or several sent as a JSON array
#[derive(Serialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum OutboundFrame {
    Single(RequestEnvelope),
    Batch(Vec<RequestEnvelope>),
}

impl OutboundFrame {
    pub fn envelopes(&self) -> &[RequestEnvelope] {
        match self {
            OutboundFrame::Single(envelope) => std::slice::from_ref(envelope),
            OutboundFrame::Batch(envelopes) => envelopes,
        }
    }

    pub fn len(&self) -> usize {
        self.envelopes().len()
    }

    pub fn is_empty(&self) -> bool {
        self.envelopes().is_empty()
    }
}

/// Server-initiated message without a response id, e.g. `{"method": "reconnect"}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ControlMessage {
    #[serde(default)]
    pub id: Option<RequestId>,
    pub method: String,
}

impl ControlMessage {
    pub fn is_reconnect(&self) -> bool {
        self.method == RECONNECT_METHOD
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseBody {
    Result(RpcResult),
    Error(RpcErrorShape),
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResponseEnvelope {
    pub id: Option<RequestId>,
    pub body: ResponseBody,
}

#[derive(Debug, Clone, PartialEq)]
pub enum IncomingMessage {
    Control(ControlMessage),
    Response(ResponseEnvelope),
}

#[derive(Deserialize)]
struct ResultResponse {
    #[serde(default)]
    id: Option<RequestId>,
    result: RpcResult,
}

#[derive(Deserialize)]
struct ErrorResponse {
    #[serde(default)]
    id: Option<RequestId>,
    error: RpcErrorShape,
}

/// Encodes outbound frames and decodes inbound ones
#[derive(Debug, Clone, Default)]
pub struct EnvelopeCodec {
    wire_config: WireConfig,
}

impl EnvelopeCodec {
    pub fn new(wire_config: WireConfig) -> Self {
        Self { wire_config }
    }

    fn validate_size(&self, size: usize) -> Result<(), WireProtocolError> {
        if size > self.wire_config.max_message_size {
            warn!(
                size = size,
                max_size = self.wire_config.max_message_size,
                "Frame size exceeds maximum allowed size"
            );
            return Err(WireProtocolError::MessageTooLarge {
                size,
                max_size: self.wire_config.max_message_size,
            });
        }
        Ok(())
    }

    #[instrument(level = "trace", skip(self, frame), fields(envelopes = frame.len()))]
    pub fn encode_frame(&self, frame: &OutboundFrame) -> Result<String, WireProtocolError> {
        let text = serde_json::to_string(frame)?;
        self.validate_size(text.len())?;
        trace!("Encoded frame to {} bytes", text.len());
        Ok(text)
    }

    /// Decode one inbound frame. A frame is either a single message or an array of them;
    /// any malformed element rejects the whole frame.
    #[instrument(level = "trace", skip(self, text), fields(size = text.len()))]
    pub fn decode_frame(&self, text: &str) -> Result<Vec<IncomingMessage>, WireProtocolError> {
        self.validate_size(text.len())?;
        if text.trim().is_empty() {
            return Err(WireProtocolError::EmptyFrame);
        }

        let value: Value = serde_json::from_str(text).map_err(|e| {
            debug!(error = %e, "Inbound frame is not valid JSON");
            WireProtocolError::CorruptedData {
                reason: format!("invalid JSON: {}", e),
            }
        })?;

        match value {
            Value::Array(items) => items.into_iter().map(decode_message).collect(),
            other => Ok(vec![decode_message(other)?]),
        }
    }
}

fn decode_message(value: Value) -> Result<IncomingMessage, WireProtocolError> {
    let object = value
        .as_object()
        .ok_or_else(|| WireProtocolError::CorruptedData {
            reason: "message is not a JSON object".to_string(),
        })?;

    if object.contains_key("method") {
        let control: ControlMessage = serde_json::from_value(value)?;
        return Ok(IncomingMessage::Control(control));
    }

    if object.contains_key("error") {
        let response: ErrorResponse = serde_json::from_value(value)?;
        return Ok(IncomingMessage::Response(ResponseEnvelope {
            id: response.id,
            body: ResponseBody::Error(response.error),
        }));
    }

    if object.contains_key("result") {
        let response: ResultResponse = serde_json::from_value(value)?;
        return Ok(IncomingMessage::Response(ResponseEnvelope {
            id: response.id,
            body: ResponseBody::Result(response.result),
        }));
    }

    Err(WireProtocolError::CorruptedData {
        reason: "message has neither method, result nor error".to_string(),
    })
}
