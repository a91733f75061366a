use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// Identifier of an operation. Unique among the operations a session has in flight.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash)]
#[serde(untagged)]
pub enum RequestId {
    Number(i64),
    String(String),
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RequestId::Number(n) => write!(f, "{}", n),
            RequestId::String(s) => write!(f, "{}", s),
        }
    }
}

impl From<i64> for RequestId {
    fn from(id: i64) -> Self {
        RequestId::Number(id)
    }
}

impl From<&str> for RequestId {
    fn from(id: &str) -> Self {
        RequestId::String(id.to_string())
    }
}

impl From<String> for RequestId {
    fn from(id: String) -> Self {
        RequestId::String(id)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum OperationKind {
    Query,
    Mutation,
    Subscription,
}

impl OperationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationKind::Query => "query",
            OperationKind::Mutation => "mutation",
            OperationKind::Subscription => "subscription",
        }
    }
}

impl fmt::Display for OperationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One logical RPC call. Immutable once created; its identity is `id`.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct Operation {
    pub id: RequestId,
    pub kind: OperationKind,
    pub path: String,
    pub input: Option<Value>,
}

impl Operation {
    pub fn new(
        id: impl Into<RequestId>,
        kind: OperationKind,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self {
            id: id.into(),
            kind,
            path: path.into(),
            input,
        }
    }

    /// Create a query operation
    pub fn query(id: impl Into<RequestId>, path: impl Into<String>, input: Option<Value>) -> Self {
        Self::new(id, OperationKind::Query, path, input)
    }

    /// Create a mutation operation
    pub fn mutation(
        id: impl Into<RequestId>,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self::new(id, OperationKind::Mutation, path, input)
    }

    /// Create a subscription operation
    pub fn subscription(
        id: impl Into<RequestId>,
        path: impl Into<String>,
        input: Option<Value>,
    ) -> Self {
        Self::new(id, OperationKind::Subscription, path, input)
    }

    pub fn is_subscription(&self) -> bool {
        self.kind == OperationKind::Subscription
    }
}

/// Successful result carried by a response, tagged by `type` on the wire.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum RpcResult {
    /// Subscription acknowledged by the server
    Started,
    Data {
        #[serde(default)]
        data: Value,
    },
    /// Terminal marker: the server will send nothing more for this id
    Stopped,
}

impl RpcResult {
    pub fn data(data: Value) -> Self {
        RpcResult::Data { data }
    }

    pub fn is_stopped(&self) -> bool {
        matches!(self, RpcResult::Stopped)
    }

    /// Borrow the payload of a `data` result
    pub fn as_data(&self) -> Option<&Value> {
        match self {
            RpcResult::Data { data } => Some(data),
            _ => None,
        }
    }
}

/// Error body of a response
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RpcErrorShape {
    pub message: String,
    #[serde(default)]
    pub code: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcErrorShape {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code,
            data: None,
        }
    }
}
