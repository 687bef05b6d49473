//! JSON-RPC wire types and shape-based message classification.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// JSON-RPC version echoed on server-constructed responses.
pub const JSONRPC_VERSION: &str = "2.0";

/// An RPC request addressed to a device.
///
/// `id` is caller-chosen and must be unique among in-flight calls for
/// the target device.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcCall {
    pub id: String,
    pub method: String,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

fn default_version() -> String {
    JSONRPC_VERSION.to_owned()
}

impl RpcCall {
    /// Create a call with no parameters.
    pub fn new(id: impl Into<String>, method: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            method: method.into(),
            jsonrpc: default_version(),
            params: None,
        }
    }

    /// Attach parameters.
    pub fn with_params(mut self, params: Value) -> Self {
        self.params = Some(params);
        self
    }
}

/// A device's reply to a call, echoing the same `id`.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RpcResponse {
    pub id: String,
    #[serde(default = "default_version")]
    pub jsonrpc: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<Value>,
}

impl RpcResponse {
    /// Build a successful response.
    pub fn success(id: impl Into<String>, result: Value) -> Self {
        Self {
            id: id.into(),
            jsonrpc: default_version(),
            result: Some(result),
            error: None,
        }
    }

    /// Build an error response.
    pub fn failure(id: impl Into<String>, error: Value) -> Self {
        Self {
            id: id.into(),
            jsonrpc: default_version(),
            result: None,
            error: Some(error),
        }
    }
}

/// A classified inbound device payload.
///
/// Explicit tagged union: a payload carrying both `method` and `result`
/// is a [`DeviceMessage::Call`]; `method` is the single discriminator.
#[derive(Clone, Debug, PartialEq)]
pub enum DeviceMessage {
    /// The device issued a call of its own (e.g. `forwardLogs`).
    Call(RpcCall),
    /// The device answered a call the server sent.
    Response(RpcResponse),
}

/// Why a payload could not be classified.
#[derive(Debug, thiserror::Error)]
pub enum ClassifyError {
    /// Payload is not valid JSON or has the wrong field types.
    #[error("invalid JSON: {0}")]
    Json(#[from] serde_json::Error),
    /// Valid JSON, but neither `method` nor `result`/`error` present.
    #[error("message is neither a call nor a response")]
    UnknownShape,
}

impl ClassifyError {
    /// Metric category for this failure.
    pub fn category(&self) -> &'static str {
        match self {
            Self::Json(_) => "unmarshal",
            Self::UnknownShape => "protocol",
        }
    }
}

/// Classify a raw device payload into a [`DeviceMessage`].
///
/// `method` present ⇒ call; else `result` or `error` present ⇒ response;
/// neither ⇒ protocol error. The caller logs and drops failures without
/// terminating the connection.
pub fn classify(payload: &[u8]) -> Result<DeviceMessage, ClassifyError> {
    let value: Value = serde_json::from_slice(payload)?;
    if value.get("method").is_some() {
        Ok(DeviceMessage::Call(serde_json::from_value(value)?))
    } else if value.get("result").is_some() || value.get("error").is_some() {
        Ok(DeviceMessage::Response(serde_json::from_value(value)?))
    } else {
        Err(ClassifyError::UnknownShape)
    }
}
