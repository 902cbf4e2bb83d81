//! RPC Protocol Messages
//!
//! JSON-RPC-2.0-shaped request/response objects carried inside the
//! encrypted envelope. Failures are reported in the body, never through the
//! HTTP status.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::session::StateError;

// =============================================================================
// ERROR CODES
// =============================================================================

/// Request object is missing required fields.
pub const INVALID_REQUEST: i64 = -32600;
/// No handler is registered for the method.
pub const METHOD_NOT_FOUND: i64 = -32601;
/// Params or caller context are unusable.
pub const INVALID_PARAMS: i64 = -32602;
/// Handler ran and failed (game-state errors land here).
pub const HANDLER_ERROR: i64 = -32000;

// =============================================================================
// REQUEST
// =============================================================================

/// Decoded RPC request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcRequest {
    /// Fully-qualified method name, e.g. `AuthService.Login`.
    pub method: String,
    /// Method parameters.
    #[serde(default)]
    pub params: Value,
    /// Caller-chosen correlation id, echoed back.
    #[serde(default)]
    pub id: Value,
}

impl RpcRequest {
    /// Parse a request out of a decoded envelope document.
    ///
    /// On failure the returned error still carries the request id if one
    /// could be recovered.
    pub fn from_value(doc: Value) -> Result<Self, (Value, RpcError)> {
        let id = doc.get("id").cloned().unwrap_or(Value::Null);

        if !doc.is_object() {
            return Err((id, RpcError::InvalidRequest("request is not an object".into())));
        }
        match doc.get("method") {
            Some(Value::String(_)) => {}
            Some(_) => {
                return Err((id, RpcError::InvalidRequest("method is not a string".into())));
            }
            None => return Err((id, RpcError::InvalidRequest("missing method".into()))),
        }

        serde_json::from_value(doc).map_err(|e| (id, RpcError::InvalidRequest(e.to_string())))
    }
}

// =============================================================================
// RESPONSE
// =============================================================================

/// Error object inside a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcErrorObject {
    /// Numeric error code.
    pub code: i64,
    /// Human-readable message.
    pub message: String,
}

/// RPC response, serialized as `{id, result}` or `{id, error}`.
#[derive(Debug, Clone, PartialEq)]
pub enum RpcResponse {
    /// Successful call.
    Success {
        /// Echoed request id.
        id: Value,
        /// Handler result.
        result: Value,
    },
    /// Failed call.
    Failure {
        /// Echoed request id.
        id: Value,
        /// Error description.
        error: RpcErrorObject,
    },
}

impl RpcResponse {
    /// Build a success response.
    pub fn success(id: Value, result: Value) -> Self {
        Self::Success { id, result }
    }

    /// Build an error response.
    pub fn failure(id: Value, error: &RpcError) -> Self {
        Self::Failure {
            id,
            error: RpcErrorObject {
                code: error.code(),
                message: error.to_string(),
            },
        }
    }

    /// Convert to a JSON document for encoding.
    pub fn to_value(&self) -> Value {
        match self {
            Self::Success { id, result } => serde_json::json!({ "id": id, "result": result }),
            Self::Failure { id, error } => serde_json::json!({
                "id": id,
                "error": { "code": error.code, "message": error.message },
            }),
        }
    }
}

// =============================================================================
// ERRORS
// =============================================================================

/// Errors raised while routing or running an RPC method.
#[derive(Debug, Error)]
pub enum RpcError {
    /// Request object is malformed.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Method is not registered.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// Params or caller identity are unusable.
    #[error("invalid params: {0}")]
    InvalidParams(String),

    /// Game-state failure; the transaction was rolled back.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Generic handler failure.
    #[error("{0}")]
    Handler(String),
}

impl RpcError {
    /// JSON-RPC error code for this error.
    pub fn code(&self) -> i64 {
        match self {
            Self::InvalidRequest(_) => INVALID_REQUEST,
            Self::MethodNotFound(_) => METHOD_NOT_FOUND,
            Self::InvalidParams(_) => INVALID_PARAMS,
            Self::State(_) | Self::Handler(_) => HANDLER_ERROR,
        }
    }
}
