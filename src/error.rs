//! Error types for a3s-bridge

use crate::jsonrpc::message::{codes, JsonRpcErrorObject};
use thiserror::Error;

/// Broad classification of a [`BridgeError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// Invalid or missing setup, reported at call time
    Configuration,
    /// Connection, send and timeout failures; usually retryable
    Network,
    /// Malformed messages, invalid state, remote errors
    Protocol,
    /// Bad input supplied by the caller
    Validation,
    /// Routine MCP failure modes (not initialized, unknown tool, ...)
    Mcp,
}

/// Errors that can occur in the bridge core
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A handler is already registered for this method
    #[error("Handler already registered for method '{0}'")]
    DuplicateRegistration(String),

    /// `batch()` called while batching is disabled
    #[error("Batching is disabled")]
    BatchingDisabled,

    /// Batch exceeds the configured maximum
    #[error("Batch of {size} messages exceeds maximum of {max}")]
    BatchTooLarge { size: usize, max: usize },

    /// Outbound request received no response in time
    #[error("Request '{method}' timed out after {timeout_ms}ms")]
    Timeout { method: String, timeout_ms: u64 },

    /// Pending request was cancelled locally
    #[error("Request {id} cancelled: {reason}")]
    Cancelled { id: String, reason: String },

    /// The peer answered with a JSON-RPC error response
    #[error("Remote error {code}: {message}")]
    Remote {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// Error raised by a handler with an explicit JSON-RPC code
    #[error("{message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<serde_json::Value>,
    },

    /// No handler for the requested method
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// Handler parameters could not be interpreted
    #[error("Invalid params: {0}")]
    InvalidParams(String),

    /// Message does not have the shape of a JSON-RPC request
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Inbound bytes could not be parsed
    #[error("Parse error: {0}")]
    Parse(String),

    /// Operation requires a live connection
    #[error("Not connected")]
    NotConnected,

    /// Connection attempt failed
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    /// Connection attempt exceeded `connectionTimeout`
    #[error("Connection timed out after {0}ms")]
    ConnectionTimeout(u64),

    /// Outbound message exceeds `maxMessageSize`
    #[error("Message of {size} bytes exceeds maximum of {max} bytes")]
    MessageTooLarge { size: usize, max: usize },

    /// The connector failed to write a message
    #[error("Send failed: {0}")]
    SendFailed(String),

    /// Operation is not valid in the current state
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// MCP domain error surfaced as a JSON-RPC error response
    #[error("{message}")]
    Mcp { code: i64, message: String },

    /// Serialization/deserialization failure
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unexpected internal failure
    #[error("Internal error: {0}")]
    Internal(String),
}

impl BridgeError {
    /// Build an application error carrying an explicit JSON-RPC code
    pub fn rpc(code: i64, message: impl Into<String>) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: None,
        }
    }

    /// Build an application error with attached data
    pub fn rpc_with_data(code: i64, message: impl Into<String>, data: serde_json::Value) -> Self {
        Self::Rpc {
            code,
            message: message.into(),
            data: Some(data),
        }
    }

    /// Classify the error according to the bridge error taxonomy
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::DuplicateRegistration(_)
            | Self::BatchingDisabled
            | Self::BatchTooLarge { .. }
            | Self::Config(_) => ErrorCategory::Configuration,
            Self::Timeout { .. }
            | Self::NotConnected
            | Self::ConnectionFailed(_)
            | Self::ConnectionTimeout(_)
            | Self::MessageTooLarge { .. }
            | Self::SendFailed(_) => ErrorCategory::Network,
            Self::InvalidParams(_) => ErrorCategory::Validation,
            Self::Mcp { .. } => ErrorCategory::Mcp,
            Self::Cancelled { .. }
            | Self::Remote { .. }
            | Self::Rpc { .. }
            | Self::MethodNotFound(_)
            | Self::InvalidRequest(_)
            | Self::Parse(_)
            | Self::InvalidState(_)
            | Self::Serialization(_)
            | Self::Internal(_) => ErrorCategory::Protocol,
        }
    }

    /// Whether retrying the same operation later may succeed
    pub fn is_retryable(&self) -> bool {
        // An oversized message will stay oversized.
        self.category() == ErrorCategory::Network && !matches!(self, Self::MessageTooLarge { .. })
    }

    /// JSON-RPC code classifying this error.
    ///
    /// Only errors that carry an explicit code keep it on the wire; see
    /// [`BridgeError::to_error_object`].
    pub fn code(&self) -> i64 {
        match self {
            Self::Remote { code, .. } | Self::Rpc { code, .. } | Self::Mcp { code, .. } => *code,
            Self::MethodNotFound(_) => codes::METHOD_NOT_FOUND,
            Self::InvalidParams(_) => codes::INVALID_PARAMS,
            Self::InvalidRequest(_) => codes::INVALID_REQUEST,
            Self::Parse(_) => codes::PARSE_ERROR,
            Self::Timeout { .. } | Self::ConnectionTimeout(_) => codes::TIMEOUT,
            Self::Cancelled { .. } => codes::CANCELLED,
            Self::InvalidState(_) => codes::INVALID_STATE,
            Self::NotConnected | Self::ConnectionFailed(_) | Self::SendFailed(_) => {
                codes::CONNECTION_ERROR
            }
            _ => codes::INTERNAL_ERROR,
        }
    }

    /// Convert to a JSON-RPC error object.
    ///
    /// Errors that carry their own code keep it and their message; anything
    /// else becomes a generic `-32603 Internal error` with the detail in `data`.
    pub fn to_error_object(&self) -> JsonRpcErrorObject {
        match self {
            Self::Remote {
                code,
                message,
                data,
            }
            | Self::Rpc {
                code,
                message,
                data,
            } => JsonRpcErrorObject {
                code: *code,
                message: message.clone(),
                data: data.clone(),
            },
            Self::Mcp { code, message } => JsonRpcErrorObject::new(*code, message.clone()),
            Self::MethodNotFound(method) => JsonRpcErrorObject::with_data(
                codes::METHOD_NOT_FOUND,
                "Method not found",
                serde_json::json!({ "method": method }),
            ),
            Self::InvalidParams(detail) => JsonRpcErrorObject::with_data(
                codes::INVALID_PARAMS,
                "Invalid params",
                serde_json::Value::String(detail.clone()),
            ),
            Self::InvalidRequest(detail) => JsonRpcErrorObject::with_data(
                codes::INVALID_REQUEST,
                "Invalid Request",
                serde_json::Value::String(detail.clone()),
            ),
            Self::Parse(detail) => JsonRpcErrorObject::with_data(
                codes::PARSE_ERROR,
                "Parse error",
                serde_json::Value::String(detail.clone()),
            ),
            other => JsonRpcErrorObject::with_data(
                codes::INTERNAL_ERROR,
                "Internal error",
                serde_json::Value::String(other.to_string()),
            ),
        }
    }
}

/// Result type alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpc_error_keeps_code() {
        let err = BridgeError::rpc(-32050, "quota exhausted");
        let obj = err.to_error_object();
        assert_eq!(obj.code, -32050);
        assert_eq!(obj.message, "quota exhausted");
        assert!(obj.data.is_none());
    }

    #[test]
    fn test_generic_error_maps_to_internal() {
        let err = BridgeError::Internal("boom".to_string());
        let obj = err.to_error_object();
        assert_eq!(obj.code, codes::INTERNAL_ERROR);
        assert_eq!(obj.message, "Internal error");
    }

    #[test]
    fn test_method_not_found_object() {
        let obj = BridgeError::MethodNotFound("nope".to_string()).to_error_object();
        assert_eq!(obj.code, -32601);
        assert_eq!(obj.data.unwrap()["method"], "nope");
    }

    #[test]
    fn test_categories() {
        assert_eq!(
            BridgeError::DuplicateRegistration("x".into()).category(),
            ErrorCategory::Configuration
        );
        assert_eq!(BridgeError::NotConnected.category(), ErrorCategory::Network);
        assert_eq!(
            BridgeError::InvalidParams("x".into()).category(),
            ErrorCategory::Validation
        );
        assert_eq!(
            BridgeError::Mcp {
                code: -32002,
                message: "not initialized".into()
            }
            .category(),
            ErrorCategory::Mcp
        );
    }

    #[test]
    fn test_retryable() {
        assert!(BridgeError::NotConnected.is_retryable());
        assert!(BridgeError::ConnectionTimeout(100).is_retryable());
        assert!(!BridgeError::MessageTooLarge { size: 10, max: 5 }.is_retryable());
        assert!(!BridgeError::BatchingDisabled.is_retryable());
    }

    #[test]
    fn test_codes() {
        assert_eq!(
            BridgeError::Timeout {
                method: "x".into(),
                timeout_ms: 1
            }
            .code(),
            -32001
        );
        assert_eq!(
            BridgeError::Cancelled {
                id: "1".into(),
                reason: "test".into()
            }
            .code(),
            -32002
        );
        assert_eq!(BridgeError::NotConnected.code(), -32008);
    }
}
