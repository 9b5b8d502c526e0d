//! JSON-RPC 2.0 wire types
//!
//! Outbound messages serialize through typed structs. Inbound values are
//! classified by field presence first (see [`JsonRpcMessage::parse`]) so a
//! malformed member is reported on its own instead of failing a whole batch.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;

/// Mandatory `jsonrpc` tag
pub const JSONRPC_VERSION: &str = "2.0";

/// Standard and implementation-defined JSON-RPC error codes
pub mod codes {
    pub const PARSE_ERROR: i64 = -32700;
    pub const INVALID_REQUEST: i64 = -32600;
    pub const METHOD_NOT_FOUND: i64 = -32601;
    pub const INVALID_PARAMS: i64 = -32602;
    pub const INTERNAL_ERROR: i64 = -32603;

    pub const SERVER_ERROR: i64 = -32000;
    pub const TIMEOUT: i64 = -32001;
    pub const CANCELLED: i64 = -32002;
    pub const NOT_IMPLEMENTED: i64 = -32003;
    pub const UNAUTHORIZED: i64 = -32004;
    pub const RATE_LIMITED: i64 = -32005;
    pub const RESOURCE_NOT_FOUND: i64 = -32006;
    pub const INVALID_STATE: i64 = -32007;
    pub const CONNECTION_ERROR: i64 = -32008;
}

fn jsonrpc_version() -> String {
    JSONRPC_VERSION.to_string()
}

/// Request/response correlation id
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum JsonRpcId {
    Number(i64),
    String(String),
}

impl fmt::Display for JsonRpcId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{}", n),
            Self::String(s) => f.write_str(s),
        }
    }
}

impl From<i64> for JsonRpcId {
    fn from(value: i64) -> Self {
        Self::Number(value)
    }
}

impl From<&str> for JsonRpcId {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl JsonRpcId {
    fn from_json(value: &Value) -> Option<Self> {
        match value {
            Value::Number(n) => n.as_i64().map(Self::Number),
            Value::String(s) => Some(Self::String(s.clone())),
            _ => None,
        }
    }
}

/// A call expecting exactly one response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcRequest {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcRequest {
    pub fn new(id: JsonRpcId, method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            id,
            method: method.into(),
            params,
        }
    }
}

/// A fire-and-forget message; never answered
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcNotification {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

impl JsonRpcNotification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: jsonrpc_version(),
            method: method.into(),
            params,
        }
    }
}

/// Error member of an error response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl JsonRpcErrorObject {
    pub fn new(code: i64, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(code: i64, message: impl Into<String>, data: Value) -> Self {
        Self {
            code,
            message: message.into(),
            data: Some(data),
        }
    }
}

/// Successful response
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcSuccess {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: JsonRpcId,
    pub result: Value,
}

/// Error response; `id` is null when the request could not be identified
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JsonRpcErrorResponse {
    #[serde(default = "jsonrpc_version")]
    pub jsonrpc: String,
    pub id: Option<JsonRpcId>,
    pub error: JsonRpcErrorObject,
}

/// Response to a request: exactly one of `result` / `error`
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcResponse {
    Success(JsonRpcSuccess),
    Error(JsonRpcErrorResponse),
}

impl JsonRpcResponse {
    pub fn success(id: JsonRpcId, result: Value) -> Self {
        Self::Success(JsonRpcSuccess {
            jsonrpc: jsonrpc_version(),
            id,
            result,
        })
    }

    pub fn error(id: Option<JsonRpcId>, error: JsonRpcErrorObject) -> Self {
        Self::Error(JsonRpcErrorResponse {
            jsonrpc: jsonrpc_version(),
            id,
            error,
        })
    }

    pub fn id(&self) -> Option<&JsonRpcId> {
        match self {
            Self::Success(s) => Some(&s.id),
            Self::Error(e) => e.id.as_ref(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Any single JSON-RPC message
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcMessage {
    Request(JsonRpcRequest),
    Notification(JsonRpcNotification),
    Response(JsonRpcResponse),
}

/// What goes over the wire: one message or a batch array
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum JsonRpcPayload {
    Single(JsonRpcMessage),
    Batch(Vec<JsonRpcMessage>),
}

impl JsonRpcPayload {
    pub fn to_value(&self) -> crate::Result<Value> {
        Ok(serde_json::to_value(self)?)
    }
}

impl From<JsonRpcMessage> for JsonRpcPayload {
    fn from(message: JsonRpcMessage) -> Self {
        Self::Single(message)
    }
}

/// An inbound value that is not a valid JSON-RPC message
#[derive(Debug, Clone, PartialEq)]
pub struct InvalidMessage {
    /// Id of the offending message, when one could be read
    pub id: Option<JsonRpcId>,
    pub reason: String,
}

impl InvalidMessage {
    fn new(id: Option<JsonRpcId>, reason: impl Into<String>) -> Self {
        Self {
            id,
            reason: reason.into(),
        }
    }
}

impl JsonRpcMessage {
    /// Classify and decode an inbound value.
    ///
    /// Shape rules: `method` + `id` is a request, `method` alone is a
    /// notification, `result`/`error` is a response. With `strict` set the
    /// `jsonrpc: "2.0"` tag is mandatory.
    pub fn parse(value: &Value, strict: bool) -> Result<Self, InvalidMessage> {
        let obj = value
            .as_object()
            .ok_or_else(|| InvalidMessage::new(None, "message is not a JSON object"))?;

        let id = read_id(obj)?;

        if strict && obj.get("jsonrpc").and_then(Value::as_str) != Some(JSONRPC_VERSION) {
            return Err(InvalidMessage::new(
                id.flatten(),
                "missing or unsupported jsonrpc version",
            ));
        }

        if let Some(method) = obj.get("method") {
            let method = method.as_str().ok_or_else(|| {
                InvalidMessage::new(id.clone().flatten(), "method must be a string")
            })?;

            let params = obj.get("params").filter(|p| !p.is_null()).cloned();

            return match id {
                Some(Some(id)) => Ok(Self::Request(JsonRpcRequest::new(id, method, params))),
                Some(None) => Err(InvalidMessage::new(None, "request id must not be null")),
                None => Ok(Self::Notification(JsonRpcNotification::new(method, params))),
            };
        }

        if let Some(error) = obj.get("error") {
            if obj.contains_key("result") {
                return Err(InvalidMessage::new(
                    id.flatten(),
                    "response carries both result and error",
                ));
            }
            let error: JsonRpcErrorObject = serde_json::from_value(error.clone())
                .map_err(|e| InvalidMessage::new(id.clone().flatten(), e.to_string()))?;
            return Ok(Self::Response(JsonRpcResponse::error(id.flatten(), error)));
        }

        if let Some(result) = obj.get("result") {
            return match id {
                Some(Some(id)) => Ok(Self::Response(JsonRpcResponse::success(
                    id,
                    result.clone(),
                ))),
                _ => Err(InvalidMessage::new(None, "success response without id")),
            };
        }

        Err(InvalidMessage::new(
            id.flatten(),
            "message is neither request, notification nor response",
        ))
    }
}

/// `None` = absent, `Some(None)` = explicit null, `Some(Some(id))` = usable id
fn read_id(obj: &Map<String, Value>) -> Result<Option<Option<JsonRpcId>>, InvalidMessage> {
    match obj.get("id") {
        None => Ok(None),
        Some(Value::Null) => Ok(Some(None)),
        Some(raw) => JsonRpcId::from_json(raw)
            .map(|id| Some(Some(id)))
            .ok_or_else(|| InvalidMessage::new(None, "id must be a string or integer")),
    }
}

/// Best-effort id extraction from an arbitrary value
pub fn extract_id(value: &Value) -> Option<JsonRpcId> {
    value.get("id").and_then(JsonRpcId::from_json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_serialization() {
        let req = JsonRpcRequest::new(7.into(), "tools/list", None);
        let json = serde_json::to_value(&req).unwrap();
        assert_eq!(json, json!({"jsonrpc": "2.0", "id": 7, "method": "tools/list"}));
    }

    #[test]
    fn test_error_response_serializes_null_id() {
        let resp = JsonRpcResponse::error(None, JsonRpcErrorObject::new(-32700, "Parse error"));
        let json = serde_json::to_value(&resp).unwrap();
        assert!(json["id"].is_null());
        assert_eq!(json["error"]["code"], -32700);
        assert!(json.get("result").is_none());
    }

    #[test]
    fn test_parse_request() {
        let msg = JsonRpcMessage::parse(
            &json!({"jsonrpc": "2.0", "id": "a", "method": "echo", "params": {"x": 1}}),
            true,
        )
        .unwrap();
        match msg {
            JsonRpcMessage::Request(req) => {
                assert_eq!(req.id, JsonRpcId::from("a"));
                assert_eq!(req.params.unwrap()["x"], 1);
            }
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_notification() {
        let msg = JsonRpcMessage::parse(&json!({"jsonrpc": "2.0", "method": "initialized"}), true)
            .unwrap();
        assert!(matches!(msg, JsonRpcMessage::Notification(_)));
    }

    #[test]
    fn test_parse_error_response() {
        let msg = JsonRpcMessage::parse(
            &json!({"jsonrpc": "2.0", "id": 3, "error": {"code": -32601, "message": "nope"}}),
            true,
        )
        .unwrap();
        match msg {
            JsonRpcMessage::Response(JsonRpcResponse::Error(e)) => {
                assert_eq!(e.id, Some(JsonRpcId::Number(3)));
                assert_eq!(e.error.code, -32601);
            }
            other => panic!("expected error response, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_null_result_is_success() {
        let msg =
            JsonRpcMessage::parse(&json!({"jsonrpc": "2.0", "id": 1, "result": null}), true).unwrap();
        assert!(matches!(
            msg,
            JsonRpcMessage::Response(JsonRpcResponse::Success(_))
        ));
    }

    #[test]
    fn test_strict_requires_version_tag() {
        let value = json!({"id": 1, "method": "x"});
        let err = JsonRpcMessage::parse(&value, true).unwrap_err();
        assert_eq!(err.id, Some(JsonRpcId::Number(1)));
        assert!(JsonRpcMessage::parse(&value, false).is_ok());
    }

    #[test]
    fn test_invalid_shapes() {
        assert!(JsonRpcMessage::parse(&json!(42), false).is_err());
        assert!(JsonRpcMessage::parse(&json!({"jsonrpc": "2.0", "id": 1}), true).is_err());
        assert!(JsonRpcMessage::parse(&json!({"jsonrpc": "2.0", "id": 1, "method": 5}), true).is_err());
        assert!(JsonRpcMessage::parse(&json!({"jsonrpc": "2.0", "id": {"a": 1}, "method": "x"}), true).is_err());
    }

    #[test]
    fn test_parse_scalar_params() {
        for params in [json!(5), json!("s"), json!(true), json!(1.5)] {
            let msg = JsonRpcMessage::parse(
                &json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": params.clone()}),
                true,
            )
            .unwrap();
            match msg {
                JsonRpcMessage::Request(req) => assert_eq!(req.params, Some(params)),
                other => panic!("expected request, got {:?}", other),
            }
        }

        let msg = JsonRpcMessage::parse(
            &json!({"jsonrpc": "2.0", "method": "tick", "params": 7}),
            true,
        )
        .unwrap();
        match msg {
            JsonRpcMessage::Notification(n) => assert_eq!(n.params, Some(json!(7))),
            other => panic!("expected notification, got {:?}", other),
        }
    }

    #[test]
    fn test_parse_null_params_is_absent() {
        let msg = JsonRpcMessage::parse(
            &json!({"jsonrpc": "2.0", "id": 1, "method": "echo", "params": null}),
            true,
        )
        .unwrap();
        match msg {
            JsonRpcMessage::Request(req) => assert!(req.params.is_none()),
            other => panic!("expected request, got {:?}", other),
        }
    }

    #[test]
    fn test_batch_payload_serializes_as_array() {
        let payload = JsonRpcPayload::Batch(vec![
            JsonRpcMessage::Request(JsonRpcRequest::new(1.into(), "a", None)),
            JsonRpcMessage::Notification(JsonRpcNotification::new("b", None)),
        ]);
        let json = payload.to_value().unwrap();
        assert_eq!(json.as_array().unwrap().len(), 2);
        assert!(json[1].get("id").is_none());
    }

    #[test]
    fn test_extract_id() {
        assert_eq!(extract_id(&json!({"id": 5})), Some(JsonRpcId::Number(5)));
        assert_eq!(extract_id(&json!({"id": null})), None);
        assert_eq!(extract_id(&json!([1, 2])), None);
    }
}
