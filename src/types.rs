//! Identifiers and envelope types shared by the transport and protocol layers
//!
//! All envelope types use camelCase JSON serialization for wire compatibility.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// Version tag stamped on every [`ProtocolMessage`]
pub const ENVELOPE_VERSION: &str = "1.0";

/// Opaque session identifier (`session-<uuid>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    /// Generate a fresh session id
    pub fn new() -> Self {
        Self(format!("session-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<String> for SessionId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Opaque envelope identifier (`req-<uuid>`)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    /// Generate a fresh request id
    pub fn new() -> Self {
        Self(format!("req-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for RequestId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Unix timestamp in milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(u64);

impl Timestamp {
    /// Current wall-clock time
    pub fn now() -> Self {
        Self(now_millis())
    }

    pub fn from_millis(millis: u64) -> Self {
        Self(millis)
    }

    pub fn as_millis(&self) -> u64 {
        self.0
    }

    /// Milliseconds elapsed since this timestamp (zero if in the future)
    pub fn elapsed_millis(&self) -> u64 {
        now_millis().saturating_sub(self.0)
    }
}

/// Envelope wrapping a JSON-RPC message or batch for transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolMessage<T> {
    pub id: RequestId,
    pub session_id: SessionId,
    pub timestamp: Timestamp,
    pub version: String,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl<T> ProtocolMessage<T> {
    /// Wrap a payload with a fresh id and the current timestamp
    pub fn new(session_id: SessionId, version: impl Into<String>, payload: T) -> Self {
        Self {
            id: RequestId::new(),
            session_id,
            timestamp: Timestamp::now(),
            version: version.into(),
            payload,
            metadata: None,
        }
    }
}

/// Outer envelope used purely by the transport
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportMessage<T> {
    pub id: String,
    pub timestamp: Timestamp,
    pub payload: T,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<HashMap<String, serde_json::Value>>,
}

impl<T> TransportMessage<T> {
    /// Wrap a payload with a fresh `msg-<uuid>` id
    pub fn new(payload: T) -> Self {
        Self {
            id: format!("msg-{}", uuid::Uuid::new_v4()),
            timestamp: Timestamp::now(),
            payload,
            metadata: None,
        }
    }

    /// Add a metadata entry
    pub fn with_metadata(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.metadata
            .get_or_insert_with(HashMap::new)
            .insert(key.into(), value);
        self
    }
}

pub(crate) fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_prefixed_and_unique() {
        let a = SessionId::new();
        let b = SessionId::new();
        assert!(a.as_str().starts_with("session-"));
        assert_ne!(a, b);
        assert!(RequestId::new().as_str().starts_with("req-"));
    }

    #[test]
    fn test_protocol_message_camel_case() {
        let msg = ProtocolMessage::new(
            SessionId::from("session-1".to_string()),
            ENVELOPE_VERSION,
            serde_json::json!({"jsonrpc": "2.0", "method": "ping"}),
        );
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["sessionId"], "session-1");
        assert_eq!(json["version"], "1.0");
        assert_eq!(json["payload"]["method"], "ping");
        assert!(json.get("metadata").is_none());
    }

    #[test]
    fn test_transport_message_metadata() {
        let msg = TransportMessage::new(serde_json::json!(1))
            .with_metadata("sessionId", serde_json::json!("session-9"));
        assert!(msg.id.starts_with("msg-"));
        let json = serde_json::to_string(&msg).unwrap();
        let parsed: TransportMessage<serde_json::Value> = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.metadata.unwrap()["sessionId"], "session-9");
    }

    #[test]
    fn test_timestamp_elapsed() {
        let ts = Timestamp::from_millis(now_millis() - 50);
        assert!(ts.elapsed_millis() >= 50);
        assert_eq!(Timestamp::from_millis(u64::MAX).elapsed_millis(), 0);
    }
}
