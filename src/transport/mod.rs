//! Transport abstraction
//!
//! [`Transport`] owns one physical connection's lifecycle: the connection
//! state machine, reconnection with backoff, keep-alive, middleware and
//! statistics. The wire itself is a [`Connector`]; concrete connectors only
//! know how to open, close and write to their channel and report inbound
//! traffic through a [`ConnectorEvent`] channel.
//!
//! - [`WebSocketConnector`]: bidirectional, ping/pong keep-alive
//! - [`HttpConnector`]: one POST per message, response bodies are inbound
//! - [`MemoryConnector`]: in-process linked pair with failure injection

pub mod base;
pub mod http;
pub mod memory;
pub mod middleware;
pub mod websocket;

pub use base::{HandlerId, MessageHandler, Transport};
pub use http::HttpConnector;
pub use memory::MemoryConnector;
pub use middleware::{TracingMiddleware, TransportMiddleware};
pub use websocket::{WebSocketConfig, WebSocketConnector};

use crate::error::Result;
use crate::types::{SessionId, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;

/// Connection lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Closing,
    Closed,
    Error,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
            Self::Closing => "closing",
            Self::Closed => "closed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// Feature flags a connector declares
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportCapabilities {
    pub bidirectional: bool,
    pub streaming: bool,
    pub batching: bool,
    pub compression: bool,
    pub encryption: bool,
    pub authentication: bool,
    pub qos: bool,
}

/// Details of the current connection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub session_id: SessionId,
    pub connection_string: String,
    pub connected_at: Timestamp,
}

/// Snapshot of transport counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub errors: u64,
    pub reconnect_attempts: u64,
    /// Milliseconds since the current connection was established
    pub connection_duration_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_activity: Option<Timestamp>,
}

/// Events emitted by a [`Transport`]
#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged {
        from: ConnectionState,
        to: ConnectionState,
    },
    Connected {
        info: ConnectionInfo,
    },
    Disconnected {
        reason: String,
        will_reconnect: bool,
    },
    Reconnecting {
        attempt: u32,
        delay_ms: u64,
    },
    ReconnectFailed {
        attempts: u32,
    },
    Error {
        message: String,
    },
}

/// Inbound traffic reported by a connector
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectorEvent {
    /// One inbound text frame
    Message(String),
    /// The connection went away without `disconnect()` being called
    Closed { reason: String },
}

/// The wire underneath a [`Transport`]
#[async_trait]
pub trait Connector: Send + Sync {
    /// Human-readable endpoint description
    fn connection_string(&self) -> String;

    fn capabilities(&self) -> TransportCapabilities;

    /// Open the connection; inbound frames and loss are reported on `events`
    async fn connect(&self, events: mpsc::UnboundedSender<ConnectorEvent>) -> Result<()>;

    /// Close the connection; must succeed when already closed
    async fn disconnect(&self) -> Result<()>;

    /// Write one serialized envelope
    async fn send(&self, data: String) -> Result<()>;

    /// Protocol-specific liveness check
    async fn send_keep_alive(&self) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_serializes_lowercase() {
        assert_eq!(
            serde_json::to_value(ConnectionState::Reconnecting).unwrap(),
            "reconnecting"
        );
        assert_eq!(ConnectionState::Closed.to_string(), "closed");
    }

    #[test]
    fn test_stats_camel_case() {
        let json = serde_json::to_value(TransportStats::default()).unwrap();
        assert_eq!(json["reconnectAttempts"], 0);
        assert!(json.get("lastActivity").is_none());
    }
}
