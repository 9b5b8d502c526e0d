//! Configuration for the protocol engine, transports and client
//!
//! Every component receives its configuration at construction; there is no
//! process-wide mutable configuration. All structs deserialize from camelCase
//! JSON and fall back to their defaults for missing fields.

use crate::error::{BridgeError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// JSON-RPC engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ProtocolConfig {
    /// Default timeout for outbound requests
    pub request_timeout_ms: u64,

    /// Allow `batch()` calls
    pub batching: bool,

    /// Maximum number of messages per outbound batch
    pub max_batch_size: usize,

    /// Honour explicit cancellation and abort signals
    pub cancellation: bool,

    /// Accept `$/progress` notifications
    pub progress: bool,

    /// Reject unknown methods with `-32601` and validate the `jsonrpc` tag
    pub strict_mode: bool,

    /// Trace every inbound and outbound message
    pub debug: bool,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 60_000,
            batching: true,
            max_batch_size: 100,
            cancellation: true,
            progress: true,
            strict_mode: true,
            debug: false,
        }
    }
}

impl ProtocolConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.request_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "requestTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.max_batch_size == 0 {
            return Err(BridgeError::Config(
                "maxBatchSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Transport state machine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TransportConfig {
    /// Reconnect after an unexpected drop
    pub auto_reconnect: bool,

    /// Reconnect attempts before falling back to `disconnected`
    pub max_reconnect_attempts: u32,

    /// Delay before the first reconnect attempt
    pub reconnect_delay_ms: u64,

    /// Multiplier applied to the delay after every failed attempt
    pub reconnect_backoff_multiplier: f64,

    /// Ceiling for the reconnect delay
    pub max_reconnect_delay_ms: u64,

    /// A connect attempt fails once this elapses
    pub connection_timeout_ms: u64,

    /// Send periodic keep-alive pings
    pub keep_alive: bool,

    /// Interval between keep-alive pings
    pub keep_alive_interval_ms: u64,

    /// Outbound messages larger than this fail before being sent
    pub max_message_size: usize,

    /// Advertise compression support (capability flag only)
    pub compression: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            max_reconnect_attempts: 5,
            reconnect_delay_ms: 1_000,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 30_000,
            connection_timeout_ms: 10_000,
            keep_alive: true,
            keep_alive_interval_ms: 30_000,
            max_message_size: 10 * 1024 * 1024,
            compression: false,
        }
    }
}

impl TransportConfig {
    pub fn connection_timeout(&self) -> Duration {
        Duration::from_millis(self.connection_timeout_ms)
    }

    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based)
    ///
    /// `reconnectDelay × multiplier^(attempt-1)`, capped at `maxReconnectDelay`.
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1) as i32;
        let raw = self.reconnect_delay_ms as f64 * self.reconnect_backoff_multiplier.powi(exponent);
        let capped = raw.min(self.max_reconnect_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    pub fn validate(&self) -> Result<()> {
        if self.connection_timeout_ms == 0 {
            return Err(BridgeError::Config(
                "connectionTimeoutMs must be greater than zero".to_string(),
            ));
        }
        if self.reconnect_backoff_multiplier < 1.0 {
            return Err(BridgeError::Config(format!(
                "reconnectBackoffMultiplier must be >= 1.0, got {}",
                self.reconnect_backoff_multiplier
            )));
        }
        if self.keep_alive && self.keep_alive_interval_ms == 0 {
            return Err(BridgeError::Config(
                "keepAliveIntervalMs must be greater than zero when keepAlive is enabled"
                    .to_string(),
            ));
        }
        if self.max_message_size == 0 {
            return Err(BridgeError::Config(
                "maxMessageSize must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}

/// Protocol client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ClientConfig {
    /// Queue outbound messages while the transport is reconnecting
    pub auto_reconnect: bool,

    /// Offline queue capacity; the oldest message is evicted on overflow
    pub message_queue_size: usize,

    /// Session id stamped on outgoing envelopes (generated when absent)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,

    /// Envelope version tag
    pub envelope_version: String,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            auto_reconnect: true,
            message_queue_size: 100,
            session_id: None,
            envelope_version: crate::types::ENVELOPE_VERSION.to_string(),
        }
    }
}

impl ClientConfig {
    /// Whether offline messages are queued rather than rejected
    pub fn queueing_enabled(&self) -> bool {
        self.auto_reconnect && self.message_queue_size > 0
    }
}

/// MCP server identity and engine settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct McpConfig {
    pub server_name: String,
    pub server_version: String,
    pub protocol: ProtocolConfig,
}

impl Default for McpConfig {
    fn default() -> Self {
        Self {
            server_name: "a3s-bridge".to_string(),
            server_version: env!("CARGO_PKG_VERSION").to_string(),
            protocol: ProtocolConfig::default(),
        }
    }
}

/// Aggregate configuration for a full bridge stack
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BridgeConfig {
    pub mcp: McpConfig,
    pub transport: TransportConfig,
    pub client: ClientConfig,
}

impl BridgeConfig {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| BridgeError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a JSON configuration file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|e| {
            BridgeError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;

        let config = Self::from_json_str(&json)?;
        tracing::debug!(path = %path.display(), "Bridge config loaded");
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.mcp.protocol.validate()?;
        self.transport.validate()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_defaults() {
        let config = ProtocolConfig::default();
        assert_eq!(config.request_timeout_ms, 60_000);
        assert!(config.batching);
        assert_eq!(config.max_batch_size, 100);
        assert!(config.cancellation);
        assert!(config.progress);
        assert!(config.strict_mode);
        assert!(!config.debug);
    }

    #[test]
    fn test_reconnect_backoff() {
        let config = TransportConfig {
            reconnect_delay_ms: 100,
            reconnect_backoff_multiplier: 2.0,
            max_reconnect_delay_ms: 500,
            ..Default::default()
        };
        assert_eq!(config.reconnect_delay(1), Duration::from_millis(100));
        assert_eq!(config.reconnect_delay(2), Duration::from_millis(200));
        assert_eq!(config.reconnect_delay(3), Duration::from_millis(400));
        assert_eq!(config.reconnect_delay(4), Duration::from_millis(500));
        assert_eq!(config.reconnect_delay(20), Duration::from_millis(500));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let config = BridgeConfig::from_json_str(
            r#"{"transport": {"maxReconnectAttempts": 2}, "client": {"messageQueueSize": 2}}"#,
        )
        .unwrap();
        assert_eq!(config.transport.max_reconnect_attempts, 2);
        assert!(config.transport.auto_reconnect);
        assert_eq!(config.client.message_queue_size, 2);
        assert_eq!(config.mcp.protocol.request_timeout_ms, 60_000);
    }

    #[test]
    fn test_invalid_multiplier_rejected() {
        let result = BridgeConfig::from_json_str(
            r#"{"transport": {"reconnectBackoffMultiplier": 0.5}}"#,
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_zero_batch_size_rejected() {
        let config = ProtocolConfig {
            max_batch_size: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_queueing_enabled() {
        assert!(ClientConfig::default().queueing_enabled());
        let config = ClientConfig {
            auto_reconnect: false,
            ..Default::default()
        };
        assert!(!config.queueing_enabled());
    }

    #[test]
    fn test_from_file_missing() {
        let result = BridgeConfig::from_file("/tmp/nonexistent-a3s-bridge-config.json");
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[test]
    fn test_from_file_roundtrip() {
        let dir = std::env::temp_dir().join(format!("a3s-bridge-test-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("bridge.json");
        std::fs::write(&path, r#"{"mcp": {"serverName": "devtools"}}"#).unwrap();

        let config = BridgeConfig::from_file(&path).unwrap();
        assert_eq!(config.mcp.server_name, "devtools");

        std::fs::remove_dir_all(&dir).unwrap();
    }
}
