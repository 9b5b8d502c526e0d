//! # a3s-bridge
//!
//! JSON-RPC 2.0 and Model Context Protocol core for the A3S DevTools bridge.
//!
//! ## Overview
//!
//! `a3s-bridge` lets a process expose tools, resources and prompts to a
//! controlling client over a long-lived connection. It is transport-agnostic:
//! the protocol engine only sees JSON values, and connectors (WebSocket, HTTP,
//! in-memory) only see serialized envelopes.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use a3s_bridge::{McpServerBuilder, McpTool, ProtocolClient, Transport, TransportConfig};
//! use serde_json::json;
//!
//! # async fn example() -> a3s_bridge::Result<()> {
//! let mcp = McpServerBuilder::new("devtools", "1.0.0")
//!     .tool(McpTool::new("echo", "Echo arguments", json!({"type": "object"})))
//!     .on_tool_call(|params| async move { Ok(json!({ "echoed": params })) })
//!     .build()?;
//!
//! let transport = Transport::websocket("ws://127.0.0.1:9229/bridge", TransportConfig::default())?;
//! let client = ProtocolClient::builder(transport).mcp(&mcp).build()?;
//! client.connect().await?;
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - **JsonRpcProtocol**: framing, correlation, dispatch, middleware, stats
//! - **McpProtocol**: MCP lifecycle and method namespace on top of the engine
//! - **Transport**: connection state machine over a pluggable `Connector`
//! - **ProtocolClient**: envelope glue between engine and transport, with an
//!   offline queue

pub mod client;
pub mod config;
pub mod error;
pub mod jsonrpc;
pub mod mcp;
pub mod transport;
pub mod types;

mod lock;

// Re-export core types
pub use client::{ClientEvent, ProtocolClient, ProtocolClientBuilder};
pub use config::{BridgeConfig, ClientConfig, McpConfig, ProtocolConfig, TransportConfig};
pub use error::{BridgeError, ErrorCategory, Result};
pub use jsonrpc::{
    BatchEntry, BatchOutcome, JsonRpcErrorObject, JsonRpcId, JsonRpcMessage, JsonRpcPayload,
    JsonRpcProtocol, LogLevel, MessageSink, Middleware, Next, ProtocolEvent, ProtocolStats,
    RequestContext, RequestOptions,
};
pub use mcp::{
    McpError, McpPrompt, McpProtocol, McpResource, McpServerBuilder, McpState, McpTool,
    PromptArgument, ResourceContent,
};
pub use transport::{
    ConnectionInfo, ConnectionState, Connector, ConnectorEvent, HttpConnector, MemoryConnector,
    Transport, TransportCapabilities, TransportEvent, TransportMiddleware, TransportStats,
    WebSocketConnector,
};
pub use types::{ProtocolMessage, SessionId, Timestamp, TransportMessage};
