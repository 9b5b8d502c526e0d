//! Model Context Protocol layered on the JSON-RPC engine

pub mod builder;
pub mod protocol;
pub mod types;

pub use builder::McpServerBuilder;
pub use protocol::{ExitHook, McpProtocol};
pub use types::{
    error_codes, CallToolParams, ClientCapabilities, GetPromptParams, Implementation,
    InitializeParams, InitializeResult, McpError, McpPrompt, McpResource, McpState, McpTool,
    PromptArgument, ResourceContent, ServerCapabilities, PROTOCOL_VERSION,
};
