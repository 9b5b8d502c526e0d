//! Fluent construction of an [`McpProtocol`]

use super::protocol::McpProtocol;
use super::types::{
    CallToolParams, GetPromptParams, McpPrompt, McpResource, McpTool, ResourceContent,
};
use crate::config::{McpConfig, ProtocolConfig};
use crate::error::Result;
use crate::jsonrpc::Middleware;
use serde_json::Value;
use std::future::Future;

type Binding = Box<dyn FnOnce(&McpProtocol) + Send>;

/// Builder for an MCP server protocol
///
/// ```rust,ignore
/// let mcp = McpServerBuilder::new("devtools", "1.0.0")
///     .tool(McpTool::new("echo", "Echo arguments", json!({"type": "object"})))
///     .on_tool_call(|params| async move { Ok(json!({ "echoed": params })) })
///     .build()?;
/// ```
pub struct McpServerBuilder {
    config: McpConfig,
    resources: Vec<McpResource>,
    tools: Vec<McpTool>,
    prompts: Vec<McpPrompt>,
    bindings: Vec<Binding>,
}

impl McpServerBuilder {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            config: McpConfig {
                server_name: name.into(),
                server_version: version.into(),
                ..Default::default()
            },
            resources: Vec::new(),
            tools: Vec::new(),
            prompts: Vec::new(),
            bindings: Vec::new(),
        }
    }

    /// Start from a full configuration
    pub fn from_config(config: McpConfig) -> Self {
        Self {
            config,
            resources: Vec::new(),
            tools: Vec::new(),
            prompts: Vec::new(),
            bindings: Vec::new(),
        }
    }

    pub fn protocol_config(mut self, protocol: ProtocolConfig) -> Self {
        self.config.protocol = protocol;
        self
    }

    pub fn resource(mut self, resource: McpResource) -> Self {
        self.resources.push(resource);
        self
    }

    pub fn tool(mut self, tool: McpTool) -> Self {
        self.tools.push(tool);
        self
    }

    pub fn prompt(mut self, prompt: McpPrompt) -> Self {
        self.prompts.push(prompt);
        self
    }

    pub fn on_resource_list<F, Fut>(self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpResource>>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_resource_list_handler(handler))
    }

    pub fn on_resource_read<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContent>>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_resource_read_handler(handler))
    }

    pub fn on_tool_list<F, Fut>(self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpTool>>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_tool_list_handler(handler))
    }

    pub fn on_tool_call<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(CallToolParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_tool_call_handler(handler))
    }

    pub fn on_prompt_list<F, Fut>(self, handler: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpPrompt>>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_prompt_list_handler(handler))
    }

    pub fn on_prompt_get<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(GetPromptParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        self.bind(move |mcp| mcp.set_prompt_get_handler(handler))
    }

    pub fn on_exit<F>(self, hook: F) -> Self
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        self.bind(move |mcp| mcp.set_exit_hook(hook))
    }

    /// Add a request middleware layer to the engine
    pub fn middleware(self, middleware: impl Middleware + 'static) -> Self {
        self.bind(move |mcp| mcp.engine().use_middleware(middleware))
    }

    fn bind(mut self, binding: impl FnOnce(&McpProtocol) + Send + 'static) -> Self {
        self.bindings.push(Box::new(binding));
        self
    }

    pub fn build(self) -> Result<McpProtocol> {
        let mcp = McpProtocol::new(self.config)?;
        for resource in self.resources {
            mcp.register_resource(resource);
        }
        for tool in self.tools {
            mcp.register_tool(tool);
        }
        for prompt in self.prompts {
            mcp.register_prompt(prompt);
        }
        for binding in self.bindings {
            binding(&mcp);
        }
        Ok(mcp)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_builder_registers_everything() {
        let mcp = McpServerBuilder::new("devtools", "2.0.0")
            .resource(McpResource::new("app://dom", "DOM"))
            .tool(McpTool::new("echo", "Echo", json!({"type": "object"})))
            .on_prompt_list(|| async { Ok(vec![McpPrompt::new("debug")]) })
            .build()
            .unwrap();

        let caps = mcp.server_capabilities();
        assert!(caps.resources.is_some());
        assert!(caps.tools.is_some());
        assert!(caps.prompts.is_some());
        assert!(mcp.engine().has_handler("tools/call"));
    }

    #[test]
    fn test_builder_rejects_invalid_protocol_config() {
        let result = McpServerBuilder::new("devtools", "2.0.0")
            .protocol_config(ProtocolConfig {
                request_timeout_ms: 0,
                ..Default::default()
            })
            .build();
        assert!(result.is_err());
    }
}
