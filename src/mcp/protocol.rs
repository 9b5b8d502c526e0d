//! MCP lifecycle and method surface on top of the JSON-RPC engine
//!
//! `McpProtocol` pre-registers the MCP method handlers on a fresh
//! [`JsonRpcProtocol`] at construction. Handlers share an `McpShared` that
//! holds only a weak engine handle, so the engine → handler → engine path
//! never forms a reference cycle.

use super::types::*;
use crate::config::McpConfig;
use crate::error::{BridgeError, Result};
use crate::jsonrpc::{JsonRpcProtocol, LogLevel};
use crate::lock::{read, write};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock, Weak};

type ListHandler<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<Vec<T>>> + Send + Sync>;
type CallHandler<P, R> = Arc<dyn Fn(P) -> BoxFuture<'static, Result<R>> + Send + Sync>;

/// Invoked on `exit` with the process status the MCP lifecycle prescribes
pub type ExitHook = Arc<dyn Fn(i32) + Send + Sync>;

#[derive(Default)]
struct DynamicHandlers {
    resource_list: Option<ListHandler<McpResource>>,
    resource_read: Option<CallHandler<String, Vec<ResourceContent>>>,
    tool_list: Option<ListHandler<McpTool>>,
    tool_call: Option<CallHandler<CallToolParams, Value>>,
    prompt_list: Option<ListHandler<McpPrompt>>,
    prompt_get: Option<CallHandler<GetPromptParams, Value>>,
}

struct McpShared {
    config: McpConfig,
    engine: Weak<JsonRpcProtocol>,
    state: RwLock<McpState>,
    client_capabilities: RwLock<Option<ClientCapabilities>>,
    client_info: RwLock<Option<Implementation>>,
    resources: RwLock<BTreeMap<String, McpResource>>,
    tools: RwLock<BTreeMap<String, McpTool>>,
    prompts: RwLock<BTreeMap<String, McpPrompt>>,
    handlers: RwLock<DynamicHandlers>,
    exit_hook: RwLock<ExitHook>,
}

/// MCP server-side protocol
#[derive(Clone)]
pub struct McpProtocol {
    engine: Arc<JsonRpcProtocol>,
    shared: Arc<McpShared>,
}

impl McpProtocol {
    /// Create an MCP protocol with all lifecycle and domain methods registered
    pub fn new(config: McpConfig) -> Result<Self> {
        config.protocol.validate()?;
        let engine = Arc::new(JsonRpcProtocol::new(config.protocol.clone()));
        let shared = Arc::new(McpShared {
            config,
            engine: Arc::downgrade(&engine),
            state: RwLock::new(McpState::Uninitialized),
            client_capabilities: RwLock::new(None),
            client_info: RwLock::new(None),
            resources: RwLock::new(BTreeMap::new()),
            tools: RwLock::new(BTreeMap::new()),
            prompts: RwLock::new(BTreeMap::new()),
            handlers: RwLock::new(DynamicHandlers::default()),
            exit_hook: RwLock::new(Arc::new(exit_process)),
        });

        install_handlers(&engine, &shared)?;
        tracing::debug!(
            server = %shared.config.server_name,
            version = %shared.config.server_version,
            "MCP protocol created"
        );
        Ok(Self { engine, shared })
    }

    /// The underlying JSON-RPC engine
    pub fn engine(&self) -> &Arc<JsonRpcProtocol> {
        &self.engine
    }

    pub fn state(&self) -> McpState {
        self.shared.state()
    }

    /// Capabilities recorded from the client's `initialize` call
    pub fn client_capabilities(&self) -> Option<ClientCapabilities> {
        read(&self.shared.client_capabilities).clone()
    }

    pub fn client_info(&self) -> Option<Implementation> {
        read(&self.shared.client_info).clone()
    }

    /// Capabilities derived from the current registries and handlers
    pub fn server_capabilities(&self) -> ServerCapabilities {
        self.shared.server_capabilities()
    }

    /// Dispatch an inbound message through the engine
    pub async fn handle_message(&self, message: Value) {
        self.engine.handle_message(message).await
    }

    // ------------------------------------------------------------------
    // Static registries
    // ------------------------------------------------------------------

    pub fn register_resource(&self, resource: McpResource) {
        tracing::debug!(uri = %resource.uri, "Resource registered");
        write(&self.shared.resources).insert(resource.uri.clone(), resource);
    }

    pub fn unregister_resource(&self, uri: &str) -> bool {
        write(&self.shared.resources).remove(uri).is_some()
    }

    pub fn register_tool(&self, tool: McpTool) {
        tracing::debug!(tool = %tool.name, "Tool registered");
        write(&self.shared.tools).insert(tool.name.clone(), tool);
    }

    pub fn unregister_tool(&self, name: &str) -> bool {
        write(&self.shared.tools).remove(name).is_some()
    }

    pub fn register_prompt(&self, prompt: McpPrompt) {
        tracing::debug!(prompt = %prompt.name, "Prompt registered");
        write(&self.shared.prompts).insert(prompt.name.clone(), prompt);
    }

    pub fn unregister_prompt(&self, name: &str) -> bool {
        write(&self.shared.prompts).remove(name).is_some()
    }

    // ------------------------------------------------------------------
    // Dynamic handlers (take precedence over the static registries)
    // ------------------------------------------------------------------

    pub fn set_resource_list_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpResource>>> + Send + 'static,
    {
        write(&self.shared.handlers).resource_list = Some(Arc::new(move || handler().boxed()));
    }

    /// Handler receives the requested URI and returns its contents
    pub fn set_resource_read_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<ResourceContent>>> + Send + 'static,
    {
        write(&self.shared.handlers).resource_read =
            Some(Arc::new(move |uri| handler(uri).boxed()));
    }

    pub fn set_tool_list_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpTool>>> + Send + 'static,
    {
        write(&self.shared.handlers).tool_list = Some(Arc::new(move || handler().boxed()));
    }

    /// Handler executes tools; its return value becomes the call result
    pub fn set_tool_call_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(CallToolParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        write(&self.shared.handlers).tool_call =
            Some(Arc::new(move |params| handler(params).boxed()));
    }

    pub fn set_prompt_list_handler<F, Fut>(&self, handler: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Vec<McpPrompt>>> + Send + 'static,
    {
        write(&self.shared.handlers).prompt_list = Some(Arc::new(move || handler().boxed()));
    }

    pub fn set_prompt_get_handler<F, Fut>(&self, handler: F)
    where
        F: Fn(GetPromptParams) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        write(&self.shared.handlers).prompt_get =
            Some(Arc::new(move |params| handler(params).boxed()));
    }

    /// Replace the `exit` behaviour (defaults to terminating the process)
    pub fn set_exit_hook<F>(&self, hook: F)
    where
        F: Fn(i32) + Send + Sync + 'static,
    {
        *write(&self.shared.exit_hook) = Arc::new(hook);
    }
}

fn exit_process(code: i32) {
    std::process::exit(code)
}

fn install_handlers(engine: &Arc<JsonRpcProtocol>, shared: &Arc<McpShared>) -> Result<()> {
    route(engine, shared, "initialize", |s, params| async move {
        s.initialize(params)
    })?;
    route(engine, shared, "shutdown", |s, _| async move { s.shutdown() })?;

    route(engine, shared, "resources/list", |s, _| async move {
        s.require_initialized()?;
        s.list_resources().await
    })?;
    route(engine, shared, "resources/read", |s, params| async move {
        s.require_initialized()?;
        s.read_resource(parse_params(params)?).await
    })?;
    route(engine, shared, "tools/list", |s, _| async move {
        s.require_initialized()?;
        s.list_tools().await
    })?;
    route(engine, shared, "tools/call", |s, params| async move {
        s.require_initialized()?;
        s.call_tool(parse_params(params)?).await
    })?;
    route(engine, shared, "prompts/list", |s, _| async move {
        s.require_initialized()?;
        s.list_prompts().await
    })?;
    route(engine, shared, "prompts/get", |s, params| async move {
        s.require_initialized()?;
        s.get_prompt(parse_params(params)?).await
    })?;
    route(engine, shared, "logging/setLevel", |s, params| async move {
        s.require_initialized()?;
        s.set_level(parse_params(params)?)
    })?;

    let s = shared.clone();
    engine.register_notification_handler("initialized", move |_| {
        let state = s.state();
        async move {
            if state != McpState::Initialized {
                tracing::warn!(state = %state, "Received 'initialized' outside initialized state");
            } else {
                tracing::info!("MCP session initialized");
            }
            Ok(())
        }
    })?;

    if shared.config.protocol.progress {
        engine.register_notification_handler("$/progress", |params| async move {
            let progress: ProgressParams = parse_params(params)?;
            tracing::debug!(
                token = %progress.progress_token,
                progress = progress.progress,
                total = ?progress.total,
                "Progress notification"
            );
            Ok(())
        })?;
    }

    let s = shared.clone();
    engine.register_notification_handler("$/cancelRequest", move |params| {
        let s = s.clone();
        async move {
            let cancel: CancelRequestParams = parse_params(params)?;
            if let Some(engine) = s.engine.upgrade() {
                let cancelled = engine.cancel_request(&cancel.id);
                tracing::debug!(id = %cancel.id, cancelled, "Cancel request notification");
            }
            Ok(())
        }
    })?;

    install_exit_handler(engine, shared)
}

/// `exit` must outlive `shutdown`, which clears every other handler
fn install_exit_handler(engine: &JsonRpcProtocol, shared: &Arc<McpShared>) -> Result<()> {
    let s = shared.clone();
    engine.register_notification_handler("exit", move |_| {
        let s = s.clone();
        async move {
            s.exit();
            Ok(())
        }
    })
}

fn route<F, Fut>(
    engine: &JsonRpcProtocol,
    shared: &Arc<McpShared>,
    method: &str,
    handler: F,
) -> Result<()>
where
    F: Fn(Arc<McpShared>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    let shared = shared.clone();
    engine.register_handler(method, move |params, _ctx| handler(shared.clone(), params))
}

fn parse_params<T: DeserializeOwned>(params: Option<Value>) -> Result<T> {
    let params = params.unwrap_or_else(|| Value::Object(Default::default()));
    serde_json::from_value(params).map_err(|e| BridgeError::InvalidParams(e.to_string()))
}

impl McpShared {
    fn state(&self) -> McpState {
        *read(&self.state)
    }

    fn set_state(&self, state: McpState) {
        let previous = std::mem::replace(&mut *write(&self.state), state);
        tracing::debug!(from = %previous, to = %state, "MCP state changed");
    }

    fn require_initialized(&self) -> Result<()> {
        match self.state() {
            McpState::Initialized => Ok(()),
            _ => Err(McpError::not_initialized()),
        }
    }

    fn server_capabilities(&self) -> ServerCapabilities {
        let handlers = read(&self.handlers);
        let has_resources =
            !read(&self.resources).is_empty() || handlers.resource_list.is_some();
        let has_tools = !read(&self.tools).is_empty() || handlers.tool_list.is_some();
        let has_prompts = !read(&self.prompts).is_empty() || handlers.prompt_list.is_some();

        ServerCapabilities {
            resources: has_resources.then(ResourcesCapability::default),
            tools: has_tools.then(ToolsCapability::default),
            prompts: has_prompts.then(PromptsCapability::default),
            logging: Some(LoggingCapability {}),
        }
    }

    fn initialize(&self, params: Option<Value>) -> Result<Value> {
        if self.state() != McpState::Uninitialized {
            return Err(McpError::already_initialized());
        }
        // Malformed params must leave the state untouched
        let params: InitializeParams = parse_params(params)?;
        {
            let mut state = write(&self.state);
            if *state != McpState::Uninitialized {
                return Err(McpError::already_initialized());
            }
            *state = McpState::Initializing;
        }

        if let Some(requested) = params.protocol_version.as_deref() {
            if requested != PROTOCOL_VERSION {
                tracing::debug!(
                    requested,
                    supported = PROTOCOL_VERSION,
                    "Client requested a different protocol version"
                );
            }
        }
        if let Some(info) = &params.client_info {
            tracing::info!(client = %info.name, version = %info.version, "MCP client connected");
        }
        *write(&self.client_capabilities) = Some(params.capabilities);
        *write(&self.client_info) = params.client_info;

        self.set_state(McpState::Initialized);

        let result = InitializeResult {
            protocol_version: PROTOCOL_VERSION.to_string(),
            capabilities: self.server_capabilities(),
            server_info: Implementation {
                name: self.config.server_name.clone(),
                version: self.config.server_version.clone(),
            },
        };
        Ok(serde_json::to_value(result)?)
    }

    fn shutdown(self: &Arc<Self>) -> Result<Value> {
        self.require_initialized()?;
        self.set_state(McpState::ShuttingDown);

        if let Some(engine) = self.engine.upgrade() {
            engine.clear();
            install_exit_handler(&engine, self)?;
        }

        self.set_state(McpState::Shutdown);
        tracing::info!("MCP session shut down");
        Ok(Value::Null)
    }

    fn exit(&self) {
        let code = if self.state() == McpState::Shutdown { 0 } else { 1 };
        tracing::info!(code, "MCP exit requested");
        let hook = read(&self.exit_hook).clone();
        hook(code);
    }

    async fn list_resources(&self) -> Result<Value> {
        let handler = read(&self.handlers).resource_list.clone();
        let resources = match handler {
            Some(handler) => handler().await?,
            None => read(&self.resources).values().cloned().collect(),
        };
        Ok(serde_json::to_value(ListResourcesResult { resources })?)
    }

    async fn read_resource(&self, params: ReadResourceParams) -> Result<Value> {
        let handler = read(&self.handlers).resource_read.clone();
        let contents = match handler {
            Some(handler) => handler(params.uri).await?,
            None => {
                let resource = read(&self.resources).get(&params.uri).cloned();
                let resource = resource.ok_or_else(|| McpError::resource_not_found(&params.uri))?;
                vec![ResourceContent {
                    uri: resource.uri,
                    mime_type: resource.mime_type,
                    text: Some(String::new()),
                    blob: None,
                }]
            }
        };
        Ok(serde_json::to_value(ReadResourceResult { contents })?)
    }

    async fn list_tools(&self) -> Result<Value> {
        let handler = read(&self.handlers).tool_list.clone();
        let tools = match handler {
            Some(handler) => handler().await?,
            None => read(&self.tools).values().cloned().collect(),
        };
        Ok(serde_json::to_value(ListToolsResult { tools })?)
    }

    async fn call_tool(&self, params: CallToolParams) -> Result<Value> {
        let handler = read(&self.handlers).tool_call.clone();
        let Some(handler) = handler else {
            return if read(&self.tools).contains_key(&params.name) {
                Err(McpError::tool_execution_failed(
                    &params.name,
                    "no tool call handler installed",
                ))
            } else {
                Err(McpError::tool_not_found(&params.name))
            };
        };

        let name = params.name.clone();
        tracing::debug!(tool = %name, "Calling tool");
        match handler(params).await {
            Ok(result) => Ok(result),
            Err(e @ (BridgeError::Mcp { .. } | BridgeError::Rpc { .. })) => Err(e),
            Err(e) => Err(McpError::tool_execution_failed(&name, &e.to_string())),
        }
    }

    async fn list_prompts(&self) -> Result<Value> {
        let handler = read(&self.handlers).prompt_list.clone();
        let prompts = match handler {
            Some(handler) => handler().await?,
            None => read(&self.prompts).values().cloned().collect(),
        };
        Ok(serde_json::to_value(ListPromptsResult { prompts })?)
    }

    async fn get_prompt(&self, params: GetPromptParams) -> Result<Value> {
        let prompt = read(&self.prompts).get(&params.name).cloned();
        let handler = read(&self.handlers).prompt_get.clone();

        if let Some(prompt) = &prompt {
            let missing = prompt.missing_arguments(params.arguments.as_ref());
            if !missing.is_empty() {
                return Err(McpError::invalid_prompt_arguments(&params.name, &missing));
            }
        }

        match (handler, prompt) {
            (Some(handler), _) => handler(params).await,
            (None, Some(prompt)) => Ok(json!({
                "description": prompt.description,
                "messages": [],
            })),
            (None, None) => Err(McpError::prompt_not_found(&params.name)),
        }
    }

    fn set_level(&self, params: SetLevelParams) -> Result<Value> {
        let level: LogLevel = params.level.parse()?;
        if let Some(engine) = self.engine.upgrade() {
            engine.set_log_level(level);
        }
        Ok(json!({}))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::jsonrpc::{JsonRpcPayload, MessageSink};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicI32, Ordering};
    use tokio::sync::mpsc;

    struct ChannelSink(mpsc::UnboundedSender<Value>);

    #[async_trait]
    impl MessageSink for ChannelSink {
        async fn send_message(&self, payload: JsonRpcPayload) -> Result<()> {
            self.0
                .send(payload.to_value()?)
                .map_err(|e| BridgeError::SendFailed(e.to_string()))
        }
    }

    fn server() -> (McpProtocol, mpsc::UnboundedReceiver<Value>) {
        let mcp = McpProtocol::new(McpConfig::default()).unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        mcp.engine().set_sink(Arc::new(ChannelSink(tx)));
        (mcp, rx)
    }

    async fn call(
        mcp: &McpProtocol,
        out: &mut mpsc::UnboundedReceiver<Value>,
        id: i64,
        method: &str,
        params: Value,
    ) -> Value {
        mcp.handle_message(json!({"jsonrpc": "2.0", "id": id, "method": method, "params": params}))
            .await;
        out.recv().await.unwrap()
    }

    async fn initialize(mcp: &McpProtocol, out: &mut mpsc::UnboundedReceiver<Value>) {
        let response = call(mcp, out, 0, "initialize", json!({"capabilities": {}})).await;
        assert!(response.get("result").is_some(), "{}", response);
    }

    #[tokio::test]
    async fn test_capabilities_follow_registries() {
        let (mcp, _out) = server();
        let caps = mcp.server_capabilities();
        assert!(caps.tools.is_none());
        assert!(caps.logging.is_some());

        mcp.register_tool(McpTool::new("echo", "Echo", json!({"type": "object"})));
        mcp.set_prompt_list_handler(|| async { Ok(vec![]) });
        let caps = mcp.server_capabilities();
        assert!(caps.tools.is_some());
        assert!(caps.prompts.is_some());
        assert!(caps.resources.is_none());
    }

    #[tokio::test]
    async fn test_initialize_records_client() {
        let (mcp, mut out) = server();
        let response = call(
            &mcp,
            &mut out,
            1,
            "initialize",
            json!({
                "protocolVersion": "2024-11-05",
                "capabilities": {"sampling": {}},
                "clientInfo": {"name": "inspector", "version": "1.0"}
            }),
        )
        .await;

        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "a3s-bridge");
        assert_eq!(mcp.state(), McpState::Initialized);
        assert_eq!(mcp.client_info().unwrap().name, "inspector");
        assert!(mcp.client_capabilities().unwrap().sampling.is_some());
    }

    #[tokio::test]
    async fn test_malformed_initialize_keeps_state() {
        let (mcp, mut out) = server();
        let response = call(&mcp, &mut out, 1, "initialize", json!({"clientInfo": 5})).await;
        assert_eq!(
            response["error"]["code"],
            crate::jsonrpc::codes::INVALID_PARAMS
        );
        assert_eq!(mcp.state(), McpState::Uninitialized);
        assert!(mcp.client_info().is_none());

        initialize(&mcp, &mut out).await;
        assert_eq!(mcp.state(), McpState::Initialized);
    }

    #[tokio::test]
    async fn test_read_static_resource_placeholder() {
        let (mcp, mut out) = server();
        mcp.register_resource(McpResource::new("app://state", "State").with_mime_type("application/json"));
        initialize(&mcp, &mut out).await;

        let response = call(&mcp, &mut out, 1, "resources/read", json!({"uri": "app://state"})).await;
        let content = &response["result"]["contents"][0];
        assert_eq!(content["uri"], "app://state");
        assert_eq!(content["mimeType"], "application/json");
        assert_eq!(content["text"], "");

        let response = call(&mcp, &mut out, 2, "resources/read", json!({"uri": "app://nope"})).await;
        assert_eq!(response["error"]["code"], error_codes::RESOURCE_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tool_call_without_handler() {
        let (mcp, mut out) = server();
        mcp.register_tool(McpTool::new("echo", "Echo", json!({"type": "object"})));
        initialize(&mcp, &mut out).await;

        let response = call(&mcp, &mut out, 1, "tools/call", json!({"name": "echo"})).await;
        assert_eq!(response["error"]["code"], error_codes::TOOL_EXECUTION_FAILED);

        let response = call(&mcp, &mut out, 2, "tools/call", json!({"name": "other"})).await;
        assert_eq!(response["error"]["code"], error_codes::TOOL_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_tool_handler_failure_is_wrapped() {
        let (mcp, mut out) = server();
        mcp.set_tool_call_handler(|_| async { Err(BridgeError::Internal("exploded".to_string())) });
        initialize(&mcp, &mut out).await;

        let response = call(&mcp, &mut out, 1, "tools/call", json!({"name": "any"})).await;
        assert_eq!(response["error"]["code"], error_codes::TOOL_EXECUTION_FAILED);
        assert!(response["error"]["message"]
            .as_str()
            .unwrap()
            .contains("exploded"));
    }

    #[tokio::test]
    async fn test_prompt_get_validates_required_arguments() {
        let (mcp, mut out) = server();
        mcp.register_prompt(McpPrompt::new("review").with_argument(PromptArgument::required("file")));
        initialize(&mcp, &mut out).await;

        let response = call(&mcp, &mut out, 1, "prompts/get", json!({"name": "review"})).await;
        assert_eq!(response["error"]["code"], error_codes::INVALID_PROMPT_ARGUMENTS);

        let response = call(
            &mcp,
            &mut out,
            2,
            "prompts/get",
            json!({"name": "review", "arguments": {"file": "lib.rs"}}),
        )
        .await;
        assert_eq!(response["result"]["messages"], json!([]));

        let response = call(&mcp, &mut out, 3, "prompts/get", json!({"name": "missing"})).await;
        assert_eq!(response["error"]["code"], error_codes::PROMPT_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_set_level() {
        let (mcp, mut out) = server();
        initialize(&mcp, &mut out).await;

        let response = call(&mcp, &mut out, 1, "logging/setLevel", json!({"level": "debug"})).await;
        assert!(response.get("result").is_some());
        assert_eq!(mcp.engine().log_level(), LogLevel::Debug);

        let response = call(&mcp, &mut out, 2, "logging/setLevel", json!({"level": "loud"})).await;
        assert_eq!(response["error"]["code"], -32602);
    }

    #[tokio::test]
    async fn test_exit_status_follows_lifecycle() {
        let (mcp, mut out) = server();
        let status = Arc::new(AtomicI32::new(-1));
        let seen = status.clone();
        mcp.set_exit_hook(move |code| seen.store(code, Ordering::SeqCst));

        mcp.handle_message(json!({"jsonrpc": "2.0", "method": "exit"})).await;
        assert_eq!(status.load(Ordering::SeqCst), 1);

        initialize(&mcp, &mut out).await;
        let response = call(&mcp, &mut out, 1, "shutdown", json!({})).await;
        assert!(response["result"].is_null());
        assert_eq!(mcp.state(), McpState::Shutdown);

        mcp.handle_message(json!({"jsonrpc": "2.0", "method": "exit"})).await;
        assert_eq!(status.load(Ordering::SeqCst), 0);
    }
}
