//! Protocol client
//!
//! Binds a [`JsonRpcProtocol`] (plain or MCP) to a [`Transport`]. Outbound
//! JSON-RPC payloads are wrapped in a [`ProtocolMessage`] and then a
//! [`TransportMessage`]; inbound envelopes are unwrapped and fed to the engine
//! in the order the transport delivered them.
//! While the transport is down, outbound messages wait in a bounded offline
//! queue that is flushed in order on the next `connected` event.

use crate::config::{ClientConfig, ProtocolConfig};
use crate::error::{BridgeError, Result};
use crate::jsonrpc::{
    codes, extract_id, BatchEntry, BatchOutcome, JsonRpcErrorObject, JsonRpcId, JsonRpcMessage,
    JsonRpcPayload, JsonRpcProtocol, JsonRpcResponse, MessageSink, RequestOptions,
};
use crate::lock::{lock, read, write};
use crate::mcp::McpProtocol;
use crate::transport::{ConnectionInfo, HandlerId, Transport, TransportEvent};
use crate::types::{ProtocolMessage, SessionId, TransportMessage};
use async_trait::async_trait;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::VecDeque;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;

/// Metadata key carrying the session id on every transport envelope
const SESSION_METADATA_KEY: &str = "sessionId";

/// Events emitted by a [`ProtocolClient`]
#[derive(Debug, Clone)]
pub enum ClientEvent {
    Connected {
        info: ConnectionInfo,
    },
    Disconnected {
        reason: String,
        will_reconnect: bool,
    },
    Error {
        message: String,
    },
    /// A message was parked in the offline queue
    MessageQueued {
        id: String,
        queued: usize,
    },
    /// A queued message was evicted or failed to flush
    MessageDropped {
        id: String,
        reason: String,
    },
}

struct ClientInner {
    engine: Arc<JsonRpcProtocol>,
    transport: Transport,
    config: ClientConfig,
    session_id: SessionId,
    connected: AtomicBool,
    ever_connected: AtomicBool,
    queue: Mutex<VecDeque<TransportMessage<Value>>>,
    events: RwLock<Option<broadcast::Sender<ClientEvent>>>,
    handler_id: Mutex<Option<HandlerId>>,
    listener: Mutex<Option<JoinHandle<()>>>,
    /// Inbound queue receiver, taken when the dispatcher starts
    inbound: Mutex<Option<mpsc::UnboundedReceiver<TransportMessage<Value>>>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Engine sink writing through the client
struct ClientSink {
    inner: Weak<ClientInner>,
}

#[async_trait]
impl MessageSink for ClientSink {
    async fn send_message(&self, payload: JsonRpcPayload) -> Result<()> {
        let inner = self.inner.upgrade().ok_or(BridgeError::NotConnected)?;
        inner.send_outgoing(payload).await
    }
}

/// A protocol engine wired to a transport
#[derive(Clone)]
pub struct ProtocolClient {
    inner: Arc<ClientInner>,
}

impl ProtocolClient {
    pub fn builder(transport: Transport) -> ProtocolClientBuilder {
        ProtocolClientBuilder::new(transport)
    }

    /// Wire `engine` to `transport`.
    ///
    /// Installs the client as the engine's sink and registers an inbound
    /// handler on the transport; neither is owned by the client.
    ///
    /// A single dispatcher task starts inbound messages in arrival order. Each
    /// runs until it first suspends before the next one starts; the remainder
    /// finishes on its own task.
    pub fn new(engine: Arc<JsonRpcProtocol>, transport: Transport, config: ClientConfig) -> Self {
        let session_id = config
            .session_id
            .clone()
            .map(SessionId::from)
            .unwrap_or_default();
        let (events, _) = broadcast::channel(64);
        let already_connected = transport.is_connected();
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(ClientInner {
            engine,
            transport,
            config,
            session_id,
            connected: AtomicBool::new(already_connected),
            ever_connected: AtomicBool::new(already_connected),
            queue: Mutex::new(VecDeque::new()),
            events: RwLock::new(Some(events)),
            handler_id: Mutex::new(None),
            listener: Mutex::new(None),
            inbound: Mutex::new(Some(inbound_rx)),
            dispatcher: Mutex::new(None),
        });

        inner.engine.set_sink(Arc::new(ClientSink {
            inner: Arc::downgrade(&inner),
        }));

        let weak = Arc::downgrade(&inner);
        let handler_id = inner.transport.on_message(move |message| {
            if let Some(inner) = weak.upgrade() {
                inner.ensure_dispatcher();
                let _ = inbound_tx.send(message);
            }
        });
        *lock(&inner.handler_id) = Some(handler_id);

        tracing::debug!(
            session = %inner.session_id,
            endpoint = %inner.transport.connection_string(),
            "Protocol client created"
        );
        Self { inner }
    }

    pub fn engine(&self) -> &Arc<JsonRpcProtocol> {
        &self.inner.engine
    }

    pub fn transport(&self) -> &Transport {
        &self.inner.transport
    }

    pub fn session_id(&self) -> &SessionId {
        &self.inner.session_id
    }

    pub fn config(&self) -> &ClientConfig {
        &self.inner.config
    }

    /// Whether the last transport event observed was `connected`
    pub fn is_connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    /// Number of messages waiting in the offline queue
    pub fn queued_messages(&self) -> usize {
        lock(&self.inner.queue).len()
    }

    /// Connect the transport and start following its events
    pub async fn connect(&self) -> Result<()> {
        self.ensure_listener();
        self.inner.transport.connect().await?;
        self.inner.connected.store(true, Ordering::SeqCst);
        self.inner.ever_connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.inner.transport.disconnect().await
    }

    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.ensure_connected_once()?;
        self.inner.engine.request(method, params).await
    }

    pub async fn request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        self.ensure_connected_once()?;
        self.inner.engine.request_as(method, params).await
    }

    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value> {
        self.ensure_connected_once()?;
        self.inner.engine.request_with(method, params, opts).await
    }

    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        self.ensure_connected_once()?;
        self.inner.engine.notify(method, params).await
    }

    pub async fn batch(&self, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        self.ensure_connected_once()?;
        self.inner.engine.batch(entries).await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ClientEvent> {
        match read(&self.inner.events).as_ref() {
            Some(events) => events.subscribe(),
            None => broadcast::channel(1).1,
        }
    }

    pub fn events(&self) -> BroadcastStream<ClientEvent> {
        BroadcastStream::new(self.subscribe())
    }

    /// Disconnect, detach from transport and engine, and drop queued messages
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if let Err(e) = inner.transport.disconnect().await {
            tracing::debug!(error = %e, "Error while disconnecting destroyed client");
        }

        let handler_id = lock(&inner.handler_id).take();
        if let Some(id) = handler_id {
            inner.transport.remove_message_handler(id);
        }
        let listener = lock(&inner.listener).take();
        if let Some(listener) = listener {
            listener.abort();
        }
        let dispatcher = lock(&inner.dispatcher).take();
        if let Some(dispatcher) = dispatcher {
            dispatcher.abort();
        }
        lock(&inner.inbound).take();

        inner.engine.clear_sink();
        inner.engine.clear();
        lock(&inner.queue).clear();
        inner.connected.store(false, Ordering::SeqCst);
        *write(&inner.events) = None;
        tracing::debug!(session = %inner.session_id, "Protocol client destroyed");
    }

    fn ensure_connected_once(&self) -> Result<()> {
        if self.inner.ever_connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::NotConnected)
        }
    }

    fn ensure_listener(&self) {
        self.inner.ensure_dispatcher();
        let mut listener = lock(&self.inner.listener);
        if listener.is_none() {
            let events = self.inner.transport.subscribe();
            *listener = Some(tokio::spawn(listen(Arc::downgrade(&self.inner), events)));
        }
    }
}

impl ClientInner {
    /// Start the inbound dispatcher on first use
    fn ensure_dispatcher(self: &Arc<Self>) {
        let inbound = lock(&self.inbound).take();
        if let Some(inbound) = inbound {
            let task = tokio::spawn(dispatch_inbound(Arc::downgrade(self), inbound));
            *lock(&self.dispatcher) = Some(task);
        }
    }

    fn emit(&self, event: ClientEvent) {
        if let Some(events) = read(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn wrap(&self, payload: &JsonRpcPayload) -> Result<TransportMessage<Value>> {
        let envelope = ProtocolMessage::new(
            self.session_id.clone(),
            self.config.envelope_version.clone(),
            payload.to_value()?,
        );
        Ok(TransportMessage::new(serde_json::to_value(envelope)?).with_metadata(
            SESSION_METADATA_KEY,
            Value::String(self.session_id.to_string()),
        ))
    }

    async fn send_outgoing(&self, payload: JsonRpcPayload) -> Result<()> {
        let message = self.wrap(&payload)?;

        if !self.transport.is_connected() {
            if self.config.queueing_enabled() {
                self.enqueue(message);
                return Ok(());
            }
            return Err(BridgeError::NotConnected);
        }

        match self.transport.send(message.clone()).await {
            Ok(()) => Ok(()),
            Err(e) => {
                if self.config.queueing_enabled() && e.is_retryable() {
                    self.enqueue(message);
                }
                Err(e)
            }
        }
    }

    /// Park a message, evicting the oldest entry when full
    fn enqueue(&self, message: TransportMessage<Value>) {
        let id = message.id.clone();
        let (evicted, queued) = {
            let mut queue = lock(&self.queue);
            let evicted = if queue.len() >= self.config.message_queue_size {
                queue.pop_front()
            } else {
                None
            };
            queue.push_back(message);
            (evicted, queue.len())
        };

        if let Some(evicted) = evicted {
            tracing::warn!(id = %evicted.id, "Offline queue full, dropping oldest message");
            self.emit(ClientEvent::MessageDropped {
                id: evicted.id,
                reason: "offline queue full".to_string(),
            });
        }
        tracing::debug!(id = %id, queued, "Message queued while offline");
        self.emit(ClientEvent::MessageQueued { id, queued });
    }

    /// Send every queued message in order; failures are logged and dropped
    async fn flush_queue(&self) {
        let drained: Vec<TransportMessage<Value>> = lock(&self.queue).drain(..).collect();
        if drained.is_empty() {
            return;
        }
        tracing::info!(count = drained.len(), "Flushing offline queue");

        for message in drained {
            let id = message.id.clone();
            if let Err(e) = self.transport.send(message).await {
                tracing::warn!(id = %id, error = %e, "Failed to flush queued message");
                self.emit(ClientEvent::MessageDropped {
                    id,
                    reason: e.to_string(),
                });
            }
        }
    }

    async fn handle_incoming(self: Arc<Self>, message: TransportMessage<Value>) {
        let raw = message.payload;
        let inner_id = raw.get("payload").and_then(extract_id);

        let envelope = match serde_json::from_value::<ProtocolMessage<Value>>(raw) {
            Ok(envelope) if !envelope.payload.is_null() => envelope,
            Ok(_) => {
                tracing::warn!(id = %message.id, "Protocol envelope has no payload");
                self.reply_parse_error(inner_id, "missing payload").await;
                return;
            }
            Err(e) => {
                tracing::warn!(id = %message.id, error = %e, "Failed to unwrap protocol envelope");
                self.reply_parse_error(inner_id, &e.to_string()).await;
                return;
            }
        };

        let engine = self.engine.clone();
        let dispatched = AssertUnwindSafe(engine.handle_message(envelope.payload))
            .catch_unwind()
            .await;
        if dispatched.is_err() {
            tracing::error!(id = %envelope.id, "Protocol engine panicked handling message");
            self.reply_parse_error(inner_id, "message handling failed").await;
        }
    }

    async fn reply_parse_error(&self, id: Option<JsonRpcId>, detail: &str) {
        // Only requests can be answered
        let Some(id) = id else {
            return;
        };
        let response = JsonRpcResponse::error(
            Some(id),
            JsonRpcErrorObject::with_data(
                codes::PARSE_ERROR,
                "Parse error",
                Value::String(detail.to_string()),
            ),
        );
        if let Err(e) = self
            .send_outgoing(JsonRpcPayload::Single(JsonRpcMessage::Response(response)))
            .await
        {
            tracing::warn!(error = %e, "Failed to send parse error response");
        }
    }

    async fn on_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Connected { info } => {
                self.connected.store(true, Ordering::SeqCst);
                self.ever_connected.store(true, Ordering::SeqCst);
                self.emit(ClientEvent::Connected { info });
                self.flush_queue().await;
            }
            TransportEvent::Disconnected {
                reason,
                will_reconnect,
            } => {
                self.connected.store(false, Ordering::SeqCst);
                self.emit(ClientEvent::Disconnected {
                    reason,
                    will_reconnect,
                });
            }
            TransportEvent::Error { message } => {
                self.connected.store(self.transport.is_connected(), Ordering::SeqCst);
                self.emit(ClientEvent::Error { message });
            }
            TransportEvent::ReconnectFailed { attempts } => {
                self.connected.store(false, Ordering::SeqCst);
                self.emit(ClientEvent::Error {
                    message: format!("reconnect failed after {} attempts", attempts),
                });
            }
            TransportEvent::StateChanged { .. } | TransportEvent::Reconnecting { .. } => {}
        }
    }
}

/// Feed inbound envelopes to the engine in arrival order
async fn dispatch_inbound(
    weak: Weak<ClientInner>,
    mut inbound: mpsc::UnboundedReceiver<TransportMessage<Value>>,
) {
    while let Some(message) = inbound.recv().await {
        let Some(inner) = weak.upgrade() else {
            return;
        };
        let mut handling = Box::pin(inner.handle_incoming(message));
        // Synchronous work completes here; a suspended handler must not stall the queue
        if futures::poll!(handling.as_mut()).is_pending() {
            tokio::spawn(handling);
        }
    }
}

async fn listen(weak: Weak<ClientInner>, mut events: broadcast::Receiver<TransportEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::warn!(skipped, "Client fell behind transport events");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        inner.on_transport_event(event).await;
    }
}

/// Builder for [`ProtocolClient`]
pub struct ProtocolClientBuilder {
    transport: Transport,
    engine: Option<Arc<JsonRpcProtocol>>,
    config: ClientConfig,
}

impl ProtocolClientBuilder {
    pub fn new(transport: Transport) -> Self {
        Self {
            transport,
            engine: None,
            config: ClientConfig::default(),
        }
    }

    /// Use an existing engine instead of a fresh default one
    pub fn engine(mut self, engine: Arc<JsonRpcProtocol>) -> Self {
        self.engine = Some(engine);
        self
    }

    /// Drive an MCP server's engine
    pub fn mcp(self, mcp: &McpProtocol) -> Self {
        self.engine(mcp.engine().clone())
    }

    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = config;
        self
    }

    pub fn auto_reconnect(mut self, enabled: bool) -> Self {
        self.config.auto_reconnect = enabled;
        self
    }

    pub fn message_queue_size(mut self, size: usize) -> Self {
        self.config.message_queue_size = size;
        self
    }

    pub fn session_id(mut self, session_id: impl Into<String>) -> Self {
        self.config.session_id = Some(session_id.into());
        self
    }

    pub fn build(self) -> Result<ProtocolClient> {
        let engine = match self.engine {
            Some(engine) => engine,
            None => {
                let config = ProtocolConfig::default();
                config.validate()?;
                Arc::new(JsonRpcProtocol::new(config))
            }
        };
        Ok(ProtocolClient::new(engine, self.transport, self.config))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::TransportConfig;
    use crate::transport::MemoryConnector;
    use serde_json::json;
    use std::time::Duration;

    fn transport(connector: MemoryConnector) -> Transport {
        Transport::new(
            connector,
            TransportConfig {
                keep_alive: false,
                reconnect_delay_ms: 10,
                ..Default::default()
            },
        )
        .unwrap()
    }

    fn envelopes(connector: &MemoryConnector) -> Vec<Value> {
        connector
            .sent()
            .iter()
            .map(|raw| serde_json::from_str::<Value>(raw).unwrap())
            .collect()
    }

    #[tokio::test]
    async fn test_request_before_connect_fails_fast() {
        let client = ProtocolClient::builder(transport(MemoryConnector::new("memory://x")))
            .build()
            .unwrap();
        assert!(matches!(
            client.request("ping", None).await,
            Err(BridgeError::NotConnected)
        ));
        assert!(matches!(
            client.notify("ping", None).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_outgoing_envelope_shape() {
        let connector = MemoryConnector::new("memory://x");
        let client = ProtocolClient::builder(transport(connector.clone()))
            .session_id("session-fixed")
            .build()
            .unwrap();
        client.connect().await.unwrap();
        client.notify("log", Some(json!({"line": 1}))).await.unwrap();

        let sent = envelopes(&connector);
        assert_eq!(sent.len(), 1);
        let envelope = &sent[0];
        assert!(envelope["id"].as_str().unwrap().starts_with("msg-"));
        assert_eq!(envelope["metadata"]["sessionId"], "session-fixed");
        assert_eq!(envelope["payload"]["sessionId"], "session-fixed");
        assert_eq!(envelope["payload"]["version"], "1.0");
        assert_eq!(envelope["payload"]["payload"]["method"], "log");
        assert_eq!(envelope["payload"]["payload"]["jsonrpc"], "2.0");
    }

    #[tokio::test]
    async fn test_malformed_envelope_gets_parse_error() {
        let connector = MemoryConnector::new("memory://x");
        let client = ProtocolClient::builder(transport(connector.clone()))
            .build()
            .unwrap();
        client.connect().await.unwrap();

        // Envelope without sessionId/version but with an identifiable request
        let bad = TransportMessage::new(json!({
            "payload": {"jsonrpc": "2.0", "id": 7, "method": "ping"}
        }));
        connector.inject(serde_json::to_string(&bad).unwrap());
        tokio::time::sleep(Duration::from_millis(50)).await;

        let sent = envelopes(&connector);
        assert_eq!(sent.len(), 1);
        let response = &sent[0]["payload"]["payload"];
        assert_eq!(response["id"], 7);
        assert_eq!(response["error"]["code"], -32700);
    }

    #[tokio::test]
    async fn test_queue_evicts_oldest() {
        let connector = MemoryConnector::new("memory://x");
        let transport = transport(connector.clone());
        let client = ProtocolClient::builder(transport.clone())
            .message_queue_size(2)
            .build()
            .unwrap();
        client.connect().await.unwrap();
        transport.disconnect().await.unwrap();

        let mut events = client.subscribe();
        for n in 0..3 {
            client.notify("tick", Some(json!(n))).await.unwrap();
        }
        assert_eq!(client.queued_messages(), 2);

        let mut dropped = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, ClientEvent::MessageDropped { .. }) {
                dropped += 1;
            }
        }
        assert_eq!(dropped, 1);
    }

    #[tokio::test]
    async fn test_offline_without_queueing_fails() {
        let connector = MemoryConnector::new("memory://x");
        let transport = transport(connector);
        let client = ProtocolClient::builder(transport.clone())
            .auto_reconnect(false)
            .build()
            .unwrap();
        client.connect().await.unwrap();
        transport.disconnect().await.unwrap();
        assert!(matches!(
            client.notify("tick", None).await,
            Err(BridgeError::NotConnected)
        ));
        assert_eq!(client.queued_messages(), 0);
    }

    #[tokio::test]
    async fn test_destroy_clears_engine() {
        let connector = MemoryConnector::new("memory://x");
        let client = ProtocolClient::builder(transport(connector))
            .build()
            .unwrap();
        client
            .engine()
            .register_handler("ping", |_, _| async { Ok(json!("pong")) })
            .unwrap();
        client.connect().await.unwrap();
        client.destroy().await;

        assert!(!client.engine().has_handler("ping"));
        assert!(!client.transport().is_connected());
        assert!(client.subscribe().recv().await.is_err());
    }
}
