//! JSON-RPC 2.0 protocol engine
//!
//! Framing, request/response correlation, dispatch and statistics over an
//! abstract [`MessageSink`]. The engine never touches the network itself:
//! whoever embeds it (directly, or through `ProtocolClient`) installs a sink
//! and feeds inbound values to [`JsonRpcProtocol::handle_message`].
//!
//! Every outbound request owns exactly one pending entry. Whichever of
//! {response, explicit cancel, abort signal, timeout} removes that entry
//! from the pending table first decides the outcome; later causes find the
//! entry gone and have no effect.

use super::message::{
    JsonRpcErrorObject, JsonRpcId, JsonRpcMessage, JsonRpcNotification, JsonRpcPayload,
    JsonRpcRequest, JsonRpcResponse,
};
use super::middleware::{Middleware, Next};
use crate::config::ProtocolConfig;
use crate::error::{BridgeError, Result};
use crate::lock::{lock, read, write};
use crate::types::Timestamp;
use async_trait::async_trait;
use futures::future::{join_all, BoxFuture};
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::str::FromStr;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::{broadcast, oneshot};
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;

/// Boxed future returned by request handlers
pub type HandlerFuture = BoxFuture<'static, Result<Value>>;

/// Type-erased request handler
pub type RequestHandler = Arc<dyn Fn(Option<Value>, RequestContext) -> HandlerFuture + Send + Sync>;

/// Type-erased notification handler
pub type NotificationHandler =
    Arc<dyn Fn(Option<Value>) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// Custom mapping from handler errors to wire error objects
pub type ErrorTransformer = Arc<dyn Fn(&BridgeError) -> JsonRpcErrorObject + Send + Sync>;

/// Outbound hook the engine writes every message through
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn send_message(&self, payload: JsonRpcPayload) -> Result<()>;
}

/// Context handed to request handlers and middleware
#[derive(Debug, Clone)]
pub struct RequestContext {
    pub id: JsonRpcId,
    pub method: String,
    pub received_at: Timestamp,
}

/// Per-call overrides for [`JsonRpcProtocol::request_with`]
#[derive(Debug, Clone, Default)]
pub struct RequestOptions {
    /// Overrides the protocol-level `requestTimeout`
    pub timeout: Option<Duration>,

    /// Cancelling the token settles the request as cancelled
    pub signal: Option<CancellationToken>,
}

impl RequestOptions {
    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            timeout: Some(timeout),
            signal: None,
        }
    }

    pub fn with_signal(signal: CancellationToken) -> Self {
        Self {
            timeout: None,
            signal: Some(signal),
        }
    }
}

/// One entry of an outbound batch
#[derive(Debug, Clone)]
pub struct BatchEntry {
    pub method: String,
    pub params: Option<Value>,
    pub is_notification: bool,
}

impl BatchEntry {
    pub fn request(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            is_notification: false,
        }
    }

    pub fn notification(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            method: method.into(),
            params,
            is_notification: true,
        }
    }
}

/// Settled outcome of one batch slot
#[derive(Debug)]
pub enum BatchOutcome {
    /// The request resolved with a result
    Result(Value),
    /// Notification slot; nothing to wait for
    Notification,
    /// The request was rejected, timed out or cancelled
    Error(BridgeError),
}

impl BatchOutcome {
    /// Access the slot, surfacing a rejection as `Err`
    pub fn into_result(self) -> Result<Option<Value>> {
        match self {
            Self::Result(value) => Ok(Some(value)),
            Self::Notification => Ok(None),
            Self::Error(err) => Err(err),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, Self::Error(_))
    }
}

/// Events emitted by the engine
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    RequestCancelled {
        id: JsonRpcId,
        method: String,
        reason: String,
    },
    RequestTimedOut {
        id: JsonRpcId,
        method: String,
        timeout_ms: u64,
    },
    Error {
        message: String,
    },
}

/// MCP log levels (RFC 5424 severities)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    #[default]
    Info,
    Notice,
    Warning,
    Error,
    Critical,
    Alert,
    Emergency,
}

impl FromStr for LogLevel {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "notice" => Ok(Self::Notice),
            "warning" => Ok(Self::Warning),
            "error" => Ok(Self::Error),
            "critical" => Ok(Self::Critical),
            "alert" => Ok(Self::Alert),
            "emergency" => Ok(Self::Emergency),
            other => Err(BridgeError::InvalidParams(format!(
                "Unknown log level '{}'",
                other
            ))),
        }
    }
}

/// Snapshot of engine counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProtocolStats {
    pub requests_sent: u64,
    pub requests_received: u64,
    pub responses_sent: u64,
    pub responses_received: u64,
    pub notifications_sent: u64,
    pub notifications_received: u64,
    pub errors: u64,
    pub pending_requests: usize,
}

#[derive(Default)]
struct Counters {
    requests_sent: AtomicU64,
    requests_received: AtomicU64,
    responses_sent: AtomicU64,
    responses_received: AtomicU64,
    notifications_sent: AtomicU64,
    notifications_received: AtomicU64,
    errors: AtomicU64,
}

impl Counters {
    fn bump(counter: &AtomicU64, n: u64) {
        counter.fetch_add(n, Ordering::Relaxed);
    }
}

/// Bookkeeping for one in-flight outbound request
struct PendingRequest {
    method: String,
    sent_at: Timestamp,
    settle: oneshot::Sender<Result<Value>>,
}

/// Removes a pending entry if the awaiting future goes away unsettled
struct PendingGuard<'a> {
    engine: &'a JsonRpcProtocol,
    id: JsonRpcId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.engine.take_pending(&self.id);
    }
}

enum Wake {
    Settled(Result<Value>),
    TimedOut,
    Aborted,
}

/// JSON-RPC 2.0 protocol engine
pub struct JsonRpcProtocol {
    config: ProtocolConfig,
    handlers: RwLock<HashMap<String, RequestHandler>>,
    notification_handlers: RwLock<HashMap<String, NotificationHandler>>,
    pending: Mutex<HashMap<JsonRpcId, PendingRequest>>,
    middleware: RwLock<Vec<Arc<dyn Middleware>>>,
    sink: RwLock<Option<Arc<dyn MessageSink>>>,
    error_transformer: RwLock<Option<ErrorTransformer>>,
    log_level: RwLock<LogLevel>,
    next_id: AtomicI64,
    counters: Counters,
    events: broadcast::Sender<ProtocolEvent>,
}

impl JsonRpcProtocol {
    /// Create an engine with no sink installed
    pub fn new(config: ProtocolConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            config,
            handlers: RwLock::new(HashMap::new()),
            notification_handlers: RwLock::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            middleware: RwLock::new(Vec::new()),
            sink: RwLock::new(None),
            error_transformer: RwLock::new(None),
            log_level: RwLock::new(LogLevel::default()),
            next_id: AtomicI64::new(1),
            counters: Counters::default(),
            events,
        }
    }

    pub fn config(&self) -> &ProtocolConfig {
        &self.config
    }

    /// Install the outbound hook
    pub fn set_sink(&self, sink: Arc<dyn MessageSink>) {
        *write(&self.sink) = Some(sink);
    }

    /// Remove the outbound hook; later sends fail with `NotConnected`
    pub fn clear_sink(&self) {
        *write(&self.sink) = None;
    }

    /// Install a custom handler-error → wire-error mapping
    pub fn set_error_transformer<F>(&self, transformer: F)
    where
        F: Fn(&BridgeError) -> JsonRpcErrorObject + Send + Sync + 'static,
    {
        *write(&self.error_transformer) = Some(Arc::new(transformer));
    }

    pub fn set_log_level(&self, level: LogLevel) {
        *write(&self.log_level) = level;
        tracing::info!(level = ?level, "Protocol log level updated");
    }

    pub fn log_level(&self) -> LogLevel {
        *read(&self.log_level)
    }

    fn traffic_traced(&self) -> bool {
        self.config.debug || self.log_level() == LogLevel::Debug
    }

    // ------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------

    /// Register a request handler; fails if the method already has one
    pub fn register_handler<F, Fut>(&self, method: impl Into<String>, handler: F) -> Result<()>
    where
        F: Fn(Option<Value>, RequestContext) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value>> + Send + 'static,
    {
        let method = method.into();
        let mut handlers = write(&self.handlers);
        if handlers.contains_key(&method) {
            return Err(BridgeError::DuplicateRegistration(method));
        }
        let handler: RequestHandler = Arc::new(move |params, ctx| handler(params, ctx).boxed());
        handlers.insert(method, handler);
        Ok(())
    }

    /// Register a notification handler; fails if the method already has one
    pub fn register_notification_handler<F, Fut>(
        &self,
        method: impl Into<String>,
        handler: F,
    ) -> Result<()>
    where
        F: Fn(Option<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let method = method.into();
        let mut handlers = write(&self.notification_handlers);
        if handlers.contains_key(&method) {
            return Err(BridgeError::DuplicateRegistration(method));
        }
        let handler: NotificationHandler = Arc::new(move |params| handler(params).boxed());
        handlers.insert(method, handler);
        Ok(())
    }

    /// Remove a request handler, returning whether one was registered
    pub fn unregister_handler(&self, method: &str) -> bool {
        write(&self.handlers).remove(method).is_some()
    }

    /// Remove a notification handler, returning whether one was registered
    pub fn unregister_notification_handler(&self, method: &str) -> bool {
        write(&self.notification_handlers).remove(method).is_some()
    }

    pub fn has_handler(&self, method: &str) -> bool {
        read(&self.handlers).contains_key(method)
    }

    pub fn has_notification_handler(&self, method: &str) -> bool {
        read(&self.notification_handlers).contains_key(method)
    }

    /// Append a middleware layer; layers run in registration order
    pub fn use_middleware(&self, middleware: impl Middleware + 'static) {
        tracing::debug!(middleware = middleware.name(), "Middleware registered");
        write(&self.middleware).push(Arc::new(middleware));
    }

    // ------------------------------------------------------------------
    // Outbound
    // ------------------------------------------------------------------

    /// Send a request and wait for its response
    pub async fn request(&self, method: &str, params: Option<Value>) -> Result<Value> {
        self.request_with(method, params, RequestOptions::default())
            .await
    }

    /// Send a request and deserialize its result
    pub async fn request_as<R: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<R> {
        let value = self.request(method, params).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Send a request with a per-call timeout and/or abort signal
    pub async fn request_with(
        &self,
        method: &str,
        params: Option<Value>,
        opts: RequestOptions,
    ) -> Result<Value> {
        let id = self.next_request_id();
        let timeout = opts.timeout.unwrap_or_else(|| self.config.request_timeout());
        let settled = self.register_pending(id.clone(), method);
        let _guard = PendingGuard {
            engine: self,
            id: id.clone(),
        };

        Counters::bump(&self.counters.requests_sent, 1);
        let request = JsonRpcRequest::new(id.clone(), method, params);
        if let Err(e) = self
            .send_payload(JsonRpcMessage::Request(request).into())
            .await
        {
            Counters::bump(&self.counters.errors, 1);
            tracing::warn!(id = %id, method, error = %e, "Failed to send request");
            return Err(e);
        }

        let outcome = self
            .await_settlement(&id, method, settled, timeout, opts.signal)
            .await;
        if outcome.is_err() {
            Counters::bump(&self.counters.errors, 1);
        }
        outcome
    }

    /// Send a notification; no response is ever expected
    pub async fn notify(&self, method: &str, params: Option<Value>) -> Result<()> {
        let notification = JsonRpcNotification::new(method, params);
        self.send_payload(JsonRpcMessage::Notification(notification).into())
            .await?;
        Counters::bump(&self.counters.notifications_sent, 1);
        Ok(())
    }

    /// Send several requests/notifications as one array.
    ///
    /// Resolves once every request slot has settled; each slot settles
    /// independently, and notification slots are [`BatchOutcome::Notification`].
    pub async fn batch(&self, entries: Vec<BatchEntry>) -> Result<Vec<BatchOutcome>> {
        if !self.config.batching {
            return Err(BridgeError::BatchingDisabled);
        }
        if entries.len() > self.config.max_batch_size {
            return Err(BridgeError::BatchTooLarge {
                size: entries.len(),
                max: self.config.max_batch_size,
            });
        }
        if entries.is_empty() {
            return Ok(Vec::new());
        }

        let timeout = self.config.request_timeout();
        let mut messages = Vec::with_capacity(entries.len());
        let mut slots = Vec::with_capacity(entries.len());
        let mut guards = Vec::new();
        let mut request_count = 0u64;

        for entry in entries {
            if entry.is_notification {
                messages.push(JsonRpcMessage::Notification(JsonRpcNotification::new(
                    entry.method,
                    entry.params,
                )));
                slots.push(None);
            } else {
                let id = self.next_request_id();
                let settled = self.register_pending(id.clone(), &entry.method);
                guards.push(PendingGuard {
                    engine: self,
                    id: id.clone(),
                });
                messages.push(JsonRpcMessage::Request(JsonRpcRequest::new(
                    id.clone(),
                    entry.method.clone(),
                    entry.params,
                )));
                slots.push(Some((id, entry.method, settled)));
                request_count += 1;
            }
        }

        let notification_count = messages.len() as u64 - request_count;
        if let Err(e) = self.send_payload(JsonRpcPayload::Batch(messages)).await {
            Counters::bump(&self.counters.errors, 1);
            tracing::warn!(error = %e, "Failed to send batch");
            return Err(e);
        }
        Counters::bump(&self.counters.requests_sent, request_count);
        Counters::bump(&self.counters.notifications_sent, notification_count);

        let waits = slots.into_iter().map(|slot| async move {
            match slot {
                None => BatchOutcome::Notification,
                Some((id, method, settled)) => {
                    match self
                        .await_settlement(&id, &method, settled, timeout, None)
                        .await
                    {
                        Ok(value) => BatchOutcome::Result(value),
                        Err(e) => {
                            Counters::bump(&self.counters.errors, 1);
                            BatchOutcome::Error(e)
                        }
                    }
                }
            }
        });
        let outcomes = join_all(waits).await;
        drop(guards);
        Ok(outcomes)
    }

    /// Cancel a pending request locally.
    ///
    /// Returns `false` (and does nothing) if no such request is pending or
    /// cancellation is disabled. The remote peer is not informed.
    pub fn cancel_request(&self, id: &JsonRpcId) -> bool {
        if !self.config.cancellation {
            tracing::debug!(id = %id, "Cancellation disabled, ignoring cancel");
            return false;
        }
        match self.take_pending(id) {
            Some(pending) => {
                tracing::debug!(id = %id, method = %pending.method, "Request cancelled");
                self.emit(ProtocolEvent::RequestCancelled {
                    id: id.clone(),
                    method: pending.method,
                    reason: "cancelled".to_string(),
                });
                let _ = pending.settle.send(Err(BridgeError::Cancelled {
                    id: id.to_string(),
                    reason: "cancelled".to_string(),
                }));
                true
            }
            None => false,
        }
    }

    /// Reject every pending request and drop all handlers
    pub fn clear(&self) {
        let drained: Vec<(JsonRpcId, PendingRequest)> = lock(&self.pending).drain().collect();
        for (id, pending) in drained {
            self.emit(ProtocolEvent::RequestCancelled {
                id: id.clone(),
                method: pending.method,
                reason: "protocol cleared".to_string(),
            });
            let _ = pending.settle.send(Err(BridgeError::Cancelled {
                id: id.to_string(),
                reason: "protocol cleared".to_string(),
            }));
        }
        write(&self.handlers).clear();
        write(&self.notification_handlers).clear();
        tracing::debug!("Protocol handlers and pending requests cleared");
    }

    // ------------------------------------------------------------------
    // Inbound
    // ------------------------------------------------------------------

    /// Dispatch an inbound message or batch.
    ///
    /// Never fails: errors are counted, logged and, for identifiable
    /// requests, answered with an error response.
    pub async fn handle_message(&self, message: Value) {
        if self.traffic_traced() {
            tracing::debug!(message = %message, "Inbound JSON-RPC message");
        }

        match message {
            Value::Array(items) => self.handle_batch(items).await,
            single => {
                if let Some(response) = self.handle_single(single).await {
                    self.send_responses(JsonRpcPayload::Single(JsonRpcMessage::Response(
                        response,
                    )))
                    .await;
                }
            }
        }
    }

    async fn handle_batch(&self, items: Vec<Value>) {
        if items.is_empty() {
            Counters::bump(&self.counters.errors, 1);
            tracing::warn!("Received empty batch");
            let response = JsonRpcResponse::error(
                None,
                BridgeError::InvalidRequest("empty batch".to_string()).to_error_object(),
            );
            self.send_responses(JsonRpcPayload::Single(JsonRpcMessage::Response(response)))
                .await;
            return;
        }

        let responses: Vec<JsonRpcMessage> = join_all(items.into_iter().map(|item| self.handle_single(item)))
            .await
            .into_iter()
            .flatten()
            .map(JsonRpcMessage::Response)
            .collect();

        if !responses.is_empty() {
            self.send_responses(JsonRpcPayload::Batch(responses)).await;
        }
    }

    async fn handle_single(&self, value: Value) -> Option<JsonRpcResponse> {
        match JsonRpcMessage::parse(&value, self.config.strict_mode) {
            Ok(JsonRpcMessage::Request(request)) => self.handle_request(request).await,
            Ok(JsonRpcMessage::Notification(notification)) => {
                self.handle_notification(notification).await;
                None
            }
            Ok(JsonRpcMessage::Response(response)) => {
                self.handle_response(response);
                None
            }
            Err(invalid) => {
                Counters::bump(&self.counters.errors, 1);
                tracing::warn!(id = ?invalid.id, reason = %invalid.reason, "Invalid JSON-RPC message");
                self.emit(ProtocolEvent::Error {
                    message: invalid.reason.clone(),
                });
                invalid.id.map(|id| {
                    JsonRpcResponse::error(
                        Some(id),
                        BridgeError::InvalidRequest(invalid.reason).to_error_object(),
                    )
                })
            }
        }
    }

    async fn handle_request(&self, request: JsonRpcRequest) -> Option<JsonRpcResponse> {
        Counters::bump(&self.counters.requests_received, 1);

        let handler = read(&self.handlers).get(&request.method).cloned();
        let Some(handler) = handler else {
            if self.config.strict_mode {
                tracing::debug!(method = %request.method, "Method not found");
                return Some(JsonRpcResponse::error(
                    Some(request.id),
                    BridgeError::MethodNotFound(request.method).to_error_object(),
                ));
            }
            tracing::debug!(method = %request.method, "No handler, ignoring request");
            return None;
        };

        let id = request.id.clone();
        let ctx = RequestContext {
            id: id.clone(),
            method: request.method.clone(),
            received_at: Timestamp::now(),
        };
        let chain = read(&self.middleware).clone();

        let outcome = AssertUnwindSafe(Next::new(&chain, &handler).run(request, ctx))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| Err(BridgeError::Internal("request handler panicked".to_string())));

        match outcome {
            Ok(result) => Some(JsonRpcResponse::success(id, result)),
            Err(e) => {
                Counters::bump(&self.counters.errors, 1);
                tracing::debug!(id = %id, error = %e, "Request handler failed");
                Some(JsonRpcResponse::error(Some(id), self.transform_error(&e)))
            }
        }
    }

    async fn handle_notification(&self, notification: JsonRpcNotification) {
        Counters::bump(&self.counters.notifications_received, 1);

        let handler = read(&self.notification_handlers)
            .get(&notification.method)
            .cloned();
        let Some(handler) = handler else {
            if self.config.strict_mode {
                tracing::warn!(method = %notification.method, "No handler for notification");
            } else {
                tracing::debug!(method = %notification.method, "Ignoring unhandled notification");
            }
            return;
        };

        let outcome = AssertUnwindSafe(handler(notification.params))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(BridgeError::Internal(
                    "notification handler panicked".to_string(),
                ))
            });
        if let Err(e) = outcome {
            Counters::bump(&self.counters.errors, 1);
            tracing::warn!(method = %notification.method, error = %e, "Notification handler failed");
        }
    }

    fn handle_response(&self, response: JsonRpcResponse) {
        let Some(id) = response.id().cloned() else {
            Counters::bump(&self.counters.errors, 1);
            if let JsonRpcResponse::Error(e) = &response {
                tracing::warn!(
                    code = e.error.code,
                    message = %e.error.message,
                    "Received error response without id"
                );
            }
            return;
        };

        let Some(pending) = self.take_pending(&id) else {
            tracing::debug!(id = %id, "Dropping response for unknown or settled request");
            return;
        };

        Counters::bump(&self.counters.responses_received, 1);
        if self.traffic_traced() {
            tracing::debug!(
                id = %id,
                method = %pending.method,
                elapsed_ms = pending.sent_at.elapsed_millis(),
                "Response received"
            );
        }

        let outcome = match response {
            JsonRpcResponse::Success(success) => Ok(success.result),
            JsonRpcResponse::Error(error) => Err(BridgeError::Remote {
                code: error.error.code,
                message: error.error.message,
                data: error.error.data,
            }),
        };
        let _ = pending.settle.send(outcome);
    }

    // ------------------------------------------------------------------
    // Stats & events
    // ------------------------------------------------------------------

    /// Number of requests awaiting settlement
    pub fn pending_count(&self) -> usize {
        lock(&self.pending).len()
    }

    pub fn stats(&self) -> ProtocolStats {
        let c = &self.counters;
        ProtocolStats {
            requests_sent: c.requests_sent.load(Ordering::Relaxed),
            requests_received: c.requests_received.load(Ordering::Relaxed),
            responses_sent: c.responses_sent.load(Ordering::Relaxed),
            responses_received: c.responses_received.load(Ordering::Relaxed),
            notifications_sent: c.notifications_sent.load(Ordering::Relaxed),
            notifications_received: c.notifications_received.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            pending_requests: self.pending_count(),
        }
    }

    pub fn reset_stats(&self) {
        let c = &self.counters;
        for counter in [
            &c.requests_sent,
            &c.requests_received,
            &c.responses_sent,
            &c.responses_received,
            &c.notifications_sent,
            &c.notifications_received,
            &c.errors,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<ProtocolEvent> {
        self.events.subscribe()
    }

    /// Engine events as a stream
    pub fn events(&self) -> BroadcastStream<ProtocolEvent> {
        BroadcastStream::new(self.events.subscribe())
    }

    // ------------------------------------------------------------------
    // Internals
    // ------------------------------------------------------------------

    fn next_request_id(&self) -> JsonRpcId {
        JsonRpcId::Number(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    fn register_pending(&self, id: JsonRpcId, method: &str) -> oneshot::Receiver<Result<Value>> {
        let (settle, settled) = oneshot::channel();
        lock(&self.pending).insert(
            id,
            PendingRequest {
                method: method.to_string(),
                sent_at: Timestamp::now(),
                settle,
            },
        );
        settled
    }

    fn take_pending(&self, id: &JsonRpcId) -> Option<PendingRequest> {
        lock(&self.pending).remove(id)
    }

    async fn await_settlement(
        &self,
        id: &JsonRpcId,
        method: &str,
        mut settled: oneshot::Receiver<Result<Value>>,
        timeout: Duration,
        signal: Option<CancellationToken>,
    ) -> Result<Value> {
        let signal = signal.filter(|_| self.config.cancellation);
        let aborted = async {
            match &signal {
                Some(token) => token.cancelled().await,
                None => std::future::pending::<()>().await,
            }
        };

        let wake = tokio::select! {
            biased;
            outcome = &mut settled => Wake::Settled(outcome.unwrap_or_else(|_| {
                Err(BridgeError::Cancelled {
                    id: id.to_string(),
                    reason: "pending request dropped".to_string(),
                })
            })),
            _ = tokio::time::sleep(timeout) => Wake::TimedOut,
            _ = aborted => Wake::Aborted,
        };

        match wake {
            Wake::Settled(outcome) => outcome,
            Wake::TimedOut => {
                if self.take_pending(id).is_none() {
                    return Self::already_settled(id, settled).await;
                }
                let timeout_ms = timeout.as_millis() as u64;
                tracing::warn!(id = %id, method, timeout_ms, "Request timed out");
                self.emit(ProtocolEvent::RequestTimedOut {
                    id: id.clone(),
                    method: method.to_string(),
                    timeout_ms,
                });
                Err(BridgeError::Timeout {
                    method: method.to_string(),
                    timeout_ms,
                })
            }
            Wake::Aborted => {
                if self.take_pending(id).is_none() {
                    return Self::already_settled(id, settled).await;
                }
                tracing::debug!(id = %id, method, "Request aborted by caller");
                self.emit(ProtocolEvent::RequestCancelled {
                    id: id.clone(),
                    method: method.to_string(),
                    reason: "aborted".to_string(),
                });
                Err(BridgeError::Cancelled {
                    id: id.to_string(),
                    reason: "aborted".to_string(),
                })
            }
        }
    }

    /// Another cause claimed the entry between wake-up and removal
    async fn already_settled(
        id: &JsonRpcId,
        settled: oneshot::Receiver<Result<Value>>,
    ) -> Result<Value> {
        settled.await.unwrap_or_else(|_| {
            Err(BridgeError::Cancelled {
                id: id.to_string(),
                reason: "pending request dropped".to_string(),
            })
        })
    }

    async fn send_payload(&self, payload: JsonRpcPayload) -> Result<()> {
        let sink = read(&self.sink).clone().ok_or(BridgeError::NotConnected)?;
        if self.traffic_traced() {
            if let Ok(json) = serde_json::to_string(&payload) {
                tracing::debug!(payload = %json, "Outbound JSON-RPC payload");
            }
        }
        sink.send_message(payload).await
    }

    async fn send_responses(&self, payload: JsonRpcPayload) {
        let count = match &payload {
            JsonRpcPayload::Batch(items) => items.len() as u64,
            JsonRpcPayload::Single(_) => 1,
        };
        match self.send_payload(payload).await {
            Ok(()) => Counters::bump(&self.counters.responses_sent, count),
            Err(e) => {
                Counters::bump(&self.counters.errors, 1);
                tracing::error!(error = %e, "Failed to send response");
                self.emit(ProtocolEvent::Error {
                    message: format!("failed to send response: {}", e),
                });
            }
        }
    }

    fn transform_error(&self, error: &BridgeError) -> JsonRpcErrorObject {
        match read(&self.error_transformer).as_ref() {
            Some(transform) => transform(error),
            None => error.to_error_object(),
        }
    }

    fn emit(&self, event: ProtocolEvent) {
        let _ = self.events.send(event);
    }
}

impl Default for JsonRpcProtocol {
    fn default() -> Self {
        Self::new(ProtocolConfig::default())
    }
}
