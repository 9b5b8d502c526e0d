//! Connection state machine shared by every connector
//!
//! State transitions:
//!
//! ```text
//! disconnected ─connect()─▶ connecting ─ok─▶ connected ─disconnect()─▶ closing ─▶ closed
//!                                 └─err─▶ error       └─drop─▶ reconnecting ─ok─▶ connected
//!                                                                   └─exhausted─▶ disconnected
//! ```
//!
//! Each successful connect starts a new *generation*. Background tasks
//! (inbound pump, keep-alive) carry the generation they were started for
//! and stand down once it is no longer current, so a late event from a
//! previous connection can never disturb the current one.

use super::middleware::TransportMiddleware;
use super::{
    ConnectionInfo, ConnectionState, Connector, ConnectorEvent, HttpConnector,
    TransportCapabilities, TransportEvent, TransportStats, WebSocketConnector,
};
use crate::config::TransportConfig;
use crate::error::{BridgeError, Result};
use crate::lock::{lock, read, write};
use crate::types::{SessionId, Timestamp, TransportMessage};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde_json::Value;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_stream::wrappers::BroadcastStream;

/// Callback receiving every inbound envelope
pub type MessageHandler = Arc<dyn Fn(TransportMessage<Value>) + Send + Sync>;

/// Registration handle returned by [`Transport::on_message`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

#[derive(Default)]
struct Counters {
    messages_sent: AtomicU64,
    messages_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
    errors: AtomicU64,
    reconnect_attempts: AtomicU64,
    /// Epoch millis; zero means no activity yet
    last_activity: AtomicU64,
}

#[derive(Default)]
struct Tasks {
    pump: Option<JoinHandle<()>>,
    keep_alive: Option<JoinHandle<()>>,
    reconnect: Option<JoinHandle<()>>,
}

impl Tasks {
    fn abort_all(&mut self) {
        for handle in [
            self.pump.take(),
            self.keep_alive.take(),
            self.reconnect.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
    }
}

struct Inner {
    config: TransportConfig,
    connector: Box<dyn Connector>,
    state: watch::Sender<ConnectionState>,
    events: RwLock<Option<broadcast::Sender<TransportEvent>>>,
    handlers: RwLock<Vec<(HandlerId, MessageHandler)>>,
    middleware: RwLock<Vec<Arc<dyn TransportMiddleware>>>,
    next_handler_id: AtomicU64,
    counters: Counters,
    info: RwLock<Option<ConnectionInfo>>,
    generation: AtomicU64,
    explicit_close: AtomicBool,
    destroyed: AtomicBool,
    tasks: Mutex<Tasks>,
    /// Serializes connect/disconnect
    lifecycle: tokio::sync::Mutex<()>,
}

/// A connection with lifecycle management; cheap to clone
#[derive(Clone)]
pub struct Transport {
    inner: Arc<Inner>,
}

impl Transport {
    /// Wrap `connector`; fails with [`BridgeError::Config`] on an invalid config
    pub fn new(connector: impl Connector + 'static, config: TransportConfig) -> Result<Self> {
        config.validate()?;
        let (state, _) = watch::channel(ConnectionState::Disconnected);
        let (events, _) = broadcast::channel(64);
        Ok(Self {
            inner: Arc::new(Inner {
                config,
                connector: Box::new(connector),
                state,
                events: RwLock::new(Some(events)),
                handlers: RwLock::new(Vec::new()),
                middleware: RwLock::new(Vec::new()),
                next_handler_id: AtomicU64::new(1),
                counters: Counters::default(),
                info: RwLock::new(None),
                generation: AtomicU64::new(0),
                explicit_close: AtomicBool::new(false),
                destroyed: AtomicBool::new(false),
                tasks: Mutex::new(Tasks::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        })
    }

    /// WebSocket transport with default socket settings
    pub fn websocket(url: impl Into<String>, config: TransportConfig) -> Result<Self> {
        Self::new(WebSocketConnector::new(url), config)
    }

    /// HTTP transport posting every envelope to `endpoint`
    pub fn http(endpoint: impl Into<String>, config: TransportConfig) -> Result<Self> {
        Self::new(HttpConnector::new(endpoint)?, config)
    }

    pub fn config(&self) -> &TransportConfig {
        &self.inner.config
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch channel following every state change
    pub fn state_watch(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        read(&self.inner.info).clone()
    }

    pub fn connection_string(&self) -> String {
        self.inner.connector.connection_string()
    }

    pub fn capabilities(&self) -> TransportCapabilities {
        let mut caps = self.inner.connector.capabilities();
        caps.compression &= self.inner.config.compression;
        caps
    }

    /// Open the connection.
    ///
    /// A no-op (with a warning) when already connected. On failure the
    /// transport moves to [`ConnectionState::Error`] and the error is returned.
    pub async fn connect(&self) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_usable()?;
        let _lifecycle = inner.lifecycle.lock().await;

        if inner.state() == ConnectionState::Connected {
            tracing::warn!(
                endpoint = %inner.connector.connection_string(),
                "connect() called while already connected"
            );
            return Ok(());
        }

        inner.explicit_close.store(false, Ordering::SeqCst);
        inner.abort_reconnect();
        inner.set_state(ConnectionState::Connecting);

        match inner.establish().await {
            Ok(()) => Ok(()),
            Err(e) => {
                inner.bump_errors();
                inner.set_state(ConnectionState::Error);
                tracing::warn!(
                    endpoint = %inner.connector.connection_string(),
                    error = %e,
                    "Transport connect failed"
                );
                inner.emit(TransportEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.disconnect_with_reason("client disconnect").await
    }

    /// Close the connection; a no-op (with a warning) when not connected
    pub async fn disconnect_with_reason(&self, reason: &str) -> Result<()> {
        let inner = &self.inner;
        let _lifecycle = inner.lifecycle.lock().await;

        let state = inner.state();
        if !matches!(
            state,
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            tracing::warn!(state = %state, "disconnect() called while not connected");
            return Ok(());
        }

        inner.explicit_close.store(true, Ordering::SeqCst);
        inner.generation.fetch_add(1, Ordering::SeqCst);
        {
            let mut tasks = lock(&inner.tasks);
            for handle in [tasks.reconnect.take(), tasks.keep_alive.take()]
                .into_iter()
                .flatten()
            {
                handle.abort();
            }
        }
        inner.set_state(ConnectionState::Closing);

        let result = inner.connector.disconnect().await;
        if let Some(pump) = lock(&inner.tasks).pump.take() {
            pump.abort();
        }
        *write(&inner.info) = None;
        inner.set_state(ConnectionState::Closed);

        tracing::info!(reason, "Transport disconnected");
        inner.emit(TransportEvent::Disconnected {
            reason: reason.to_string(),
            will_reconnect: false,
        });

        if let Err(e) = &result {
            inner.bump_errors();
            tracing::warn!(error = %e, "Connector reported an error while closing");
        }
        result
    }

    /// Send one envelope.
    ///
    /// Fails with `NotConnected` unless connected and with `MessageTooLarge`
    /// before any middleware runs if the serialized envelope is too big.
    pub async fn send(&self, message: TransportMessage<Value>) -> Result<()> {
        let inner = &self.inner;
        inner.ensure_usable()?;
        if inner.state() != ConnectionState::Connected {
            return Err(BridgeError::NotConnected);
        }

        let mut data = serde_json::to_string(&message)?;
        let max = inner.config.max_message_size;
        if data.len() > max {
            return Err(BridgeError::MessageTooLarge {
                size: data.len(),
                max,
            });
        }

        let chain = read(&inner.middleware).clone();
        if !chain.is_empty() {
            let mut message = message;
            for middleware in &chain {
                match middleware.outgoing(message).await? {
                    Some(next) => message = next,
                    None => {
                        tracing::debug!(
                            middleware = middleware.name(),
                            "Outgoing message dropped by middleware"
                        );
                        return Ok(());
                    }
                }
            }
            data = serde_json::to_string(&message)?;
        }

        let size = data.len() as u64;
        match inner.connector.send(data).await {
            Ok(()) => {
                inner.counters.messages_sent.fetch_add(1, Ordering::Relaxed);
                inner.counters.bytes_sent.fetch_add(size, Ordering::Relaxed);
                inner.touch();
                Ok(())
            }
            Err(e) => {
                inner.bump_errors();
                tracing::warn!(error = %e, "Transport send failed");
                inner.emit(TransportEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    /// Register a handler for inbound envelopes
    pub fn on_message<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(TransportMessage<Value>) + Send + Sync + 'static,
    {
        let id = HandlerId(self.inner.next_handler_id.fetch_add(1, Ordering::Relaxed));
        write(&self.inner.handlers).push((id, Arc::new(handler)));
        id
    }

    pub fn remove_message_handler(&self, id: HandlerId) -> bool {
        let mut handlers = write(&self.inner.handlers);
        let before = handlers.len();
        handlers.retain(|(existing, _)| *existing != id);
        handlers.len() != before
    }

    /// Append a middleware layer; layers run in registration order
    pub fn use_middleware(&self, middleware: impl TransportMiddleware + 'static) {
        tracing::debug!(middleware = middleware.name(), "Transport middleware registered");
        write(&self.inner.middleware).push(Arc::new(middleware));
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TransportEvent> {
        match read(&self.inner.events).as_ref() {
            Some(events) => events.subscribe(),
            // Destroyed: hand out an already-closed receiver
            None => broadcast::channel(1).1,
        }
    }

    pub fn events(&self) -> BroadcastStream<TransportEvent> {
        BroadcastStream::new(self.subscribe())
    }

    pub fn stats(&self) -> TransportStats {
        let c = &self.inner.counters;
        let connection_duration_ms = match (self.state(), self.connection_info()) {
            (ConnectionState::Connected, Some(info)) => info.connected_at.elapsed_millis(),
            _ => 0,
        };
        let last_activity = match c.last_activity.load(Ordering::Relaxed) {
            0 => None,
            millis => Some(Timestamp::from_millis(millis)),
        };
        TransportStats {
            messages_sent: c.messages_sent.load(Ordering::Relaxed),
            messages_received: c.messages_received.load(Ordering::Relaxed),
            bytes_sent: c.bytes_sent.load(Ordering::Relaxed),
            bytes_received: c.bytes_received.load(Ordering::Relaxed),
            errors: c.errors.load(Ordering::Relaxed),
            reconnect_attempts: c.reconnect_attempts.load(Ordering::Relaxed),
            connection_duration_ms,
            last_activity,
        }
    }

    /// Zero every counter without touching the connection
    pub fn reset_stats(&self) {
        let c = &self.inner.counters;
        for counter in [
            &c.messages_sent,
            &c.messages_received,
            &c.bytes_sent,
            &c.bytes_received,
            &c.errors,
            &c.reconnect_attempts,
            &c.last_activity,
        ] {
            counter.store(0, Ordering::Relaxed);
        }
    }

    /// Disconnect and release everything; the transport is unusable afterwards
    pub async fn destroy(&self) {
        let inner = &self.inner;
        if inner.destroyed.load(Ordering::SeqCst) {
            return;
        }
        if matches!(
            inner.state(),
            ConnectionState::Connected | ConnectionState::Reconnecting
        ) {
            if let Err(e) = self.disconnect_with_reason("transport destroyed").await {
                tracing::debug!(error = %e, "Error while disconnecting destroyed transport");
            }
        }

        inner.destroyed.store(true, Ordering::SeqCst);
        lock(&inner.tasks).abort_all();
        write(&inner.handlers).clear();
        write(&inner.middleware).clear();
        *write(&inner.events) = None;
        tracing::debug!(
            endpoint = %inner.connector.connection_string(),
            "Transport destroyed"
        );
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.load(Ordering::SeqCst)
    }
}

impl Inner {
    fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    fn set_state(&self, to: ConnectionState) {
        let from = self.state.send_replace(to);
        if from != to {
            tracing::debug!(from = %from, to = %to, "Transport state changed");
            self.emit(TransportEvent::StateChanged { from, to });
        }
    }

    fn emit(&self, event: TransportEvent) {
        if let Some(events) = read(&self.events).as_ref() {
            let _ = events.send(event);
        }
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.destroyed.load(Ordering::SeqCst) {
            return Err(BridgeError::InvalidState("transport destroyed".to_string()));
        }
        Ok(())
    }

    fn is_current(&self, generation: u64) -> bool {
        self.generation.load(Ordering::SeqCst) == generation
    }

    fn bump_errors(&self) {
        self.counters.errors.fetch_add(1, Ordering::Relaxed);
    }

    fn touch(&self) {
        self.counters
            .last_activity
            .store(Timestamp::now().as_millis(), Ordering::Relaxed);
    }

    fn abort_reconnect(&self) {
        if let Some(handle) = lock(&self.tasks).reconnect.take() {
            handle.abort();
        }
    }

    /// Run the connector's connect under `connectionTimeout` and, on
    /// success, start this generation's pump and keep-alive tasks
    fn establish(self: &Arc<Self>) -> BoxFuture<'_, Result<()>> {
        async move {
            let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
            let (tx, rx) = mpsc::unbounded_channel();

            match tokio::time::timeout(self.config.connection_timeout(), self.connector.connect(tx))
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => return Err(e),
                Err(_) => {
                    let _ = self.connector.disconnect().await;
                    return Err(BridgeError::ConnectionTimeout(
                        self.config.connection_timeout_ms,
                    ));
                }
            }

            let info = ConnectionInfo {
                session_id: SessionId::new(),
                connection_string: self.connector.connection_string(),
                connected_at: Timestamp::now(),
            };
            *write(&self.info) = Some(info.clone());
            self.touch();
            self.set_state(ConnectionState::Connected);
            tracing::info!(
                endpoint = %info.connection_string,
                session = %info.session_id,
                "Transport connected"
            );
            self.emit(TransportEvent::Connected { info });

            let pump = tokio::spawn(pump(Arc::downgrade(self), generation, rx));
            let keep_alive = self.config.keep_alive.then(|| {
                tokio::spawn(keep_alive_loop(
                    Arc::downgrade(self),
                    generation,
                    self.config.keep_alive_interval(),
                ))
            });

            let mut tasks = lock(&self.tasks);
            for stale in [tasks.pump.replace(pump), tasks.keep_alive.take()]
                .into_iter()
                .flatten()
            {
                stale.abort();
            }
            tasks.keep_alive = keep_alive;
            Ok(())
        }
        .boxed()
    }

    async fn handle_incoming(&self, raw: String) {
        self.counters.messages_received.fetch_add(1, Ordering::Relaxed);
        self.counters
            .bytes_received
            .fetch_add(raw.len() as u64, Ordering::Relaxed);
        self.touch();

        let mut message: TransportMessage<Value> = match serde_json::from_str(&raw) {
            Ok(message) => message,
            Err(e) => {
                self.bump_errors();
                tracing::warn!(error = %e, "Dropping malformed transport envelope");
                self.emit(TransportEvent::Error {
                    message: format!("malformed envelope: {}", e),
                });
                return;
            }
        };

        let chain = read(&self.middleware).clone();
        for middleware in &chain {
            match middleware.incoming(message).await {
                Ok(Some(next)) => message = next,
                Ok(None) => {
                    tracing::debug!(
                        middleware = middleware.name(),
                        "Incoming message dropped by middleware"
                    );
                    return;
                }
                Err(e) => {
                    self.bump_errors();
                    tracing::warn!(
                        middleware = middleware.name(),
                        error = %e,
                        "Incoming middleware failed"
                    );
                    return;
                }
            }
        }

        let handlers: Vec<MessageHandler> = read(&self.handlers)
            .iter()
            .map(|(_, handler)| handler.clone())
            .collect();
        if handlers.is_empty() {
            tracing::debug!(id = %message.id, "No message handlers registered");
            return;
        }
        for handler in handlers {
            let delivery = message.clone();
            if std::panic::catch_unwind(AssertUnwindSafe(|| handler(delivery))).is_err() {
                self.bump_errors();
                tracing::error!(id = %message.id, "Message handler panicked");
            }
        }
    }

    /// Unexpected loss of the connection identified by `generation`
    fn connection_lost(self: &Arc<Self>, generation: u64, reason: String) {
        if !self.is_current(generation)
            || self.state() != ConnectionState::Connected
            || self.explicit_close.load(Ordering::SeqCst)
        {
            return;
        }

        if let Some(handle) = lock(&self.tasks).keep_alive.take() {
            handle.abort();
        }
        *write(&self.info) = None;

        let will_reconnect = self.config.auto_reconnect
            && self.config.max_reconnect_attempts > 0
            && !self.destroyed.load(Ordering::SeqCst);
        tracing::warn!(reason = %reason, will_reconnect, "Transport connection lost");
        self.emit(TransportEvent::Disconnected {
            reason,
            will_reconnect,
        });

        if will_reconnect {
            self.set_state(ConnectionState::Reconnecting);
            let handle = tokio::spawn(reconnect_loop(Arc::downgrade(self)));
            if let Some(stale) = lock(&self.tasks).reconnect.replace(handle) {
                stale.abort();
            }
        } else {
            self.set_state(ConnectionState::Disconnected);
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        match self.tasks.get_mut() {
            Ok(tasks) => tasks.abort_all(),
            Err(poisoned) => poisoned.into_inner().abort_all(),
        }
    }
}

/// Forward connector events for one generation
async fn pump(
    weak: Weak<Inner>,
    generation: u64,
    mut events: mpsc::UnboundedReceiver<ConnectorEvent>,
) {
    let reason = loop {
        let Some(event) = events.recv().await else {
            break "connection channel closed".to_string();
        };
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) {
            return;
        }
        match event {
            ConnectorEvent::Message(raw) => inner.handle_incoming(raw).await,
            ConnectorEvent::Closed { reason } => break reason,
        }
    };

    if let Some(inner) = weak.upgrade() {
        inner.connection_lost(generation, reason);
    }
}

async fn keep_alive_loop(weak: Weak<Inner>, generation: u64, period: Duration) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker.tick().await;

    loop {
        ticker.tick().await;
        let Some(inner) = weak.upgrade() else {
            return;
        };
        if !inner.is_current(generation) || inner.state() != ConnectionState::Connected {
            return;
        }
        match inner.connector.send_keep_alive().await {
            Ok(()) => tracing::trace!("Keep-alive sent"),
            Err(e) => {
                inner.bump_errors();
                tracing::warn!(error = %e, "Keep-alive failed");
            }
        }
    }
}

async fn reconnect_loop(weak: Weak<Inner>) {
    let max_attempts = match weak.upgrade() {
        Some(inner) => {
            // Release whatever the dead connection left behind
            if let Err(e) = inner.connector.disconnect().await {
                tracing::debug!(error = %e, "Cleanup of lost connection failed");
            }
            inner.config.max_reconnect_attempts
        }
        None => return,
    };

    for attempt in 1..=max_attempts {
        let delay = {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.state() != ConnectionState::Reconnecting {
                return;
            }
            let delay = inner.config.reconnect_delay(attempt);
            inner
                .counters
                .reconnect_attempts
                .fetch_add(1, Ordering::Relaxed);
            let delay_ms = delay.as_millis() as u64;
            tracing::info!(attempt, max_attempts, delay_ms, "Reconnecting transport");
            inner.emit(TransportEvent::Reconnecting { attempt, delay_ms });
            delay
        };

        tokio::time::sleep(delay).await;

        let Some(inner) = weak.upgrade() else {
            return;
        };
        if inner.state() != ConnectionState::Reconnecting {
            return;
        }
        match inner.establish().await {
            Ok(()) => {
                tracing::info!(attempt, "Transport reconnected");
                return;
            }
            Err(e) => {
                inner.bump_errors();
                tracing::warn!(attempt, error = %e, "Reconnect attempt failed");
            }
        }
    }

    if let Some(inner) = weak.upgrade() {
        if inner.state() == ConnectionState::Reconnecting {
            inner.set_state(ConnectionState::Disconnected);
            tracing::warn!(attempts = max_attempts, "Reconnect attempts exhausted");
            inner.emit(TransportEvent::ReconnectFailed {
                attempts: max_attempts,
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryConnector;
    use async_trait::async_trait;
    use serde_json::json;

    fn quiet_config() -> TransportConfig {
        TransportConfig {
            keep_alive: false,
            reconnect_delay_ms: 10,
            max_reconnect_delay_ms: 50,
            connection_timeout_ms: 200,
            ..Default::default()
        }
    }

    /// Connector whose connect never completes
    struct Unresponsive;

    #[async_trait]
    impl Connector for Unresponsive {
        fn connection_string(&self) -> String {
            "unresponsive://".to_string()
        }

        fn capabilities(&self) -> TransportCapabilities {
            TransportCapabilities::default()
        }

        async fn connect(&self, _events: mpsc::UnboundedSender<ConnectorEvent>) -> Result<()> {
            std::future::pending().await
        }

        async fn disconnect(&self) -> Result<()> {
            Ok(())
        }

        async fn send(&self, _data: String) -> Result<()> {
            Ok(())
        }

        async fn send_keep_alive(&self) -> Result<()> {
            Ok(())
        }
    }

    struct DropAll;

    #[async_trait]
    impl TransportMiddleware for DropAll {
        async fn outgoing(
            &self,
            _message: TransportMessage<Value>,
        ) -> Result<Option<TransportMessage<Value>>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn test_connect_and_exchange() {
        let (a, b) = MemoryConnector::pair();
        let left = Transport::new(a, quiet_config()).unwrap();
        let right = Transport::new(b, quiet_config()).unwrap();
        left.connect().await.unwrap();
        right.connect().await.unwrap();

        let (tx, mut rx) = mpsc::unbounded_channel();
        right.on_message(move |msg| {
            let _ = tx.send(msg.payload);
        });

        left.send(TransportMessage::new(json!({"hello": "world"})))
            .await
            .unwrap();
        assert_eq!(rx.recv().await.unwrap()["hello"], "world");

        let stats = left.stats();
        assert_eq!(stats.messages_sent, 1);
        assert!(stats.bytes_sent > 0);
        assert!(stats.last_activity.is_some());
        assert_eq!(right.stats().messages_received, 1);
        assert!(left.connection_info().unwrap().session_id.as_str().starts_with("session-"));
    }

    #[test]
    fn test_new_rejects_invalid_config() {
        let result = Transport::new(
            MemoryConnector::new("memory://solo"),
            TransportConfig {
                connection_timeout_ms: 0,
                ..quiet_config()
            },
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));

        let result = Transport::new(
            MemoryConnector::new("memory://solo"),
            TransportConfig {
                reconnect_backoff_multiplier: 0.5,
                ..quiet_config()
            },
        );
        assert!(matches!(result, Err(BridgeError::Config(_))));
    }

    #[tokio::test]
    async fn test_connect_twice_is_noop() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        transport.connect().await.unwrap();
        let session = transport.connection_info().unwrap().session_id;
        transport.connect().await.unwrap();
        assert_eq!(transport.connection_info().unwrap().session_id, session);
    }

    #[tokio::test]
    async fn test_disconnect_when_not_connected_is_noop() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        transport.disconnect().await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_closes() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        let mut events = transport.subscribe();
        transport.connect().await.unwrap();
        transport.disconnect_with_reason("done").await.unwrap();
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(transport.connection_info().is_none());

        let mut saw_disconnect = false;
        while let Ok(event) = events.try_recv() {
            if let TransportEvent::Disconnected {
                reason,
                will_reconnect,
            } = event
            {
                assert_eq!(reason, "done");
                assert!(!will_reconnect);
                saw_disconnect = true;
            }
        }
        assert!(saw_disconnect);
    }

    #[tokio::test]
    async fn test_send_requires_connection() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        let err = transport
            .send(TransportMessage::new(json!(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::NotConnected));
    }

    #[tokio::test]
    async fn test_message_too_large() {
        let transport = Transport::new(
            MemoryConnector::new("memory://solo"),
            TransportConfig {
                max_message_size: 64,
                ..quiet_config()
            },
        )
        .unwrap();
        transport.connect().await.unwrap();
        let err = transport
            .send(TransportMessage::new(json!("x".repeat(128))))
            .await
            .unwrap_err();
        assert!(matches!(err, BridgeError::MessageTooLarge { max: 64, .. }));
        assert_eq!(transport.stats().messages_sent, 0);
    }

    #[tokio::test]
    async fn test_failed_connect_enters_error_state() {
        let connector = MemoryConnector::new("memory://down");
        connector.set_reachable(false);
        let transport = Transport::new(connector, quiet_config()).unwrap();
        assert!(matches!(
            transport.connect().await,
            Err(BridgeError::ConnectionFailed(_))
        ));
        assert_eq!(transport.state(), ConnectionState::Error);
        assert_eq!(transport.stats().errors, 1);
    }

    #[tokio::test]
    async fn test_connect_timeout() {
        let transport = Transport::new(
            Unresponsive,
            TransportConfig {
                connection_timeout_ms: 30,
                ..quiet_config()
            },
        )
        .unwrap();
        assert!(matches!(
            transport.connect().await,
            Err(BridgeError::ConnectionTimeout(30))
        ));
        assert_eq!(transport.state(), ConnectionState::Error);
    }

    #[tokio::test]
    async fn test_outgoing_middleware_can_drop() {
        let connector = MemoryConnector::new("memory://solo");
        let transport = Transport::new(connector.clone(), quiet_config()).unwrap();
        transport.use_middleware(DropAll);
        transport.connect().await.unwrap();
        transport.send(TransportMessage::new(json!(1))).await.unwrap();
        assert!(connector.sent().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_inbound_counts_error() {
        let connector = MemoryConnector::new("memory://solo");
        let transport = Transport::new(connector.clone(), quiet_config()).unwrap();
        transport.connect().await.unwrap();
        connector.inject("not json");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(transport.stats().errors, 1);
        assert_eq!(transport.stats().messages_received, 1);
    }

    #[tokio::test]
    async fn test_remove_message_handler() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        let id = transport.on_message(|_| {});
        assert!(transport.remove_message_handler(id));
        assert!(!transport.remove_message_handler(id));
    }

    #[tokio::test]
    async fn test_keep_alive_ticks() {
        let connector = MemoryConnector::new("memory://solo");
        let transport = Transport::new(
            connector.clone(),
            TransportConfig {
                keep_alive: true,
                keep_alive_interval_ms: 10,
                ..quiet_config()
            },
        )
        .unwrap();
        transport.connect().await.unwrap();
        tokio::time::sleep(Duration::from_millis(60)).await;
        assert!(connector.keep_alives() >= 2);
    }

    #[tokio::test]
    async fn test_reset_stats_keeps_connection() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        transport.connect().await.unwrap();
        transport.send(TransportMessage::new(json!(1))).await.unwrap();
        transport.reset_stats();
        assert_eq!(transport.stats().messages_sent, 0);
        assert!(transport.is_connected());
    }

    #[tokio::test]
    async fn test_destroy_is_terminal() {
        let transport =
            Transport::new(MemoryConnector::new("memory://solo"), quiet_config()).unwrap();
        transport.connect().await.unwrap();
        transport.destroy().await;
        assert_eq!(transport.state(), ConnectionState::Closed);
        assert!(transport.is_destroyed());
        assert!(matches!(
            transport.connect().await,
            Err(BridgeError::InvalidState(_))
        ));
        let mut events = transport.subscribe();
        assert!(events.recv().await.is_err());
    }
}
