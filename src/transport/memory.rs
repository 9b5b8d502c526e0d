//! In-process connector for tests and embedding
//!
//! A [`MemoryConnector`] can stand alone (frames are only recorded) or be one
//! half of a linked pair created with [`MemoryConnector::pair`], in which case
//! frames sent on one side arrive as inbound messages on the other. Failure
//! injection (`sever`, `set_reachable`, `fail_next_connects`) drives the
//! transport's reconnect paths without a network.

use super::{Connector, ConnectorEvent, TransportCapabilities};
use crate::error::{BridgeError, Result};
use crate::lock::lock;
use async_trait::async_trait;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;

#[derive(Debug)]
struct Endpoint {
    events: Option<mpsc::UnboundedSender<ConnectorEvent>>,
    unreachable: bool,
    failures_remaining: u32,
    sent: Vec<String>,
    keep_alives: u64,
}

impl Endpoint {
    fn new() -> Self {
        Self {
            events: None,
            unreachable: false,
            failures_remaining: 0,
            sent: Vec::new(),
            keep_alives: 0,
        }
    }
}

/// Linked in-memory connector; clones share the same endpoint
#[derive(Debug, Clone)]
pub struct MemoryConnector {
    name: String,
    local: Arc<Mutex<Endpoint>>,
    peer: Option<Arc<Mutex<Endpoint>>>,
}

impl MemoryConnector {
    /// Standalone connector; sent frames are only recorded
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            local: Arc::new(Mutex::new(Endpoint::new())),
            peer: None,
        }
    }

    /// Two connectors wired to each other
    pub fn pair() -> (Self, Self) {
        let a = Arc::new(Mutex::new(Endpoint::new()));
        let b = Arc::new(Mutex::new(Endpoint::new()));
        (
            Self {
                name: "memory://a".to_string(),
                local: a.clone(),
                peer: Some(b.clone()),
            },
            Self {
                name: "memory://b".to_string(),
                local: b,
                peer: Some(a),
            },
        )
    }

    /// Drop the connection as if the network failed
    pub fn sever(&self, reason: impl Into<String>) {
        let events = lock(&self.local).events.take();
        if let Some(events) = events {
            let _ = events.send(ConnectorEvent::Closed {
                reason: reason.into(),
            });
        }
    }

    /// While unreachable, every connect attempt fails
    pub fn set_reachable(&self, reachable: bool) {
        lock(&self.local).unreachable = !reachable;
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.local).failures_remaining = count;
    }

    /// Deliver a raw inbound frame to this side
    pub fn inject(&self, data: impl Into<String>) -> bool {
        match lock(&self.local).events.as_ref() {
            Some(events) => events.send(ConnectorEvent::Message(data.into())).is_ok(),
            None => false,
        }
    }

    /// Every frame written through this side
    pub fn sent(&self) -> Vec<String> {
        lock(&self.local).sent.clone()
    }

    pub fn keep_alives(&self) -> u64 {
        lock(&self.local).keep_alives
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.local).events.is_some()
    }
}

#[async_trait]
impl Connector for MemoryConnector {
    fn connection_string(&self) -> String {
        self.name.clone()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            bidirectional: true,
            streaming: true,
            batching: true,
            ..Default::default()
        }
    }

    async fn connect(&self, events: mpsc::UnboundedSender<ConnectorEvent>) -> Result<()> {
        let mut local = lock(&self.local);
        if local.unreachable {
            return Err(BridgeError::ConnectionFailed(format!(
                "{} is unreachable",
                self.name
            )));
        }
        if local.failures_remaining > 0 {
            local.failures_remaining -= 1;
            return Err(BridgeError::ConnectionFailed(format!(
                "{} refused the connection",
                self.name
            )));
        }
        local.events = Some(events);
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.local).events = None;
        Ok(())
    }

    async fn send(&self, data: String) -> Result<()> {
        {
            let mut local = lock(&self.local);
            if local.events.is_none() {
                return Err(BridgeError::NotConnected);
            }
            local.sent.push(data.clone());
        }

        let Some(peer) = &self.peer else {
            return Ok(());
        };
        let peer = lock(peer);
        match peer.events.as_ref() {
            Some(events) if events.send(ConnectorEvent::Message(data)).is_ok() => Ok(()),
            _ => Err(BridgeError::SendFailed(format!(
                "peer of {} is not connected",
                self.name
            ))),
        }
    }

    async fn send_keep_alive(&self) -> Result<()> {
        let mut local = lock(&self.local);
        if local.events.is_none() {
            return Err(BridgeError::NotConnected);
        }
        local.keep_alives += 1;
        Ok(())
    }
}
