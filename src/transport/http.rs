//! HTTP connector
//!
//! Request/response only: every outbound envelope is POSTed to the endpoint
//! and a non-empty response body is reported as an inbound message. "Connect"
//! and keep-alive are reachability checks (`HEAD`).

use super::{Connector, ConnectorEvent, TransportCapabilities};
use crate::error::{BridgeError, Result};
use crate::lock::lock;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

pub struct HttpConnector {
    endpoint: String,
    client: reqwest::Client,
    events: Mutex<Option<mpsc::UnboundedSender<ConnectorEvent>>>,
}

impl HttpConnector {
    pub fn new(endpoint: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| BridgeError::Config(format!("Failed to build HTTP client: {}", e)))?;
        Ok(Self::with_client(endpoint, client))
    }

    /// Use a preconfigured client (proxies, TLS roots, default headers)
    pub fn with_client(endpoint: impl Into<String>, client: reqwest::Client) -> Self {
        Self {
            endpoint: endpoint.into(),
            client,
            events: Mutex::new(None),
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    fn events(&self) -> Option<mpsc::UnboundedSender<ConnectorEvent>> {
        lock(&self.events).clone()
    }

    async fn check_reachable(&self) -> Result<()> {
        self.client
            .head(&self.endpoint)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| {
                BridgeError::ConnectionFailed(format!("{} unreachable: {}", self.endpoint, e))
            })
    }
}

#[async_trait]
impl Connector for HttpConnector {
    fn connection_string(&self) -> String {
        self.endpoint.clone()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            batching: true,
            encryption: self.endpoint.starts_with("https://"),
            ..Default::default()
        }
    }

    async fn connect(&self, events: mpsc::UnboundedSender<ConnectorEvent>) -> Result<()> {
        // Any HTTP status proves the server is there
        self.check_reachable().await?;
        *lock(&self.events) = Some(events);
        tracing::debug!(endpoint = %self.endpoint, "HTTP endpoint reachable");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.events).take();
        Ok(())
    }

    async fn send(&self, data: String) -> Result<()> {
        let events = self.events().ok_or(BridgeError::NotConnected)?;

        let response = self
            .client
            .post(&self.endpoint)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(data)
            .send()
            .await
            .map_err(|e| BridgeError::SendFailed(format!("POST {} failed: {}", self.endpoint, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(BridgeError::SendFailed(format!(
                "POST {} returned {}",
                self.endpoint, status
            )));
        }

        let body: Bytes = response.bytes().await.map_err(|e| {
            BridgeError::SendFailed(format!("Failed to read response body: {}", e))
        })?;
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(());
        }
        match String::from_utf8(body.to_vec()) {
            Ok(text) => {
                let _ = events.send(ConnectorEvent::Message(text));
            }
            Err(_) => tracing::warn!(endpoint = %self.endpoint, "Dropping non-UTF-8 response body"),
        }
        Ok(())
    }

    async fn send_keep_alive(&self) -> Result<()> {
        let Some(events) = self.events() else {
            return Err(BridgeError::NotConnected);
        };
        if let Err(e) = self.check_reachable().await {
            let _ = events.send(ConnectorEvent::Closed {
                reason: e.to_string(),
            });
            return Err(e);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities() {
        let caps = HttpConnector::new("https://example.com/rpc")
            .unwrap()
            .capabilities();
        assert!(!caps.bidirectional);
        assert!(caps.encryption);
        assert!(caps.batching);
    }

    #[tokio::test]
    async fn test_send_requires_connect() {
        let connector = HttpConnector::new("http://127.0.0.1:1/rpc").unwrap();
        assert!(matches!(
            connector.send("{}".to_string()).await,
            Err(BridgeError::NotConnected)
        ));
    }

    #[tokio::test]
    async fn test_unreachable_endpoint() {
        let connector = HttpConnector::new("http://127.0.0.1:1/rpc").unwrap();
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            connector.connect(tx).await,
            Err(BridgeError::ConnectionFailed(_))
        ));
    }
}
