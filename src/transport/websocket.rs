//! WebSocket connector
//!
//! One writer task drains an unbounded queue into the socket sink and one
//! reader task turns frames into [`ConnectorEvent`]s. Keep-alive is a ping;
//! a missing pong within `pong_timeout_ms` closes the socket and reports the
//! connection lost, which lets the transport reconnect.

use super::{Connector, ConnectorEvent, TransportCapabilities};
use crate::error::{BridgeError, Result};
use crate::lock::lock;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Socket-level settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WebSocketConfig {
    /// Close the socket when a ping goes unanswered this long
    pub pong_timeout_ms: u64,
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            pong_timeout_ms: 10_000,
        }
    }
}

struct Connection {
    outbound: mpsc::UnboundedSender<Message>,
    reader: JoinHandle<()>,
    writer: JoinHandle<()>,
    awaiting_pong: Arc<Mutex<Option<Instant>>>,
    events: mpsc::UnboundedSender<ConnectorEvent>,
}

pub struct WebSocketConnector {
    url: String,
    config: WebSocketConfig,
    connection: Mutex<Option<Connection>>,
}

impl WebSocketConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self::with_config(url, WebSocketConfig::default())
    }

    pub fn with_config(url: impl Into<String>, config: WebSocketConfig) -> Self {
        Self {
            url: url.into(),
            config,
            connection: Mutex::new(None),
        }
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    fn outbound(&self) -> Result<mpsc::UnboundedSender<Message>> {
        lock(&self.connection)
            .as_ref()
            .map(|c| c.outbound.clone())
            .ok_or(BridgeError::NotConnected)
    }
}

#[async_trait]
impl Connector for WebSocketConnector {
    fn connection_string(&self) -> String {
        self.url.clone()
    }

    fn capabilities(&self) -> TransportCapabilities {
        TransportCapabilities {
            bidirectional: true,
            streaming: true,
            encryption: self.url.starts_with("wss://"),
            ..Default::default()
        }
    }

    async fn connect(&self, events: mpsc::UnboundedSender<ConnectorEvent>) -> Result<()> {
        // Never leave a previous socket running underneath a new one
        self.disconnect().await?;

        let (stream, _) = connect_async(self.url.as_str()).await.map_err(|e| {
            BridgeError::ConnectionFailed(format!("WebSocket connect to {} failed: {}", self.url, e))
        })?;
        let (mut sink, mut source) = stream.split();
        let (outbound, mut queue) = mpsc::unbounded_channel::<Message>();
        let awaiting_pong = Arc::new(Mutex::new(None::<Instant>));

        let writer_events = events.clone();
        let writer = tokio::spawn(async move {
            while let Some(message) = queue.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = sink.send(message).await {
                    tracing::debug!(error = %e, "WebSocket write failed");
                    let _ = writer_events.send(ConnectorEvent::Closed {
                        reason: format!("write failed: {}", e),
                    });
                    return;
                }
                if closing {
                    break;
                }
            }
            let _ = sink.close().await;
        });

        let reader_events = events.clone();
        let reader_outbound = outbound.clone();
        let reader_pong = awaiting_pong.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match source.next().await {
                    Some(Ok(Message::Text(text))) => {
                        if reader_events.send(ConnectorEvent::Message(text)).is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                        Ok(text) => {
                            if reader_events.send(ConnectorEvent::Message(text)).is_err() {
                                return;
                            }
                        }
                        Err(_) => tracing::warn!("Dropping non-UTF-8 binary frame"),
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = reader_outbound.send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_))) => {
                        *lock(&reader_pong) = None;
                    }
                    Some(Ok(Message::Close(frame))) => {
                        break frame
                            .map(|f| format!("closed by peer: {} {}", f.code, f.reason))
                            .unwrap_or_else(|| "closed by peer".to_string());
                    }
                    Some(Ok(Message::Frame(_))) => {}
                    Some(Err(e)) => break format!("read failed: {}", e),
                    None => break "stream ended".to_string(),
                }
            };
            tracing::debug!(reason = %reason, "WebSocket reader stopped");
            let _ = reader_events.send(ConnectorEvent::Closed { reason });
        });

        tracing::debug!(url = %self.url, "WebSocket connected");
        *lock(&self.connection) = Some(Connection {
            outbound,
            reader,
            writer,
            awaiting_pong,
            events,
        });
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let connection = lock(&self.connection).take();
        let Some(connection) = connection else {
            return Ok(());
        };
        let Connection {
            outbound,
            reader,
            mut writer,
            ..
        } = connection;

        reader.abort();
        let _ = outbound.send(Message::Close(None));
        drop(outbound);
        if tokio::time::timeout(Duration::from_secs(1), &mut writer)
            .await
            .is_err()
        {
            tracing::debug!(url = %self.url, "WebSocket close handshake timed out");
            writer.abort();
        }
        Ok(())
    }

    async fn send(&self, data: String) -> Result<()> {
        self.outbound()?
            .send(Message::Text(data))
            .map_err(|_| BridgeError::SendFailed("WebSocket writer has stopped".to_string()))
    }

    async fn send_keep_alive(&self) -> Result<()> {
        let (outbound, awaiting, events) = {
            let guard = lock(&self.connection);
            let connection = guard.as_ref().ok_or(BridgeError::NotConnected)?;
            (
                connection.outbound.clone(),
                connection.awaiting_pong.clone(),
                connection.events.clone(),
            )
        };

        let sent_at = Instant::now();
        *lock(&awaiting) = Some(sent_at);
        outbound
            .send(Message::Ping(Vec::new()))
            .map_err(|_| BridgeError::SendFailed("WebSocket writer has stopped".to_string()))?;

        let pong_timeout = Duration::from_millis(self.config.pong_timeout_ms);
        tokio::spawn(async move {
            tokio::time::sleep(pong_timeout).await;
            let outstanding = *lock(&awaiting) == Some(sent_at);
            if outstanding {
                tracing::warn!(
                    timeout_ms = pong_timeout.as_millis() as u64,
                    "No pong received, closing WebSocket"
                );
                let _ = outbound.send(Message::Close(None));
                let _ = events.send(ConnectorEvent::Closed {
                    reason: "pong timeout".to_string(),
                });
            }
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_capabilities_follow_scheme() {
        assert!(!WebSocketConnector::new("ws://localhost:1")
            .capabilities()
            .encryption);
        let secure = WebSocketConnector::new("wss://example.com/socket").capabilities();
        assert!(secure.encryption);
        assert!(secure.bidirectional);
    }

    #[test]
    fn test_config_defaults() {
        let config: WebSocketConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.pong_timeout_ms, 10_000);
    }

    #[tokio::test]
    async fn test_send_without_connection() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        assert!(matches!(
            connector.send("x".to_string()).await,
            Err(BridgeError::NotConnected)
        ));
        connector.disconnect().await.unwrap();
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let connector = WebSocketConnector::new("ws://127.0.0.1:1");
        let (tx, _rx) = mpsc::unbounded_channel();
        assert!(matches!(
            connector.connect(tx).await,
            Err(BridgeError::ConnectionFailed(_))
        ));
    }
}
