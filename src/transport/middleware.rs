//! Transport-level middleware
//!
//! Hooks run on every envelope passing through a [`Transport`](super::Transport):
//! outgoing before the connector writes it, incoming before message handlers
//! see it. Returning `Ok(None)` drops the envelope.

use crate::error::Result;
use crate::types::TransportMessage;
use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait TransportMiddleware: Send + Sync {
    fn name(&self) -> &str {
        "transport-middleware"
    }

    async fn outgoing(
        &self,
        message: TransportMessage<Value>,
    ) -> Result<Option<TransportMessage<Value>>> {
        Ok(Some(message))
    }

    async fn incoming(
        &self,
        message: TransportMessage<Value>,
    ) -> Result<Option<TransportMessage<Value>>> {
        Ok(Some(message))
    }
}

/// Traces envelope ids in both directions
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingMiddleware;

#[async_trait]
impl TransportMiddleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn outgoing(
        &self,
        message: TransportMessage<Value>,
    ) -> Result<Option<TransportMessage<Value>>> {
        tracing::trace!(id = %message.id, "Outgoing envelope");
        Ok(Some(message))
    }

    async fn incoming(
        &self,
        message: TransportMessage<Value>,
    ) -> Result<Option<TransportMessage<Value>>> {
        tracing::trace!(id = %message.id, "Incoming envelope");
        Ok(Some(message))
    }
}
