//! Request middleware chain
//!
//! Middleware wraps inbound request dispatch in registration order. Each
//! layer receives the request and a [`Next`] continuation; calling
//! `next.run(..)` passes control inward, returning without calling it
//! short-circuits the chain.

use super::engine::{RequestContext, RequestHandler};
use super::message::JsonRpcRequest;
use crate::error::Result;
use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

/// Interceptor around inbound request handling
#[async_trait]
pub trait Middleware: Send + Sync {
    /// Name used in logs
    fn name(&self) -> &str {
        "middleware"
    }

    /// Handle a request, usually by delegating to `next`
    async fn handle_request(
        &self,
        request: JsonRpcRequest,
        ctx: RequestContext,
        next: Next<'_>,
    ) -> Result<Value> {
        next.run(request, ctx).await
    }
}

/// Continuation into the rest of the middleware chain
pub struct Next<'a> {
    chain: &'a [Arc<dyn Middleware>],
    endpoint: &'a RequestHandler,
}

impl<'a> Next<'a> {
    pub(crate) fn new(chain: &'a [Arc<dyn Middleware>], endpoint: &'a RequestHandler) -> Self {
        Self { chain, endpoint }
    }

    /// Run the remaining middleware, then the method handler
    pub async fn run(self, request: JsonRpcRequest, ctx: RequestContext) -> Result<Value> {
        match self.chain.split_first() {
            Some((head, rest)) => {
                head.handle_request(request, ctx, Next::new(rest, self.endpoint))
                    .await
            }
            None => (self.endpoint)(request.params, ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::BridgeError;
    use crate::jsonrpc::message::JsonRpcId;
    use crate::types::Timestamp;
    use futures::FutureExt;
    use std::sync::Mutex;

    struct Recorder {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Middleware for Recorder {
        async fn handle_request(
            &self,
            request: JsonRpcRequest,
            ctx: RequestContext,
            next: Next<'_>,
        ) -> Result<Value> {
            self.log.lock().unwrap().push(format!("{}:before", self.label));
            let result = next.run(request, ctx).await;
            self.log.lock().unwrap().push(format!("{}:after", self.label));
            result
        }
    }

    struct Deny;

    #[async_trait]
    impl Middleware for Deny {
        async fn handle_request(
            &self,
            _request: JsonRpcRequest,
            _ctx: RequestContext,
            _next: Next<'_>,
        ) -> Result<Value> {
            Err(BridgeError::rpc(-32004, "unauthorized"))
        }
    }

    fn ctx() -> RequestContext {
        RequestContext {
            id: JsonRpcId::Number(1),
            method: "echo".to_string(),
            received_at: Timestamp::now(),
        }
    }

    fn echo_handler(log: Arc<Mutex<Vec<String>>>) -> RequestHandler {
        Arc::new(move |params: Option<Value>, _ctx: RequestContext| {
            log.lock().unwrap().push("handler".to_string());
            async move { Ok(params.unwrap_or(Value::Null)) }.boxed()
        })
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![
            Arc::new(Recorder {
                label: "outer",
                log: log.clone(),
            }),
            Arc::new(Recorder {
                label: "inner",
                log: log.clone(),
            }),
        ];
        let handler = echo_handler(log.clone());
        let request = JsonRpcRequest::new(1.into(), "echo", Some(serde_json::json!({"v": 1})));

        let result = Next::new(&chain, &handler).run(request, ctx()).await.unwrap();
        assert_eq!(result["v"], 1);
        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "outer:before",
                "inner:before",
                "handler",
                "inner:after",
                "outer:after"
            ]
        );
    }

    #[tokio::test]
    async fn test_short_circuit_skips_handler() {
        let log = Arc::new(Mutex::new(Vec::new()));
        let chain: Vec<Arc<dyn Middleware>> = vec![Arc::new(Deny)];
        let handler = echo_handler(log.clone());
        let request = JsonRpcRequest::new(1.into(), "echo", None);

        let err = Next::new(&chain, &handler)
            .run(request, ctx())
            .await
            .unwrap_err();
        assert_eq!(err.code(), -32004);
        assert!(log.lock().unwrap().is_empty());
    }
}
