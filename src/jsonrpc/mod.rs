//! JSON-RPC 2.0 engine, wire types and request middleware

pub mod engine;
pub mod message;
pub mod middleware;

pub use engine::{
    BatchEntry, BatchOutcome, ErrorTransformer, HandlerFuture, JsonRpcProtocol, LogLevel,
    MessageSink, NotificationHandler, ProtocolEvent, ProtocolStats, RequestContext,
    RequestHandler, RequestOptions,
};
pub use message::{
    codes, extract_id, InvalidMessage, JsonRpcErrorObject, JsonRpcId, JsonRpcMessage,
    JsonRpcNotification, JsonRpcPayload, JsonRpcRequest, JsonRpcResponse, JSONRPC_VERSION,
};
pub use middleware::{Middleware, Next};
