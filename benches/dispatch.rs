//! Performance benchmarks for a3s-bridge
//!
//! Run with: cargo bench

use a3s_bridge::{
    JsonRpcMessage, JsonRpcProtocol, MemoryConnector, ProtocolClient, ProtocolConfig, Transport,
    TransportConfig, TransportMessage,
};
use criterion::{criterion_group, criterion_main, Criterion};
use serde_json::{json, Value};
use std::sync::Arc;

fn bench_parse(c: &mut Criterion) {
    let request = json!({
        "jsonrpc": "2.0",
        "id": 42,
        "method": "tools/call",
        "params": {"name": "echo", "arguments": {"x": 1, "tags": ["a", "b"]}}
    });

    c.bench_function("JsonRpcMessage::parse request", |b| {
        b.iter(|| JsonRpcMessage::parse(&request, true).unwrap());
    });

    let envelope = serde_json::to_string(&TransportMessage::new(request.clone())).unwrap();
    c.bench_function("TransportMessage deserialize", |b| {
        b.iter(|| serde_json::from_str::<TransportMessage<Value>>(&envelope).unwrap());
    });
}

fn bench_round_trip(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    let (caller, _callee) = rt.block_on(async {
        let config = TransportConfig {
            keep_alive: false,
            ..Default::default()
        };
        let (a, b) = MemoryConnector::pair();
        let callee_engine = Arc::new(JsonRpcProtocol::new(ProtocolConfig::default()));
        callee_engine
            .register_handler("echo", |params: Option<Value>, _ctx| async move {
                Ok(params.unwrap_or(Value::Null))
            })
            .unwrap();

        let callee = ProtocolClient::builder(Transport::new(b, config.clone()).unwrap())
            .engine(callee_engine)
            .build()
            .unwrap();
        let caller = ProtocolClient::builder(Transport::new(a, config).unwrap())
            .build()
            .unwrap();
        callee.connect().await.unwrap();
        caller.connect().await.unwrap();
        (caller, callee)
    });

    c.bench_function("request round trip (memory)", |b| {
        b.to_async(&rt).iter(|| async {
            caller
                .request("echo", Some(json!({"x": 1})))
                .await
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_parse, bench_round_trip);
criterion_main!(benches);
