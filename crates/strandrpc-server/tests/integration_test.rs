//! End-to-end tests of the five call shapes over in-memory channels.

mod common;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use strandrpc_client::{CallerKind, ClientConfig, ClientManifest, RpcClient};
use strandrpc_common::middleware::{self, IdentityStage, StagePair, StageVerdict};
use strandrpc_common::protocol::{ResponseError, RpcError, WireError, WireMessage};
use strandrpc_server::{handlers, Manifest, RpcServer, ServerConfig};

fn echo_server(config: ServerConfig) -> Arc<RpcServer<()>> {
    let manifest = Manifest::new()
        .register(
            "echo",
            handlers::unary(|_cx, params| async move { Ok(params.unwrap_or(Value::Null)) }),
        )
        .register(
            "count",
            handlers::server_stream(|_cx, params| async move {
                let n = params.and_then(|p| p.as_u64()).unwrap_or(0);
                Ok(futures::stream::iter((0..n).map(|i| Ok(json!(i)))).boxed())
            }),
        )
        .register(
            "sum",
            handlers::client_stream(|_cx, mut input| async move {
                let mut sum = 0i64;
                while let Some(params) = input.next().await {
                    sum += params.and_then(|p| p.as_i64()).unwrap_or(0);
                }
                Ok(json!(sum))
            }),
        )
        .register(
            "mirror",
            handlers::duplex(|_cx, input| async move {
                Ok(input.map(|params| Ok(params.unwrap_or(Value::Null))).boxed())
            }),
        )
        .register(
            "blob",
            handlers::raw(|_cx, params, input| async move {
                Ok((Some(json!({"accepted": params.is_some()})), input))
            }),
        );
    Arc::new(RpcServer::new(manifest, (), config))
}

fn client_for(server: Arc<RpcServer<()>>) -> RpcClient {
    let manifest = ClientManifest::new()
        .register("echo", CallerKind::Unary)
        .register("count", CallerKind::ServerStream)
        .register("sum", CallerKind::ClientStream)
        .register("mirror", CallerKind::Duplex)
        .register("blob", CallerKind::Raw);
    RpcClient::new(manifest, common::connect(server), ClientConfig::default())
}

#[tokio::test]
async fn test_unary_echo_round_trip() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let values = [
        json!({"nested": {"list": [1, 2, 3], "flag": true}, "text": "héllo"}),
        json!([null, 1.5, "two", {"three": 3}]),
        json!("plain string"),
        json!(42),
        json!(true),
        json!(null),
    ];
    for value in values {
        let reply = client.call_unary("echo", Some(value.clone())).await.unwrap();
        assert_eq!(reply, value);
    }
}

#[tokio::test]
async fn test_unary_without_params() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);
    let reply = client.call_unary("echo", None).await.unwrap();
    assert_eq!(reply, Value::Null);
}

#[tokio::test]
async fn test_server_stream_cardinality_and_order() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    for n in [0u64, 1, 5, 32] {
        let mut stream = client
            .call_server_stream("count", Some(json!(n)))
            .await
            .unwrap();
        let mut got = Vec::new();
        while let Some(item) = stream.next().await {
            got.push(item.unwrap().as_u64().unwrap());
        }
        let expected: Vec<u64> = (0..n).collect();
        assert_eq!(got, expected, "wrong items for n = {}", n);
    }
}

#[tokio::test]
async fn test_client_stream_aggregation() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let call = client.call_client_stream("sum").await.unwrap();
    let numbers = [3i64, -1, 7, 100, 0, 25];
    for n in numbers {
        call.send(json!(n)).await.unwrap();
    }
    let total = call.finish().await.unwrap();
    assert_eq!(total, json!(numbers.iter().sum::<i64>()));
}

#[tokio::test]
async fn test_client_stream_empty_input() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let call = client.call_client_stream("sum").await.unwrap();
    let total = call.finish().await.unwrap();
    assert_eq!(total, json!(0));
}

#[tokio::test]
async fn test_duplex_round_trip_preserves_order() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let (sink, mut stream) = client.call_duplex("mirror").await.unwrap();
    for i in 0..10 {
        sink.send(json!({"seq": i})).await.unwrap();
        let echoed = stream.next().await.unwrap().unwrap();
        assert_eq!(echoed, json!({"seq": i}));
    }

    // Closing the writable end eventually ends the readable end
    drop(sink);
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_duplex_pipelined_writes() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let (sink, stream) = client.call_duplex("mirror").await.unwrap();
    for i in 0..5 {
        sink.send(json!(i)).await.unwrap();
    }
    drop(sink);

    let got: Vec<Value> = stream.map(|item| item.unwrap()).collect().await;
    assert_eq!(got, vec![json!(0), json!(1), json!(2), json!(3), json!(4)]);
}

#[tokio::test]
async fn test_raw_call_round_trip() {
    let server = echo_server(ServerConfig::default());
    let client = client_for(server);

    let mut call = client
        .call_raw("blob", Some(json!({"name": "payload"})))
        .await
        .unwrap();
    assert_eq!(call.meta, Some(json!({"accepted": true})));

    call.writer.write_all(b"opaque bytes \x00\x01\x02").await.unwrap();
    call.writer.shutdown().await.unwrap();

    let mut echoed = Vec::new();
    call.reader.read_to_end(&mut echoed).await.unwrap();
    assert_eq!(echoed, b"opaque bytes \x00\x01\x02");
}

#[tokio::test]
async fn test_method_not_found_from_server() {
    let server = echo_server(ServerConfig::default());
    // Client manifest deliberately declares a method the server lacks
    let manifest = ClientManifest::new().register("ghost", CallerKind::Unary);
    let client = RpcClient::new(manifest, common::connect(server), ClientConfig::default());

    match client.call_unary("ghost", None).await {
        Err(RpcError::Remote { code, cause, .. }) => {
            assert_eq!(code, -32601);
            match cause.as_deref() {
                Some(RpcError::MethodNotFound(method)) => assert_eq!(method, "ghost"),
                other => panic!("expected method not found cause, got {:?}", other),
            }
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_middleware_rejection_short_circuits_handler() {
    let reached = Arc::new(AtomicBool::new(false));
    let flag = reached.clone();

    let manifest = Manifest::new().register(
        "guarded",
        handlers::unary(move |_cx, params| {
            let flag = flag.clone();
            async move {
                flag.store(true, Ordering::SeqCst);
                Ok(params.unwrap_or(Value::Null))
            }
        }),
    );

    let server = Arc::new(
        RpcServer::new(manifest, (), ServerConfig::default()).with_middleware(
            middleware::factory_fn(|_meta| StagePair {
                forward: middleware::stage_fn(|msg, _ctx| {
                    let authorized = match &msg {
                        WireMessage::Request(r) => {
                            r.params
                                .as_ref()
                                .and_then(|p| p.get("token"))
                                .and_then(Value::as_str)
                                == Some("sesame")
                        }
                        _ => true,
                    };
                    if authorized {
                        StageVerdict::Forward(msg)
                    } else {
                        StageVerdict::Terminate {
                            reply: WireMessage::ResponseError(ResponseError::new(
                                WireError::from_error(
                                    &RpcError::Application("unauthorized".into()),
                                    true,
                                ),
                            )),
                        }
                    }
                }),
                reverse: Box::new(IdentityStage),
            }),
        ),
    );

    let manifest = ClientManifest::new().register("guarded", CallerKind::Unary);
    let client = RpcClient::new(manifest, common::connect(server), ClientConfig::default());

    // Rejected: the handler never runs
    match client.call_unary("guarded", Some(json!({"token": "wrong"}))).await {
        Err(RpcError::Remote { message, .. }) => assert!(message.contains("unauthorized")),
        other => panic!("expected remote rejection, got {:?}", other),
    }
    assert!(!reached.load(Ordering::SeqCst));

    // Authorized: the call proceeds normally
    let reply = client
        .call_unary("guarded", Some(json!({"token": "sesame"})))
        .await
        .unwrap();
    assert_eq!(reply, json!({"token": "sesame"}));
    assert!(reached.load(Ordering::SeqCst));
}

#[tokio::test]
async fn test_calls_run_concurrently() {
    // A slow call must not block a fast one
    let manifest = Manifest::new()
        .register(
            "slow",
            handlers::unary(|_cx, _| async move {
                tokio::time::sleep(std::time::Duration::from_millis(300)).await;
                Ok(json!("slow"))
            }),
        )
        .register(
            "fast",
            handlers::unary(|_cx, _| async move { Ok(json!("fast")) }),
        );
    let server = Arc::new(RpcServer::new(manifest, (), ServerConfig::default()));

    let manifest = ClientManifest::new()
        .register("slow", CallerKind::Unary)
        .register("fast", CallerKind::Unary);
    let client = Arc::new(RpcClient::new(
        manifest,
        common::connect(server),
        ClientConfig::default(),
    ));

    let slow = {
        let client = client.clone();
        tokio::spawn(async move { client.call_unary("slow", None).await })
    };
    tokio::time::sleep(std::time::Duration::from_millis(50)).await;

    let started = std::time::Instant::now();
    let fast = client.call_unary("fast", None).await.unwrap();
    assert_eq!(fast, json!("fast"));
    assert!(
        started.elapsed() < std::time::Duration::from_millis(200),
        "fast call was blocked behind the slow one"
    );
    assert_eq!(slow.await.unwrap().unwrap(), json!("slow"));
}
