//! Graceful and forced shutdown behavior.

mod common;

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use strandrpc_client::{CallerKind, ClientConfig, ClientManifest, RpcClient};
use strandrpc_common::context::{CallContext, CancelReason};
use strandrpc_common::protocol::{Request, RpcError, WireMessage};
use strandrpc_common::transport::{
    write_message, ByteChannel, CancelHandle, MessageReader, DEFAULT_MAX_MESSAGE_SIZE,
};
use strandrpc_server::{handlers, Manifest, RpcServer, ServerConfig};

#[tokio::test]
async fn test_graceful_stop_waits_for_in_flight_calls() {
    let manifest = Manifest::new().register(
        "linger",
        handlers::unary(|_cx, _| async move {
            tokio::time::sleep(Duration::from_millis(250)).await;
            Ok(json!("done"))
        }),
    );
    let server = Arc::new(RpcServer::new(manifest, (), ServerConfig::default()));

    let client = RpcClient::new(
        ClientManifest::new().register("linger", CallerKind::Unary),
        common::connect(server.clone()),
        ClientConfig::default(),
    );

    let call = tokio::spawn(async move { client.call_unary("linger", None).await });
    // Let the call get registered before stopping
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(server.active_calls(), 1);

    let stopping = Instant::now();
    server.stop().await;
    assert!(
        stopping.elapsed() >= Duration::from_millis(150),
        "graceful stop returned before the call finished"
    );
    assert_eq!(server.active_calls(), 0);
    assert_eq!(call.await.unwrap().unwrap(), json!("done"));
}

#[tokio::test]
async fn test_stopping_server_refuses_new_calls() {
    let manifest = Manifest::new().register(
        "echo",
        handlers::unary(|_cx, params| async move { Ok(params.unwrap_or(Value::Null)) }),
    );
    let server = Arc::new(RpcServer::new(manifest, (), ServerConfig::default()));
    server.stop().await;
    assert!(server.is_stopping());

    let client = RpcClient::new(
        ClientManifest::new().register("echo", CallerKind::Unary),
        common::connect(server),
        ClientConfig::default(),
    );
    match client.call_unary("echo", None).await {
        Err(RpcError::Remote { code, cause, .. }) => {
            assert_eq!(code, -32003);
            assert!(matches!(cause.as_deref(), Some(RpcError::Stopping)));
        }
        other => panic!("expected remote stopping error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_forced_stop_cancels_contexts_and_severs_channels() {
    let captured: Arc<Mutex<Option<CallContext>>> = Arc::new(Mutex::new(None));
    let capture = captured.clone();

    let manifest = Manifest::new().register(
        "hang",
        handlers::duplex(move |cx, _input| {
            let capture = capture.clone();
            async move {
                *capture.lock().unwrap() = Some(cx.ctx.clone());
                // Never produces; only shutdown ends this call
                Ok(futures::stream::pending().boxed())
            }
        }),
    );
    let server = Arc::new(RpcServer::new(manifest, (), ServerConfig::default()));

    // Hand-built channel so the cancel hook's reason is observable
    let (client_io, server_io) = tokio::io::duplex(common::PIPE_CAPACITY);
    let (client_read, mut client_write) = tokio::io::split(client_io);
    let (server_read, server_write) = tokio::io::split(server_io);

    let severed: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let seen = severed.clone();
    let hook = CancelHandle::new(move |reason| {
        *seen.lock().unwrap() = Some(reason.to_string());
    });
    server.handle_stream(ByteChannel::new(
        Box::new(server_read),
        Box::new(server_write),
        hook,
    ));

    // Open the call
    write_message(
        &mut client_write,
        &WireMessage::Request(Request::new("hang", None)),
    )
    .await
    .unwrap();

    // Wait until the call is registered
    for _ in 0..100 {
        if server.active_calls() == 1 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(server.active_calls(), 1);

    tokio::time::timeout(Duration::from_secs(2), server.stop_force())
        .await
        .expect("forced stop must drain promptly");
    assert_eq!(server.active_calls(), 0);

    // The channel's cancel hook fired with the stopping reason
    let reason = severed.lock().unwrap().clone().expect("hook not invoked");
    assert!(reason.contains("stopping"), "unexpected reason: {}", reason);

    // The handler's context was cancelled with the same reason
    let ctx = captured.lock().unwrap().clone().expect("handler never ran");
    assert!(ctx.is_cancelled());
    assert_eq!(ctx.reason(), Some(CancelReason::Stopping));

    // The peer was told why before the channel closed
    let mut messages = MessageReader::new(client_read, DEFAULT_MAX_MESSAGE_SIZE);
    let reply = messages.next_message().await.unwrap().unwrap();
    assert_eq!(reply["error"]["code"], json!(-32003));
    let _ = client_write.shutdown().await;
}
