//! Error fidelity across the wire: kinds survive serialization, sensitive
//! mode strips diagnostics, and stream-level failures surface exactly once.

mod common;

use std::sync::Arc;

use futures::StreamExt;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;

use strandrpc_client::{CallerKind, ClientConfig, ClientManifest, RpcClient};
use strandrpc_common::protocol::RpcError;
use strandrpc_common::transport::{memory_channel_pair, MessageReader, DEFAULT_MAX_MESSAGE_SIZE};
use strandrpc_server::{handlers, Manifest, RpcServer, ServerConfig};

fn failing_server(config: ServerConfig) -> Arc<RpcServer<()>> {
    let manifest = Manifest::new()
        .register(
            "explode",
            handlers::unary(|_cx, _| async move {
                Err::<Value, _>(RpcError::Application("kaboom".into()))
            }),
        )
        .register(
            "flaky_feed",
            handlers::server_stream(|_cx, _| async move {
                Ok(futures::stream::iter(vec![
                    Ok(json!(1)),
                    Ok(json!(2)),
                    Err(RpcError::Application("feed broke".into())),
                ])
                .boxed())
            }),
        );
    Arc::new(RpcServer::new(manifest, (), config))
}

#[tokio::test]
async fn test_handler_error_arrives_as_remote_cause() {
    let server = failing_server(ServerConfig::default());
    let client = RpcClient::new(
        ClientManifest::new().register("explode", CallerKind::Unary),
        common::connect(server),
        ClientConfig::default(),
    );

    match client.call_unary("explode", None).await {
        Err(RpcError::Remote {
            code,
            message,
            stack,
            cause,
        }) => {
            assert_eq!(code, -32000);
            assert!(message.contains("kaboom"));
            // Default mode carries the peer's diagnostic trace
            assert!(stack.is_some());
            match cause.as_deref() {
                Some(RpcError::Application(msg)) => assert_eq!(msg, "kaboom"),
                other => panic!("expected application cause, got {:?}", other),
            }
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_sensitive_mode_strips_stack() {
    let server = failing_server(ServerConfig {
        sensitive: true,
        ..ServerConfig::default()
    });
    let client = RpcClient::new(
        ClientManifest::new().register("explode", CallerKind::Unary),
        common::connect(server),
        ClientConfig::default(),
    );

    match client.call_unary("explode", None).await {
        Err(RpcError::Remote { stack, cause, .. }) => {
            assert!(stack.is_none(), "sensitive mode must strip the trace");
            // The kind still reconstructs
            assert!(matches!(cause.as_deref(), Some(RpcError::Application(_))));
        }
        other => panic!("expected remote error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_stream_error_is_terminal_and_keeps_prior_items() {
    let server = failing_server(ServerConfig::default());
    let client = RpcClient::new(
        ClientManifest::new().register("flaky_feed", CallerKind::ServerStream),
        common::connect(server),
        ClientConfig::default(),
    );

    let mut stream = client.call_server_stream("flaky_feed", None).await.unwrap();
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(1));
    assert_eq!(stream.next().await.unwrap().unwrap(), json!(2));
    match stream.next().await {
        Some(Err(RpcError::Remote { message, .. })) => assert!(message.contains("feed broke")),
        other => panic!("expected terminal remote error, got {:?}", other),
    }
    // Exactly once: the stream is finished afterwards
    assert!(stream.next().await.is_none());
}

#[tokio::test]
async fn test_non_json_noise_fails_the_call_with_parse_error() {
    let server = failing_server(ServerConfig::default());
    let mut events = server.subscribe();

    let (client_end, server_end) = memory_channel_pair(common::PIPE_CAPACITY);
    server.handle_stream(server_end);

    let (reader, mut writer, _cancel, _meta) = client_end.into_parts();
    writer.write_all(b"this is not json").await.unwrap();
    writer.shutdown().await.unwrap();

    let mut messages = MessageReader::new(reader, DEFAULT_MAX_MESSAGE_SIZE);
    let reply = messages.next_message().await.unwrap().unwrap();
    assert_eq!(reply["error"]["code"], json!(-32700));

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("expected an error event")
        .unwrap();
    assert_eq!(event.code, -32700);
}

#[tokio::test]
async fn test_oversized_message_fails_with_length_error() {
    // Cap far below the request size; the message arrives in read-sized
    // chunks, so the re-assembly buffer trips the limit before the value
    // completes
    let server = failing_server(ServerConfig {
        max_message_size: 256,
        ..ServerConfig::default()
    });
    let mut events = server.subscribe();

    let client = RpcClient::new(
        ClientManifest::new().register("explode", CallerKind::Unary),
        common::connect(server),
        ClientConfig::default(),
    );

    let huge = json!({"blob": "x".repeat(32 * 1024)});
    match client.call_unary("explode", Some(huge)).await {
        Err(RpcError::Remote { code, cause, .. }) => {
            assert_eq!(code, -32001);
            assert!(matches!(
                cause.as_deref(),
                Some(RpcError::MessageLength { .. })
            ));
        }
        other => panic!("expected remote length error, got {:?}", other),
    }

    let event = tokio::time::timeout(std::time::Duration::from_secs(2), events.recv())
        .await
        .expect("expected an error event")
        .unwrap();
    assert_eq!(event.code, -32001);
}
