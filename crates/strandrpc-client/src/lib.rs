//! StrandRPC Client
//!
//! The client side of the StrandRPC runtime: given a stream factory that
//! opens one duplex byte channel per outbound call and a manifest declaring
//! each method's call shape, [`RpcClient`] exposes a strongly-shaped call
//! per method name.
//!
//! # Call Shapes
//!
//! - **Unary**: write one request, await exactly one response
//! - **ServerStream**: write one request, consume a lazy, finite stream of
//!   results
//! - **ClientStream**: write a stream of params, await one deferred result
//! - **Duplex**: independent writable and readable ends; closing the
//!   writable does not stop reading
//! - **Raw**: one JSON envelope each way, then raw byte ends
//!
//! A caller never retries a failed call; the failure surfaces to the
//! invoker exactly once. Each call invokes the stream factory exactly once.
//!
//! # Example
//!
//! ```no_run
//! use strandrpc_client::{CallerKind, ClientConfig, ClientManifest, RpcClient};
//! use strandrpc_common::transport::ByteChannel;
//! use serde_json::json;
//!
//! # async fn example(open_channel: impl Fn() -> ByteChannel + Send + Sync + 'static) {
//! let manifest = ClientManifest::new().register("echo", CallerKind::Unary);
//! let client = RpcClient::new(
//!     manifest,
//!     strandrpc_client::stream_factory(move || {
//!         let channel = open_channel();
//!         async move { Ok(channel) }
//!     }),
//!     ClientConfig::default(),
//! );
//! let reply = client.call_unary("echo", Some(json!({"msg": "hi"}))).await;
//! # }
//! ```

pub mod callers;
pub mod client;

pub use callers::{CallerKind, ClientManifest};
pub use client::{
    stream_factory, ClientConfig, ClientStreamCall, DuplexSink, RawCall, RpcClient, StreamFactory,
};
