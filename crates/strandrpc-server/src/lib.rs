//! StrandRPC Server
//!
//! The server side of the StrandRPC runtime: it accepts one duplex byte
//! channel per inbound call, reads the leading request to select a handler
//! from its manifest, builds the call's context, runs the middleware and
//! the handler, tracks every in-flight call, and supports graceful and
//! forced shutdown.
//!
//! # Call Shapes
//!
//! Five handler kinds share the same codec and channel substrate:
//!
//! - **Unary**: one request in, one response out
//! - **ServerStream**: one request in, a stream of results out
//! - **ClientStream**: a stream of requests in, one response out
//! - **Duplex**: both directions stream, fully concurrently
//! - **Raw**: one JSON envelope each way, opaque bytes after
//!
//! # Example
//!
//! ```no_run
//! use strandrpc_server::{handlers, Manifest, RpcServer, ServerConfig};
//! use serde_json::Value;
//!
//! # async fn example() {
//! let manifest = Manifest::new().register(
//!     "echo",
//!     handlers::unary(|_cx, params| async move { Ok(params.unwrap_or(Value::Null)) }),
//! );
//! let server = RpcServer::new(manifest, (), ServerConfig::default());
//! // A transport layer calls server.handle_stream(channel) once per call.
//! # }
//! ```

pub mod handlers;
pub mod manifest;
pub mod registry;
pub mod server;

pub use handlers::{
    CallCx, ClientStreamHandler, DuplexHandler, Handler, RawHandler, ServerStreamHandler,
    UnaryHandler,
};
pub use manifest::Manifest;
pub use server::{ErrorEvent, RpcServer, ServerConfig};
