//! StrandRPC Common Types and Plumbing
//!
//! This crate provides the core protocol definitions and shared plumbing for
//! the StrandRPC streaming protocol runtime.
//!
//! # Overview
//!
//! StrandRPC (Streaming RPC over Abstract Nonspecific Duplex channels) is a
//! transport-agnostic request/response and streaming-call framework. The
//! runtime never opens sockets itself: a transport layer hands it one duplex
//! byte channel per logical call, and everything above that — framing,
//! envelopes, cancellation, middleware — lives in this workspace. This crate
//! contains the pieces shared by both the server and the client role:
//!
//! - **Protocol Layer**: envelope types, error taxonomy, and the wire error
//!   form that carries cause chains across the network
//! - **Transport Layer**: the duplex byte channel abstraction and the
//!   incremental JSON frame codec
//! - **Call Context**: cancellation token plus resettable deadline, one per
//!   active call
//! - **Middleware**: per-call forward/reverse envelope transform stages
//!
//! # Wire Format
//!
//! Messages are UTF-8 JSON values concatenated with no delimiter or length
//! prefix; message boundaries are recovered purely from JSON structural
//! balance. Every message conforms to one of four JSON-RPC 2.0 shapes
//! (request, notification, response result, response error).
//!
//! # Example
//!
//! ```
//! use strandrpc_common::protocol::{Request, WireMessage};
//! use strandrpc_common::transport::encode_message;
//! use serde_json::json;
//!
//! let request = Request::new("echo", Some(json!({"msg": "hello"})));
//! let bytes = encode_message(&WireMessage::Request(request)).unwrap();
//! assert!(bytes.starts_with(b"{"));
//! ```

pub mod context;
pub mod middleware;
pub mod protocol;
pub mod transport;

pub use context::{CallContext, CancelReason, Deadline};
pub use middleware::{MiddlewareFactory, MiddlewareStage, StagePair, StageVerdict};
pub use protocol::{Result, RpcError, WireError, WireMessage};
pub use transport::{ByteChannel, CancelHandle, ConnectionMeta};
