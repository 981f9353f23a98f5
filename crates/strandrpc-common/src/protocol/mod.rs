//! StrandRPC Protocol Layer
//!
//! This module defines the JSON-RPC 2.0 envelope shapes carried over a call's
//! byte channel, the runtime error taxonomy, and the wire form errors take
//! when they cross the network.
//!
//! # Components
//!
//! - **[`envelope`]** - The four message shapes and classification of parsed
//!   JSON values into them
//! - **[`error`]** - The [`RpcError`] taxonomy and error code constants
//! - **[`wire_error`]** - `{code, message, data}` serialization of errors,
//!   including cause chains and the sensitive mode that strips diagnostics

pub mod envelope;
pub mod error;
pub mod wire_error;


pub use envelope::{Notification, Request, ResponseError, ResponseResult, WireMessage};
pub use error::{Result, RpcError};
pub use wire_error::{WireError, WireErrorData};
