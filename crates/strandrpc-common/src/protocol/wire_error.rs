//! Wire Form of Errors
//!
//! Outgoing errors serialize as `{code, message, data}`, where `data`
//! carries the stable kind name, kind-specific structured fields, the
//! recursively serialized cause chain, and — unless sensitive mode is
//! active — a diagnostic trace captured at serialization time. The
//! receiving side reconstructs a [`RpcError::Remote`] whose cause is the
//! rebuilt original kind, so cause chains survive the network.

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::protocol::error::{RpcError, APPLICATION_ERROR};

/// Serialized error as it travels inside a response-error envelope.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireError {
    /// Error code (see the constants in [`crate::protocol::error`])
    pub code: i32,
    /// Human-readable description
    pub message: String,
    /// Structured diagnostic payload, absent only for foreign peers
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<WireErrorData>,
}

/// Diagnostic payload of a [`WireError`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireErrorData {
    /// Stable kind name, e.g. `"Timeout"`
    pub kind: String,
    /// Diagnostic trace; stripped in sensitive mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Kind-specific structured fields needed to rebuild the kind
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<Value>,
    /// Serialized cause, one level down the chain
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cause: Option<Box<WireError>>,
}

impl WireError {
    /// Serializes an error for the wire.
    ///
    /// When `sensitive` is true the diagnostic trace is omitted; `code`,
    /// `message`, and the structured fields required to reconstruct the
    /// kind are always conveyed.
    pub fn from_error(error: &RpcError, sensitive: bool) -> Self {
        let stack = if sensitive {
            None
        } else {
            Some(std::backtrace::Backtrace::force_capture().to_string())
        };

        let cause = match error {
            RpcError::Remote {
                cause: Some(inner), ..
            } => Some(Box::new(WireError::from_error(inner, sensitive))),
            _ => None,
        };

        WireError {
            code: error.code(),
            message: error.to_string(),
            data: Some(WireErrorData {
                kind: error.kind().to_string(),
                stack,
                detail: detail_for(error),
                cause,
            }),
        }
    }

    /// Reconstructs the received error as a [`RpcError::Remote`] wrapping
    /// the rebuilt original kind.
    pub fn to_error(&self) -> RpcError {
        let stack = self.data.as_ref().and_then(|d| d.stack.clone());
        let cause = self.data.as_ref().map(reconstruct_kind);
        RpcError::Remote {
            code: self.code,
            message: self.message.clone(),
            stack,
            cause: cause.map(Box::new),
        }
    }
}

/// Kind-specific fields carried alongside the kind name.
fn detail_for(error: &RpcError) -> Option<Value> {
    match error {
        RpcError::Parse(msg)
        | RpcError::OutputStream(msg)
        | RpcError::Application(msg) => Some(json!({ "message": msg })),
        RpcError::MessageLength { size, limit } => {
            Some(json!({ "size": size, "limit": limit }))
        }
        RpcError::Timeout(ms) => Some(json!({ "timeout_ms": ms })),
        RpcError::MethodNotFound(method) => Some(json!({ "method": method })),
        RpcError::Remote { code, message, .. } => {
            Some(json!({ "code": code, "message": message }))
        }
        RpcError::Io(err) => Some(json!({ "message": err.to_string() })),
        RpcError::Json(err) => Some(json!({ "message": err.to_string() })),
        RpcError::Stopping | RpcError::StreamEnded => None,
    }
}

/// Rebuilds the original error kind from its wire data.
///
/// Unknown kinds degrade to [`RpcError::Application`] so a newer peer never
/// breaks an older one.
fn reconstruct_kind(data: &WireErrorData) -> RpcError {
    let detail = data.detail.as_ref();
    let field = |name: &str| -> Option<&Value> { detail.and_then(|d| d.get(name)) };
    let message = field("message")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match data.kind.as_str() {
        "Parse" | "Json" => RpcError::Parse(message),
        "MessageLength" => RpcError::MessageLength {
            size: field("size").and_then(Value::as_u64).unwrap_or(0) as usize,
            limit: field("limit").and_then(Value::as_u64).unwrap_or(0) as usize,
        },
        "Timeout" => RpcError::Timeout(field("timeout_ms").and_then(Value::as_u64).unwrap_or(0)),
        "Stopping" => RpcError::Stopping,
        "StreamEnded" => RpcError::StreamEnded,
        "OutputStream" => RpcError::OutputStream(message),
        "MethodNotFound" => RpcError::MethodNotFound(
            field("method")
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string(),
        ),
        "Io" => RpcError::Io(std::io::Error::other(message)),
        "Remote" => RpcError::Remote {
            code: field("code")
                .and_then(Value::as_i64)
                .unwrap_or(APPLICATION_ERROR as i64) as i32,
            message,
            stack: data.stack.clone(),
            cause: data.cause.as_ref().map(|c| Box::new(c.to_error())),
        },
        _ => RpcError::Application(if message.is_empty() {
            data.kind.clone()
        } else {
            message
        }),
    }
}
