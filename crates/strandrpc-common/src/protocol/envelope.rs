//! JSON-RPC 2.0 Envelope Shapes
//!
//! Every message on a call's channel is one of four shapes:
//!
//! - Request: `{"jsonrpc": "2.0", "method": "...", "params": ..., "id": ...}`
//! - Notification: the same without `id`
//! - ResponseResult: `{"jsonrpc": "2.0", "result": ..., "id": ...}`
//! - ResponseError: `{"jsonrpc": "2.0", "error": {...}, "id": ...}`
//!
//! One channel carries exactly one logical call, so responses are never
//! correlated against request ids: the runtime always stamps `id: null` on
//! outgoing traffic. A parsed JSON value conforming to none of the four
//! shapes is rejected with a parse error describing the encountered value.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::protocol::error::{Result, RpcError};
use crate::protocol::wire_error::WireError;

/// JSON-RPC version stamped on every outgoing envelope
pub const JSONRPC_VERSION: &str = "2.0";

/// A call-opening or streaming request.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Request {
    pub jsonrpc: String,
    /// Name of the method to invoke
    pub method: String,
    /// Parameter value, omitted when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Request identifier (string, number, or null)
    pub id: Value,
}

/// A request without an id; the sender expects no response.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Notification {
    pub jsonrpc: String,
    pub method: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

/// A successful response carrying one result item.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseResult {
    pub jsonrpc: String,
    pub result: Value,
    pub id: Value,
}

/// A failed response carrying a serialized error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ResponseError {
    pub jsonrpc: String,
    pub error: WireError,
    pub id: Value,
}

impl Request {
    /// Creates a request stamped with the protocol version and a null id.
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
            id: Value::Null,
        }
    }
}

impl Notification {
    pub fn new(method: impl Into<String>, params: Option<Value>) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            method: method.into(),
            params,
        }
    }
}

impl ResponseResult {
    pub fn new(result: Value) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            result,
            id: Value::Null,
        }
    }
}

impl ResponseError {
    pub fn new(error: WireError) -> Self {
        Self {
            jsonrpc: JSONRPC_VERSION.into(),
            error,
            id: Value::Null,
        }
    }
}

/// A parsed protocol message, classified into exactly one of the four
/// envelope shapes.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(untagged)]
pub enum WireMessage {
    Request(Request),
    Notification(Notification),
    ResponseResult(ResponseResult),
    ResponseError(ResponseError),
}

impl WireMessage {
    /// Classifies a parsed JSON value into one of the four envelope shapes.
    ///
    /// Classification is by structure: a `method` field makes the value a
    /// request (with `id`) or notification (without), a `result` field a
    /// response result, an `error` field a response error. Anything else is
    /// rejected with a parse error describing the encountered value.
    ///
    /// # Errors
    ///
    /// Returns [`RpcError::Parse`] when the value is not an object, lacks
    /// the `"2.0"` version stamp, carries an id that is not a string,
    /// number, or null, or matches none of the shapes.
    pub fn classify(value: Value) -> Result<Self> {
        let obj = match value.as_object() {
            Some(obj) => obj,
            None => {
                return Err(RpcError::Parse(format!(
                    "expected a protocol message object, got: {}",
                    summarize(&value)
                )));
            }
        };

        match obj.get("jsonrpc").and_then(Value::as_str) {
            Some(JSONRPC_VERSION) => {}
            _ => {
                return Err(RpcError::Parse(format!(
                    "missing or invalid \"jsonrpc\" version in: {}",
                    summarize(&value)
                )));
            }
        }

        if obj.contains_key("method") {
            if obj.contains_key("id") {
                validate_id(obj.get("id"), &value)?;
                let request = serde_json::from_value::<Request>(value.clone())
                    .map_err(|e| shape_error("request", &value, e))?;
                return Ok(WireMessage::Request(request));
            }
            let notification = serde_json::from_value::<Notification>(value.clone())
                .map_err(|e| shape_error("notification", &value, e))?;
            return Ok(WireMessage::Notification(notification));
        }

        if obj.contains_key("result") {
            validate_id(obj.get("id"), &value)?;
            let response = serde_json::from_value::<ResponseResult>(value.clone())
                .map_err(|e| shape_error("response result", &value, e))?;
            return Ok(WireMessage::ResponseResult(response));
        }

        if obj.contains_key("error") {
            validate_id(obj.get("id"), &value)?;
            let response = serde_json::from_value::<ResponseError>(value.clone())
                .map_err(|e| shape_error("response error", &value, e))?;
            return Ok(WireMessage::ResponseError(response));
        }

        Err(RpcError::Parse(format!(
            "value conforms to no protocol message shape: {}",
            summarize(&value)
        )))
    }
}

fn validate_id(id: Option<&Value>, value: &Value) -> Result<()> {
    match id {
        Some(Value::String(_)) | Some(Value::Number(_)) | Some(Value::Null) | None => Ok(()),
        Some(_) => Err(RpcError::Parse(format!(
            "message id must be a string, number, or null in: {}",
            summarize(value)
        ))),
    }
}

fn shape_error(shape: &str, value: &Value, err: serde_json::Error) -> RpcError {
    RpcError::Parse(format!(
        "malformed {} envelope ({}): {}",
        shape,
        err,
        summarize(value)
    ))
}

/// Renders a value for an error message, truncated so a hostile peer cannot
/// inflate diagnostics.
fn summarize(value: &Value) -> String {
    const MAX: usize = 120;
    let mut rendered = value.to_string();
    if rendered.len() > MAX {
        let mut cut = MAX;
        while !rendered.is_char_boundary(cut) {
            cut -= 1;
        }
        rendered.truncate(cut);
        rendered.push_str("...");
    }
    rendered
}
