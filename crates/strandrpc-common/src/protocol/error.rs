use thiserror::Error;

// JSON-RPC 2.0 error codes, plus runtime-specific codes in the
// -32000..-32099 server error range.
/// Invalid JSON, or a value conforming to none of the message shapes
pub const PARSE_ERROR: i32 = -32700;
/// The requested method does not exist in the manifest
pub const METHOD_NOT_FOUND: i32 = -32601;
/// Internal runtime error
pub const INTERNAL_ERROR: i32 = -32603;
/// Application-level handler error
pub const APPLICATION_ERROR: i32 = -32000;
/// Re-assembly buffer exceeded the configured cap
pub const MESSAGE_TOO_LARGE: i32 = -32001;
/// Call deadline elapsed
pub const TIMEOUT: i32 = -32002;
/// Runtime shutdown in progress
pub const STOPPING: i32 = -32003;
/// Channel closed while the call was still pending
pub const STREAM_ENDED: i32 = -32004;
/// The outgoing side of a channel failed or was cancelled
pub const OUTPUT_STREAM: i32 = -32005;

/// Error taxonomy for the RPC runtime.
///
/// Every failure a call can experience is one of these kinds. Local kinds
/// are raised directly; a peer's failure arrives as [`RpcError::Remote`]
/// wrapping the reconstructed original kind as its cause.
#[derive(Error, Debug)]
pub enum RpcError {
    /// Malformed JSON or a value conforming to no message shape
    #[error("Parse error: {0}")]
    Parse(String),

    /// The codec's re-assembly buffer exceeded the configured cap
    #[error("Message too large: {size} bytes buffered (max {limit} bytes)")]
    MessageLength { size: usize, limit: usize },

    /// The call's deadline elapsed
    #[error("Call timed out after {0}ms")]
    Timeout(u64),

    /// The runtime is shutting down
    #[error("RPC runtime is stopping")]
    Stopping,

    /// The channel closed while the call was still pending
    #[error("Stream ended before the call completed")]
    StreamEnded,

    /// The outgoing side of the channel failed or was cancelled
    #[error("Output stream failed: {0}")]
    OutputStream(String),

    /// No handler or caller registered under the method name
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    /// An application-level error raised by a handler
    #[error("{0}")]
    Application(String),

    /// A response-error envelope received from the peer
    #[error("Remote error ({code}): {message}")]
    Remote {
        code: i32,
        message: String,
        /// Peer-side diagnostic trace, absent when the peer ran in
        /// sensitive mode
        stack: Option<String>,
        #[source]
        cause: Option<Box<RpcError>>,
    },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

impl RpcError {
    /// The wire error code for this kind.
    pub fn code(&self) -> i32 {
        match self {
            RpcError::Parse(_) | RpcError::Json(_) => PARSE_ERROR,
            RpcError::MessageLength { .. } => MESSAGE_TOO_LARGE,
            RpcError::Timeout(_) => TIMEOUT,
            RpcError::Stopping => STOPPING,
            RpcError::StreamEnded => STREAM_ENDED,
            RpcError::OutputStream(_) => OUTPUT_STREAM,
            RpcError::MethodNotFound(_) => METHOD_NOT_FOUND,
            RpcError::Application(_) => APPLICATION_ERROR,
            RpcError::Remote { code, .. } => *code,
            RpcError::Io(_) => INTERNAL_ERROR,
        }
    }

    /// Stable kind name used to reconstruct the error on the far side.
    pub fn kind(&self) -> &'static str {
        match self {
            RpcError::Parse(_) => "Parse",
            RpcError::MessageLength { .. } => "MessageLength",
            RpcError::Timeout(_) => "Timeout",
            RpcError::Stopping => "Stopping",
            RpcError::StreamEnded => "StreamEnded",
            RpcError::OutputStream(_) => "OutputStream",
            RpcError::MethodNotFound(_) => "MethodNotFound",
            RpcError::Application(_) => "Application",
            RpcError::Remote { .. } => "Remote",
            RpcError::Io(_) => "Io",
            RpcError::Json(_) => "Json",
        }
    }
}

pub type Result<T> = std::result::Result<T, RpcError>;
