//! StrandRPC Transport Layer
//!
//! The runtime owns no sockets. A transport layer (QUIC, TCP, unix sockets,
//! an in-process pipe — anything that can move bytes both ways) opens one
//! duplex byte channel per logical call and hands it to the runtime. This
//! module defines that channel abstraction and the codec that recovers
//! protocol messages from the raw byte stream.
//!
//! # Components
//!
//! - **[`ByteChannel`]** - one call's transport: a readable end, a writable
//!   end, a cancel hook, and connection metadata
//! - **[`JsonFrameDecoder`]** / **[`MessageReader`]** - incremental JSON
//!   framing with no length prefix; boundaries come from JSON structural
//!   balance alone
//! - **[`memory`]** - an in-process channel pair for tests and embedding
//!
//! # Message Size Limits
//!
//! The decoder enforces a configurable cap on the re-assembly buffer
//! (default 10 MB) so a peer cannot exhaust memory with one unterminated
//! message.

pub mod codec;
pub mod memory;


pub use codec::{
    encode_message, write_message, JsonFrameDecoder, MessageReader, DEFAULT_MAX_MESSAGE_SIZE,
};
pub use memory::memory_channel_pair;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};

use crate::protocol::RpcError;

/// Boxed readable end of a channel.
pub type ChannelReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed writable end of a channel.
pub type ChannelWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Transport-supplied connection metadata, made visible to handlers.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMeta {
    pub local_addr: Option<SocketAddr>,
    pub remote_addr: Option<SocketAddr>,
    /// Peer identity as established by the transport (e.g. a node id
    /// derived from its TLS certificate), when available
    pub peer_identity: Option<String>,
}

/// Hook that forcibly tears down a channel's transport-level resource.
///
/// The hook fires at most once; later invocations are no-ops. It is
/// cloneable so the runtime can keep one handle in its active-call registry
/// (for forced shutdown) while the call's own plumbing holds another.
#[derive(Clone)]
pub struct CancelHandle {
    hook: Arc<Mutex<Option<Box<dyn FnOnce(RpcError) + Send>>>>,
}

impl CancelHandle {
    pub fn new(hook: impl FnOnce(RpcError) + Send + 'static) -> Self {
        Self {
            hook: Arc::new(Mutex::new(Some(Box::new(hook)))),
        }
    }

    /// A handle that does nothing; for transports whose resources are
    /// released by dropping the channel ends.
    pub fn noop() -> Self {
        Self {
            hook: Arc::new(Mutex::new(None)),
        }
    }

    /// Severs the transport, passing the reason through to the hook.
    /// Idempotent.
    pub fn cancel(&self, reason: RpcError) {
        let hook = match self.hook.lock() {
            Ok(mut slot) => slot.take(),
            Err(_) => None,
        };
        if let Some(hook) = hook {
            tracing::debug!(reason = %reason, "severing channel transport");
            hook(reason);
        }
    }
}

impl std::fmt::Debug for CancelHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("CancelHandle")
    }
}

/// One logical call's transport: an already-open pair of byte stream ends.
///
/// The transport layer that created the channel owns it; the runtime only
/// reads, writes, and may invoke the cancel hook. Dropping the ends closes
/// them.
pub struct ByteChannel {
    reader: ChannelReader,
    writer: ChannelWriter,
    cancel: CancelHandle,
    meta: ConnectionMeta,
}

impl ByteChannel {
    pub fn new(reader: ChannelReader, writer: ChannelWriter, cancel: CancelHandle) -> Self {
        Self {
            reader,
            writer,
            cancel,
            meta: ConnectionMeta::default(),
        }
    }

    pub fn with_meta(mut self, meta: ConnectionMeta) -> Self {
        self.meta = meta;
        self
    }

    pub fn meta(&self) -> &ConnectionMeta {
        &self.meta
    }

    /// Forcibly tears down the transport resource behind this channel.
    pub fn cancel(&self, reason: RpcError) {
        self.cancel.cancel(reason);
    }

    /// Splits the channel into its parts for independent pumping.
    pub fn into_parts(self) -> (ChannelReader, ChannelWriter, CancelHandle, ConnectionMeta) {
        (self.reader, self.writer, self.cancel, self.meta)
    }
}
