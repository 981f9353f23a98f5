//! In-process channel pair
//!
//! Builds two [`ByteChannel`]s wired back to back, so a server and client
//! can talk without any real transport. Used throughout the workspace's
//! tests and useful to embedders exercising their manifests.

use tokio::io::split;

use crate::transport::{ByteChannel, CancelHandle};

/// Creates a connected pair of byte channels with the given pipe capacity.
///
/// Bytes written to either channel become readable on the other. The
/// channels carry no-op cancel hooks; dropping the ends releases the pipe.
pub fn memory_channel_pair(capacity: usize) -> (ByteChannel, ByteChannel) {
    let (a, b) = tokio::io::duplex(capacity);
    let (a_read, a_write) = split(a);
    let (b_read, b_write) = split(b);

    let a_channel = ByteChannel::new(Box::new(a_read), Box::new(a_write), CancelHandle::noop());
    let b_channel = ByteChannel::new(Box::new(b_read), Box::new(b_write), CancelHandle::noop());
    (a_channel, b_channel)
}
