//! Shared helpers for the end-to-end tests: a stream factory that opens an
//! in-memory channel pair per call and pushes the far end into a server.

// Not every test binary uses every helper
#![allow(dead_code)]

use std::sync::Arc;

use strandrpc_client::{stream_factory, StreamFactory};
use strandrpc_common::transport::memory_channel_pair;
use strandrpc_server::RpcServer;

/// Pipe capacity for the in-memory channels.
pub const PIPE_CAPACITY: usize = 64 * 1024;

/// Captures runtime logs per test.
pub fn init_tracing() {
    static INIT: std::sync::Once = std::sync::Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    });
}

/// Builds a client stream factory wired straight into `server`: every call
/// opens a fresh channel pair and hands the server its end.
pub fn connect<D: Send + Sync + 'static>(server: Arc<RpcServer<D>>) -> StreamFactory {
    init_tracing();
    stream_factory(move || {
        let server = server.clone();
        async move {
            let (client_end, server_end) = memory_channel_pair(PIPE_CAPACITY);
            server.handle_stream(server_end);
            Ok(client_end)
        }
    })
}
