//! Caller Kinds and the Client Manifest
//!
//! The client's manifest declares, per method name, which call shape the
//! peer serves it under. Shapes are checked at call time: invoking a method
//! through the wrong shape is a local error, before any channel is opened.

use std::collections::HashMap;

/// The five call shapes, mirroring the server's handler kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallerKind {
    Unary,
    ServerStream,
    ClientStream,
    Duplex,
    Raw,
}

impl CallerKind {
    pub fn name(&self) -> &'static str {
        match self {
            CallerKind::Unary => "unary",
            CallerKind::ServerStream => "server_stream",
            CallerKind::ClientStream => "client_stream",
            CallerKind::Duplex => "duplex",
            CallerKind::Raw => "raw",
        }
    }
}

/// Immutable mapping from method name to call shape. Built once at client
/// construction; method names are matched exactly.
pub struct ClientManifest {
    callers: HashMap<String, CallerKind>,
}

impl ClientManifest {
    pub fn new() -> Self {
        Self {
            callers: HashMap::new(),
        }
    }

    pub fn register(mut self, method: impl Into<String>, kind: CallerKind) -> Self {
        self.callers.insert(method.into(), kind);
        self
    }

    pub fn get(&self, method: &str) -> Option<&CallerKind> {
        self.callers.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.callers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.callers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.callers.is_empty()
    }
}

impl Default for ClientManifest {
    fn default() -> Self {
        Self::new()
    }
}
