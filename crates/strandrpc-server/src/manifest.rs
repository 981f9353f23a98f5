//! Method Manifest
//!
//! The immutable mapping from method name to handler. Built once at server
//! construction with the builder-style [`register`](Manifest::register) and
//! never mutated afterwards; method names are plain strings, matched
//! exactly.

use std::collections::HashMap;

use crate::handlers::Handler;

pub struct Manifest<D> {
    handlers: HashMap<String, Handler<D>>,
}

impl<D> Manifest<D> {
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
        }
    }

    /// Registers a handler under a method name, replacing any previous
    /// registration of the same name.
    pub fn register(mut self, method: impl Into<String>, handler: Handler<D>) -> Self {
        self.handlers.insert(method.into(), handler);
        self
    }

    pub fn get(&self, method: &str) -> Option<&Handler<D>> {
        self.handlers.get(method)
    }

    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl<D> Default for Manifest<D> {
    fn default() -> Self {
        Self::new()
    }
}
