//! Handler Kinds
//!
//! Each handler kind wraps a user-supplied implementation and defines how it
//! attaches to a channel that has already produced its leading request. The
//! kinds form a closed set: the server selects one per call by manifest
//! lookup and each kind owns its own stream-wiring strategy, so no dispatch
//! happens inside the per-chunk loops.
//!
//! Every handler receives a [`CallCx`]: the shared dependency container
//! (read-only, process-wide collaborators injected at manifest construction
//! time), the transport's connection metadata, and the call's context. A
//! handler may declare its own timeout; the server arms the shorter of the
//! declared value and its configured default — a handler can tighten its
//! budget, never widen it.

use std::sync::Arc;
use std::time::Duration;

use std::future::Future;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::io::AsyncRead;

use strandrpc_common::context::CallContext;
use strandrpc_common::protocol::Result;
use strandrpc_common::transport::ConnectionMeta;

/// Raw byte stream handed to and returned by [`RawHandler`]s.
pub type RawRead = Box<dyn AsyncRead + Send + Unpin>;

/// Per-call view handed to every handler invocation.
pub struct CallCx<D> {
    /// Shared dependency container, injected at manifest construction
    pub deps: Arc<D>,
    /// Transport-supplied connection metadata
    pub meta: ConnectionMeta,
    /// The call's cancellation signal and deadline
    pub ctx: CallContext,
    /// The effective timeout armed for this call
    pub timeout: Duration,
}

impl<D> Clone for CallCx<D> {
    fn clone(&self) -> Self {
        Self {
            deps: self.deps.clone(),
            meta: self.meta.clone(),
            ctx: self.ctx.clone(),
            timeout: self.timeout,
        }
    }
}

/// One request in, one response out.
#[async_trait]
pub trait UnaryHandler<D>: Send + Sync {
    async fn handle(&self, cx: &CallCx<D>, params: Option<Value>) -> Result<Value>;
}

/// One request in, a stream of results out. Items are emitted in production
/// order; an error raised mid-stream becomes the single terminal response
/// error and already-emitted items are not revoked.
#[async_trait]
pub trait ServerStreamHandler<D>: Send + Sync {
    async fn handle(
        &self,
        cx: &CallCx<D>,
        params: Option<Value>,
    ) -> Result<BoxStream<'static, Result<Value>>>;
}

/// A stream of request params in, one response out. The handler is invoked
/// immediately; `input` yields each subsequent request's params in arrival
/// order until the channel's readable side ends.
#[async_trait]
pub trait ClientStreamHandler<D>: Send + Sync {
    async fn handle(
        &self,
        cx: &CallCx<D>,
        input: BoxStream<'static, Option<Value>>,
    ) -> Result<Value>;
}

/// Both directions stream, fully concurrently: the handler may interleave
/// consuming `input` and producing output arbitrarily, and may close its
/// output before or after the input ends.
#[async_trait]
pub trait DuplexHandler<D>: Send + Sync {
    async fn handle(
        &self,
        cx: &CallCx<D>,
        input: BoxStream<'static, Option<Value>>,
    ) -> Result<BoxStream<'static, Result<Value>>>;
}

/// One JSON envelope each way; everything after is opaque bytes. The
/// handler receives the leading request's params and the channel's
/// remaining inbound bytes, and returns the leading response value plus a
/// byte stream the server pumps out until it ends.
#[async_trait]
pub trait RawHandler<D>: Send + Sync {
    async fn handle(
        &self,
        cx: &CallCx<D>,
        params: Option<Value>,
        input: RawRead,
    ) -> Result<(Option<Value>, RawRead)>;
}

/// A registered handler: one of the five kinds plus its declared timeout.
pub struct Handler<D> {
    kind: HandlerKind<D>,
    timeout: Option<Duration>,
}

pub(crate) enum HandlerKind<D> {
    Unary(Arc<dyn UnaryHandler<D>>),
    ServerStream(Arc<dyn ServerStreamHandler<D>>),
    ClientStream(Arc<dyn ClientStreamHandler<D>>),
    Duplex(Arc<dyn DuplexHandler<D>>),
    Raw(Arc<dyn RawHandler<D>>),
}

impl<D> Handler<D> {
    /// Declares this handler's own timeout. The server arms
    /// `min(declared, server default)` — the declared value can only
    /// tighten the budget.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn kind_name(&self) -> &'static str {
        match &self.kind {
            HandlerKind::Unary(_) => "unary",
            HandlerKind::ServerStream(_) => "server_stream",
            HandlerKind::ClientStream(_) => "client_stream",
            HandlerKind::Duplex(_) => "duplex",
            HandlerKind::Raw(_) => "raw",
        }
    }

    pub(crate) fn kind(&self) -> &HandlerKind<D> {
        &self.kind
    }
}

impl<D> Clone for Handler<D> {
    fn clone(&self) -> Self {
        let kind = match &self.kind {
            HandlerKind::Unary(h) => HandlerKind::Unary(h.clone()),
            HandlerKind::ServerStream(h) => HandlerKind::ServerStream(h.clone()),
            HandlerKind::ClientStream(h) => HandlerKind::ClientStream(h.clone()),
            HandlerKind::Duplex(h) => HandlerKind::Duplex(h.clone()),
            HandlerKind::Raw(h) => HandlerKind::Raw(h.clone()),
        };
        Self {
            kind,
            timeout: self.timeout,
        }
    }
}

// Closure adapters. Manifests are mostly built from these; implementing the
// traits directly is for handlers with their own state.

struct UnaryFn<F>(F);

#[async_trait]
impl<D, F, Fut> UnaryHandler<D> for UnaryFn<F>
where
    D: Send + Sync,
    F: Fn(CallCx<D>, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(&self, cx: &CallCx<D>, params: Option<Value>) -> Result<Value> {
        (self.0)(cx.clone(), params).await
    }
}

/// Wraps a closure as a unary handler.
pub fn unary<D, F, Fut>(f: F) -> Handler<D>
where
    D: Send + Sync + 'static,
    F: Fn(CallCx<D>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Handler {
        kind: HandlerKind::Unary(Arc::new(UnaryFn(f))),
        timeout: None,
    }
}

struct ServerStreamFn<F>(F);

#[async_trait]
impl<D, F, Fut> ServerStreamHandler<D> for ServerStreamFn<F>
where
    D: Send + Sync,
    F: Fn(CallCx<D>, Option<Value>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BoxStream<'static, Result<Value>>>> + Send,
{
    async fn handle(
        &self,
        cx: &CallCx<D>,
        params: Option<Value>,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        (self.0)(cx.clone(), params).await
    }
}

/// Wraps a closure as a server-streaming handler.
pub fn server_stream<D, F, Fut>(f: F) -> Handler<D>
where
    D: Send + Sync + 'static,
    F: Fn(CallCx<D>, Option<Value>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<Value>>>> + Send + 'static,
{
    Handler {
        kind: HandlerKind::ServerStream(Arc::new(ServerStreamFn(f))),
        timeout: None,
    }
}

struct ClientStreamFn<F>(F);

#[async_trait]
impl<D, F, Fut> ClientStreamHandler<D> for ClientStreamFn<F>
where
    D: Send + Sync,
    F: Fn(CallCx<D>, BoxStream<'static, Option<Value>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<Value>> + Send,
{
    async fn handle(
        &self,
        cx: &CallCx<D>,
        input: BoxStream<'static, Option<Value>>,
    ) -> Result<Value> {
        (self.0)(cx.clone(), input).await
    }
}

/// Wraps a closure as a client-streaming handler.
pub fn client_stream<D, F, Fut>(f: F) -> Handler<D>
where
    D: Send + Sync + 'static,
    F: Fn(CallCx<D>, BoxStream<'static, Option<Value>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<Value>> + Send + 'static,
{
    Handler {
        kind: HandlerKind::ClientStream(Arc::new(ClientStreamFn(f))),
        timeout: None,
    }
}

struct DuplexFn<F>(F);

#[async_trait]
impl<D, F, Fut> DuplexHandler<D> for DuplexFn<F>
where
    D: Send + Sync,
    F: Fn(CallCx<D>, BoxStream<'static, Option<Value>>) -> Fut + Send + Sync,
    Fut: Future<Output = Result<BoxStream<'static, Result<Value>>>> + Send,
{
    async fn handle(
        &self,
        cx: &CallCx<D>,
        input: BoxStream<'static, Option<Value>>,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        (self.0)(cx.clone(), input).await
    }
}

/// Wraps a closure as a duplex handler.
pub fn duplex<D, F, Fut>(f: F) -> Handler<D>
where
    D: Send + Sync + 'static,
    F: Fn(CallCx<D>, BoxStream<'static, Option<Value>>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<BoxStream<'static, Result<Value>>>> + Send + 'static,
{
    Handler {
        kind: HandlerKind::Duplex(Arc::new(DuplexFn(f))),
        timeout: None,
    }
}

struct RawFn<F>(F);

#[async_trait]
impl<D, F, Fut> RawHandler<D> for RawFn<F>
where
    D: Send + Sync,
    F: Fn(CallCx<D>, Option<Value>, RawRead) -> Fut + Send + Sync,
    Fut: Future<Output = Result<(Option<Value>, RawRead)>> + Send,
{
    async fn handle(
        &self,
        cx: &CallCx<D>,
        params: Option<Value>,
        input: RawRead,
    ) -> Result<(Option<Value>, RawRead)> {
        (self.0)(cx.clone(), params, input).await
    }
}

/// Wraps a closure as a raw handler.
pub fn raw<D, F, Fut>(f: F) -> Handler<D>
where
    D: Send + Sync + 'static,
    F: Fn(CallCx<D>, Option<Value>, RawRead) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(Option<Value>, RawRead)>> + Send + 'static,
{
    Handler {
        kind: HandlerKind::Raw(Arc::new(RawFn(f))),
        timeout: None,
    }
}
