//! RPC Client
//!
//! [`RpcClient`] turns a manifest of call shapes and an injected stream
//! factory into strongly-shaped calls. Per call it invokes the factory
//! exactly once, builds a fresh context (deadline armed with the configured
//! call timeout) and middleware stage pair, writes the leading request, and
//! wires the shape's read/write pumps. On the client the middleware roles
//! invert: `forward` transforms outgoing request envelopes, `reverse`
//! transforms incoming response envelopes.
//!
//! Stopping the client only tears down what the client owns: calls already
//! in flight resolve or reject on their own channel's natural termination.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::{mpsc, oneshot};

use strandrpc_common::context::CallContext;
use strandrpc_common::middleware::{MiddlewareFactory, MiddlewareStage, StagePair, StageVerdict};
use strandrpc_common::protocol::{Request, Result, RpcError, WireMessage};
use strandrpc_common::transport::{
    write_message, ByteChannel, CancelHandle, ChannelReader, ChannelWriter, MessageReader,
    DEFAULT_MAX_MESSAGE_SIZE,
};

use crate::callers::{CallerKind, ClientManifest};

/// Recognized client options.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Per-call deadline; duplex calls refresh it on activity
    pub call_timeout: Duration,
    /// Cap on the codec's re-assembly buffer
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            call_timeout: Duration::from_secs(30),
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

/// Opens one duplex byte channel per outbound call.
pub type StreamFactory = Arc<dyn Fn() -> BoxFuture<'static, Result<ByteChannel>> + Send + Sync>;

/// Builds a [`StreamFactory`] from an async closure.
pub fn stream_factory<F, Fut>(f: F) -> StreamFactory
where
    F: Fn() -> Fut + Send + Sync + 'static,
    Fut: std::future::Future<Output = Result<ByteChannel>> + Send + 'static,
{
    Arc::new(move || Box::pin(f()))
}

/// The client side of the runtime.
pub struct RpcClient {
    manifest: Arc<ClientManifest>,
    factory: StreamFactory,
    config: ClientConfig,
    middleware: Option<MiddlewareFactory>,
    stopped: Arc<AtomicBool>,
}

/// An in-flight client-streaming call: a writable end for params plus one
/// deferred result. Writing is independent of the eventual outcome.
pub struct ClientStreamCall {
    sink: mpsc::Sender<Value>,
    done: oneshot::Receiver<Result<Value>>,
}

impl ClientStreamCall {
    /// Writes one params value into the outgoing stream.
    pub async fn send(&self, params: Value) -> Result<()> {
        self.sink
            .send(params)
            .await
            .map_err(|_| RpcError::OutputStream("call is no longer accepting writes".into()))
    }

    /// A cloneable handle on the writable end; the outgoing stream closes
    /// when every handle is dropped.
    pub fn sink(&self) -> mpsc::Sender<Value> {
        self.sink.clone()
    }

    /// Closes the writable end and awaits the single response.
    pub async fn finish(self) -> Result<Value> {
        let ClientStreamCall { sink, done } = self;
        drop(sink);
        done.await.map_err(|_| RpcError::StreamEnded)?
    }
}

/// The writable half of a duplex call. Dropping every clone closes the
/// outgoing direction; the readable half keeps going on its own.
#[derive(Clone)]
pub struct DuplexSink {
    tx: mpsc::Sender<Value>,
}

impl DuplexSink {
    pub async fn send(&self, params: Value) -> Result<()> {
        self.tx
            .send(params)
            .await
            .map_err(|_| RpcError::OutputStream("call is no longer accepting writes".into()))
    }
}

/// An established raw call: out-of-band metadata from the first reply, then
/// opaque byte ends in both directions.
pub struct RawCall {
    /// The first reply's result, when the peer sent one
    pub meta: Option<Value>,
    pub reader: Box<dyn AsyncRead + Send + Unpin>,
    pub writer: Box<dyn AsyncWrite + Send + Unpin>,
}

impl RpcClient {
    pub fn new(manifest: ClientManifest, factory: StreamFactory, config: ClientConfig) -> Self {
        Self {
            manifest: Arc::new(manifest),
            factory,
            config,
            middleware: None,
            stopped: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Installs a middleware factory, invoked once per call to produce a
    /// fresh stage pair.
    pub fn with_middleware(mut self, factory: MiddlewareFactory) -> Self {
        self.middleware = Some(factory);
        self
    }

    /// Stops the client: new calls are refused. In-flight calls resolve on
    /// their own channel's termination.
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        tracing::debug!("rpc client stopped");
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    async fn open_call(&self, method: &str, expected: CallerKind) -> Result<OpenCall> {
        if self.stopped.load(Ordering::SeqCst) {
            return Err(RpcError::Stopping);
        }
        match self.manifest.get(method) {
            Some(kind) if *kind == expected => {}
            Some(kind) => {
                return Err(RpcError::Application(format!(
                    "method '{}' is declared {} but was called {}",
                    method,
                    kind.name(),
                    expected.name()
                )));
            }
            None => return Err(RpcError::MethodNotFound(method.to_string())),
        }

        let channel = (self.factory)().await?;
        let stages = match &self.middleware {
            Some(factory) => factory(channel.meta()),
            None => StagePair::identity(),
        };
        let (reader, writer, cancel, _meta) = channel.into_parts();
        let ctx = CallContext::new(Some(self.config.call_timeout));
        tracing::debug!(method = %method, kind = expected.name(), "opening call");

        Ok(OpenCall {
            messages: MessageReader::new(reader, self.config.max_message_size),
            writer,
            cancel,
            ctx,
            stages,
        })
    }

    /// Writes one request and awaits exactly one response.
    pub async fn call_unary(&self, method: &str, params: Option<Value>) -> Result<Value> {
        let mut call = self.open_call(method, CallerKind::Unary).await?;

        let leading = WireMessage::Request(Request::new(method, params));
        match call.stages.forward.transform(leading, &call.ctx) {
            StageVerdict::Forward(message) => write_message(&mut call.writer, &message).await?,
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => return interpret_terminal(reply),
        }
        // Nothing further travels outbound on a unary call
        let _ = call.writer.shutdown().await;

        loop {
            let item = tokio::select! {
                _ = call.ctx.cancelled() => {
                    call.cancel.cancel(call.ctx.error());
                    return Err(call.ctx.error());
                }
                item = call.messages.next_message() => item,
            };
            match item {
                Some(Ok(value)) => {
                    match apply_reverse(&mut call.stages.reverse, value, &call.ctx) {
                        Reply::Final(result) => return result,
                        Reply::Skip => {}
                    }
                }
                Some(Err(e)) => return Err(e),
                None => return Err(RpcError::StreamEnded),
            }
        }
    }

    /// Writes one request and returns a lazy, finite, non-restartable
    /// stream of result items. A response error terminates the stream with
    /// the deserialized remote failure.
    pub async fn call_server_stream(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<BoxStream<'static, Result<Value>>> {
        let mut call = self.open_call(method, CallerKind::ServerStream).await?;

        let leading = WireMessage::Request(Request::new(method, params));
        match call.stages.forward.transform(leading, &call.ctx) {
            StageVerdict::Forward(message) => write_message(&mut call.writer, &message).await?,
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => {
                let result = interpret_terminal(reply);
                return Ok(Box::pin(futures::stream::iter(std::iter::once(result))));
            }
        }
        let _ = call.writer.shutdown().await;

        let OpenCall {
            messages,
            writer: _writer,
            cancel,
            ctx,
            stages,
        } = call;
        // No writer task: the sender half of the injection channel drops
        // here and the read loop learns it immediately.
        let (_inject_tx, inject_rx) = mpsc::channel(1);
        Ok(response_stream(ReadState {
            messages,
            reverse: stages.reverse,
            ctx,
            cancel,
            refresh: None,
            inject: inject_rx,
            inject_open: true,
            done: false,
        }))
    }

    /// Returns a writable end for outgoing params plus a single deferred
    /// result, resolved after the input stream is closed.
    pub async fn call_client_stream(&self, method: &str) -> Result<ClientStreamCall> {
        let mut call = self.open_call(method, CallerKind::ClientStream).await?;
        let (done_tx, done_rx) = oneshot::channel();
        let (tx, mut rx) = mpsc::channel::<Value>(1);

        // The leading request opens the call; params flow afterwards.
        let leading = WireMessage::Request(Request::new(method, None));
        match call.stages.forward.transform(leading, &call.ctx) {
            StageVerdict::Forward(message) => write_message(&mut call.writer, &message).await?,
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => {
                let _ = done_tx.send(interpret_terminal(reply));
                return Ok(ClientStreamCall {
                    sink: tx,
                    done: done_rx,
                });
            }
        }

        let method = method.to_string();
        let OpenCall {
            mut messages,
            mut writer,
            cancel,
            ctx,
            stages,
        } = call;
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;

        tokio::spawn(async move {
            // Outgoing pump: each written value becomes one request
            loop {
                let next = tokio::select! {
                    _ = ctx.cancelled() => {
                        cancel.cancel(ctx.error());
                        let _ = done_tx.send(Err(ctx.error()));
                        return;
                    }
                    next = rx.recv() => next,
                };
                match next {
                    Some(params) => {
                        let message =
                            WireMessage::Request(Request::new(method.clone(), Some(params)));
                        match forward.transform(message, &ctx) {
                            StageVerdict::Forward(message) => {
                                if let Err(e) = write_message(&mut writer, &message).await {
                                    let _ = done_tx.send(Err(e));
                                    return;
                                }
                            }
                            StageVerdict::Drop => {}
                            StageVerdict::Terminate { reply } => {
                                let _ = done_tx.send(interpret_terminal(reply));
                                return;
                            }
                        }
                    }
                    None => break,
                }
            }

            // Half-close: the handler's input sequence ends here
            let _ = writer.shutdown().await;

            // Await the single response
            loop {
                let item = tokio::select! {
                    _ = ctx.cancelled() => {
                        cancel.cancel(ctx.error());
                        let _ = done_tx.send(Err(ctx.error()));
                        return;
                    }
                    item = messages.next_message() => item,
                };
                match item {
                    Some(Ok(value)) => match apply_reverse(&mut reverse, value, &ctx) {
                        Reply::Final(result) => {
                            let _ = done_tx.send(result);
                            return;
                        }
                        Reply::Skip => {}
                    },
                    Some(Err(e)) => {
                        let _ = done_tx.send(Err(e));
                        return;
                    }
                    None => {
                        let _ = done_tx.send(Err(RpcError::StreamEnded));
                        return;
                    }
                }
            }
        });

        Ok(ClientStreamCall {
            sink: tx,
            done: done_rx,
        })
    }

    /// Returns an independent writable and readable pair. Closing the
    /// writable signals no more requests but does not stop reading.
    pub async fn call_duplex(
        &self,
        method: &str,
    ) -> Result<(DuplexSink, BoxStream<'static, Result<Value>>)> {
        let mut call = self.open_call(method, CallerKind::Duplex).await?;

        let leading = WireMessage::Request(Request::new(method, None));
        match call.stages.forward.transform(leading, &call.ctx) {
            StageVerdict::Forward(message) => write_message(&mut call.writer, &message).await?,
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => {
                let (tx, _rx) = mpsc::channel(1);
                let result = interpret_terminal(reply);
                return Ok((
                    DuplexSink { tx },
                    Box::pin(futures::stream::iter(std::iter::once(result))),
                ));
            }
        }

        let method = method.to_string();
        let timeout = self.config.call_timeout;
        let OpenCall {
            messages,
            mut writer,
            cancel,
            ctx,
            stages,
        } = call;
        let StagePair {
            mut forward,
            reverse,
        } = stages;
        let (tx, mut rx) = mpsc::channel::<Value>(1);
        let (inject_tx, inject_rx) = mpsc::channel::<WireMessage>(1);

        // Outgoing pump task
        {
            let ctx = ctx.clone();
            let cancel = cancel.clone();
            tokio::spawn(async move {
                loop {
                    let next = tokio::select! {
                        _ = ctx.cancelled() => {
                            cancel.cancel(ctx.error());
                            return;
                        }
                        next = rx.recv() => next,
                    };
                    match next {
                        Some(params) => {
                            // Activity refreshes the deadline: duplex calls
                            // idle out rather than hitting a fixed deadline
                            ctx.deadline().reset(Some(timeout));
                            let message =
                                WireMessage::Request(Request::new(method.clone(), Some(params)));
                            match forward.transform(message, &ctx) {
                                StageVerdict::Forward(message) => {
                                    if write_message(&mut writer, &message).await.is_err() {
                                        return;
                                    }
                                }
                                StageVerdict::Drop => {}
                                StageVerdict::Terminate { reply } => {
                                    // Hand the terminal envelope to the
                                    // read side and end both directions
                                    let _ = inject_tx.send(reply).await;
                                    let _ = writer.shutdown().await;
                                    return;
                                }
                            }
                        }
                        None => {
                            // Closing the writable signals no more requests
                            let _ = writer.shutdown().await;
                            return;
                        }
                    }
                }
            });
        }

        let stream = response_stream(ReadState {
            messages,
            reverse,
            ctx,
            cancel,
            refresh: Some(timeout),
            inject: inject_rx,
            inject_open: true,
            done: false,
        });
        Ok((DuplexSink { tx }, stream))
    }

    /// Sends one leading envelope, surfaces the first reply as out-of-band
    /// metadata, then exposes raw byte ends for the remainder of the call.
    pub async fn call_raw(&self, method: &str, params: Option<Value>) -> Result<RawCall> {
        let mut call = self.open_call(method, CallerKind::Raw).await?;

        let leading = WireMessage::Request(Request::new(method, params));
        match call.stages.forward.transform(leading, &call.ctx) {
            StageVerdict::Forward(message) => write_message(&mut call.writer, &message).await?,
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => {
                let meta = interpret_terminal(reply)?;
                return Ok(RawCall {
                    meta: Some(meta),
                    reader: Box::new(tokio::io::empty()),
                    writer: Box::new(tokio::io::sink()),
                });
            }
        }

        // The first parsed reply, if any, is call metadata rather than data
        let meta = loop {
            let item = tokio::select! {
                _ = call.ctx.cancelled() => {
                    call.cancel.cancel(call.ctx.error());
                    return Err(call.ctx.error());
                }
                item = call.messages.next_message() => item,
            };
            match item {
                Some(Ok(value)) => {
                    match apply_reverse(&mut call.stages.reverse, value, &call.ctx) {
                        Reply::Final(Ok(meta)) => break Some(meta),
                        Reply::Final(Err(e)) => return Err(e),
                        Reply::Skip => {}
                    }
                }
                Some(Err(e)) => return Err(e),
                None => break None,
            }
        };

        // Raw transfers own their pacing; the fixed call deadline no
        // longer applies
        call.ctx.deadline().reset(None);

        Ok(RawCall {
            meta,
            reader: Box::new(call.messages.into_raw()),
            writer: call.writer,
        })
    }
}

struct OpenCall {
    messages: MessageReader<ChannelReader>,
    writer: ChannelWriter,
    cancel: CancelHandle,
    ctx: CallContext,
    stages: StagePair,
}

/// A terminal envelope interpreted from the caller's perspective.
fn interpret_terminal(message: WireMessage) -> Result<Value> {
    match message {
        WireMessage::ResponseResult(response) => Ok(response.result),
        WireMessage::ResponseError(response) => Err(response.error.to_error()),
        _ => Err(RpcError::Parse(
            "expected a response envelope on the inbound side of a call".into(),
        )),
    }
}

enum Reply {
    Final(Result<Value>),
    Skip,
}

/// Runs one incoming value through classification and the reverse stage.
fn apply_reverse(
    reverse: &mut Box<dyn MiddlewareStage>,
    value: Value,
    ctx: &CallContext,
) -> Reply {
    let message = match WireMessage::classify(value) {
        Ok(message) => message,
        Err(e) => return Reply::Final(Err(e)),
    };
    match reverse.transform(message, ctx) {
        StageVerdict::Forward(message) => Reply::Final(interpret_terminal(message)),
        StageVerdict::Drop => Reply::Skip,
        StageVerdict::Terminate { reply } => Reply::Final(interpret_terminal(reply)),
    }
}

struct ReadState {
    messages: MessageReader<ChannelReader>,
    reverse: Box<dyn MiddlewareStage>,
    ctx: CallContext,
    cancel: CancelHandle,
    refresh: Option<Duration>,
    inject: mpsc::Receiver<WireMessage>,
    inject_open: bool,
    done: bool,
}

/// The shared read loop behind server-stream and duplex calls: yields each
/// response result in arrival order, ends on the channel closing, and
/// terminates with the deserialized remote failure on a response error.
fn response_stream(state: ReadState) -> BoxStream<'static, Result<Value>> {
    Box::pin(futures::stream::unfold(state, |mut st| async move {
        if st.done {
            return None;
        }
        loop {
            tokio::select! {
                _ = st.ctx.cancelled() => {
                    st.done = true;
                    st.cancel.cancel(st.ctx.error());
                    return Some((Err(st.ctx.error()), st));
                }
                injected = st.inject.recv(), if st.inject_open => match injected {
                    Some(message) => {
                        // A forward stage terminated the call; its reply
                        // still passes through this direction's stage
                        st.done = true;
                        match st.reverse.transform(message, &st.ctx) {
                            StageVerdict::Forward(message) => {
                                return Some((interpret_terminal(message), st));
                            }
                            StageVerdict::Drop => return None,
                            StageVerdict::Terminate { reply } => {
                                return Some((interpret_terminal(reply), st));
                            }
                        }
                    }
                    None => st.inject_open = false,
                },
                item = st.messages.next_message() => match item {
                    Some(Ok(value)) => match apply_reverse(&mut st.reverse, value, &st.ctx) {
                        Reply::Final(Ok(item)) => {
                            if let Some(window) = st.refresh {
                                st.ctx.deadline().reset(Some(window));
                            }
                            return Some((Ok(item), st));
                        }
                        Reply::Final(Err(e)) => {
                            st.done = true;
                            return Some((Err(e), st));
                        }
                        Reply::Skip => {}
                    },
                    Some(Err(e)) => {
                        st.done = true;
                        return Some((Err(e), st));
                    }
                    None => {
                        st.done = true;
                        return None;
                    }
                },
            }
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use strandrpc_common::transport::memory_channel_pair;

    fn test_client(manifest: ClientManifest) -> RpcClient {
        RpcClient::new(
            manifest,
            stream_factory(|| async {
                let (ours, _theirs) = memory_channel_pair(1024);
                Ok(ours)
            }),
            ClientConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_stopped_client_refuses_new_calls() {
        let client = test_client(ClientManifest::new().register("echo", CallerKind::Unary));
        client.stop();
        assert!(client.is_stopped());
        match client.call_unary("echo", None).await {
            Err(RpcError::Stopping) => {}
            other => panic!("expected stopping error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_unknown_method_is_local_error() {
        let client = test_client(ClientManifest::new());
        match client.call_unary("missing", None).await {
            Err(RpcError::MethodNotFound(method)) => assert_eq!(method, "missing"),
            other => panic!("expected method not found, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_shape_mismatch_is_local_error() {
        let client = test_client(ClientManifest::new().register("watch", CallerKind::ServerStream));
        match client.call_unary("watch", None).await {
            Err(RpcError::Application(message)) => {
                assert!(message.contains("server_stream"));
                assert!(message.contains("unary"));
            }
            other => panic!("expected shape mismatch error, got {:?}", other),
        }
    }
}
