//! RPC Server
//!
//! One [`RpcServer`] serves a manifest of handlers over channels pushed to
//! it by a transport layer, one channel per call. Per call it reads the
//! leading request, selects the handler, arms the context's deadline with
//! the shorter of the handler's declared timeout and the configured
//! default, builds a fresh middleware stage pair, and runs the kind's
//! wiring. Every in-flight call is tracked so shutdown can either wait for
//! the set to drain (graceful) or cancel everything first (forced).
//!
//! On deadline expiry the call's context is cancelled and the handler is
//! expected to unwind cooperatively; if the configured grace period then
//! elapses without the channel closing, the channel's cancel hook severs
//! the transport regardless of handler state.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;

use strandrpc_common::context::{CallContext, CancelReason};
use strandrpc_common::middleware::{MiddlewareFactory, MiddlewareStage, StagePair, StageVerdict};
use strandrpc_common::protocol::{
    Request, ResponseError, ResponseResult, Result, RpcError, WireError, WireMessage,
};
use strandrpc_common::transport::{
    write_message, ByteChannel, CancelHandle, ChannelReader, ChannelWriter, MessageReader,
    DEFAULT_MAX_MESSAGE_SIZE,
};

use crate::handlers::{CallCx, HandlerKind, RawHandler, UnaryHandler};
use crate::handlers::{ClientStreamHandler, DuplexHandler, ServerStreamHandler};
use crate::manifest::Manifest;
use crate::registry::ActiveCalls;

/// Recognized server options.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Default per-call timeout; a handler's declared timeout can only
    /// shorten it
    pub handler_timeout: Duration,
    /// Window after a timeout cancellation before the transport is
    /// forcibly severed; `None` disables forcible teardown
    pub handler_timeout_grace: Option<Duration>,
    /// Cap on the codec's re-assembly buffer
    pub max_message_size: usize,
    /// When true, outgoing error envelopes omit diagnostic traces
    pub sensitive: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            handler_timeout: Duration::from_secs(30),
            handler_timeout_grace: None,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
            sensitive: false,
        }
    }
}

/// Surfaced to the embedding application whenever a call fails for a
/// reason not attributable to the remote peer's own application error.
#[derive(Debug, Clone)]
pub struct ErrorEvent {
    pub method: Option<String>,
    pub code: i32,
    pub message: String,
}

/// The server side of the runtime.
pub struct RpcServer<D> {
    manifest: Arc<Manifest<D>>,
    deps: Arc<D>,
    config: ServerConfig,
    middleware: Option<MiddlewareFactory>,
    active: Arc<ActiveCalls>,
    stop_token: CancellationToken,
    events: broadcast::Sender<ErrorEvent>,
}

impl<D: Send + Sync + 'static> RpcServer<D> {
    pub fn new(manifest: Manifest<D>, deps: D, config: ServerConfig) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            manifest: Arc::new(manifest),
            deps: Arc::new(deps),
            config,
            middleware: None,
            active: Arc::new(ActiveCalls::new()),
            stop_token: CancellationToken::new(),
            events,
        }
    }

    /// Installs a middleware factory, invoked once per call to produce a
    /// fresh stage pair.
    pub fn with_middleware(mut self, factory: MiddlewareFactory) -> Self {
        self.middleware = Some(factory);
        self
    }

    /// Subscribes to error events.
    pub fn subscribe(&self) -> broadcast::Receiver<ErrorEvent> {
        self.events.subscribe()
    }

    /// Number of calls currently in flight.
    pub fn active_calls(&self) -> usize {
        self.active.len()
    }

    pub fn is_stopping(&self) -> bool {
        self.stop_token.is_cancelled()
    }

    /// Accepts one inbound call. The transport layer calls this once per
    /// duplex byte channel it opens; processing runs in its own task.
    ///
    /// While the server is stopping, new channels are answered with a
    /// stopping error and closed.
    pub fn handle_stream(&self, channel: ByteChannel) {
        if self.stop_token.is_cancelled() {
            let sensitive = self.config.sensitive;
            tokio::spawn(async move {
                let (_reader, mut writer, _cancel, _meta) = channel.into_parts();
                let _ = write_message(&mut writer, &error_reply(&RpcError::Stopping, sensitive)).await;
                let _ = writer.shutdown().await;
            });
            return;
        }

        let runner = CallRunner {
            manifest: self.manifest.clone(),
            deps: self.deps.clone(),
            config: self.config.clone(),
            middleware: self.middleware.clone(),
            active: self.active.clone(),
            events: self.events.clone(),
        };
        tokio::spawn(async move { runner.run(channel).await });
    }

    /// Graceful stop: accept nothing new and wait for every in-flight call
    /// to finish naturally.
    pub async fn stop(&self) {
        self.stop_token.cancel();
        tracing::info!(active = self.active.len(), "stopping, draining active calls");
        self.active.wait_empty().await;
        tracing::info!("stopped");
    }

    /// Forced stop: cancel every active call's context with a stopping
    /// error, sever every channel, then wait for the registry to drain.
    pub async fn stop_force(&self) {
        self.stop_token.cancel();
        tracing::info!(active = self.active.len(), "force-stopping, cancelling active calls");
        self.active.cancel_all(CancelReason::Stopping);
        self.active.wait_empty().await;
        tracing::info!("stopped");
    }
}

fn error_reply(error: &RpcError, sensitive: bool) -> WireMessage {
    WireMessage::ResponseError(ResponseError::new(WireError::from_error(error, sensitive)))
}

/// What happened to an envelope pushed through the reverse stage.
enum WriteOutcome {
    Sent,
    Skipped,
    /// The stage terminated the call; its synthetic reply was written
    Terminated,
}

async fn write_reverse(
    reverse: &mut Box<dyn MiddlewareStage>,
    writer: &mut ChannelWriter,
    message: WireMessage,
    ctx: &CallContext,
) -> Result<WriteOutcome> {
    match reverse.transform(message, ctx) {
        StageVerdict::Forward(message) => {
            write_message(writer, &message).await?;
            Ok(WriteOutcome::Sent)
        }
        StageVerdict::Drop => Ok(WriteOutcome::Skipped),
        StageVerdict::Terminate { reply } => {
            write_message(writer, &reply).await?;
            Ok(WriteOutcome::Terminated)
        }
    }
}

/// The leading request after the forward stage has seen it.
enum Lead {
    Go(Option<Value>),
    /// The stage swallowed the call-opening request; nothing to run
    Halt,
    /// The stage terminated the call with this reply
    Terminated(WireMessage),
}

fn apply_leading(
    forward: &mut Box<dyn MiddlewareStage>,
    request: Request,
    ctx: &CallContext,
) -> Result<Lead> {
    match forward.transform(WireMessage::Request(request), ctx) {
        StageVerdict::Forward(WireMessage::Request(r)) => Ok(Lead::Go(r.params)),
        StageVerdict::Forward(WireMessage::Notification(n)) => Ok(Lead::Go(n.params)),
        StageVerdict::Forward(_) => Err(RpcError::Parse(
            "middleware replaced the leading request with a response envelope".into(),
        )),
        StageVerdict::Drop => Ok(Lead::Halt),
        StageVerdict::Terminate { reply } => Ok(Lead::Terminated(reply)),
    }
}

/// How the input pump for streaming kinds ended.
enum PumpEnd {
    /// Input exhausted, or the call was cancelled
    Finished,
    Failed(RpcError),
    /// The forward stage terminated the call with this reply
    Terminated(WireMessage),
}

/// Adapts an mpsc receiver into the lazy input sequence handlers consume.
fn input_stream(
    rx: mpsc::Receiver<Option<Value>>,
) -> futures::stream::BoxStream<'static, Option<Value>> {
    Box::pin(futures::stream::unfold(rx, |mut rx| async move {
        rx.recv().await.map(|item| (item, rx))
    }))
}

/// Reads subsequent request envelopes, runs each through the forward
/// stage, and delivers params to the handler's input sequence.
///
/// The bounded channel propagates readiness upstream: a slow handler
/// suspends this pump rather than letting it buffer unboundedly. A
/// cancelled context reads as immediate end of input.
async fn input_pump(
    mut messages: MessageReader<ChannelReader>,
    mut forward: Box<dyn MiddlewareStage>,
    ctx: CallContext,
    tx: mpsc::Sender<Option<Value>>,
    refresh: Option<Duration>,
) -> PumpEnd {
    loop {
        let item = tokio::select! {
            _ = ctx.cancelled() => return PumpEnd::Finished,
            item = messages.next_message() => item,
        };
        let value = match item {
            Some(Ok(value)) => value,
            Some(Err(e)) => return PumpEnd::Failed(e),
            None => return PumpEnd::Finished,
        };
        let message = match WireMessage::classify(value) {
            Ok(message @ (WireMessage::Request(_) | WireMessage::Notification(_))) => message,
            Ok(_) => {
                return PumpEnd::Failed(RpcError::Parse(
                    "unexpected response envelope on the inbound side of a call".into(),
                ))
            }
            Err(e) => return PumpEnd::Failed(e),
        };
        match forward.transform(message, &ctx) {
            StageVerdict::Forward(WireMessage::Request(r)) => {
                if let Some(window) = refresh {
                    ctx.deadline().reset(Some(window));
                }
                if tx.send(r.params).await.is_err() {
                    // Handler dropped its input; keep draining nothing
                    return PumpEnd::Finished;
                }
            }
            StageVerdict::Forward(WireMessage::Notification(n)) => {
                if let Some(window) = refresh {
                    ctx.deadline().reset(Some(window));
                }
                if tx.send(n.params).await.is_err() {
                    return PumpEnd::Finished;
                }
            }
            StageVerdict::Forward(_) => {
                return PumpEnd::Failed(RpcError::Parse(
                    "middleware produced a response envelope on the forward path".into(),
                ))
            }
            StageVerdict::Drop => {}
            StageVerdict::Terminate { reply } => return PumpEnd::Terminated(reply),
        }
    }
}

/// Watches for cancellation and severs the transport if the grace period
/// elapses without the call winding down.
fn spawn_grace_watchdog(
    ctx: CallContext,
    cancel: CancelHandle,
    grace: Option<Duration>,
    done: CancellationToken,
) {
    tokio::spawn(async move {
        tokio::select! {
            _ = done.cancelled() => return,
            _ = ctx.cancelled() => {}
        }
        let Some(grace) = grace else { return };
        tokio::select! {
            _ = done.cancelled() => {}
            _ = tokio::time::sleep(grace) => {
                tracing::warn!("grace period elapsed without the channel closing, severing transport");
                cancel.cancel(ctx.error());
            }
        }
    });
}

/// One call's worth of server state, detached from the server handle.
struct CallRunner<D> {
    manifest: Arc<Manifest<D>>,
    deps: Arc<D>,
    config: ServerConfig,
    middleware: Option<MiddlewareFactory>,
    active: Arc<ActiveCalls>,
    events: broadcast::Sender<ErrorEvent>,
}

impl<D: Send + Sync + 'static> CallRunner<D> {
    fn emit(&self, method: Option<&str>, error: &RpcError) {
        let _ = self.events.send(ErrorEvent {
            method: method.map(str::to_string),
            code: error.code(),
            message: error.to_string(),
        });
    }

    async fn run(self, channel: ByteChannel) {
        let (reader, mut writer, cancel, meta) = channel.into_parts();
        let mut messages = MessageReader::new(reader, self.config.max_message_size);

        // The leading request selects the handler.
        let leading = match messages.next_message().await {
            Some(Ok(value)) => value,
            Some(Err(e)) => {
                tracing::debug!(error = %e, "failed to read leading request");
                self.emit(None, &e);
                let _ = write_message(&mut writer, &error_reply(&e, self.config.sensitive)).await;
                let _ = writer.shutdown().await;
                return;
            }
            None => {
                tracing::debug!("channel closed before a leading request arrived");
                return;
            }
        };

        let request = match WireMessage::classify(leading) {
            Ok(WireMessage::Request(request)) => request,
            Ok(_) => {
                let e = RpcError::Parse("expected a request as the leading message".into());
                self.emit(None, &e);
                let _ = write_message(&mut writer, &error_reply(&e, self.config.sensitive)).await;
                let _ = writer.shutdown().await;
                return;
            }
            Err(e) => {
                self.emit(None, &e);
                let _ = write_message(&mut writer, &error_reply(&e, self.config.sensitive)).await;
                let _ = writer.shutdown().await;
                return;
            }
        };

        let method = request.method.clone();
        let handler = match self.manifest.get(&method) {
            Some(handler) => handler.clone(),
            None => {
                tracing::debug!(method = %method, "no handler registered");
                let e = RpcError::MethodNotFound(method);
                let _ = write_message(&mut writer, &error_reply(&e, self.config.sensitive)).await;
                let _ = writer.shutdown().await;
                return;
            }
        };

        // A handler may shorten its own timeout but never exceed the
        // configured default.
        let effective = handler
            .timeout()
            .map(|declared| declared.min(self.config.handler_timeout))
            .unwrap_or(self.config.handler_timeout);
        let ctx = CallContext::new(Some(effective));
        let cx = CallCx {
            deps: self.deps.clone(),
            meta: meta.clone(),
            ctx: ctx.clone(),
            timeout: effective,
        };

        let call_id = self.active.register(ctx.clone(), cancel.clone());
        tracing::debug!(
            method = %method,
            kind = handler.kind_name(),
            timeout_ms = effective.as_millis() as u64,
            "dispatching call"
        );

        let stages = match &self.middleware {
            Some(factory) => factory(&meta),
            None => StagePair::identity(),
        };

        let done = CancellationToken::new();
        spawn_grace_watchdog(
            ctx.clone(),
            cancel.clone(),
            self.config.handler_timeout_grace,
            done.clone(),
        );

        let outcome = match handler.kind() {
            HandlerKind::Unary(h) => {
                self.run_unary(h.clone(), &cx, stages, request, &mut writer).await
            }
            HandlerKind::ServerStream(h) => {
                self.run_server_stream(h.clone(), &cx, stages, request, &mut writer)
                    .await
            }
            HandlerKind::ClientStream(h) => {
                self.run_client_stream(h.clone(), &cx, stages, request, messages, &mut writer)
                    .await
            }
            HandlerKind::Duplex(h) => {
                self.run_duplex(h.clone(), &cx, stages, request, messages, &mut writer)
                    .await
            }
            HandlerKind::Raw(h) => {
                self.run_raw(h.clone(), &cx, stages, request, messages, &mut writer)
                    .await
            }
        };
        done.cancel();
        let _ = writer.shutdown().await;

        match &outcome {
            Err(e) => {
                tracing::warn!(method = %method, error = %e, "call failed");
                self.emit(Some(&method), e);
            }
            Ok(()) => {
                // Timeout and shutdown cancellations are runtime failures,
                // not the peer's application errors; surface them too.
                if let Some(reason @ (CancelReason::Timeout(_) | CancelReason::Stopping)) =
                    ctx.reason()
                {
                    self.emit(Some(&method), &reason.to_error());
                }
                tracing::debug!(method = %method, "call finished");
            }
        }
        self.active.deregister(call_id);
    }

    async fn run_unary(
        &self,
        handler: Arc<dyn UnaryHandler<D>>,
        cx: &CallCx<D>,
        stages: StagePair,
        request: Request,
        writer: &mut ChannelWriter,
    ) -> Result<()> {
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;
        let params = match apply_leading(&mut forward, request, &cx.ctx)? {
            Lead::Go(params) => params,
            Lead::Halt => return Ok(()),
            Lead::Terminated(reply) => {
                write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                return Ok(());
            }
        };

        let outcome = tokio::select! {
            result = handler.handle(cx, params) => result,
            _ = cx.ctx.cancelled() => Err(cx.ctx.error()),
        };
        let reply = match outcome {
            Ok(value) => WireMessage::ResponseResult(ResponseResult::new(value)),
            Err(e) => {
                tracing::debug!(error = %e, "handler returned an error");
                error_reply(&e, self.config.sensitive)
            }
        };
        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
        Ok(())
    }

    async fn run_server_stream(
        &self,
        handler: Arc<dyn ServerStreamHandler<D>>,
        cx: &CallCx<D>,
        stages: StagePair,
        request: Request,
        writer: &mut ChannelWriter,
    ) -> Result<()> {
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;
        let params = match apply_leading(&mut forward, request, &cx.ctx)? {
            Lead::Go(params) => params,
            Lead::Halt => return Ok(()),
            Lead::Terminated(reply) => {
                write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                return Ok(());
            }
        };

        let produced = tokio::select! {
            result = handler.handle(cx, params) => result,
            _ = cx.ctx.cancelled() => Err(cx.ctx.error()),
        };
        let mut stream = match produced {
            Ok(stream) => stream,
            Err(e) => {
                write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx)
                    .await?;
                return Ok(());
            }
        };

        loop {
            let item = tokio::select! {
                item = stream.next() => item,
                _ = cx.ctx.cancelled() => {
                    let e = cx.ctx.error();
                    write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await?;
                    return Ok(());
                }
            };
            match item {
                Some(Ok(value)) => {
                    let reply = WireMessage::ResponseResult(ResponseResult::new(value));
                    if matches!(
                        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?,
                        WriteOutcome::Terminated
                    ) {
                        return Ok(());
                    }
                }
                Some(Err(e)) => {
                    // A mid-stream error is terminal; items already emitted
                    // stand.
                    write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx)
                        .await?;
                    return Ok(());
                }
                None => return Ok(()),
            }
        }
    }

    async fn run_client_stream(
        &self,
        handler: Arc<dyn ClientStreamHandler<D>>,
        cx: &CallCx<D>,
        stages: StagePair,
        request: Request,
        messages: MessageReader<ChannelReader>,
        writer: &mut ChannelWriter,
    ) -> Result<()> {
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;
        // The leading request only opens the call; its params are not part
        // of the handler's input sequence.
        match apply_leading(&mut forward, request, &cx.ctx)? {
            Lead::Go(_) | Lead::Halt => {}
            Lead::Terminated(reply) => {
                write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                return Ok(());
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let input = input_stream(rx);
        let pump = input_pump(messages, forward, cx.ctx.clone(), tx, None);
        tokio::pin!(pump);

        let handler_fut = async {
            tokio::select! {
                // Cancellation wins over a handler that only finished
                // because cancellation ended its input
                biased;
                _ = cx.ctx.cancelled() => Err(cx.ctx.error()),
                result = handler.handle(cx, input) => result,
            }
        };
        tokio::pin!(handler_fut);

        let mut pump_done = false;
        let outcome = loop {
            tokio::select! {
                result = &mut handler_fut => break result,
                end = &mut pump, if !pump_done => match end {
                    PumpEnd::Finished => pump_done = true,
                    PumpEnd::Failed(e) => {
                        let _ = write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await;
                        return Err(e);
                    }
                    PumpEnd::Terminated(reply) => {
                        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                        return Ok(());
                    }
                },
            }
        };

        let reply = match outcome {
            Ok(value) => WireMessage::ResponseResult(ResponseResult::new(value)),
            Err(e) => error_reply(&e, self.config.sensitive),
        };
        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
        Ok(())
    }

    async fn run_duplex(
        &self,
        handler: Arc<dyn DuplexHandler<D>>,
        cx: &CallCx<D>,
        stages: StagePair,
        request: Request,
        messages: MessageReader<ChannelReader>,
        writer: &mut ChannelWriter,
    ) -> Result<()> {
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;
        match apply_leading(&mut forward, request, &cx.ctx)? {
            Lead::Go(_) | Lead::Halt => {}
            Lead::Terminated(reply) => {
                write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                return Ok(());
            }
        }

        let (tx, rx) = mpsc::channel(1);
        let input = input_stream(rx);
        // Inbound traffic refreshes the deadline: duplex calls idle out
        // rather than running against a fixed deadline.
        let pump = input_pump(
            messages,
            forward,
            cx.ctx.clone(),
            tx,
            Some(cx.timeout),
        );
        tokio::pin!(pump);

        // The pump runs while the handler is being invoked too: a handler
        // may consume input before it produces its output stream.
        let invoke = async {
            tokio::select! {
                biased;
                _ = cx.ctx.cancelled() => Err(cx.ctx.error()),
                result = handler.handle(cx, input) => result,
            }
        };
        tokio::pin!(invoke);

        let mut pump_done = false;
        let produced = loop {
            tokio::select! {
                result = &mut invoke => break result,
                end = &mut pump, if !pump_done => match end {
                    PumpEnd::Finished => pump_done = true,
                    PumpEnd::Failed(e) => {
                        let _ = write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await;
                        return Err(e);
                    }
                    PumpEnd::Terminated(reply) => {
                        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                        return Ok(());
                    }
                },
            }
        };
        let mut stream = match produced {
            Ok(stream) => stream,
            Err(e) => {
                write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx)
                    .await?;
                return Ok(());
            }
        };

        loop {
            tokio::select! {
                item = stream.next() => match item {
                    Some(Ok(value)) => {
                        // Outbound activity refreshes the deadline too
                        cx.ctx.deadline().reset(Some(cx.timeout));
                        let reply = WireMessage::ResponseResult(ResponseResult::new(value));
                        if matches!(
                            write_reverse(&mut reverse, writer, reply, &cx.ctx).await?,
                            WriteOutcome::Terminated
                        ) {
                            return Ok(());
                        }
                    }
                    Some(Err(e)) => {
                        write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await?;
                        return Ok(());
                    }
                    None => {
                        // The output may have ended because cancellation
                        // cut the input off; the peer still learns why
                        if cx.ctx.is_cancelled() {
                            let e = cx.ctx.error();
                            let _ = write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await;
                        }
                        return Ok(());
                    }
                },
                end = &mut pump, if !pump_done => match end {
                    PumpEnd::Finished => pump_done = true,
                    PumpEnd::Failed(e) => {
                        let _ = write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await;
                        return Err(e);
                    }
                    PumpEnd::Terminated(reply) => {
                        write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                        return Ok(());
                    }
                },
                _ = cx.ctx.cancelled() => {
                    let e = cx.ctx.error();
                    let _ = write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx).await;
                    return Ok(());
                }
            }
        }
    }

    async fn run_raw(
        &self,
        handler: Arc<dyn RawHandler<D>>,
        cx: &CallCx<D>,
        stages: StagePair,
        request: Request,
        messages: MessageReader<ChannelReader>,
        writer: &mut ChannelWriter,
    ) -> Result<()> {
        let StagePair {
            mut forward,
            mut reverse,
        } = stages;
        let params = match apply_leading(&mut forward, request, &cx.ctx)? {
            Lead::Go(params) => params,
            Lead::Halt => return Ok(()),
            Lead::Terminated(reply) => {
                write_reverse(&mut reverse, writer, reply, &cx.ctx).await?;
                return Ok(());
            }
        };

        // Everything after the leading envelope is opaque bytes; the codec
        // surrenders whatever it had buffered past the request.
        let raw_input: crate::handlers::RawRead = Box::new(messages.into_raw());

        let outcome = tokio::select! {
            result = handler.handle(cx, params, raw_input) => result,
            _ = cx.ctx.cancelled() => Err(cx.ctx.error()),
        };
        let (lead, mut body) = match outcome {
            Ok(out) => out,
            Err(e) => {
                write_reverse(&mut reverse, writer, error_reply(&e, self.config.sensitive), &cx.ctx)
                    .await?;
                return Ok(());
            }
        };

        let reply = WireMessage::ResponseResult(ResponseResult::new(lead.unwrap_or(Value::Null)));
        if matches!(
            write_reverse(&mut reverse, writer, reply, &cx.ctx).await?,
            WriteOutcome::Terminated
        ) {
            return Ok(());
        }

        tokio::select! {
            copied = tokio::io::copy(&mut body, writer) => {
                copied.map_err(|e| RpcError::OutputStream(e.to_string()))?;
            }
            _ = cx.ctx.cancelled() => return Err(cx.ctx.error()),
        }
        Ok(())
    }
}
