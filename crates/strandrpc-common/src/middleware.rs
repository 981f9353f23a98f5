//! Middleware Pipeline
//!
//! A middleware factory is invoked once per call to produce a fresh pair of
//! transform stages — stages are call-scoped, never shared across calls, so
//! no state leaks between them. On the server, `forward` sits between the
//! codec and the handler (it sees every incoming request or notification
//! envelope) and `reverse` between the handler and the outgoing codec; on
//! the client the roles invert.
//!
//! A stage decides what happens to each envelope: pass it on (possibly
//! mutated), drop it, or terminate the call early, injecting a synthetic
//! terminal envelope into the opposite direction. The termination verdict
//! is the authentication short-circuit: a forward stage that rejects a call
//! answers with a response error and the handler is never invoked. Stages
//! also receive the call's context and may re-arm its deadline as a side
//! effect of observing traffic.

use std::sync::Arc;

use crate::context::CallContext;
use crate::protocol::WireMessage;
use crate::transport::ConnectionMeta;

/// What a stage decided to do with one envelope.
pub enum StageVerdict {
    /// Pass the (possibly mutated) envelope on
    Forward(WireMessage),
    /// Swallow the envelope; the pipeline continues with the next one
    Drop,
    /// End both directions now; `reply` is injected into the opposite
    /// direction's stage as the call's terminal envelope
    Terminate { reply: WireMessage },
}

/// A call-scoped transform over envelopes travelling in one direction.
pub trait MiddlewareStage: Send {
    fn transform(&mut self, message: WireMessage, ctx: &CallContext) -> StageVerdict;
}

/// The two stages produced for one call.
pub struct StagePair {
    pub forward: Box<dyn MiddlewareStage>,
    pub reverse: Box<dyn MiddlewareStage>,
}

/// Per-call constructor of stage pairs.
pub type MiddlewareFactory = Arc<dyn Fn(&ConnectionMeta) -> StagePair + Send + Sync>;

/// A stage that passes every envelope through untouched.
pub struct IdentityStage;

impl MiddlewareStage for IdentityStage {
    fn transform(&mut self, message: WireMessage, _ctx: &CallContext) -> StageVerdict {
        StageVerdict::Forward(message)
    }
}

impl StagePair {
    pub fn identity() -> Self {
        Self {
            forward: Box::new(IdentityStage),
            reverse: Box::new(IdentityStage),
        }
    }
}

/// Adapts a closure into a stage.
pub fn stage_fn<F>(f: F) -> Box<dyn MiddlewareStage>
where
    F: FnMut(WireMessage, &CallContext) -> StageVerdict + Send + 'static,
{
    struct FnStage<F>(F);
    impl<F> MiddlewareStage for FnStage<F>
    where
        F: FnMut(WireMessage, &CallContext) -> StageVerdict + Send,
    {
        fn transform(&mut self, message: WireMessage, ctx: &CallContext) -> StageVerdict {
            (self.0)(message, ctx)
        }
    }
    Box::new(FnStage(f))
}

/// Builds a factory from a plain function or closure.
pub fn factory_fn<F>(f: F) -> MiddlewareFactory
where
    F: Fn(&ConnectionMeta) -> StagePair + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Chains multiple factories; per call, each produces a fresh stage pair
/// and envelopes flow through the stages in declared order. The first
/// non-`Forward` verdict in a chain settles the envelope.
pub fn compose(factories: Vec<MiddlewareFactory>) -> MiddlewareFactory {
    Arc::new(move |meta: &ConnectionMeta| {
        let mut forwards = Vec::with_capacity(factories.len());
        let mut reverses = Vec::with_capacity(factories.len());
        for factory in &factories {
            let pair = factory(meta);
            forwards.push(pair.forward);
            reverses.push(pair.reverse);
        }
        StagePair {
            forward: Box::new(ChainStage { stages: forwards }),
            reverse: Box::new(ChainStage { stages: reverses }),
        }
    })
}

struct ChainStage {
    stages: Vec<Box<dyn MiddlewareStage>>,
}

impl MiddlewareStage for ChainStage {
    fn transform(&mut self, message: WireMessage, ctx: &CallContext) -> StageVerdict {
        let mut current = message;
        for stage in &mut self.stages {
            match stage.transform(current, ctx) {
                StageVerdict::Forward(next) => current = next,
                verdict => return verdict,
            }
        }
        StageVerdict::Forward(current)
    }
}
