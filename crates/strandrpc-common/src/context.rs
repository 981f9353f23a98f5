//! Call Context: Cancellation and Deadline
//!
//! Every active call — on the server and the client alike — owns one
//! [`CallContext`]: a cancellation signal paired with a resettable deadline.
//! The signal transitions once, irreversibly, from live to cancelled with a
//! reason; the deadline can be re-armed at any time, discarding whatever
//! firing was previously scheduled. Deadline expiry cancels the context
//! with a timeout reason.
//!
//! Cancellation is cooperative: it does not sever the underlying channel.
//! Stream pumps and handlers observe the signal at their suspension points
//! and unwind, surfacing the reason as the terminal error; forcible
//! transport teardown is the grace-period watchdog's job, not this
//! module's.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::watch;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::protocol::RpcError;

/// Why a call's context was cancelled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CancelReason {
    /// The armed deadline elapsed; carries the delay that was armed, in ms
    Timeout(u64),
    /// The runtime is shutting down
    Stopping,
    /// The surrounding channel ended while the call was pending
    StreamEnded,
    /// Explicit cancellation with a caller-supplied description
    Aborted(String),
}

impl CancelReason {
    /// The error kind this reason surfaces as.
    pub fn to_error(&self) -> RpcError {
        match self {
            CancelReason::Timeout(ms) => RpcError::Timeout(*ms),
            CancelReason::Stopping => RpcError::Stopping,
            CancelReason::StreamEnded => RpcError::StreamEnded,
            CancelReason::Aborted(msg) => RpcError::Application(msg.clone()),
        }
    }
}

/// Deadline target: when to fire, and the armed delay in ms for reporting.
type DeadlineTarget = Option<(Instant, u64)>;

/// A single resettable deadline.
///
/// Re-arming with a new delay discards any previously scheduled firing;
/// `None` disarms entirely. Clones share the same underlying deadline.
#[derive(Clone)]
pub struct Deadline {
    tx: watch::Sender<DeadlineTarget>,
}

impl Deadline {
    /// Re-arms the deadline `delay` from now, or disarms it with `None`.
    pub fn reset(&self, delay: Option<Duration>) {
        let target = delay.map(|d| (Instant::now() + d, d.as_millis() as u64));
        // Receiver gone means the context was already cancelled; nothing to
        // re-arm.
        let _ = self.tx.send(target);
    }

    /// The instant the deadline is currently scheduled to fire, if armed.
    pub fn scheduled_at(&self) -> Option<Instant> {
        (*self.tx.borrow()).map(|(at, _)| at)
    }
}

/// Cancellation signal plus deadline, scoped to one call.
///
/// Cheap to clone; all clones observe the same signal and deadline.
#[derive(Clone)]
pub struct CallContext {
    token: CancellationToken,
    reason: Arc<Mutex<Option<CancelReason>>>,
    deadline: Deadline,
}

impl CallContext {
    /// Creates a context, arming the deadline when a timeout is given.
    pub fn new(timeout: Option<Duration>) -> Self {
        let token = CancellationToken::new();
        let reason: Arc<Mutex<Option<CancelReason>>> = Arc::new(Mutex::new(None));

        let initial = timeout.map(|d| (Instant::now() + d, d.as_millis() as u64));
        let (tx, rx) = watch::channel(initial);

        spawn_deadline_monitor(token.clone(), reason.clone(), rx);

        Self {
            token,
            reason,
            deadline: Deadline { tx },
        }
    }

    /// Cancels the context. The first reason wins; later calls are no-ops.
    pub fn cancel(&self, reason: CancelReason) {
        cancel_with(&self.token, &self.reason, reason);
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.token.cancelled().await;
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// The first cancellation reason, once cancelled.
    pub fn reason(&self) -> Option<CancelReason> {
        self.reason.lock().ok().and_then(|slot| slot.clone())
    }

    /// The cancellation reason as an error, for surfacing to pumps and
    /// callers.
    pub fn error(&self) -> RpcError {
        match self.reason() {
            Some(reason) => reason.to_error(),
            None => RpcError::Application("call cancelled".into()),
        }
    }

    pub fn deadline(&self) -> &Deadline {
        &self.deadline
    }
}

fn cancel_with(
    token: &CancellationToken,
    reason_slot: &Arc<Mutex<Option<CancelReason>>>,
    reason: CancelReason,
) {
    if let Ok(mut slot) = reason_slot.lock() {
        if slot.is_none() {
            *slot = Some(reason);
        }
    }
    // The reason is recorded before the signal flips, so an observer woken
    // by the token always finds it.
    token.cancel();
}

/// Watches the deadline and fires the cancellation when it elapses.
///
/// The monitor holds no `Deadline` sender, so it winds down as soon as the
/// context is cancelled or every context clone is dropped.
fn spawn_deadline_monitor(
    token: CancellationToken,
    reason_slot: Arc<Mutex<Option<CancelReason>>>,
    mut rx: watch::Receiver<DeadlineTarget>,
) {
    tokio::spawn(async move {
        loop {
            let target = *rx.borrow_and_update();
            match target {
                Some((at, armed_ms)) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(at) => {
                            tracing::debug!(timeout_ms = armed_ms, "call deadline elapsed");
                            cancel_with(&token, &reason_slot, CancelReason::Timeout(armed_ms));
                            return;
                        }
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = token.cancelled() => return,
                    }
                }
                None => {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                return;
                            }
                        }
                        _ = token.cancelled() => return,
                    }
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_cancel_is_irreversible_and_first_reason_wins() {
        let ctx = CallContext::new(None);
        assert!(!ctx.is_cancelled());
        ctx.cancel(CancelReason::Stopping);
        ctx.cancel(CancelReason::StreamEnded);
        assert!(ctx.is_cancelled());
        assert_eq!(ctx.reason(), Some(CancelReason::Stopping));
        assert!(matches!(ctx.error(), RpcError::Stopping));
    }

    #[tokio::test]
    async fn test_deadline_fires_with_timeout_reason() {
        let ctx = CallContext::new(Some(Duration::from_millis(20)));
        ctx.cancelled().await;
        assert_eq!(ctx.reason(), Some(CancelReason::Timeout(20)));
    }

    #[tokio::test]
    async fn test_deadline_reset_postpones_firing() {
        let ctx = CallContext::new(Some(Duration::from_millis(40)));
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.deadline().reset(Some(Duration::from_millis(100)));
        tokio::time::sleep(Duration::from_millis(50)).await;
        // Original firing would have hit by now; the reset discarded it
        assert!(!ctx.is_cancelled());
        ctx.cancelled().await;
        assert_eq!(ctx.reason(), Some(CancelReason::Timeout(100)));
    }

    #[tokio::test]
    async fn test_deadline_reset_advances_schedule() {
        let ctx = CallContext::new(Some(Duration::from_millis(200)));
        let before = ctx.deadline().scheduled_at().unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;
        ctx.deadline().reset(Some(Duration::from_millis(200)));
        let after = ctx.deadline().scheduled_at().unwrap();
        assert!(after > before);
    }

    #[tokio::test]
    async fn test_deadline_disarm_prevents_timeout() {
        let ctx = CallContext::new(Some(Duration::from_millis(30)));
        ctx.deadline().reset(None);
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(!ctx.is_cancelled());
    }

    #[tokio::test]
    async fn test_clones_share_signal() {
        let ctx = CallContext::new(None);
        let clone = ctx.clone();
        ctx.cancel(CancelReason::Aborted("done".into()));
        clone.cancelled().await;
        assert_eq!(clone.reason(), Some(CancelReason::Aborted("done".into())));
    }
}
