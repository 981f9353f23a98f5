//! Active Call Registry
//!
//! One entry per in-flight call, each holding the call's context and a
//! handle on its channel's cancel hook. Graceful shutdown waits for the set
//! to drain naturally; forced shutdown cancels every context and severs
//! every channel first, then waits.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tokio::sync::Notify;

use strandrpc_common::context::{CallContext, CancelReason};
use strandrpc_common::transport::CancelHandle;

pub struct ActiveCalls {
    calls: Mutex<HashMap<u64, ActiveCall>>,
    next_id: AtomicU64,
    drained: Notify,
}

struct ActiveCall {
    ctx: CallContext,
    channel_cancel: CancelHandle,
}

impl ActiveCalls {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(0),
            drained: Notify::new(),
        }
    }

    /// Tracks a call; the returned id deregisters it.
    pub fn register(&self, ctx: CallContext, channel_cancel: CancelHandle) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        if let Ok(mut calls) = self.calls.lock() {
            calls.insert(
                id,
                ActiveCall {
                    ctx,
                    channel_cancel,
                },
            );
        }
        id
    }

    pub fn deregister(&self, id: u64) {
        let now_empty = match self.calls.lock() {
            Ok(mut calls) => {
                calls.remove(&id);
                calls.is_empty()
            }
            Err(_) => false,
        };
        if now_empty {
            self.drained.notify_waiters();
        }
    }

    pub fn len(&self) -> usize {
        self.calls.lock().map(|calls| calls.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Resolves once no calls remain in flight.
    pub async fn wait_empty(&self) {
        loop {
            let notified = self.drained.notified();
            if self.is_empty() {
                return;
            }
            notified.await;
        }
    }

    /// Cancels every active call's context and severs every channel.
    pub fn cancel_all(&self, reason: CancelReason) {
        let snapshot: Vec<(CallContext, CancelHandle)> = match self.calls.lock() {
            Ok(calls) => calls
                .values()
                .map(|call| (call.ctx.clone(), call.channel_cancel.clone()))
                .collect(),
            Err(_) => Vec::new(),
        };
        for (ctx, channel_cancel) in snapshot {
            ctx.cancel(reason.clone());
            channel_cancel.cancel(reason.to_error());
        }
    }
}

impl Default for ActiveCalls {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_register_and_deregister_drains() {
        let registry = Arc::new(ActiveCalls::new());
        let a = registry.register(CallContext::new(None), CancelHandle::noop());
        let b = registry.register(CallContext::new(None), CancelHandle::noop());
        assert_eq!(registry.len(), 2);

        let waiter = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.wait_empty().await })
        };

        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!waiter.is_finished());

        registry.deregister(a);
        registry.deregister(b);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait_empty should resolve once drained")
            .unwrap();
    }

    #[tokio::test]
    async fn test_wait_empty_resolves_immediately_when_idle() {
        let registry = ActiveCalls::new();
        tokio::time::timeout(Duration::from_millis(100), registry.wait_empty())
            .await
            .expect("empty registry should not block");
    }

    #[tokio::test]
    async fn test_cancel_all_cancels_contexts_and_channels() {
        let registry = ActiveCalls::new();
        let severed = Arc::new(AtomicUsize::new(0));

        let mut contexts = Vec::new();
        for _ in 0..3 {
            let ctx = CallContext::new(None);
            let severed = severed.clone();
            let hook = CancelHandle::new(move |_| {
                severed.fetch_add(1, Ordering::SeqCst);
            });
            registry.register(ctx.clone(), hook);
            contexts.push(ctx);
        }

        registry.cancel_all(CancelReason::Stopping);
        assert_eq!(severed.load(Ordering::SeqCst), 3);
        for ctx in contexts {
            assert!(ctx.is_cancelled());
            assert_eq!(ctx.reason(), Some(CancelReason::Stopping));
        }
    }
}
