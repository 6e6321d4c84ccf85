//! Cooperative cancellation signaling for in-flight handlers (C5).

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;

/// Owns the one-shot cancellation boolean for a single in-flight request handler. Dropped when
/// the handler completes; cancelling after completion is a harmless no-op.
#[derive(Clone)]
pub struct CancellationTokenSource {
    inner: Arc<Inner>,
}

struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancellationTokenSource {
    pub fn new() -> Self {
        CancellationTokenSource {
            inner: Arc::new(Inner { cancelled: AtomicBool::new(false), notify: Notify::new() }),
        }
    }

    /// Idempotent: cancelling twice has the same effect as cancelling once.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::SeqCst) {
            self.inner.notify.notify_waiters();
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken { inner: self.inner.clone() }
    }
}

impl Default for CancellationTokenSource {
    fn default() -> Self {
        Self::new()
    }
}

/// A handle a request handler receives to cooperatively observe cancellation.
#[derive(Clone)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Resolves immediately if already cancelled, matching the "subscribing to an already
    /// cancelled token fires synchronously" invariant — `Notify::notified` registers first so no
    /// signal fired between the check and the wait is missed, and the initial check covers the
    /// case where cancellation already happened.
    pub async fn cancelled(&self) {
        if self.is_cancelled() {
            return;
        }
        let notified = self.inner.notify.notified();
        if self.is_cancelled() {
            return;
        }
        notified.await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let source = CancellationTokenSource::new();
        source.cancel();
        source.cancel();
        assert!(source.is_cancelled());
    }

    #[tokio::test]
    async fn token_observes_cancellation() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        assert!(!token.is_cancelled());
        source.cancel();
        assert!(token.is_cancelled());
        token.cancelled().await; // must resolve immediately
    }

    #[tokio::test]
    async fn subscribing_after_cancel_fires_immediately() {
        let source = CancellationTokenSource::new();
        source.cancel();
        let token = source.token();
        tokio::time::timeout(std::time::Duration::from_millis(50), token.cancelled())
            .await
            .expect("cancelled() must resolve immediately for an already-cancelled token");
    }

    #[tokio::test]
    async fn waiting_token_wakes_on_cancel() {
        let source = CancellationTokenSource::new();
        let token = source.token();
        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        source.cancel();
        tokio::time::timeout(std::time::Duration::from_millis(100), handle)
            .await
            .expect("task should complete after cancel")
            .unwrap();
    }
}
