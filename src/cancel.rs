//! Cooperative cancellation of a single call.
//!
//! Cancelling a call abandons the wait for its answer. It does not cancel a
//! block job on the VM; use [`crate::BlockJob::cancel`] for that.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use tokio::sync::Notify;

/// A clonable cancellation token.
///
/// Clones share the same cancellation state.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    cancelled: AtomicBool,
    notify: Notify,
}

impl CancelToken {
    /// Create a new, non-cancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cancel this token. Idempotent.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.notify.notify_waiters();
        }
    }

    /// Returns `true` if the token has been cancelled.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// A future that resolves when the token is cancelled.
    pub fn cancelled(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let inner = self.inner.clone();
        async move {
            loop {
                // Register before checking the flag so a concurrent
                // `cancel()` cannot slip between the two.
                let notified = inner.notify.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                if inner.cancelled.load(Ordering::Acquire) {
                    return;
                }
                notified.await;
            }
        }
    }
}
