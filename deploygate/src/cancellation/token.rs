//! Cancellation token for cooperative, awaitable cancellation.

use parking_lot::{Mutex, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// A callback invoked with the cancellation reason.
pub type CancelCallback = Box<dyn FnOnce(String) + Send>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: Mutex<Vec<CancelCallback>>,
    notify: Notify,
}

/// A cloneable token shared by everything taking part in a run.
///
/// Cancellation is idempotent; only the first reason is kept. Clones observe
/// the same state.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation with a reason.
    ///
    /// Wakes every task awaiting [`cancelled`](Self::cancelled) and runs the
    /// registered callbacks. Panicking callbacks are logged and suppressed.
    pub fn cancel(&self, reason: impl Into<String>) {
        let reason = reason.into();
        {
            // The flag flips under the reason lock so readers never see a
            // cancelled token without its reason.
            let mut slot = self.inner.reason.write();
            if slot.is_some() {
                return;
            }
            *slot = Some(reason.clone());
            self.inner.cancelled.store(true, Ordering::SeqCst);
        }

        debug!(reason = %reason, "cancellation requested");
        self.inner.notify.notify_waiters();

        let callbacks = std::mem::take(&mut *self.inner.callbacks.lock());
        for callback in callbacks {
            let reason = reason.clone();
            if let Err(e) =
                std::panic::catch_unwind(std::panic::AssertUnwindSafe(move || callback(reason)))
            {
                warn!("Cancellation callback panicked: {:?}", e);
            }
        }
    }

    /// Registers a callback to run on cancellation.
    ///
    /// If already cancelled, the callback runs immediately.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: FnOnce(String) + Send + 'static,
    {
        {
            let mut callbacks = self.inner.callbacks.lock();
            if !self.is_cancelled() {
                callbacks.push(Box::new(callback));
                return;
            }
        }
        callback(self.reason().unwrap_or_default());
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// Returns the cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Resolves once the token is cancelled, yielding the reason.
    pub async fn cancelled(&self) -> String {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return self.reason().unwrap_or_default();
            }
            notified.await;
        }
    }

    /// Creates a token that is cancelled whenever this one is.
    ///
    /// Cancelling the child leaves the parent untouched.
    #[must_use]
    pub fn child_token(&self) -> Self {
        let child = Self::new();
        let weak = Arc::downgrade(&child.inner);
        self.on_cancel(move |reason| {
            if let Some(inner) = weak.upgrade() {
                Self { inner }.cancel(reason);
            }
        });
        child
    }

    /// Cancels the token after `duration` unless it is cancelled first.
    ///
    /// Abort the returned handle to disarm the timer.
    pub fn cancel_after(&self, duration: Duration, reason: impl Into<String>) -> JoinHandle<()> {
        let token = self.clone();
        let reason = reason.into();
        tokio::spawn(async move {
            tokio::select! {
                () = tokio::time::sleep(duration) => token.cancel(reason),
                _ = token.cancelled() => {}
            }
        })
    }
}

impl std::fmt::Debug for CancellationToken {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CancellationToken")
            .field("cancelled", &self.is_cancelled())
            .field("reason", &self.reason())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[test]
    fn test_token_default_not_cancelled() {
        let token = CancellationToken::new();
        assert!(!token.is_cancelled());
        assert!(token.reason().is_none());
    }

    #[test]
    fn test_token_cancel_idempotent() {
        let token = CancellationToken::new();
        token.cancel("First reason");
        token.cancel("Second reason");

        assert!(token.is_cancelled());
        assert_eq!(token.reason(), Some("First reason".to_string()));
    }

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        clone.cancel("interrupted");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_on_cancel_before_and_after() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let c = counter.clone();
        token.on_cancel(move |_| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 0);

        token.cancel("test");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let c = counter.clone();
        token.on_cancel(move |reason| {
            assert_eq!(reason, "test");
            c.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_callback_panic_suppressed() {
        let token = CancellationToken::new();
        token.on_cancel(|_| panic!("Intentional panic"));
        token.cancel("test");
        assert!(token.is_cancelled());
    }

    #[test]
    fn test_child_follows_parent() {
        let parent = CancellationToken::new();
        let child = parent.child_token();

        child.cancel("child only");
        assert!(!parent.is_cancelled());

        let other = parent.child_token();
        parent.cancel("deadline");
        assert_eq!(other.reason(), Some("deadline".to_string()));
    }

    #[tokio::test]
    async fn test_cancelled_wakes_waiter() {
        let token = CancellationToken::new();
        let waiter = {
            let token = token.clone();
            tokio::spawn(async move { token.cancelled().await })
        };
        tokio::task::yield_now().await;
        token.cancel("stop");
        assert_eq!(waiter.await.unwrap(), "stop");
    }

    #[tokio::test]
    async fn test_cancelled_returns_immediately_when_already_cancelled() {
        let token = CancellationToken::new();
        token.cancel("done");
        assert_eq!(token.cancelled().await, "done");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_deadline() {
        let token = CancellationToken::new();
        let _timer = token.cancel_after(Duration::from_secs(30), "deadline exceeded");

        tokio::time::sleep(Duration::from_secs(29)).await;
        assert!(!token.is_cancelled());

        let reason = token.cancelled().await;
        assert_eq!(reason, "deadline exceeded");
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_after_disarmed_by_earlier_cancel() {
        let token = CancellationToken::new();
        let timer = token.cancel_after(Duration::from_secs(30), "deadline exceeded");
        token.cancel("interrupted");
        timer.await.unwrap();
        assert_eq!(token.reason(), Some("interrupted".to_string()));
    }
}
