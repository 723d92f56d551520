//! Scoped cleanup that runs on every exit path.
//!
//! Cleanup callbacks run in LIFO order (last registered, first executed) to
//! unwind resource acquisition. Each callback is bounded by a timeout, and a
//! panicking callback is recorded as a failure rather than aborting the rest.

use futures::FutureExt;
use parking_lot::Mutex;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tokio::time::timeout;
use tracing::{debug, warn};

/// Result of one cleanup callback.
pub type CleanupResult = Result<(), String>;

/// Type alias for async cleanup callbacks.
pub type CleanupCallback =
    Box<dyn FnOnce() -> Pin<Box<dyn Future<Output = CleanupResult> + Send>> + Send>;

/// Registry of cleanup callbacks.
#[derive(Default)]
pub struct CleanupRegistry {
    callbacks: Mutex<Vec<(String, CleanupCallback)>>,
}

impl CleanupRegistry {
    /// Creates a new cleanup registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a cleanup callback.
    pub fn register<F, Fut>(&self, name: impl Into<String>, callback: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = CleanupResult> + Send + 'static,
    {
        let boxed: CleanupCallback = Box::new(move || Box::pin(callback()));
        self.callbacks.lock().push((name.into(), boxed));
    }

    /// Returns the number of pending cleanup callbacks.
    #[must_use]
    pub fn pending_count(&self) -> usize {
        self.callbacks.lock().len()
    }

    /// Runs and drains all callbacks in LIFO order, each bounded by
    /// `per_callback`.
    ///
    /// Returns the completed names and the failed `(name, reason)` pairs.
    pub async fn run_all(&self, per_callback: Duration) -> (Vec<String>, Vec<(String, String)>) {
        let callbacks = std::mem::take(&mut *self.callbacks.lock());

        let mut completed = Vec::new();
        let mut failed = Vec::new();

        for (name, callback) in callbacks.into_iter().rev() {
            let fut = AssertUnwindSafe(callback()).catch_unwind();
            match timeout(per_callback, fut).await {
                Ok(Ok(Ok(()))) => {
                    debug!(cleanup = %name, "cleanup completed");
                    completed.push(name);
                }
                Ok(Ok(Err(reason))) => {
                    warn!(cleanup = %name, reason = %reason, "cleanup failed");
                    failed.push((name, reason));
                }
                Ok(Err(_)) => {
                    warn!(cleanup = %name, "cleanup panicked");
                    failed.push((name, "panicked".to_string()));
                }
                Err(_) => {
                    warn!(cleanup = %name, timeout_ms = per_callback.as_millis(), "cleanup timed out");
                    failed.push((name, format!("timed out after {per_callback:?}")));
                }
            }
        }

        (completed, failed)
    }
}

impl std::fmt::Debug for CleanupRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CleanupRegistry")
            .field("pending_count", &self.pending_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_cleanup_registry_lifo_order() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let registry = CleanupRegistry::new();

        for i in 1..=3 {
            let order = order.clone();
            registry.register(format!("step-{i}"), move || async move {
                order.lock().push(i);
                Ok(())
            });
        }
        assert_eq!(registry.pending_count(), 3);

        let (completed, failed) = registry.run_all(Duration::from_secs(1)).await;

        assert_eq!(completed, vec!["step-3", "step-2", "step-1"]);
        assert!(failed.is_empty());
        assert_eq!(*order.lock(), vec![3, 2, 1]);
        assert_eq!(registry.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_registry_empty() {
        let registry = CleanupRegistry::new();
        let (completed, failed) = registry.run_all(Duration::from_secs(1)).await;
        assert!(completed.is_empty());
        assert!(failed.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cleanup_timeout_does_not_block_others() {
        let registry = CleanupRegistry::new();
        registry.register("fast", || async { Ok(()) });
        registry.register("slow", || async {
            tokio::time::sleep(Duration::from_secs(600)).await;
            Ok(())
        });

        let (completed, failed) = registry.run_all(Duration::from_secs(5)).await;

        assert_eq!(completed, vec!["fast"]);
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].0, "slow");
        assert!(failed[0].1.contains("timed out"));
    }

    fn explode() -> CleanupResult {
        panic!("boom")
    }

    #[tokio::test]
    async fn test_cleanup_error_and_panic_recorded() {
        let registry = CleanupRegistry::new();
        registry.register("erroring", || async { Err("docker rm failed".to_string()) });
        registry.register("panicking", || async { explode() });

        let (completed, failed) = registry.run_all(Duration::from_secs(1)).await;

        assert!(completed.is_empty());
        assert_eq!(
            failed,
            vec![
                ("panicking".to_string(), "panicked".to_string()),
                ("erroring".to_string(), "docker rm failed".to_string()),
            ]
        );
    }
}
