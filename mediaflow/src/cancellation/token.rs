//! Cancellation token shared between a caller and running pipelines.

use crate::errors::MediaflowError;
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

/// A callback type for cancellation notifications.
pub type CancelCallback = Box<dyn Fn() + Send + Sync>;

#[derive(Default)]
struct Inner {
    cancelled: AtomicBool,
    reason: RwLock<Option<String>>,
    callbacks: RwLock<Vec<CancelCallback>>,
    notify: Notify,
}

/// A cloneable token for cooperative cancellation.
///
/// Clones share state. Cancellation is idempotent; the first reason is kept.
#[derive(Clone, Default)]
pub struct CancellationToken {
    inner: Arc<Inner>,
}

impl CancellationToken {
    /// Creates a new, uncancelled token.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests cancellation.
    ///
    /// Callbacks run immediately; a panicking callback is logged and skipped.
    pub fn cancel(&self, reason: impl Into<String>) {
        if self
            .inner
            .cancelled
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return;
        }
        let reason = reason.into();
        info!(reason = %reason, "Cancellation requested");
        *self.inner.reason.write() = Some(reason);

        for callback in self.inner.callbacks.read().iter() {
            run_callback(callback.as_ref());
        }
        self.inner.notify.notify_waiters();
    }

    /// Registers a callback to run on cancellation, or now if already
    /// cancelled.
    pub fn on_cancel<F>(&self, callback: F)
    where
        F: Fn() + Send + Sync + 'static,
    {
        if self.is_cancelled() {
            run_callback(&callback);
        } else {
            self.inner.callbacks.write().push(Box::new(callback));
        }
    }

    /// Returns whether cancellation has been requested.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::SeqCst)
    }

    /// The cancellation reason, if any.
    #[must_use]
    pub fn reason(&self) -> Option<String> {
        self.inner.reason.read().clone()
    }

    /// Fails with `MediaflowError::Cancelled` once cancellation was requested.
    pub fn check(&self) -> Result<(), MediaflowError> {
        if self.is_cancelled() {
            Err(MediaflowError::Cancelled(
                self.reason().unwrap_or_else(|| "cancelled".to_string()),
            ))
        } else {
            Ok(())
        }
    }

    /// Resolves once cancellation is requested.
    pub async fn cancelled(&self) {
        loop {
            let notified = self.inner.notify.notified();
            if self.is_cancelled() {
                return;
            }
            notified.await;
        }
    }
}

fn run_callback(callback: &(dyn Fn() + Send + Sync)) {
    if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(callback)) {
        warn!("Cancellation callback panicked: {:?}", e);
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
    use std::time::Duration;

    #[test]
    fn test_clones_share_state() {
        let token = CancellationToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());

        clone.cancel("operator stop");

        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("operator stop"));
        assert!(matches!(token.check(), Err(MediaflowError::Cancelled(r)) if r == "operator stop"));
    }

    #[test]
    fn test_first_reason_wins() {
        let token = CancellationToken::new();
        token.cancel("first");
        token.cancel("second");
        assert_eq!(token.reason().as_deref(), Some("first"));
    }

    #[test]
    fn test_callbacks() {
        let token = CancellationToken::new();
        let counter = Arc::new(AtomicUsize::new(0));

        let before = counter.clone();
        token.on_cancel(move || {
            before.fetch_add(1, Ordering::SeqCst);
        });
        token.on_cancel(|| panic!("Intentional panic"));
        token.cancel("stop");
        assert_eq!(counter.load(Ordering::SeqCst), 1);

        let after = counter.clone();
        token.on_cancel(move || {
            after.fetch_add(1, Ordering::SeqCst);
        });
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_cancelled_future() {
        let token = CancellationToken::new();
        let trigger = token.clone();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            trigger.cancel("timer");
        });

        tokio::time::timeout(Duration::from_secs(2), token.cancelled())
            .await
            .unwrap();
        assert!(token.is_cancelled());
    }
}
