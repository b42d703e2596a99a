//! Graceful Shutdown
//!
//! Process signal handling and connection drain tracking.

use crate::domain::{Context, ContextError};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// Counts in-flight connections so a stopping listener can wait for them.
#[derive(Clone, Default)]
pub struct DrainTracker {
    active: Arc<AtomicUsize>,
    drained: Arc<Notify>,
}

impl DrainTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of connections currently tracked.
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    /// Track a connection until the returned guard is dropped.
    pub fn track(&self) -> DrainGuard {
        self.active.fetch_add(1, Ordering::SeqCst);
        DrainGuard {
            tracker: self.clone(),
        }
    }

    fn release(&self) {
        if self.active.fetch_sub(1, Ordering::SeqCst) == 1 {
            self.drained.notify_waiters();
        }
    }

    /// Wait until no connection is tracked, or until `ctx` ends.
    pub async fn wait(&self, ctx: &Context) -> Result<(), ContextError> {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            // Register before checking so a release in between is not lost.
            notified.as_mut().enable();

            if self.active() == 0 {
                return Ok(());
            }

            tokio::select! {
                biased;
                err = ctx.done() => {
                    tracing::warn!("drain incomplete: {} connections still active", self.active());
                    return Err(err);
                }
                _ = &mut notified => {}
            }
        }
    }
}

/// RAII guard for a tracked connection.
pub struct DrainGuard {
    tracker: DrainTracker,
}

impl Drop for DrainGuard {
    fn drop(&mut self) {
        self.tracker.release();
    }
}

/// Wait for SIGINT or SIGTERM (Ctrl+C only off unix).
///
/// Returns the context's error if it ends first.
#[cfg_attr(coverage_nightly, coverage(off))]
pub async fn wait_signal(ctx: &Context) -> Result<(), ContextError> {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        err = ctx.done() => Err(err),
        _ = ctrl_c => {
            tracing::info!("received Ctrl+C, initiating shutdown");
            Ok(())
        }
        _ = terminate => {
            tracing::info!("received SIGTERM, initiating shutdown");
            Ok(())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_tracker_new() {
        let tracker = DrainTracker::new();
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn test_guards_count_connections() {
        let tracker = DrainTracker::new();

        let guard1 = tracker.track();
        let guard2 = tracker.track();
        assert_eq!(tracker.active(), 2);

        drop(guard1);
        assert_eq!(tracker.active(), 1);

        drop(guard2);
        assert_eq!(tracker.active(), 0);
    }

    #[test]
    fn test_clone_shares_count() {
        let tracker = DrainTracker::new();
        let cloned = tracker.clone();

        let _guard = tracker.track();
        assert_eq!(cloned.active(), 1);
    }

    #[tokio::test]
    async fn test_wait_immediate_when_idle() {
        let tracker = DrainTracker::new();
        let ctx = Context::background().with_timeout(Duration::from_millis(100));
        assert!(tracker.wait(&ctx).await.is_ok());
    }

    #[tokio::test]
    async fn test_wait_for_drain_with_connections() {
        let tracker = DrainTracker::new();
        let guard = tracker.track();

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(30)).await;
            drop(guard);
        });

        let ctx = Context::background().with_timeout(Duration::from_secs(1));
        assert!(tracker.wait(&ctx).await.is_ok());
        assert_eq!(tracker.active(), 0);
    }

    #[tokio::test]
    async fn test_wait_until_deadline() {
        let tracker = DrainTracker::new();
        let _guard = tracker.track();

        let ctx = Context::background().with_timeout(Duration::from_millis(30));
        assert_eq!(
            tracker.wait(&ctx).await,
            Err(ContextError::DeadlineExceeded)
        );
    }

    #[tokio::test]
    async fn test_wait_signal_returns_on_cancel() {
        let ctx = Context::background().with_cancel();
        ctx.cancel();
        assert_eq!(wait_signal(&ctx).await, Err(ContextError::Cancelled));
    }
}
