//! Request Context
//!
//! Cancellation, deadline and trace-id propagation for every blocking
//! operation in the admission core.

use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Why a context ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ContextError {
    #[error("context canceled")]
    Cancelled,
    #[error("context deadline exceeded")]
    DeadlineExceeded,
}

/// Cancellable execution context.
///
/// Cloning is cheap and clones share the same cancellation state. Derived
/// contexts (`with_cancel`, `with_timeout`) observe the parent's cancellation,
/// but cancelling a child never reaches the parent.
#[derive(Debug, Clone)]
pub struct Context {
    token: CancellationToken,
    deadline: Option<Instant>,
    trace_id: Option<String>,
}

impl Context {
    /// A root context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self {
            token: CancellationToken::new(),
            deadline: None,
            trace_id: None,
        }
    }

    /// Derive a child context that can be cancelled on its own.
    pub fn with_cancel(&self) -> Self {
        Self {
            token: self.token.child_token(),
            deadline: self.deadline,
            trace_id: self.trace_id.clone(),
        }
    }

    /// Derive a child context that expires after `timeout`.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Derive a child context that expires at `deadline`, or at the parent's
    /// deadline if that comes first.
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = match self.deadline {
            Some(parent) if parent < deadline => parent,
            _ => deadline,
        };
        Self {
            token: self.token.child_token(),
            deadline: Some(deadline),
            trace_id: self.trace_id.clone(),
        }
    }

    /// Same cancellation state, different trace id.
    pub fn with_trace_id(&self, trace_id: impl Into<String>) -> Self {
        Self {
            token: self.token.clone(),
            deadline: self.deadline,
            trace_id: Some(trace_id.into()),
        }
    }

    pub fn trace_id(&self) -> Option<&str> {
        self.trace_id.as_deref()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Cancel this context and everything derived from it.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Why the context ended, or `None` while it is still live.
    ///
    /// Cancellation wins over an expired deadline.
    pub fn err(&self) -> Option<ContextError> {
        if self.token.is_cancelled() {
            return Some(ContextError::Cancelled);
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(ContextError::DeadlineExceeded),
            _ => None,
        }
    }

    pub fn is_done(&self) -> bool {
        self.err().is_some()
    }

    /// Resolve once the context is cancelled or its deadline passes.
    pub async fn done(&self) -> ContextError {
        match self.deadline {
            Some(deadline) => {
                tokio::select! {
                    biased;
                    _ = self.token.cancelled() => ContextError::Cancelled,
                    _ = tokio::time::sleep_until(deadline) => ContextError::DeadlineExceeded,
                }
            }
            None => {
                self.token.cancelled().await;
                ContextError::Cancelled
            }
        }
    }

    /// A tracing span tagged with this context's trace id.
    pub fn span(&self, name: &'static str) -> tracing::Span {
        tracing::info_span!("ctx", op = name, trace_id = self.trace_id.as_deref().unwrap_or(""))
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::background()
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;

    #[test]
    fn test_background_is_live() {
        let ctx = Context::background();
        assert!(!ctx.is_done());
        assert!(ctx.err().is_none());
        assert!(ctx.deadline().is_none());
        assert!(ctx.trace_id().is_none());
    }

    #[test]
    fn test_cancel_propagates_to_children_only() {
        let parent = Context::background();
        let child = parent.with_cancel();
        let grandchild = child.with_cancel();

        child.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
        assert_eq!(grandchild.err(), Some(ContextError::Cancelled));
        assert!(!parent.is_done());
    }

    #[test]
    fn test_parent_cancel_reaches_timeout_child() {
        let parent = Context::background().with_cancel();
        let child = parent.with_timeout(Duration::from_secs(60));
        parent.cancel();
        assert_eq!(child.err(), Some(ContextError::Cancelled));
    }

    #[tokio::test]
    async fn test_child_deadline_never_exceeds_parent() {
        let parent = Context::background().with_timeout(Duration::from_millis(50));
        let child = parent.with_timeout(Duration::from_secs(60));
        assert_eq!(child.deadline(), parent.deadline());

        let shorter = parent.with_timeout(Duration::from_millis(1));
        assert!(shorter.deadline() < parent.deadline());
    }

    #[tokio::test]
    async fn test_done_on_deadline() {
        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let err = ctx.done().await;
        assert_eq!(err, ContextError::DeadlineExceeded);
        assert_eq!(ctx.err(), Some(ContextError::DeadlineExceeded));
    }

    #[tokio::test]
    async fn test_done_on_cancel() {
        let ctx = Context::background().with_cancel();
        let c = ctx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            c.cancel();
        });
        assert_eq!(ctx.done().await, ContextError::Cancelled);
    }

    #[test]
    fn test_trace_id_shares_cancellation() {
        let ctx = Context::background().with_cancel();
        let traced = ctx.with_trace_id("abc123");
        assert_eq!(traced.trace_id(), Some("abc123"));

        ctx.cancel();
        assert!(traced.is_done());
    }

    #[test]
    fn test_context_error_display() {
        assert_eq!(ContextError::Cancelled.to_string(), "context canceled");
        assert_eq!(
            ContextError::DeadlineExceeded.to_string(),
            "context deadline exceeded"
        );
    }
}
