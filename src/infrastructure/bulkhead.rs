//! Bulkhead Isolation
//!
//! Per-route concurrency limits with a bounded waiting room, so one
//! overloaded route cannot starve the others.

use crate::config::{IsolationConfig, RouteLimitConfig};
use crate::domain::{Context, ContextError};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Default wait timeout when none (or zero) is configured.
pub const DEFAULT_WAIT_TIMEOUT: Duration = Duration::from_millis(50);

/// Bulkhead admission errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BulkheadError {
    /// Capacity and waiting room exhausted, or the wait timed out
    #[error("request rejected")]
    Rejected,
    /// The caller's context ended while waiting for a slot
    #[error("{0}")]
    Cancelled(#[from] ContextError),
}

/// A held bulkhead slot.
///
/// The slot goes back to the limiter on `release()` or on drop, whichever
/// comes first; later calls are no-ops.
#[derive(Debug)]
pub struct BulkheadPermit {
    permit: Option<OwnedSemaphorePermit>,
}

impl BulkheadPermit {
    /// Return the slot. Idempotent.
    pub fn release(&mut self) {
        self.permit.take();
    }

    pub fn is_released(&self) -> bool {
        self.permit.is_none()
    }
}

/// Decrements the waiting-room count when a waiter leaves, on every path.
struct WaiterGuard<'a> {
    waiting: &'a AtomicUsize,
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.waiting.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Concurrency limiter for a single route.
#[derive(Debug)]
pub struct BulkheadLimiter {
    slots: Arc<Semaphore>,
    capacity: usize,
    max_queue: usize,
    waiting: AtomicUsize,
    wait_timeout: Duration,
}

impl BulkheadLimiter {
    /// Create a limiter.
    ///
    /// A zero `capacity` becomes 1 and a zero `wait_timeout` becomes
    /// [`DEFAULT_WAIT_TIMEOUT`].
    pub fn new(capacity: usize, max_queue: usize, wait_timeout: Duration) -> Self {
        let capacity = capacity.max(1);
        let wait_timeout = if wait_timeout.is_zero() {
            DEFAULT_WAIT_TIMEOUT
        } else {
            wait_timeout
        };
        Self {
            slots: Arc::new(Semaphore::new(capacity)),
            capacity,
            max_queue,
            waiting: AtomicUsize::new(0),
            wait_timeout,
        }
    }

    pub fn from_config(config: &RouteLimitConfig) -> Self {
        Self::new(
            config.max_concurrent,
            config.max_queue,
            Duration::from_millis(config.wait_timeout_ms),
        )
    }

    /// Acquire a slot.
    ///
    /// Grants immediately when a slot is free. Otherwise the caller joins
    /// the waiting room (if there is space) and waits for a slot until the
    /// wait timeout elapses or `ctx` ends. Cancellation takes precedence
    /// over a slot freeing up at the same moment.
    pub async fn acquire(&self, ctx: &Context) -> Result<BulkheadPermit, BulkheadError> {
        if let Ok(permit) = self.slots.clone().try_acquire_owned() {
            return Ok(BulkheadPermit { permit: Some(permit) });
        }

        if self.max_queue == 0 {
            return Err(BulkheadError::Rejected);
        }

        let queued = self.waiting.fetch_add(1, Ordering::SeqCst) + 1;
        let _waiter = WaiterGuard { waiting: &self.waiting };
        if queued > self.max_queue {
            tracing::debug!(queued, max_queue = self.max_queue, "bulkhead waiting room full");
            return Err(BulkheadError::Rejected);
        }

        tokio::select! {
            biased;
            cause = ctx.done() => Err(BulkheadError::Cancelled(cause)),
            acquired = self.slots.clone().acquire_owned() => match acquired {
                Ok(permit) => Ok(BulkheadPermit { permit: Some(permit) }),
                // The semaphore is never closed
                Err(_) => Err(BulkheadError::Rejected),
            },
            _ = tokio::time::sleep(self.wait_timeout) => Err(BulkheadError::Rejected),
        }
    }

    /// Slots currently held.
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.available_permits()
    }

    /// Callers currently in the waiting room.
    pub fn waiting(&self) -> usize {
        self.waiting.load(Ordering::SeqCst)
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn max_queue(&self) -> usize {
        self.max_queue
    }

    pub fn wait_timeout(&self) -> Duration {
        self.wait_timeout
    }
}

/// Route key to limiter mapping, fixed at construction.
///
/// Lookups need no lock since the map is never mutated after `new`.
#[derive(Debug, Default)]
pub struct BulkheadManager {
    limiters: HashMap<String, Arc<BulkheadLimiter>>,
}

impl BulkheadManager {
    pub fn new(routes: &HashMap<String, RouteLimitConfig>) -> Self {
        let limiters = routes
            .iter()
            .map(|(route, cfg)| (route.clone(), Arc::new(BulkheadLimiter::from_config(cfg))))
            .collect();
        Self { limiters }
    }

    pub fn from_config(config: &IsolationConfig) -> Self {
        Self::new(&config.routes)
    }

    /// Limiter for `key`, or `None` if the route is unrestricted.
    pub fn limiter_for(&self, key: &str) -> Option<Arc<BulkheadLimiter>> {
        self.limiters.get(key).cloned()
    }

    /// All configured route keys.
    pub fn routes(&self) -> Vec<String> {
        self.limiters.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}
