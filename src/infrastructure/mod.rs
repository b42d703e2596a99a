//! Infrastructure Layer
//!
//! Admission limiters, the worker pool and shutdown plumbing.

pub mod bulkhead;
pub mod rate_limiter;
pub mod shutdown;
pub mod worker_pool;

pub use bulkhead::{BulkheadError, BulkheadLimiter, BulkheadManager, BulkheadPermit};
pub use rate_limiter::TokenBucket;
pub use shutdown::{wait_signal, DrainGuard, DrainTracker};
pub use worker_pool::{PoolError, PoolStats, WorkerPool};
