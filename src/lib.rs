//! admission-core Library
//!
//! Admission control and lifecycle core for request-serving processes:
//! a bounded worker pool, per-route bulkheads, a global token bucket and a
//! component lifecycle orchestrator.

#![cfg_attr(coverage_nightly, feature(coverage_attribute))]

pub mod adapters;
pub mod application;
pub mod config;
pub mod domain;
pub mod error;
pub mod infrastructure;

// Re-export commonly used types
pub use application::{AdmissionService, App, AppState, LifecycleError, Request, Response};
pub use config::{load_config, Config};
pub use domain::ports::{Component, MetricsSink};
pub use domain::{Context, ContextError};
pub use error::{AppError, ErrorCode};
pub use infrastructure::{
    BulkheadError, BulkheadLimiter, BulkheadManager, PoolError, TokenBucket, WorkerPool,
};
