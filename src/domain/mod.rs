//! Domain Layer
//!
//! Types and ports shared by the admission core. No I/O lives here.

pub mod context;
pub mod ports;

pub use context::{Context, ContextError};
pub use ports::{Component, MetricsSink};
