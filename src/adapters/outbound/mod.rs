mod dashmap_metrics_sink;
mod noop_metrics;

pub use dashmap_metrics_sink::{DashMapMetricsSink, RequestMetrics};
pub use noop_metrics::NoopMetrics;
