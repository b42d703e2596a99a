//! No-op Metrics Sink

use crate::domain::ports::MetricsSink;

/// Discards every observation. Used when metrics are not wired.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn observe_error(&self, _code: u16) {}

    fn inc_in_flight(&self, _method: &str, _path: &str) {}

    fn dec_in_flight(&self, _method: &str, _path: &str) {}

    fn observe(&self, _method: &str, _path: &str, _status: u16, _seconds: f64) {}
}
