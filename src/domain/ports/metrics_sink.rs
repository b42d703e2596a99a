//! Metrics Sink Port
//!
//! Defines the interface the admission path reports request outcomes to.

/// Sink for request-level metrics.
///
/// This is an outbound port. Implementations are injected as
/// `Arc<dyn MetricsSink>` at the composition root.
pub trait MetricsSink: Send + Sync {
    /// Count an error response by its application error code.
    fn observe_error(&self, code: u16);

    /// A request entered the handler chain.
    fn inc_in_flight(&self, method: &str, path: &str);

    /// A request left the handler chain.
    fn dec_in_flight(&self, method: &str, path: &str);

    /// Record a finished request with its status and latency.
    fn observe(&self, method: &str, path: &str, status: u16, seconds: f64);
}
