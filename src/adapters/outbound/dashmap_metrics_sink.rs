//! DashMap Metrics Sink
//!
//! Implements MetricsSink with in-process counters and a Prometheus-style
//! text export.

use crate::domain::ports::MetricsSink;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Counters for one (method, path, status) series.
#[derive(Debug, Default)]
pub struct RequestMetrics {
    /// Finished requests
    pub count: AtomicU64,
    /// Sum of request latencies in microseconds
    pub latency_sum_us: AtomicU64,
}

type RouteKey = (String, String);
type SeriesKey = (String, String, u16);

/// DashMap-backed metrics sink.
///
/// Every series lives in its own map entry, so unrelated routes never
/// contend on the same counter.
#[derive(Default)]
pub struct DashMapMetricsSink {
    requests: DashMap<SeriesKey, RequestMetrics>,
    in_flight: DashMap<RouteKey, AtomicUsize>,
    errors: DashMap<u16, AtomicU64>,
}

impl DashMapMetricsSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Finished requests for a series.
    pub fn request_count(&self, method: &str, path: &str, status: u16) -> u64 {
        self.requests
            .get(&(method.to_string(), path.to_string(), status))
            .map(|m| m.count.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Total latency recorded for a series, in seconds.
    pub fn latency_sum(&self, method: &str, path: &str, status: u16) -> f64 {
        self.requests
            .get(&(method.to_string(), path.to_string(), status))
            .map(|m| m.latency_sum_us.load(Ordering::Relaxed) as f64 / 1_000_000.0)
            .unwrap_or(0.0)
    }

    pub fn in_flight(&self, method: &str, path: &str) -> usize {
        self.in_flight
            .get(&(method.to_string(), path.to_string()))
            .map(|g| g.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    pub fn error_count(&self, code: u16) -> u64 {
        self.errors
            .get(&code)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    /// Export all series in Prometheus text format, sorted for stable output.
    pub fn render(&self) -> String {
        let mut output = String::new();

        let mut requests: Vec<(SeriesKey, u64, u64)> = self
            .requests
            .iter()
            .map(|e| {
                (
                    e.key().clone(),
                    e.count.load(Ordering::Relaxed),
                    e.latency_sum_us.load(Ordering::Relaxed),
                )
            })
            .collect();
        requests.sort_by(|a, b| a.0.cmp(&b.0));

        output.push_str("# HELP admission_requests_total Finished requests\n");
        output.push_str("# TYPE admission_requests_total counter\n");
        for ((method, path, status), count, _) in &requests {
            output.push_str(&format!(
                "admission_requests_total{{method=\"{}\",path=\"{}\",status=\"{}\"}} {}\n",
                method, path, status, count
            ));
        }

        output.push_str("# HELP admission_request_duration_seconds_sum Total request latency\n");
        output.push_str("# TYPE admission_request_duration_seconds_sum counter\n");
        for ((method, path, status), _, sum_us) in &requests {
            output.push_str(&format!(
                "admission_request_duration_seconds_sum{{method=\"{}\",path=\"{}\",status=\"{}\"}} {:.6}\n",
                method,
                path,
                status,
                *sum_us as f64 / 1_000_000.0
            ));
        }

        let mut in_flight: Vec<(RouteKey, usize)> = self
            .in_flight
            .iter()
            .map(|e| (e.key().clone(), e.load(Ordering::Relaxed)))
            .collect();
        in_flight.sort_by(|a, b| a.0.cmp(&b.0));

        output.push_str("# HELP admission_requests_in_flight Requests currently being handled\n");
        output.push_str("# TYPE admission_requests_in_flight gauge\n");
        for ((method, path), value) in &in_flight {
            output.push_str(&format!(
                "admission_requests_in_flight{{method=\"{}\",path=\"{}\"}} {}\n",
                method, path, value
            ));
        }

        let mut errors: Vec<(u16, u64)> = self
            .errors
            .iter()
            .map(|e| (*e.key(), e.load(Ordering::Relaxed)))
            .collect();
        errors.sort();

        output.push_str("# HELP admission_errors_total Error responses by code\n");
        output.push_str("# TYPE admission_errors_total counter\n");
        for (code, count) in &errors {
            output.push_str(&format!(
                "admission_errors_total{{code=\"{}\"}} {}\n",
                code, count
            ));
        }

        output
    }
}

impl MetricsSink for DashMapMetricsSink {
    fn observe_error(&self, code: u16) {
        self.errors
            .entry(code)
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn inc_in_flight(&self, method: &str, path: &str) {
        self.in_flight
            .entry((method.to_string(), path.to_string()))
            .or_default()
            .fetch_add(1, Ordering::Relaxed);
    }

    fn dec_in_flight(&self, method: &str, path: &str) {
        if let Some(gauge) = self.in_flight.get(&(method.to_string(), path.to_string())) {
            // Saturate at zero on unmatched decrements
            let mut current = gauge.load(Ordering::Relaxed);
            while current > 0 {
                match gauge.compare_exchange_weak(
                    current,
                    current - 1,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(c) => current = c,
                }
            }
        }
    }

    fn observe(&self, method: &str, path: &str, status: u16, seconds: f64) {
        let entry = self
            .requests
            .entry((method.to_string(), path.to_string(), status))
            .or_default();
        entry.count.fetch_add(1, Ordering::Relaxed);
        let micros = (seconds.max(0.0) * 1_000_000.0) as u64;
        entry.latency_sum_us.fetch_add(micros, Ordering::Relaxed);
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_empty_sink() {
        let sink = DashMapMetricsSink::new();
        assert_eq!(sink.request_count("GET", "/ping", 200), 0);
        assert_eq!(sink.in_flight("GET", "/ping"), 0);
        assert_eq!(sink.error_count(429), 0);
        assert_eq!(sink.latency_sum("GET", "/ping", 200), 0.0);
    }

    #[test]
    fn test_observe_accumulates_per_series() {
        let sink = DashMapMetricsSink::new();

        sink.observe("GET", "/ping", 200, 0.5);
        sink.observe("GET", "/ping", 200, 0.25);
        sink.observe("GET", "/ping", 429, 0.001);

        assert_eq!(sink.request_count("GET", "/ping", 200), 2);
        assert_eq!(sink.request_count("GET", "/ping", 429), 1);
        assert!((sink.latency_sum("GET", "/ping", 200) - 0.75).abs() < 1e-6);
    }

    #[test]
    fn test_in_flight_gauge() {
        let sink = DashMapMetricsSink::new();

        sink.inc_in_flight("GET", "/slow");
        sink.inc_in_flight("GET", "/slow");
        assert_eq!(sink.in_flight("GET", "/slow"), 2);

        sink.dec_in_flight("GET", "/slow");
        assert_eq!(sink.in_flight("GET", "/slow"), 1);
        assert_eq!(sink.in_flight("POST", "/slow"), 0);
    }

    #[test]
    fn test_in_flight_saturates_at_zero() {
        let sink = DashMapMetricsSink::new();

        sink.dec_in_flight("GET", "/never");
        sink.inc_in_flight("GET", "/ping");
        sink.dec_in_flight("GET", "/ping");
        sink.dec_in_flight("GET", "/ping");

        assert_eq!(sink.in_flight("GET", "/ping"), 0);
        assert_eq!(sink.in_flight("GET", "/never"), 0);
    }

    #[test]
    fn test_error_counts() {
        let sink = DashMapMetricsSink::new();

        sink.observe_error(429);
        sink.observe_error(429);
        sink.observe_error(500);

        assert_eq!(sink.error_count(429), 2);
        assert_eq!(sink.error_count(500), 1);
    }

    #[test]
    fn test_render() {
        let sink = DashMapMetricsSink::new();
        sink.observe("GET", "/ping", 200, 0.002);
        sink.inc_in_flight("GET", "/slow");
        sink.observe_error(429);

        let text = sink.render();
        assert!(text.contains("# TYPE admission_requests_total counter"));
        assert!(text.contains(
            "admission_requests_total{method=\"GET\",path=\"/ping\",status=\"200\"} 1"
        ));
        assert!(text.contains(
            "admission_request_duration_seconds_sum{method=\"GET\",path=\"/ping\",status=\"200\"} 0.002000"
        ));
        assert!(text.contains("admission_requests_in_flight{method=\"GET\",path=\"/slow\"} 1"));
        assert!(text.contains("admission_errors_total{code=\"429\"} 1"));
    }

    #[test]
    fn test_render_is_sorted() {
        let sink = DashMapMetricsSink::new();
        sink.observe("GET", "/b", 200, 0.0);
        sink.observe("GET", "/a", 200, 0.0);

        let text = sink.render();
        let a = text.find("path=\"/a\"").unwrap();
        let b = text.find("path=\"/b\"").unwrap();
        assert!(a < b);
    }

    #[test]
    fn test_concurrent_observe() {
        let sink = Arc::new(DashMapMetricsSink::new());
        let mut handles = vec![];

        for _ in 0..10 {
            let sink = sink.clone();
            handles.push(thread::spawn(move || {
                for _ in 0..100 {
                    sink.inc_in_flight("GET", "/ping");
                    sink.observe("GET", "/ping", 200, 0.001);
                    sink.dec_in_flight("GET", "/ping");
                }
            }));
        }

        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(sink.request_count("GET", "/ping", 200), 1000);
        assert_eq!(sink.in_flight("GET", "/ping"), 0);
    }
}
