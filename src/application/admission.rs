//! Admission Service - request admission use case
//!
//! Runs every request through the global rate limit, the per-route bulkhead
//! and a panic boundary, and reports the outcome to the metrics sink. This
//! is the interface the inbound transport calls.

use crate::config::Config;
use crate::domain::ports::MetricsSink;
use crate::domain::Context;
use crate::error::{AppError, ErrorCode};
use crate::infrastructure::worker_pool::panic_message;
use crate::infrastructure::{BulkheadManager, TokenBucket};
use futures::FutureExt;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Instant;

/// An inbound request, as far as admission cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub method: String,
    pub path: String,
    /// Caller-supplied trace id, if any
    pub trace_id: Option<String>,
}

impl Request {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            trace_id: None,
        }
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }
}

/// Outcome of a handled request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub status: u16,
    pub message: String,
    pub trace_id: String,
}

impl Response {
    pub fn is_success(&self) -> bool {
        self.status < 400
    }
}

impl fmt::Display for Response {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.status, self.message)
    }
}

/// Admission service - main application use case.
///
/// Holds the optional global throttle, the optional bulkhead table and the
/// metrics sink. All three are injected; nothing here is global.
pub struct AdmissionService {
    rate_limiter: Option<TokenBucket>,
    bulkheads: Option<BulkheadManager>,
    metrics: Arc<dyn MetricsSink>,
}

impl AdmissionService {
    /// Create a service with no limits configured.
    pub fn new(metrics: Arc<dyn MetricsSink>) -> Self {
        Self {
            rate_limiter: None,
            bulkheads: None,
            metrics,
        }
    }

    /// Build limiters for whichever features the configuration enables.
    pub fn from_config(config: &Config, metrics: Arc<dyn MetricsSink>) -> Self {
        let mut service = Self::new(metrics);
        if config.rate_limit.enabled {
            service = service.with_rate_limiter(TokenBucket::from_config(&config.rate_limit));
        }
        if config.isolation.enabled {
            service = service.with_bulkheads(BulkheadManager::from_config(&config.isolation));
        }
        service
    }

    pub fn with_rate_limiter(mut self, limiter: TokenBucket) -> Self {
        self.rate_limiter = Some(limiter);
        self
    }

    pub fn with_bulkheads(mut self, bulkheads: BulkheadManager) -> Self {
        self.bulkheads = Some(bulkheads);
        self
    }

    pub fn rate_limiter(&self) -> Option<&TokenBucket> {
        self.rate_limiter.as_ref()
    }

    pub fn bulkheads(&self) -> Option<&BulkheadManager> {
        self.bulkheads.as_ref()
    }

    pub fn metrics(&self) -> &Arc<dyn MetricsSink> {
        &self.metrics
    }

    /// Admit and run a request.
    ///
    /// The handler receives the request context, tagged with the trace id.
    /// Its success text becomes a 200 response; its [`AppError`] maps to
    /// the error code's status. Rejections never reach the handler.
    pub async fn handle<F, Fut>(&self, ctx: &Context, request: &Request, handler: F) -> Response
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        let trace_id = request
            .trace_id
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().simple().to_string());
        let ctx = ctx.with_trace_id(trace_id.clone());
        let method = request.method.as_str();
        let path = request.path.as_str();

        self.metrics.inc_in_flight(method, path);
        let started = Instant::now();

        let result = self.admit_and_run(&ctx, request, handler).await;

        let cost = started.elapsed();
        let (status, message) = match &result {
            Ok(body) => (ErrorCode::Ok.status(), body.clone()),
            Err(e) => (e.status(), e.message.clone()),
        };

        self.metrics.observe(method, path, status, cost.as_secs_f64());
        if let Err(e) = &result {
            self.metrics.observe_error(e.code.as_u16());
            if e.code == ErrorCode::Internal {
                tracing::error!(trace_id = %trace_id, method, path, "request failed: {}", e);
            } else {
                tracing::debug!(trace_id = %trace_id, method, path, "request refused: {}", e);
            }
        }
        self.metrics.dec_in_flight(method, path);

        tracing::info!(
            trace_id = %trace_id,
            method,
            path,
            status,
            cost_ms = cost.as_millis() as u64,
            "request handled"
        );

        Response {
            status,
            message,
            trace_id,
        }
    }

    async fn admit_and_run<F, Fut>(
        &self,
        ctx: &Context,
        request: &Request,
        handler: F,
    ) -> Result<String, AppError>
    where
        F: FnOnce(Context) -> Fut,
        Fut: Future<Output = Result<String, AppError>>,
    {
        // Global throttle
        if let Some(limiter) = &self.rate_limiter {
            if !limiter.allow() {
                return Err(AppError::new(ErrorCode::TooManyRequests, "too many requests"));
            }
        }

        // Per-route isolation; the permit is held until the handler returns
        let _permit = match self
            .bulkheads
            .as_ref()
            .and_then(|b| b.limiter_for(&request.path))
        {
            Some(limiter) => Some(limiter.acquire(ctx).await?),
            None => None,
        };

        let handler_ctx = ctx.clone();
        match AssertUnwindSafe(async move { handler(handler_ctx).await })
            .catch_unwind()
            .await
        {
            Ok(result) => result,
            Err(panic) => {
                tracing::error!(
                    method = %request.method,
                    path = %request.path,
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                );
                Err(AppError::new(ErrorCode::Internal, "internal server error"))
            }
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::adapters::outbound::DashMapMetricsSink;
    use crate::config::{IsolationConfig, RouteLimitConfig};
    use std::collections::HashMap;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;
    use tracing_test::traced_test;

    fn service() -> (AdmissionService, Arc<DashMapMetricsSink>) {
        let metrics = Arc::new(DashMapMetricsSink::new());
        (AdmissionService::new(metrics.clone()), metrics)
    }

    fn bulkheads(route: &str, max_concurrent: usize, max_queue: usize) -> BulkheadManager {
        let mut routes = HashMap::new();
        routes.insert(
            route.to_string(),
            RouteLimitConfig {
                max_concurrent,
                max_queue,
                wait_timeout_ms: 50,
            },
        );
        BulkheadManager::new(&routes)
    }

    #[tokio::test]
    async fn test_success_response() {
        let (svc, metrics) = service();
        let req = Request::new("GET", "/ping");

        let resp = svc
            .handle(&Context::background(), &req, |_ctx| async { Ok("pong".to_string()) })
            .await;

        assert_eq!(resp.status, 200);
        assert_eq!(resp.message, "pong");
        assert!(resp.is_success());
        assert_eq!(resp.to_string(), "200 pong");
        assert_eq!(metrics.request_count("GET", "/ping", 200), 1);
        assert_eq!(metrics.in_flight("GET", "/ping"), 0);
    }

    #[tokio::test]
    async fn test_trace_id_propagation() {
        let (svc, _) = service();

        let req = Request::new("GET", "/ping").with_trace_id("trace-42");
        let resp = svc
            .handle(&Context::background(), &req, |ctx| async move {
                Ok(ctx.trace_id().unwrap_or_default().to_string())
            })
            .await;
        assert_eq!(resp.trace_id, "trace-42");
        assert_eq!(resp.message, "trace-42");

        // Generated when absent
        let req = Request::new("GET", "/ping");
        let resp = svc
            .handle(&Context::background(), &req, |_| async { Ok(String::new()) })
            .await;
        assert_eq!(resp.trace_id.len(), 32);
    }

    #[tokio::test]
    async fn test_app_error_maps_to_status() {
        let (svc, metrics) = service();
        let req = Request::new("GET", "/users/7");

        let resp = svc
            .handle(&Context::background(), &req, |_| async {
                Err(AppError::new(ErrorCode::NotFound, "user not found"))
            })
            .await;

        assert_eq!(resp.status, 404);
        assert_eq!(resp.message, "user not found");
        assert_eq!(metrics.error_count(404), 1);
        assert_eq!(metrics.request_count("GET", "/users/7", 404), 1);
    }

    #[tokio::test]
    async fn test_rate_limit_rejects_without_running_handler() {
        let (svc, metrics) = service();
        let svc = svc.with_rate_limiter(TokenBucket::new(0.001, 1));
        let req = Request::new("GET", "/ping");
        let ctx = Context::background();

        let first = svc.handle(&ctx, &req, |_| async { Ok("ok".to_string()) }).await;
        assert_eq!(first.status, 200);

        let mut ran = false;
        let second = svc
            .handle(&ctx, &req, |_| {
                ran = true;
                async { Ok("ok".to_string()) }
            })
            .await;
        assert!(!ran);
        assert_eq!(second.status, 429);
        assert_eq!(second.message, "too many requests");
        assert_eq!(metrics.error_count(429), 1);
    }

    #[tokio::test]
    async fn test_bulkhead_rejects_when_full() {
        let (svc, metrics) = service();
        let svc = Arc::new(svc.with_bulkheads(bulkheads("/slow", 1, 0)));
        let gate = CancellationToken::new();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let holder = {
            let svc = svc.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                let req = Request::new("GET", "/slow");
                svc.handle(&Context::background(), &req, move |_| async move {
                    let _ = entered_tx.send(());
                    gate.cancelled().await;
                    Ok("done".to_string())
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let req = Request::new("GET", "/slow");
        let rejected = svc
            .handle(&Context::background(), &req, |_| async { Ok("no".to_string()) })
            .await;
        assert_eq!(rejected.status, 429);
        assert_eq!(rejected.message, "request rejected");

        // Other routes are not isolated by /slow
        let other = svc
            .handle(&Context::background(), &Request::new("GET", "/ping"), |_| async {
                Ok("pong".to_string())
            })
            .await;
        assert_eq!(other.status, 200);

        gate.cancel();
        assert_eq!(holder.await.unwrap().status, 200);
        assert_eq!(metrics.in_flight("GET", "/slow"), 0);

        // Slot freed after the holder finished
        let again = svc
            .handle(&Context::background(), &req, |_| async { Ok("yes".to_string()) })
            .await;
        assert_eq!(again.status, 200);
    }

    #[tokio::test]
    async fn test_bulkhead_permit_released_after_error() {
        let (svc, _) = service();
        let svc = svc.with_bulkheads(bulkheads("/jobs", 1, 0));
        let req = Request::new("POST", "/jobs");

        let resp = svc
            .handle(&Context::background(), &req, |_| async {
                Err(AppError::new(ErrorCode::BadRequest, "bad job"))
            })
            .await;
        assert_eq!(resp.status, 400);

        let limiter = svc.bulkheads().unwrap().limiter_for("/jobs").unwrap();
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    #[traced_test]
    async fn test_panic_becomes_internal_error() {
        let (svc, metrics) = service();
        let svc = svc.with_bulkheads(bulkheads("/panic", 1, 0));
        let req = Request::new("GET", "/panic");

        let resp = svc
            .handle(&Context::background(), &req, |_| async {
                if true {
                    panic!("handler exploded");
                }
                Ok(String::new())
            })
            .await;

        assert_eq!(resp.status, 500);
        assert_eq!(resp.message, "internal server error");
        assert_eq!(metrics.error_count(500), 1);
        assert!(logs_contain("handler panicked: handler exploded"));

        // The permit was released despite the panic
        let limiter = svc.bulkheads().unwrap().limiter_for("/panic").unwrap();
        assert_eq!(limiter.in_use(), 0);
    }

    #[tokio::test]
    async fn test_from_config_respects_enabled_flags() {
        let metrics: Arc<dyn MetricsSink> = Arc::new(DashMapMetricsSink::new());

        let mut config = Config::default();
        let svc = AdmissionService::from_config(&config, metrics.clone());
        assert!(svc.rate_limiter().is_none());
        assert!(svc.bulkheads().is_none());

        config.rate_limit.enabled = true;
        config.isolation = IsolationConfig {
            enabled: true,
            routes: [("/slow".to_string(), RouteLimitConfig::default())]
                .into_iter()
                .collect(),
        };
        let svc = AdmissionService::from_config(&config, metrics);
        assert_eq!(svc.rate_limiter().unwrap().burst(), 50.0);
        assert!(svc.bulkheads().unwrap().limiter_for("/slow").is_some());
    }

    #[tokio::test]
    async fn test_cancelled_wait_is_rejected() {
        let (svc, _) = service();
        let svc = Arc::new(svc.with_bulkheads({
            let mut routes = HashMap::new();
            routes.insert(
                "/slow".to_string(),
                RouteLimitConfig {
                    max_concurrent: 1,
                    max_queue: 1,
                    wait_timeout_ms: 5_000,
                },
            );
            BulkheadManager::new(&routes)
        }));
        let gate = CancellationToken::new();
        let (entered_tx, entered_rx) = tokio::sync::oneshot::channel();

        let holder = {
            let svc = svc.clone();
            let gate = gate.clone();
            tokio::spawn(async move {
                svc.handle(&Context::background(), &Request::new("GET", "/slow"), move |_| {
                    async move {
                        let _ = entered_tx.send(());
                        gate.cancelled().await;
                        Ok(String::new())
                    }
                })
                .await
            })
        };
        entered_rx.await.unwrap();

        let ctx = Context::background().with_timeout(Duration::from_millis(20));
        let resp = svc
            .handle(&ctx, &Request::new("GET", "/slow"), |_| async { Ok(String::new()) })
            .await;
        assert_eq!(resp.status, 429);

        gate.cancel();
        holder.await.unwrap();
    }
}
