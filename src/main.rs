//! admission-core demo server
//!
//! This is the composition root that wires together all the components.

use admission_core::adapters::inbound::TcpServer;
use admission_core::adapters::outbound::DashMapMetricsSink;
use admission_core::config::load_config;
use admission_core::domain::ports::{Component, MetricsSink};
use admission_core::{AdmissionService, App, AppError, Context, ErrorCode, PoolError, WorkerPool};
use std::sync::Arc;
use std::time::Duration;
use tracing::Instrument;
use tracing_subscriber::fmt::format::FmtSpan;

const JOB_DURATION: Duration = Duration::from_millis(200);
const SUBMIT_TIMEOUT: Duration = Duration::from_millis(100);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration from environment
    let cfg = load_config()?;

    // Setup logging
    let log_level = if cfg.debug {
        tracing::Level::DEBUG
    } else {
        tracing::Level::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(log_level)
        .with_span_events(FmtSpan::CLOSE)
        .init();

    tracing::info!(
        listen = %cfg.listen_addr,
        rate_limit = cfg.rate_limit.enabled,
        isolation = cfg.isolation.enabled,
        routes = cfg.isolation.routes.len(),
        "starting admission-core"
    );

    // ===== COMPOSITION ROOT =====

    // 1. Outbound adapters
    let metrics = Arc::new(DashMapMetricsSink::new());

    // 2. Application services
    let admission = Arc::new(AdmissionService::from_config(
        &cfg,
        metrics.clone() as Arc<dyn MetricsSink>,
    ));
    let pool = Arc::new(WorkerPool::new(cfg.pool.clone()));

    // 3. Inbound adapter and routes
    let jobs_pool = pool.clone();
    let server = TcpServer::new(cfg.listen_addr.clone(), admission)
        .route("/ping", |_ctx, _req| async { Ok("pong".to_string()) })
        .route("/slow", |ctx, _req| async move {
            tokio::select! {
                _ = tokio::time::sleep(JOB_DURATION) => Ok("done".to_string()),
                err = ctx.done() => Err(AppError::wrap(ErrorCode::Internal, "interrupted", err)),
            }
        })
        .route("/panic", |_ctx, _req| async {
            if true {
                panic!("panic route hit");
            }
            Ok(String::new())
        })
        .route("/jobs", move |ctx, _req| {
            let pool = jobs_pool.clone();
            async move { submit_job(&pool, &ctx).await }
        });

    // 4. Lifecycle
    let app = App::new(cfg.lifecycle.stop_timeout()).with_components([
        Arc::new(server) as Arc<dyn Component>,
        pool as Arc<dyn Component>,
    ]);

    let result = app.run_until_signal(&Context::background()).await;
    tracing::info!("final metrics:\n{}", metrics.render());
    result.map_err(Into::into)
}

async fn submit_job(pool: &WorkerPool, ctx: &Context) -> Result<String, AppError> {
    let trace_id = ctx.trace_id().unwrap_or_default().to_string();
    let submit_ctx = ctx.with_timeout(SUBMIT_TIMEOUT);

    pool.submit(&submit_ctx, move |job_ctx| {
        let span = job_ctx.with_trace_id(trace_id).span("job");
        async move {
            tokio::select! {
                _ = tokio::time::sleep(JOB_DURATION) => {
                    tracing::info!("job finished");
                    Ok(())
                }
                err = job_ctx.done() => Err(err.into()),
            }
        }
        .instrument(span)
    })
    .await
    .map(|()| "job accepted".to_string())
    .map_err(|e| match e {
        PoolError::Closed => AppError::wrap(ErrorCode::Internal, "worker pool closed", e),
        PoolError::Cancelled(_) => AppError::wrap(ErrorCode::TooManyRequests, "job queue full", e),
    })
}
