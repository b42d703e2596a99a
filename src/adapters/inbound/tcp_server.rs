//! TCP Server Adapter
//!
//! Line-oriented request listener. Each line `METHOD PATH [TRACE_ID]` is
//! admitted through the AdmissionService and answered with one line
//! `STATUS MESSAGE`.

use crate::application::{AdmissionService, Request};
use crate::domain::ports::Component;
use crate::domain::Context;
use crate::error::{AppError, ErrorCode};
use crate::infrastructure::{DrainGuard, DrainTracker};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::collections::HashMap;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

/// A route handler. Returns the success message or a coded error.
pub type Handler =
    Arc<dyn Fn(Context, Request) -> BoxFuture<'static, Result<String, AppError>> + Send + Sync>;

/// TCP Server - inbound adapter for line requests.
///
/// This adapter:
/// 1. Binds on `start` and accepts connections in a background task
/// 2. Parses each request line and looks up its route
/// 3. Runs the route through admission control
/// 4. On `stop`, stops accepting and waits for open connections to drain
///
/// Request contexts derive from the server's own context, so handlers see
/// cancellation as soon as `stop` begins.
pub struct TcpServer {
    listen_addr: String,
    admission: Arc<AdmissionService>,
    routes: HashMap<String, Handler>,
    shutdown: Context,
    connections: DrainTracker,
    local_addr: parking_lot::Mutex<Option<SocketAddr>>,
    accept_task: tokio::sync::Mutex<Option<JoinHandle<()>>>,
}

impl TcpServer {
    /// Create a new TCP server.
    pub fn new(listen_addr: impl Into<String>, admission: Arc<AdmissionService>) -> Self {
        Self {
            listen_addr: listen_addr.into(),
            admission,
            routes: HashMap::new(),
            shutdown: Context::background().with_cancel(),
            connections: DrainTracker::new(),
            local_addr: parking_lot::Mutex::new(None),
            accept_task: tokio::sync::Mutex::new(None),
        }
    }

    /// Register a handler for `path`. Later registrations replace earlier ones.
    pub fn route<F, Fut>(mut self, path: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Context, Request) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<String, AppError>> + Send + 'static,
    {
        let handler: Handler = Arc::new(move |ctx, req| handler(ctx, req).boxed());
        self.routes.insert(path.into(), handler);
        self
    }

    /// Address actually bound, once started.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock()
    }

    /// Connections currently open.
    pub fn active_connections(&self) -> usize {
        self.connections.active()
    }

    #[cfg_attr(coverage_nightly, coverage(off))]
    async fn accept_loop(
        listener: TcpListener,
        admission: Arc<AdmissionService>,
        routes: Arc<HashMap<String, Handler>>,
        shutdown: Context,
        connections: DrainTracker,
    ) {
        loop {
            let (stream, addr) = tokio::select! {
                _ = shutdown.done() => break,
                accepted = listener.accept() => match accepted {
                    Ok(pair) => pair,
                    Err(e) => {
                        tracing::warn!("accept failed: {}", e);
                        if !accept_backoff(&shutdown).await {
                            break;
                        }
                        continue;
                    }
                },
            };

            let guard = connections.track();
            let admission = admission.clone();
            let routes = routes.clone();
            let shutdown = shutdown.clone();

            tokio::spawn(async move {
                if let Err(e) =
                    Self::handle_connection(stream, addr, admission, routes, shutdown, guard).await
                {
                    tracing::debug!("connection error from {}: {:?}", addr, e);
                }
            });
        }
        tracing::debug!("accept loop stopped");
    }

    /// Serve requests on one connection until EOF or shutdown.
    ///
    /// Shutdown is only observed between requests, so a request that was
    /// read is always answered.
    async fn handle_connection(
        stream: TcpStream,
        peer: SocketAddr,
        admission: Arc<AdmissionService>,
        routes: Arc<HashMap<String, Handler>>,
        shutdown: Context,
        _guard: DrainGuard,
    ) -> anyhow::Result<()> {
        tracing::debug!("connection from {}", peer);
        let (reader, mut writer) = stream.into_split();
        let mut lines = BufReader::new(reader).lines();

        loop {
            let line = tokio::select! {
                _ = shutdown.done() => break,
                line = lines.next_line() => match line? {
                    Some(line) => line,
                    None => break,
                },
            };
            if line.trim().is_empty() {
                continue;
            }

            let reply = match parse_request(&line) {
                Some(request) => {
                    let handler = routes.get(&request.path).cloned();
                    let req = request.clone();
                    admission
                        .handle(&shutdown, &request, move |ctx| async move {
                            match handler {
                                Some(handler) => handler(ctx, req).await,
                                None => Err(AppError::new(ErrorCode::NotFound, "not found")),
                            }
                        })
                        .await
                        .to_string()
                }
                None => {
                    admission.metrics().observe_error(ErrorCode::BadRequest.as_u16());
                    format!("{} bad request", ErrorCode::BadRequest.status())
                }
            };

            writer.write_all(reply.as_bytes()).await?;
            writer.write_all(b"\n").await?;
        }

        Ok(())
    }
}

/// Pause after a failed accept so persistent errors (e.g. EMFILE) do not
/// spin the loop. Returns `false` if shutdown began meanwhile.
async fn accept_backoff(shutdown: &Context) -> bool {
    tokio::select! {
        _ = shutdown.done() => false,
        _ = tokio::time::sleep(ACCEPT_BACKOFF) => true,
    }
}

/// Parse `METHOD PATH [TRACE_ID]`.
pub fn parse_request(line: &str) -> Option<Request> {
    let mut parts = line.split_whitespace();
    let method = parts.next()?;
    let path = parts.next()?;
    let trace_id = parts.next();
    if parts.next().is_some() || !path.starts_with('/') {
        return None;
    }

    let request = Request::new(method.to_uppercase(), path);
    Some(match trace_id {
        Some(id) => request.with_trace_id(id),
        None => request,
    })
}

#[async_trait]
impl Component for TcpServer {
    fn name(&self) -> &str {
        "tcp-server"
    }

    async fn start(&self, _ctx: &Context) -> anyhow::Result<()> {
        let mut task = self.accept_task.lock().await;
        if task.is_some() {
            anyhow::bail!("tcp server already started");
        }

        let listener = TcpListener::bind(&self.listen_addr)
            .await
            .map_err(|e| anyhow::anyhow!("failed to bind {}: {}", self.listen_addr, e))?;
        let addr = listener.local_addr()?;
        *self.local_addr.lock() = Some(addr);
        tracing::info!("listening on {}", addr);

        *task = Some(tokio::spawn(Self::accept_loop(
            listener,
            self.admission.clone(),
            Arc::new(self.routes.clone()),
            self.shutdown.clone(),
            self.connections.clone(),
        )));
        Ok(())
    }

    async fn stop(&self, ctx: &Context) -> anyhow::Result<()> {
        self.shutdown.cancel();

        if let Some(task) = self.accept_task.lock().await.take() {
            if let Err(e) = task.await {
                tracing::warn!("accept loop exited abnormally: {}", e);
            }
        }

        self.connections.wait(ctx).await.map_err(|e| {
            anyhow::anyhow!(
                "{} connections still open: {}",
                self.connections.active(),
                e
            )
        })?;
        tracing::info!("tcp server stopped");
        Ok(())
    }
}
