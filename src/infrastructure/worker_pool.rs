//! Worker Pool
//!
//! Fixed set of workers consuming a bounded FIFO task queue. Submitters get
//! backpressure when the queue is full; closing drains what was accepted.

use crate::config::PoolConfig;
use crate::domain::{Component, Context, ContextError};
use async_trait::async_trait;
use futures::future::BoxFuture;
use futures::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::task::TaskTracker;

const DEFAULT_TASK_TIMEOUT: Duration = Duration::from_secs(10);

type Task = Box<dyn FnOnce(Context) -> BoxFuture<'static, anyhow::Result<()>> + Send>;

/// Outcome counters shared with the workers.
#[derive(Debug, Default)]
struct Counters {
    queued: AtomicUsize,
    active: AtomicUsize,
    completed: AtomicU64,
    failed: AtomicU64,
    panicked: AtomicU64,
    timed_out: AtomicU64,
}

/// Bounded worker pool.
///
/// Tasks run in submission order across `workers` Tokio tasks. Each task gets
/// a fresh [`Context`] that expires after the configured task timeout; the
/// deadline is advisory and the task body must observe it. Task errors stay
/// inside the pool and are only reported through logs and [`PoolStats`].
pub struct WorkerPool {
    config: PoolConfig,
    sender: parking_lot::Mutex<Option<mpsc::Sender<Task>>>,
    closed: AtomicBool,
    workers: TaskTracker,
    drained: AtomicBool,
    counters: Arc<Counters>,
}

impl WorkerPool {
    /// Create the pool and spawn its workers. Must be called inside a Tokio
    /// runtime.
    pub fn new(config: PoolConfig) -> Self {
        let config = PoolConfig {
            workers: config.workers.max(1),
            queue_capacity: config.queue_capacity.max(1),
            task_timeout_ms: if config.task_timeout_ms == 0 {
                DEFAULT_TASK_TIMEOUT.as_millis() as u64
            } else {
                config.task_timeout_ms
            },
        };

        let (tx, rx) = mpsc::channel::<Task>(config.queue_capacity);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let counters = Arc::new(Counters::default());

        let workers = TaskTracker::new();
        for id in 0..config.workers {
            workers.spawn(worker_loop(
                id,
                rx.clone(),
                counters.clone(),
                config.task_timeout(),
            ));
        }

        tracing::debug!(
            workers = config.workers,
            queue_capacity = config.queue_capacity,
            task_timeout_ms = config.task_timeout_ms,
            "worker pool started"
        );

        Self {
            config,
            sender: parking_lot::Mutex::new(Some(tx)),
            closed: AtomicBool::new(false),
            workers,
            drained: AtomicBool::new(false),
            counters,
        }
    }

    /// Enqueue a task.
    ///
    /// Waits while the queue is full. Fails with [`PoolError::Closed`] once
    /// the pool is closed and with [`PoolError::Cancelled`] if `ctx` ends
    /// first, in which case the task is discarded.
    pub async fn submit<F, Fut>(&self, ctx: &Context, f: F) -> Result<(), PoolError>
    where
        F: FnOnce(Context) -> Fut + Send + 'static,
        Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
    {
        if self.closed.load(Ordering::SeqCst) {
            return Err(PoolError::Closed);
        }
        // A cloned sender keeps the queue open until this submission settles,
        // so a racing close either rejects it here or drains it later.
        let tx = match self.sender.lock().as_ref() {
            Some(tx) => tx.clone(),
            None => return Err(PoolError::Closed),
        };

        let task: Task = Box::new(move |ctx| f(ctx).boxed());

        tokio::select! {
            biased;
            err = ctx.done() => Err(PoolError::Cancelled(err)),
            permit = tx.reserve() => match permit {
                Ok(permit) => {
                    self.counters.queued.fetch_add(1, Ordering::SeqCst);
                    permit.send(task);
                    Ok(())
                }
                Err(_) => Err(PoolError::Closed),
            },
        }
    }

    /// Stop accepting tasks, run everything already queued, and wait for
    /// every worker to exit.
    ///
    /// Safe to call more than once, and to abandon midway: every caller
    /// returns only after the last worker has exited.
    pub async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        // Dropping the last sender lets workers see the end of the queue
        // once it is empty.
        self.sender.lock().take();
        self.workers.close();

        self.workers.wait().await;
        if self.drained.swap(true, Ordering::SeqCst) {
            return;
        }

        tracing::info!(
            completed = self.counters.completed.load(Ordering::Relaxed),
            failed = self.counters.failed.load(Ordering::Relaxed),
            panicked = self.counters.panicked.load(Ordering::Relaxed),
            "worker pool drained"
        );
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Snapshot of the pool's counters.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            workers: self.config.workers,
            queue_capacity: self.config.queue_capacity,
            queued: self.counters.queued.load(Ordering::SeqCst),
            active: self.counters.active.load(Ordering::SeqCst),
            completed: self.counters.completed.load(Ordering::SeqCst),
            failed: self.counters.failed.load(Ordering::SeqCst),
            panicked: self.counters.panicked.load(Ordering::SeqCst),
            timed_out: self.counters.timed_out.load(Ordering::SeqCst),
        }
    }
}

impl Default for WorkerPool {
    fn default() -> Self {
        Self::new(PoolConfig::default())
    }
}

async fn worker_loop(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<Task>>>,
    counters: Arc<Counters>,
    task_timeout: Duration,
) {
    loop {
        // Only the worker holding the lock waits on the queue, which keeps
        // dequeue order FIFO across workers.
        let task = {
            let mut rx = rx.lock().await;
            rx.recv().await
        };
        let Some(task) = task else {
            break;
        };
        counters.queued.fetch_sub(1, Ordering::SeqCst);
        run_task(id, task, &counters, task_timeout).await;
    }
    tracing::debug!(worker = id, "worker stopped");
}

async fn run_task(id: usize, task: Task, counters: &Counters, task_timeout: Duration) {
    let ctx = Context::background().with_timeout(task_timeout);
    counters.active.fetch_add(1, Ordering::SeqCst);

    let task_ctx = ctx.clone();
    let outcome = AssertUnwindSafe(async move { task(task_ctx).await })
        .catch_unwind()
        .await;

    counters.active.fetch_sub(1, Ordering::SeqCst);

    match outcome {
        Ok(Ok(())) => {
            counters.completed.fetch_add(1, Ordering::SeqCst);
        }
        Ok(Err(e)) => {
            counters.failed.fetch_add(1, Ordering::SeqCst);
            tracing::warn!(worker = id, "task failed: {:#}", e);
        }
        Err(panic) => {
            counters.panicked.fetch_add(1, Ordering::SeqCst);
            tracing::error!(
                worker = id,
                "task panicked: {}",
                panic_message(panic.as_ref())
            );
        }
    }

    if ctx.err() == Some(ContextError::DeadlineExceeded) {
        counters.timed_out.fetch_add(1, Ordering::SeqCst);
        tracing::warn!(
            worker = id,
            timeout_ms = task_timeout.as_millis() as u64,
            "task overran its deadline"
        );
    }
}

/// Best-effort text of a panic payload.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

#[async_trait]
impl Component for WorkerPool {
    fn name(&self) -> &str {
        "worker-pool"
    }

    async fn start(&self, _ctx: &Context) -> anyhow::Result<()> {
        Ok(())
    }

    async fn stop(&self, ctx: &Context) -> anyhow::Result<()> {
        tokio::select! {
            _ = self.close() => Ok(()),
            err = ctx.done() => {
                let stats = self.stats();
                Err(anyhow::anyhow!(
                    "worker pool did not drain ({} queued, {} active): {}",
                    stats.queued,
                    stats.active,
                    err
                ))
            }
        }
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Accepted tasks not yet picked up by a worker
    pub queued: usize,
    /// Tasks currently executing
    pub active: usize,
    pub completed: u64,
    pub failed: u64,
    pub panicked: u64,
    /// Tasks still running when their deadline passed. Also counted in
    /// one of the outcome counters above.
    pub timed_out: u64,
}

/// Pool errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolError {
    /// Pool no longer accepts tasks
    Closed,
    /// Submitter's context ended while waiting for queue space
    Cancelled(ContextError),
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolError::Closed => write!(f, "worker pool closed"),
            PoolError::Cancelled(e) => write!(f, "submit cancelled: {}", e),
        }
    }
}

impl std::error::Error for PoolError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            PoolError::Closed => None,
            PoolError::Cancelled(e) => Some(e),
        }
    }
}

impl From<ContextError> for PoolError {
    fn from(err: ContextError) -> Self {
        PoolError::Cancelled(err)
    }
}
