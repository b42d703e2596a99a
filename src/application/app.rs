//! Lifecycle Orchestrator
//!
//! Starts registered components in order with rollback on failure, and
//! stops them concurrently in reverse order under a shared deadline.

use crate::domain::ports::Component;
use crate::domain::{Context, ContextError};
use crate::infrastructure::wait_signal;
use futures::future::join_all;
use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

pub const DEFAULT_STOP_TIMEOUT: Duration = Duration::from_secs(10);

/// Orchestrator state. Moves forward only.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Created,
    Starting,
    Running,
    Stopping,
    Stopped,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            AppState::Created => "created",
            AppState::Starting => "starting",
            AppState::Running => "running",
            AppState::Stopping => "stopping",
            AppState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// One component's stop failure.
#[derive(Debug)]
pub struct ComponentFailure {
    pub component: String,
    pub error: anyhow::Error,
}

/// Every stop failure from one shutdown.
#[derive(Debug)]
pub struct ShutdownError {
    failures: Vec<ComponentFailure>,
}

impl ShutdownError {
    pub fn failures(&self) -> &[ComponentFailure] {
        &self.failures
    }

    /// Names of the components that failed, in the order they were stopped.
    pub fn components(&self) -> Vec<&str> {
        self.failures.iter().map(|f| f.component.as_str()).collect()
    }
}

impl fmt::Display for ShutdownError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} component(s) failed to stop", self.failures.len())?;
        for (i, failure) in self.failures.iter().enumerate() {
            let sep = if i == 0 { ": " } else { "; " };
            write!(f, "{}{}: {:#}", sep, failure.component, failure.error)?;
        }
        Ok(())
    }
}

impl std::error::Error for ShutdownError {}

/// Lifecycle errors.
#[derive(Debug, thiserror::Error)]
pub enum LifecycleError {
    #[error("component {component} failed to start: {source:#}")]
    StartFailed {
        component: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Shutdown(#[from] ShutdownError),
    #[error("cannot {op} while {state}")]
    InvalidState { op: &'static str, state: AppState },
}

/// Sequences component startup and shutdown.
pub struct App {
    components: Mutex<Vec<Arc<dyn Component>>>,
    state: Mutex<AppState>,
    stop_timeout: Duration,
}

impl App {
    /// Create an orchestrator. A zero `stop_timeout` uses
    /// [`DEFAULT_STOP_TIMEOUT`].
    pub fn new(stop_timeout: Duration) -> Self {
        let stop_timeout = if stop_timeout.is_zero() {
            DEFAULT_STOP_TIMEOUT
        } else {
            stop_timeout
        };
        Self {
            components: Mutex::new(Vec::new()),
            state: Mutex::new(AppState::Created),
            stop_timeout,
        }
    }

    pub fn with_components(self, components: impl IntoIterator<Item = Arc<dyn Component>>) -> Self {
        self.components.lock().extend(components);
        self
    }

    /// Register more components. Only allowed before `start`.
    pub fn use_components(
        &self,
        components: impl IntoIterator<Item = Arc<dyn Component>>,
    ) -> Result<(), LifecycleError> {
        let state = *self.state.lock();
        if state != AppState::Created {
            return Err(LifecycleError::InvalidState { op: "use", state });
        }
        self.components.lock().extend(components);
        Ok(())
    }

    pub fn state(&self) -> AppState {
        *self.state.lock()
    }

    pub fn stop_timeout(&self) -> Duration {
        self.stop_timeout
    }

    pub fn component_names(&self) -> Vec<String> {
        self.components
            .lock()
            .iter()
            .map(|c| c.name().to_string())
            .collect()
    }

    /// Start every component in registration order.
    ///
    /// On the first failure the components already started are stopped
    /// (reverse order, concurrently, bounded by the stop timeout) and the
    /// failing component's error is returned. The app ends up `Stopped`.
    pub async fn start(&self, ctx: &Context) -> Result<(), LifecycleError> {
        self.transition("start", &[AppState::Created], AppState::Starting)?;
        let components = self.components.lock().clone();

        for (i, component) in components.iter().enumerate() {
            tracing::info!(component = component.name(), "starting component");
            if let Err(e) = component.start(ctx).await {
                tracing::error!(component = component.name(), "start failed: {:#}", e);

                let rollback_ctx = Context::background().with_timeout(self.stop_timeout);
                for failure in stop_all(&components[..i], &rollback_ctx).await {
                    tracing::warn!(
                        component = %failure.component,
                        "rollback stop failed: {:#}",
                        failure.error
                    );
                }

                *self.state.lock() = AppState::Stopped;
                return Err(LifecycleError::StartFailed {
                    component: component.name().to_string(),
                    source: e,
                });
            }
        }

        *self.state.lock() = AppState::Running;
        tracing::info!(components = components.len(), "all components started");
        Ok(())
    }

    /// Stop every component, concurrently, in reverse registration order.
    ///
    /// The deadline is the caller's if it has one, else the stop timeout.
    /// Every component is stopped even when siblings fail; all failures are
    /// returned together.
    pub async fn stop(&self, ctx: &Context) -> Result<(), LifecycleError> {
        let previous = self.transition(
            "stop",
            &[AppState::Created, AppState::Running],
            AppState::Stopping,
        )?;
        if previous == AppState::Created {
            // Nothing was started
            *self.state.lock() = AppState::Stopped;
            return Ok(());
        }

        let stop_ctx = if ctx.deadline().is_some() {
            ctx.clone()
        } else {
            ctx.with_timeout(self.stop_timeout)
        };
        let components = self.components.lock().clone();
        let failures = stop_all(&components, &stop_ctx).await;

        *self.state.lock() = AppState::Stopped;

        if failures.is_empty() {
            tracing::info!("all components stopped");
            Ok(())
        } else {
            let err = ShutdownError { failures };
            tracing::error!("shutdown incomplete: {}", err);
            Err(err.into())
        }
    }

    /// Start, wait for SIGINT/SIGTERM or for `ctx` to end, then stop.
    pub async fn run_until_signal(&self, ctx: &Context) -> Result<(), LifecycleError> {
        self.start(ctx).await?;

        match wait_signal(ctx).await {
            Ok(()) => {}
            Err(ContextError::Cancelled) => tracing::info!("context cancelled, shutting down"),
            Err(ContextError::DeadlineExceeded) => {
                tracing::info!("context deadline reached, shutting down")
            }
        }

        self.stop(&Context::background()).await
    }

    /// Move to `next` if the current state is one of `allowed`; returns the
    /// previous state.
    fn transition(
        &self,
        op: &'static str,
        allowed: &[AppState],
        next: AppState,
    ) -> Result<AppState, LifecycleError> {
        let mut state = self.state.lock();
        let current = *state;
        if !allowed.contains(&current) {
            return Err(LifecycleError::InvalidState { op, state: current });
        }
        *state = next;
        Ok(current)
    }
}

impl Default for App {
    fn default() -> Self {
        Self::new(DEFAULT_STOP_TIMEOUT)
    }
}

/// Stop `components` in reverse order, all at once, and collect failures.
async fn stop_all(components: &[Arc<dyn Component>], ctx: &Context) -> Vec<ComponentFailure> {
    let stops = components.iter().rev().map(|component| async move {
        tracing::info!(component = component.name(), "stopping component");
        component
            .stop(ctx)
            .await
            .map_err(|error| ComponentFailure {
                component: component.name().to_string(),
                error,
            })
    });

    join_all(stops)
        .await
        .into_iter()
        .filter_map(Result::err)
        .collect()
}
