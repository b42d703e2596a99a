//! Component Port
//!
//! Defines the start/stop capability the lifecycle orchestrator sequences.

use crate::domain::context::Context;
use async_trait::async_trait;

/// A managed subsystem with an explicit start and stop.
///
/// `start` may block until the component is ready to serve; `stop` should
/// honour the context's deadline and return promptly once it passes.
#[async_trait]
pub trait Component: Send + Sync {
    /// Stable name used in logs and shutdown error reports.
    fn name(&self) -> &str;

    /// Bring the component up.
    async fn start(&self, ctx: &Context) -> anyhow::Result<()>;

    /// Tear the component down, releasing everything it holds.
    async fn stop(&self, ctx: &Context) -> anyhow::Result<()>;
}
