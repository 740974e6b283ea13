//! Task trait for pipeline execution.

use async_trait::async_trait;
use nestrun_shared::NestrunResult;

/// A unit of work run against the shared pipeline context.
///
/// The context is cloned per task, so it is usually an `Arc<Mutex<_>>`.
#[async_trait]
pub trait PipelineTask<Ctx>: Send + Sync {
    async fn run(self: Box<Self>, ctx: Ctx) -> NestrunResult<()>;

    /// Task name used in logs and metrics.
    fn name(&self) -> &str;
}

pub type BoxedTask<Ctx> = Box<dyn PipelineTask<Ctx>>;
