//! Task: Self-bind the host directories and make them shared.

use async_trait::async_trait;
use nestrun_shared::NestrunResult;

use super::{BootCtx, log_task_error, task_start};
use crate::fs::MountPropagator;
use crate::pipeline::PipelineTask;

pub struct PropagateTask;

#[async_trait]
impl PipelineTask<BootCtx> for PropagateTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let propagator = MountPropagator::new(ctx.hooks.mount_syscalls.clone())
            .with_rollback(ctx.options.rollback);

        let mounts = propagator
            .prepare_dirs(&ctx.options.prepare_dirs)
            .and_then(|()| propagator.propagate(&ctx.options.host_mounts))
            .inspect_err(|e| log_task_error(&container, task_name, e))?;

        ctx.mounts = Some(mounts);
        Ok(())
    }

    fn name(&self) -> &str {
        "mount_propagation"
    }
}
