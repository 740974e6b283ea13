//! Task: Launch the engine container and wait for it to exit.

use async_trait::async_trait;
use nestrun_shared::NestrunResult;

use super::{BootCtx, log_task_error, missing_input, task_start};
use crate::pipeline::PipelineTask;
use crate::task::{LaunchRequest, TaskSupervisor};

pub struct LaunchTask;

#[async_trait]
impl PipelineTask<BootCtx> for LaunchTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let (client, image, spec) = {
            let mut ctx = ctx.lock().await;
            (
                ctx.client.clone().ok_or_else(|| missing_input("connect"))?,
                ctx.engine_image
                    .clone()
                    .ok_or_else(|| missing_input("image_unpack"))?,
                ctx.spec.take().ok_or_else(|| missing_input("spec_build"))?,
            )
        };

        let exit = TaskSupervisor::new(&client)
            .launch(LaunchRequest {
                name: &container,
                image: &image,
                spec,
            })
            .await
            .inspect_err(|e| log_task_error(&container, task_name, e))?;

        ctx.lock().await.exit = Some(exit);
        Ok(())
    }

    fn name(&self) -> &str {
        "launch"
    }
}
