//! Task: Unpack every imported image for the host platform.

use async_trait::async_trait;
use nestrun_shared::NestrunResult;

use super::{BootCtx, log_task_error, missing_input, task_start};
use crate::images::ImageUnpacker;
use crate::pipeline::PipelineTask;

pub struct UnpackTask;

#[async_trait]
impl PipelineTask<BootCtx> for UnpackTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let (client, images, platform, snapshotter, cache) = {
            let ctx = ctx.lock().await;
            (
                ctx.client.clone().ok_or_else(|| missing_input("connect"))?,
                ctx.images.clone(),
                ctx.hooks.platform.clone(),
                ctx.options.snapshotter.clone(),
                ctx.cache.clone(),
            )
        };
        if images.is_empty() {
            return Err(missing_input("image_import"));
        }

        let unpacker = ImageUnpacker::new(&client, platform, &cache);
        let mut engine_image = None;
        for image in &images {
            tracing::info!(name = %image.name, digest = %image.digest(), "Unpacking image");
            let unpacked = unpacker
                .unpack(image, &snapshotter)
                .await
                .inspect_err(|e| log_task_error(&container, task_name, e))?;
            engine_image.get_or_insert(unpacked);
        }

        ctx.lock().await.engine_image = engine_image;
        Ok(())
    }

    fn name(&self) -> &str {
        "image_unpack"
    }
}
