//! Task: Import the image archive into the content store.

use std::fs::File;

use async_trait::async_trait;
use nestrun_shared::{NestrunError, NestrunResult};

use super::{BootCtx, log_task_error, missing_input, task_start};
use crate::images::ImageImporter;
use crate::pipeline::PipelineTask;

pub struct ImportTask;

#[async_trait]
impl PipelineTask<BootCtx> for ImportTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let (client, archive, index_name) = {
            let ctx = ctx.lock().await;
            (
                ctx.client.clone().ok_or_else(|| missing_input("connect"))?,
                ctx.options.image_archive.clone(),
                ctx.options.index_name.clone(),
            )
        };

        tracing::info!(archive = %archive.display(), "Importing image archive");
        let images = async {
            let file = File::open(&archive).map_err(|e| {
                NestrunError::Import(format!("failed to open {}: {}", archive.display(), e))
            })?;
            ImageImporter::new(&client)
                .import(file, index_name.as_deref())
                .await
        }
        .await
        .inspect_err(|e| log_task_error(&container, task_name, e))?;

        tracing::info!(archive = %archive.display(), images = images.len(), "Import done");
        ctx.lock().await.images = images;
        Ok(())
    }

    fn name(&self) -> &str {
        "image_import"
    }
}
