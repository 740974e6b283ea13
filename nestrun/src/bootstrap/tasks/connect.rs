//! Task: Connect to the daemon.

use async_trait::async_trait;
use nestrun_shared::NestrunResult;

use super::{BootCtx, log_task_error, task_start};
use crate::pipeline::PipelineTask;
use crate::runtime::RuntimeClient;

pub struct ConnectTask;

#[async_trait]
impl PipelineTask<BootCtx> for ConnectTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let (address, namespace, daemon) = {
            let ctx = ctx.lock().await;
            (
                ctx.options.daemon_address.clone(),
                ctx.options.namespace.clone(),
                ctx.hooks.daemon.clone(),
            )
        };

        let client = match daemon {
            Some(daemon) => RuntimeClient::with_daemon(daemon, namespace).await,
            None => RuntimeClient::connect(&address, namespace).await,
        }
        .inspect_err(|e| log_task_error(&container, task_name, e))?;

        ctx.lock().await.client = Some(client);
        Ok(())
    }

    fn name(&self) -> &str {
        "connect"
    }
}
