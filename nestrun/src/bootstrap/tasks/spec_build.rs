//! Task: Build the runtime spec for the engine container.

use async_trait::async_trait;
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::runtime::Spec;

use super::{BootCtx, log_task_error, missing_input, task_start};
use crate::bootstrap::types::BootstrapContext;
use crate::pipeline::PipelineTask;
use crate::spec::{EngineSpecInput, engine_spec};

pub struct SpecBuildTask;

#[async_trait]
impl PipelineTask<BootCtx> for SpecBuildTask {
    async fn run(self: Box<Self>, ctx: BootCtx) -> NestrunResult<()> {
        let task_name = self.name();
        let container = task_start(&ctx, task_name).await;

        let mut ctx = ctx.lock().await;
        let spec = build(&ctx).inspect_err(|e| log_task_error(&container, task_name, e))?;
        ctx.spec = Some(spec);
        Ok(())
    }

    fn name(&self) -> &str {
        "spec_build"
    }
}

fn build(ctx: &BootstrapContext) -> NestrunResult<Spec> {
    let image = ctx
        .engine_image
        .as_ref()
        .ok_or_else(|| missing_input("image_unpack"))?;
    let mounts = ctx
        .mounts
        .as_ref()
        .ok_or_else(|| missing_input("mount_propagation"))?;
    let hostname = match &ctx.hooks.hostname {
        Some(hostname) => hostname.clone(),
        None => host_hostname()?,
    };

    engine_spec(EngineSpecInput {
        image,
        mounts,
        hostname: &hostname,
        extra_args: &ctx.options.extra_args,
        host_namespaces: &ctx.options.host_namespaces,
    })
}

fn host_hostname() -> NestrunResult<String> {
    nix::unistd::gethostname()
        .map_err(|e| NestrunError::SpecBuild(format!("get hostname: {}", e)))?
        .into_string()
        .map_err(|raw| NestrunError::SpecBuild(format!("hostname is not UTF-8: {:?}", raw)))
}
