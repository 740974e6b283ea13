//! Bootstrap orchestration.
//!
//! ## Architecture
//!
//! One table-driven plan, every stage awaited before the next:
//!
//! ```text
//!   1. Connect             (ping the daemon)
//!   2. ImageImport         (archive → content store → image records)
//!   3. ImageUnpack         (every image, strict host platform)
//!   4. MountPropagation    (mkdir, self-bind, make shared)
//!   5. SpecBuild           (privileged, host network, propagated mounts)
//!   6. Launch              (create → wait registered → start → exit)
//! ```
//!
//! Mount propagation completes before the spec is built: the spec builder
//! only accepts the `PropagatedMounts` that stage produces.

mod tasks;
mod types;

pub use types::{BootstrapCache, BootstrapOutcome};

use std::sync::Arc;

use nestrun_shared::{NestrunError, NestrunResult};
use tokio::sync::Mutex;

use crate::daemon::Daemon;
use crate::fs::{MountSyscalls, NativeMounts};
use crate::images::Platform;
use crate::pipeline::{BoxedTask, ExecutionPlan, PipelineBuilder, PipelineExecutor, Stage};
use crate::runtime::options::BootstrapOptions;

use tasks::{
    BootCtx, ConnectTask, ImportTask, LaunchTask, PropagateTask, SpecBuildTask, UnpackTask,
};
use types::{BootstrapContext, BootstrapHooks};

fn execution_plan() -> ExecutionPlan<BootCtx> {
    let stages: Vec<Stage<BoxedTask<BootCtx>>> = vec![
        Stage::sequential(vec![Box::new(ConnectTask)]),
        Stage::sequential(vec![Box::new(ImportTask)]),
        Stage::sequential(vec![Box::new(UnpackTask)]),
        Stage::sequential(vec![Box::new(PropagateTask)]),
        Stage::sequential(vec![Box::new(SpecBuildTask)]),
        Stage::sequential(vec![Box::new(LaunchTask)]),
    ];
    ExecutionPlan::new(stages)
}

/// Runs the whole bootstrap for one container.
///
/// # Example
///
/// ```ignore
/// let outcome = Bootstrap::new(BootstrapOptions::default()).run().await?;
/// std::process::exit(outcome.exit_code() as i32);
/// ```
pub struct Bootstrap {
    options: BootstrapOptions,
    hooks: BootstrapHooks,
}

impl Bootstrap {
    pub fn new(options: BootstrapOptions) -> Self {
        Self {
            options,
            hooks: BootstrapHooks {
                daemon: None,
                mount_syscalls: Arc::new(NativeMounts::new()),
                platform: Platform::host(),
                hostname: None,
            },
        }
    }

    /// Talk to `daemon` instead of connecting to the configured socket.
    pub fn with_daemon(mut self, daemon: Arc<dyn Daemon>) -> Self {
        self.hooks.daemon = Some(daemon);
        self
    }

    pub fn with_mount_syscalls(mut self, syscalls: Arc<dyn MountSyscalls>) -> Self {
        self.hooks.mount_syscalls = syscalls;
        self
    }

    /// Unpack for `platform` instead of the host's.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.hooks.platform = platform;
        self
    }

    /// Pass `hostname` to the container instead of the host's.
    pub fn with_hostname(mut self, hostname: impl Into<String>) -> Self {
        self.hooks.hostname = Some(hostname.into());
        self
    }

    /// Run every stage to completion.
    ///
    /// A non-zero exit of the nested task is an `Ok` outcome; an error the
    /// daemon attached to the exit is [`NestrunError::ContainerExit`].
    pub async fn run(self) -> NestrunResult<BootstrapOutcome> {
        self.options.sanitize()?;

        let ctx: BootCtx = Arc::new(Mutex::new(BootstrapContext::new(self.options, self.hooks)));
        let pipeline = PipelineBuilder::from_plan(execution_plan());
        let metrics = PipelineExecutor::execute(pipeline, Arc::clone(&ctx)).await?;
        metrics.log();

        let mut ctx = ctx.lock().await;
        let exit = ctx
            .exit
            .take()
            .ok_or_else(|| NestrunError::Internal("launch task must run first".into()))?;
        if let Some(message) = exit.status.error.as_ref().filter(|m| !m.is_empty()) {
            return Err(NestrunError::ContainerExit {
                exit_code: exit.exit_code(),
                message: message.clone(),
            });
        }

        Ok(BootstrapOutcome {
            exit,
            images: std::mem::take(&mut ctx.images),
            metrics,
        })
    }
}
