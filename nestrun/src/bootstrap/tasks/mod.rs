//! Bootstrap pipeline tasks, one per phase.

mod connect;
mod import;
mod launch;
mod propagate;
mod spec_build;
mod unpack;

pub(crate) use connect::ConnectTask;
pub(crate) use import::ImportTask;
pub(crate) use launch::LaunchTask;
pub(crate) use propagate::PropagateTask;
pub(crate) use spec_build::SpecBuildTask;
pub(crate) use unpack::UnpackTask;

pub(crate) type BootCtx = super::types::BootstrapCtx;

use nestrun_shared::NestrunError;

/// Log the task start; returns the container name for later log lines.
pub(super) async fn task_start(ctx: &BootCtx, task_name: &str) -> String {
    let container = ctx.lock().await.options.container_name.clone();
    tracing::debug!(container = %container, task = task_name, "Starting bootstrap task");
    container
}

pub(super) fn log_task_error(container: &str, task_name: &str, error: &NestrunError) {
    tracing::error!(
        container = %container,
        task = task_name,
        phase = error.phase(),
        error = %error,
        "Bootstrap task failed"
    );
}

/// Error for a task whose input was never produced.
pub(super) fn missing_input(what: &str) -> NestrunError {
    NestrunError::Internal(format!("{} task must run first", what))
}
