//! Error taxonomy for the bootstrap sequence.
//!
//! Every variant is fatal to the bootstrap. The variant itself names the
//! phase that failed, so callers can tell a bootstrap-phase failure apart
//! from the nested container's own failure (`ContainerExit`).

use thiserror::Error;

pub type NestrunResult<T> = Result<T, NestrunError>;

#[derive(Debug, Error)]
pub enum NestrunError {
    /// Daemon socket unreachable, or the peer did not answer a ping.
    #[error("connection error: {0}")]
    Connection(String),

    /// Malformed archive or a daemon-side write failure while importing.
    #[error("import error: {0}")]
    Import(String),

    /// No manifest for the platform, or the snapshotter rejected the layers.
    #[error("unpack error: {0}")]
    Unpack(String),

    /// Self-bind or propagation change failed on the host mount table.
    #[error("mount error: {0}")]
    Mount(String),

    /// Runtime spec could not be assembled.
    #[error("spec build error: {0}")]
    SpecBuild(String),

    #[error("container create error: {0}")]
    ContainerCreate(String),

    #[error("task create error: {0}")]
    TaskCreate(String),

    #[error("task start error: {0}")]
    TaskStart(String),

    #[error("task wait error: {0}")]
    TaskWait(String),

    /// The nested container exited and its task reported an error.
    #[error("container exited with code {exit_code}: {message}")]
    ContainerExit { exit_code: u32, message: String },

    #[error("config error: {0}")]
    Config(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl NestrunError {
    /// Name of the bootstrap phase this error belongs to.
    pub fn phase(&self) -> &'static str {
        match self {
            NestrunError::Connection(_) => "connect",
            NestrunError::Import(_) => "import",
            NestrunError::Unpack(_) => "unpack",
            NestrunError::Mount(_) => "mount",
            NestrunError::SpecBuild(_) => "spec",
            NestrunError::ContainerCreate(_) => "container_create",
            NestrunError::TaskCreate(_) => "task_create",
            NestrunError::TaskStart(_) => "task_start",
            NestrunError::TaskWait(_) => "task_wait",
            NestrunError::ContainerExit { .. } => "container",
            NestrunError::Config(_) => "config",
            NestrunError::Internal(_) | NestrunError::Io(_) | NestrunError::Json(_) => "internal",
        }
    }

    /// Re-wrap the message of this error into the given phase.
    ///
    /// Used where a generic failure (I/O, encoding) happens inside a phase and
    /// must be reported as that phase's error kind.
    pub fn into_phase(self, wrap: fn(String) -> NestrunError) -> NestrunError {
        match self {
            NestrunError::Io(_)
            | NestrunError::Json(_)
            | NestrunError::Internal(_) => wrap(self.to_string()),
            other => other,
        }
    }
}
