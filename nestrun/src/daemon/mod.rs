//! Container-runtime daemon API.
//!
//! [`Daemon`] is the seam between the bootstrap and the daemon that owns the
//! content store, snapshots, containers and tasks. [`ContainerdDaemon`]
//! implements it over containerd's gRPC services on a Unix socket.
//!
//! Errors returned by a method are already classified into the phase that
//! issued the request (content and image writes are import errors, snapshot
//! stat/apply and content reads are unpack errors, and so on).

mod containerd;

pub use containerd::ContainerdDaemon;

use std::collections::HashMap;
use std::path::Path;

use async_trait::async_trait;
use nestrun_shared::records::{
    ContainerRecord, ContentInfo, ExitStatus, ImageRecord, SnapshotInfo, TaskStdio,
};
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::Descriptor;
use tokio::sync::oneshot;

/// Operations the bootstrap needs from the daemon. All calls are namespaced.
#[async_trait]
pub trait Daemon: Send + Sync {
    /// Round-trip health check; returns the daemon's version.
    async fn ping(&self) -> NestrunResult<String>;

    async fn content_info(&self, ns: &str, digest: &str) -> NestrunResult<Option<ContentInfo>>;

    /// Upload the blob stored at `blob` (a local file) under `descriptor`,
    /// committing it with `labels`.
    async fn content_write(
        &self,
        ns: &str,
        descriptor: &Descriptor,
        blob: &Path,
        labels: &HashMap<String, String>,
    ) -> NestrunResult<()>;

    async fn content_read(&self, ns: &str, digest: &str) -> NestrunResult<Vec<u8>>;

    /// Create or update an image record.
    async fn image_create(&self, ns: &str, image: ImageRecord) -> NestrunResult<()>;

    async fn snapshot_stat(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> NestrunResult<Option<SnapshotInfo>>;

    /// Apply `layer` on top of `parent` and commit the result as `key`.
    async fn snapshot_apply(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: Option<&str>,
        layer: &Descriptor,
    ) -> NestrunResult<()>;

    /// Create the writable snapshot a container runs on.
    async fn snapshot_prepare(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> NestrunResult<()>;

    async fn container_create(&self, ns: &str, container: ContainerRecord) -> NestrunResult<()>;

    /// Create the task for a container; returns its pid.
    async fn task_create(&self, ns: &str, container_id: &str, stdio: TaskStdio)
    -> NestrunResult<u32>;

    /// Register interest in the task's exit.
    ///
    /// An exit that happens after this call returns cannot be missed. Call it
    /// between `task_create` and `task_start`.
    async fn task_wait(&self, ns: &str, container_id: &str) -> NestrunResult<ExitWaiter>;

    async fn task_start(&self, ns: &str, container_id: &str) -> NestrunResult<()>;
}

/// Pending exit notification for a task.
#[derive(Debug)]
pub struct ExitWaiter {
    rx: oneshot::Receiver<NestrunResult<ExitStatus>>,
}

impl ExitWaiter {
    pub fn new(rx: oneshot::Receiver<NestrunResult<ExitStatus>>) -> Self {
        Self { rx }
    }

    /// Create a waiter and the sender that completes it.
    pub fn channel() -> (oneshot::Sender<NestrunResult<ExitStatus>>, Self) {
        let (tx, rx) = oneshot::channel();
        (tx, Self::new(rx))
    }

    /// Block until the task exits.
    pub async fn wait(self) -> NestrunResult<ExitStatus> {
        self.rx.await.map_err(|_| {
            NestrunError::TaskWait("exit channel closed before an exit status arrived".into())
        })?
    }
}
