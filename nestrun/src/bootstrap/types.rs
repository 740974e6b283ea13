//! Shared state of one bootstrap run.

use std::collections::HashMap;
use std::sync::Arc;

use oci_spec::runtime::Spec;
use parking_lot::Mutex;

use crate::daemon::Daemon;
use crate::fs::{MountSyscalls, PropagatedMounts};
use crate::images::{ImageRef, Platform, UnpackedImage};
use crate::pipeline::PipelineMetrics;
use crate::runtime::RuntimeClient;
use crate::runtime::options::BootstrapOptions;
use crate::task::TaskExit;

/// Unpack results scoped to one bootstrap run, keyed by (image digest, snapshotter).
///
/// Thread-safe via `parking_lot::Mutex`.
#[derive(Debug, Default)]
pub struct BootstrapCache {
    unpacked: Mutex<HashMap<(String, String), UnpackedImage>>,
}

impl BootstrapCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn unpacked(&self, digest: &str, snapshotter: &str) -> Option<UnpackedImage> {
        self.unpacked
            .lock()
            .get(&(digest.to_string(), snapshotter.to_string()))
            .cloned()
    }

    pub fn insert_unpacked(&self, digest: &str, snapshotter: &str, image: UnpackedImage) {
        self.unpacked
            .lock()
            .insert((digest.to_string(), snapshotter.to_string()), image);
    }

    pub fn len(&self) -> usize {
        self.unpacked.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Collaborators a bootstrap can swap out.
pub(crate) struct BootstrapHooks {
    /// Pre-built daemon handle; `None` connects to `options.daemon_address`.
    pub daemon: Option<Arc<dyn Daemon>>,
    pub mount_syscalls: Arc<dyn MountSyscalls>,
    pub platform: Platform,
    /// Overrides the host's hostname.
    pub hostname: Option<String>,
}

/// Pipeline context: inputs up front, each task's output filled in as it runs.
pub(crate) struct BootstrapContext {
    pub options: BootstrapOptions,
    pub hooks: BootstrapHooks,
    pub cache: Arc<BootstrapCache>,

    // Task outputs, in pipeline order
    pub client: Option<RuntimeClient>,
    pub images: Vec<ImageRef>,
    /// The image launched: the first one imported.
    pub engine_image: Option<UnpackedImage>,
    pub mounts: Option<PropagatedMounts>,
    pub spec: Option<Spec>,
    pub exit: Option<TaskExit>,
}

impl BootstrapContext {
    pub fn new(options: BootstrapOptions, hooks: BootstrapHooks) -> Self {
        Self {
            options,
            hooks,
            cache: Arc::new(BootstrapCache::new()),
            client: None,
            images: Vec::new(),
            engine_image: None,
            mounts: None,
            spec: None,
            exit: None,
        }
    }
}

pub(crate) type BootstrapCtx = Arc<tokio::sync::Mutex<BootstrapContext>>;

/// Result of a bootstrap whose container ran to completion.
#[derive(Debug)]
pub struct BootstrapOutcome {
    pub exit: TaskExit,
    pub images: Vec<ImageRef>,
    pub metrics: PipelineMetrics,
}

impl BootstrapOutcome {
    /// The nested task's exit code, which becomes the process exit code.
    pub fn exit_code(&self) -> u32 {
        self.exit.exit_code()
    }
}
