//! Self-bind host paths and change their propagation.

use std::os::unix::fs::DirBuilderExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::runtime::Mount;
use serde::{Deserialize, Serialize};

use super::{MountSpec, MountSyscalls};

/// What happens to already completed mounts when a later one fails.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RollbackPolicy {
    /// Completed mounts stay in the host mount table.
    #[default]
    LeaveInPlace,
    /// Completed mounts are detached in reverse order before the error returns.
    Unmount,
}

/// Host mounts that have been self-bound and made shared.
///
/// Only [`MountPropagator::propagate`] produces this, so a runtime spec that
/// references these paths can't be built before the host side is ready.
#[derive(Debug, Clone)]
pub struct PropagatedMounts {
    mounts: Vec<MountSpec>,
}

impl PropagatedMounts {
    pub fn specs(&self) -> &[MountSpec] {
        &self.mounts
    }

    pub fn is_empty(&self) -> bool {
        self.mounts.is_empty()
    }

    pub fn len(&self) -> usize {
        self.mounts.len()
    }

    /// Container mount entries, in propagation order.
    pub fn oci_mounts(&self) -> NestrunResult<Vec<Mount>> {
        self.mounts.iter().map(MountSpec::to_oci_mount).collect()
    }
}

/// Prepares host mounts for the nested container.
pub struct MountPropagator {
    syscalls: Arc<dyn MountSyscalls>,
    rollback: RollbackPolicy,
}

impl MountPropagator {
    pub fn new(syscalls: Arc<dyn MountSyscalls>) -> Self {
        Self {
            syscalls,
            rollback: RollbackPolicy::default(),
        }
    }

    pub fn with_rollback(mut self, rollback: RollbackPolicy) -> Self {
        self.rollback = rollback;
        self
    }

    /// Create each directory (and parents) with mode 0755.
    pub fn prepare_dirs(&self, dirs: &[PathBuf]) -> NestrunResult<()> {
        for dir in dirs {
            create_dir(dir)?;
        }
        Ok(())
    }

    /// Self-bind each source and apply its propagation mode, in order.
    ///
    /// A path's propagation is changed only after its bind succeeded. The
    /// first failure stops the sequence; completed mounts are handled by the
    /// configured [`RollbackPolicy`].
    pub fn propagate(&self, specs: &[MountSpec]) -> NestrunResult<PropagatedMounts> {
        let mut bound: Vec<&Path> = Vec::with_capacity(specs.len());

        for spec in specs {
            let path = spec.source.as_path();

            if let Err(e) = create_dir(path) {
                self.roll_back(&bound);
                return Err(e);
            }

            if let Err(e) = self.syscalls.bind(path, path) {
                self.roll_back(&bound);
                return Err(NestrunError::Mount(format!(
                    "failed to self-bind {}: {}",
                    path.display(),
                    e
                )));
            }
            bound.push(path);

            if let Err(e) = self.syscalls.set_propagation(path, spec.propagation) {
                self.roll_back(&bound);
                return Err(NestrunError::Mount(format!(
                    "failed to make {} {}: {}",
                    path.display(),
                    spec.propagation,
                    e
                )));
            }

            tracing::info!(
                path = %path.display(),
                propagation = %spec.propagation,
                "Host mount propagated"
            );
        }

        Ok(PropagatedMounts {
            mounts: specs.to_vec(),
        })
    }

    fn roll_back(&self, bound: &[&Path]) {
        if self.rollback == RollbackPolicy::LeaveInPlace {
            if !bound.is_empty() {
                tracing::warn!(count = bound.len(), "Leaving completed host mounts in place");
            }
            return;
        }
        for path in bound.iter().rev() {
            if let Err(e) = self.syscalls.unmount(path) {
                tracing::warn!(path = %path.display(), error = %e, "Failed to roll back mount");
            }
        }
    }
}

fn create_dir(path: &Path) -> NestrunResult<()> {
    if path.is_dir() {
        return Ok(());
    }
    std::fs::DirBuilder::new()
        .recursive(true)
        .mode(0o755)
        .create(path)
        .map_err(|e| {
            NestrunError::Mount(format!(
                "failed to create directory {}: {}",
                path.display(),
                e
            ))
        })
}
