//! Mount descriptions.

use std::path::PathBuf;

use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::runtime::{Mount, MountBuilder};
use serde::{Deserialize, Serialize};

/// Propagation type applied to a host mount after it is bound.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PropagationMode {
    Private,
    Slave,
    Shared,
    /// Shared, applied recursively to every submount.
    RShared,
}

impl PropagationMode {
    pub fn is_recursive(&self) -> bool {
        matches!(self, PropagationMode::RShared)
    }
}

impl std::fmt::Display for PropagationMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            PropagationMode::Private => "private",
            PropagationMode::Slave => "slave",
            PropagationMode::Shared => "shared",
            PropagationMode::RShared => "rshared",
        };
        f.write_str(s)
    }
}

/// A host path bound into the container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountSpec {
    /// Host path. Self-bound before its propagation is changed.
    pub source: PathBuf,
    /// Path inside the container.
    pub destination: PathBuf,
    #[serde(rename = "type")]
    pub mount_type: String,
    pub options: Vec<String>,
    pub propagation: PropagationMode,
}

impl MountSpec {
    /// `path` bound at the same path in the container, recursively, with
    /// recursive shared propagation on the host.
    pub fn self_bound(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            source: path.clone(),
            destination: path,
            mount_type: "bind".to_string(),
            options: vec!["rbind".to_string()],
            propagation: PropagationMode::RShared,
        }
    }

    /// Container mount entry for the runtime spec.
    pub fn to_oci_mount(&self) -> NestrunResult<Mount> {
        MountBuilder::default()
            .destination(self.destination.clone())
            .typ(self.mount_type.clone())
            .source(self.source.clone())
            .options(self.options.clone())
            .build()
            .map_err(|e| {
                NestrunError::SpecBuild(format!(
                    "mount {} -> {}: {}",
                    self.source.display(),
                    self.destination.display(),
                    e
                ))
            })
    }
}
