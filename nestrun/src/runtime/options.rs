//! Bootstrap configuration.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::constants::{defaults, host_paths};
use crate::fs::{MountSpec, RollbackPolicy};
use crate::spec::HostNamespace;
use nestrun_shared::{NestrunError, NestrunResult};

/// Everything one bootstrap run needs to know up front.
///
/// `Default` reproduces the reference launch: import `/image.tar` into the
/// `dagger` namespace, propagate the four fixed host directories, and run the
/// engine with `--debug` on the host network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapOptions {
    /// Daemon control socket.
    pub daemon_address: PathBuf,
    pub namespace: String,
    /// Image archive opened read-only and closed after import.
    pub image_archive: PathBuf,
    /// Name for the image targeting the archive's whole index.
    pub index_name: Option<String>,
    pub snapshotter: String,
    pub container_name: String,
    /// Appended to the image entrypoint, replacing the image's default cmd.
    pub extra_args: Vec<String>,
    /// Host directories self-bound and made shared before launch, in order.
    pub host_mounts: Vec<MountSpec>,
    /// Directories created (mode 0755) before mounting.
    pub prepare_dirs: Vec<PathBuf>,
    /// What to do with completed mounts when a later one fails.
    pub rollback: RollbackPolicy,
    /// Namespaces the container shares with the host.
    pub host_namespaces: Vec<HostNamespace>,
    /// Optional directory for a log file in addition to stderr.
    pub log_dir: Option<PathBuf>,
}

impl Default for BootstrapOptions {
    fn default() -> Self {
        Self {
            daemon_address: PathBuf::from(defaults::DAEMON_ADDRESS),
            namespace: defaults::NAMESPACE.to_string(),
            image_archive: PathBuf::from(defaults::IMAGE_ARCHIVE),
            index_name: Some(defaults::INDEX_NAME.to_string()),
            snapshotter: defaults::SNAPSHOTTER.to_string(),
            container_name: defaults::CONTAINER_NAME.to_string(),
            extra_args: defaults::EXTRA_ARGS.iter().map(|s| s.to_string()).collect(),
            host_mounts: default_host_mounts(),
            prepare_dirs: vec![PathBuf::from(host_paths::CONTAINERS_RUN_DIR)],
            rollback: RollbackPolicy::default(),
            host_namespaces: vec![HostNamespace::Network],
            log_dir: None,
        }
    }
}

/// The fixed bind list: runtime socket dir, daemon state dir, temp dir, engine state dir.
pub fn default_host_mounts() -> Vec<MountSpec> {
    [
        host_paths::RUNTIME_SOCKET_DIR,
        host_paths::DAEMON_STATE_DIR,
        host_paths::TEMP_DIR,
        host_paths::ENGINE_STATE_DIR,
    ]
    .into_iter()
    .map(MountSpec::self_bound)
    .collect()
}

impl BootstrapOptions {
    /// Validate options before any side effect happens.
    pub fn sanitize(&self) -> NestrunResult<()> {
        validate_identifier("namespace", &self.namespace)?;
        validate_identifier("container name", &self.container_name)?;

        if self.snapshotter.is_empty() {
            return Err(NestrunError::Config("snapshotter must not be empty".into()));
        }
        if let Some(index_name) = &self.index_name
            && index_name.is_empty()
        {
            return Err(NestrunError::Config(
                "index name must not be empty when set".into(),
            ));
        }

        for mount in &self.host_mounts {
            if !mount.source.is_absolute() || !mount.destination.is_absolute() {
                return Err(NestrunError::Config(format!(
                    "host mount paths must be absolute, got {} -> {}",
                    mount.source.display(),
                    mount.destination.display()
                )));
            }
        }

        Ok(())
    }
}

/// Daemon identifiers: start alphanumeric, then alphanumerics, `.`, `_` or `-`.
fn validate_identifier(what: &str, value: &str) -> NestrunResult<()> {
    let mut chars = value.chars();
    let valid = match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {
            chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'))
        }
        _ => false,
    };
    if !valid || value.len() > 76 {
        return Err(NestrunError::Config(format!("invalid {}: {:?}", what, value)));
    }
    Ok(())
}
