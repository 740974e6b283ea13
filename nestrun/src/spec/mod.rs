//! Runtime spec for the nested engine container.

mod builder;
mod devices;
mod update;

pub use builder::{ContainerSpecBuilder, DEFAULT_PATH_ENV, replace_or_append_env};
pub use devices::host_devices;
pub use update::FieldUpdate;

use std::path::Path;

use nestrun_shared::NestrunResult;
use oci_spec::runtime::{LinuxNamespaceType, Spec};
use serde::{Deserialize, Serialize};

use crate::fs::PropagatedMounts;
use crate::images::UnpackedImage;
use crate::runtime::constants::host_paths;

/// Namespace the container shares with the host instead of getting its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HostNamespace {
    Network,
    Uts,
    Mount,
    Ipc,
    Pid,
}

impl HostNamespace {
    pub fn namespace_type(&self) -> LinuxNamespaceType {
        match self {
            HostNamespace::Network => LinuxNamespaceType::Network,
            HostNamespace::Uts => LinuxNamespaceType::Uts,
            HostNamespace::Mount => LinuxNamespaceType::Mount,
            HostNamespace::Ipc => LinuxNamespaceType::Ipc,
            HostNamespace::Pid => LinuxNamespaceType::Pid,
        }
    }
}

/// Inputs for the engine container's spec.
#[derive(Debug, Clone, Copy)]
pub struct EngineSpecInput<'a> {
    pub image: &'a UnpackedImage,
    pub mounts: &'a PropagatedMounts,
    pub hostname: &'a str,
    pub extra_args: &'a [String],
    pub host_namespaces: &'a [HostNamespace],
}

/// Spec for a privileged engine sharing the host's network.
///
/// Applied in order: image config, privileges, every device allowed, host
/// devices, host namespaces, host `/etc/hosts` and `/etc/resolv.conf`,
/// `HOSTNAME`, extra args, propagated mounts, shared rootfs propagation.
pub fn engine_spec(input: EngineSpecInput<'_>) -> NestrunResult<Spec> {
    let spec = ContainerSpecBuilder::new()?
        .image_config(input.image)?
        .privileged()?
        .all_devices_allowed()?
        .host_devices(Path::new(host_paths::DEV))?
        .host_namespaces(input.host_namespaces)?
        .host_file(Path::new(host_paths::HOSTS))?
        .host_file(Path::new(host_paths::RESOLV_CONF))?
        .env("HOSTNAME", input.hostname)?
        .args(input.image, input.extra_args)?
        .mounts(input.mounts)?
        .rootfs_propagation(FieldUpdate::SetOrInsert("shared".to_string()))?
        .build();

    tracing::debug!(
        hostname = input.hostname,
        mounts = input.mounts.len(),
        "Runtime spec assembled"
    );
    Ok(spec)
}
