//! Runtime spec assembly.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::runtime::{
    Capability, Linux, LinuxCapabilitiesBuilder, LinuxDeviceCgroupBuilder, LinuxResources,
    MountBuilder, Process, RootBuilder, Spec, UserBuilder,
};

use super::{FieldUpdate, HostNamespace, devices};
use crate::fs::PropagatedMounts;
use crate::images::UnpackedImage;

/// PATH used when the image config sets none.
pub const DEFAULT_PATH_ENV: &str =
    "PATH=/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Builds an OCI runtime spec step by step.
///
/// Every step is fallible and reports `SpecBuild`; nothing here panics on
/// malformed input.
#[derive(Debug, Clone)]
pub struct ContainerSpecBuilder {
    spec: Spec,
}

impl ContainerSpecBuilder {
    /// Start from the runtime defaults: no terminal, writable root, no hostname.
    pub fn new() -> NestrunResult<Self> {
        let mut spec = Spec::default();
        spec.set_hostname(None);
        spec.set_root(Some(
            RootBuilder::default()
                .path("rootfs")
                .readonly(false)
                .build()
                .map_err(build_error("root"))?,
        ));

        let mut process = Process::default();
        process.set_terminal(Some(false));
        process.set_env(Some(vec![DEFAULT_PATH_ENV.to_string()]));
        spec.set_process(Some(process));

        Ok(Self { spec })
    }

    /// Process args, env, cwd and user from the image config.
    ///
    /// Args are the entrypoint followed by the image cmd. Image env entries
    /// replace defaults of the same key.
    pub fn image_config(mut self, image: &UnpackedImage) -> NestrunResult<Self> {
        let config = image.config.config().clone().unwrap_or_default();
        let mut process = self.process()?;

        let mut args = config.entrypoint().clone().unwrap_or_default();
        args.extend(config.cmd().clone().unwrap_or_default());
        process.set_args(Some(args));

        let mut env = process.env().clone().unwrap_or_default();
        for entry in config.env().clone().unwrap_or_default() {
            replace_or_append_env(&mut env, entry);
        }
        process.set_env(Some(env));

        let cwd = config
            .working_dir()
            .as_deref()
            .filter(|dir| !dir.is_empty())
            .unwrap_or("/");
        process.set_cwd(PathBuf::from(cwd));

        if let Some(user) = config.user().as_deref().filter(|u| !u.is_empty()) {
            let (uid, gid) = parse_user(user)?;
            process.set_user(
                UserBuilder::default()
                    .uid(uid)
                    .gid(gid)
                    .build()
                    .map_err(build_error("user"))?,
            );
        }

        self.spec.set_process(Some(process));
        Ok(self)
    }

    /// Args become the image entrypoint followed by `extra`, which replaces
    /// the image cmd. An empty `extra` keeps the cmd.
    pub fn args(mut self, image: &UnpackedImage, extra: &[String]) -> NestrunResult<Self> {
        if extra.is_empty() {
            return Ok(self);
        }
        let config = image.config.config().clone().unwrap_or_default();
        let mut process = self.process()?;

        let mut args = config.entrypoint().clone().unwrap_or_default();
        args.extend(extra.iter().cloned());
        process.set_args(Some(args));

        self.spec.set_process(Some(process));
        Ok(self)
    }

    /// Full bounding, effective and permitted capabilities, writable sysfs and
    /// cgroupfs, no masked or readonly paths, no seccomp, AppArmor or SELinux
    /// confinement. Inheritable and ambient sets stay empty.
    pub fn privileged(mut self) -> NestrunResult<Self> {
        let caps = all_capabilities();
        let mut process = self.process()?;
        process.set_capabilities(Some(
            LinuxCapabilitiesBuilder::default()
                .bounding(caps.clone())
                .effective(caps.clone())
                .permitted(caps)
                .inheritable(HashSet::new())
                .ambient(HashSet::new())
                .build()
                .map_err(build_error("capabilities"))?,
        ));
        process.set_apparmor_profile(None);
        process.set_selinux_label(None);
        process.set_no_new_privileges(Some(false));
        self.spec.set_process(Some(process));

        let mut linux = self.linux()?;
        linux.set_masked_paths(None);
        linux.set_readonly_paths(None);
        linux.set_seccomp(None);
        self.spec.set_linux(Some(linux));

        if let Some(mounts) = self.spec.mounts().clone() {
            let mounts = mounts
                .into_iter()
                .map(|mut mount| {
                    let pseudo_fs = matches!(mount.typ().as_deref(), Some("sysfs" | "cgroup" | "cgroup2"));
                    if pseudo_fs && let Some(options) = mount.options().clone() {
                        mount.set_options(Some(options.into_iter().filter(|o| o != "ro").collect()));
                    }
                    mount
                })
                .collect();
            self.spec.set_mounts(Some(mounts));
        }

        Ok(self)
    }

    /// Device cgroup rule allowing read, write and mknod on every device.
    pub fn all_devices_allowed(mut self) -> NestrunResult<Self> {
        let rule = LinuxDeviceCgroupBuilder::default()
            .allow(true)
            .access("rwm")
            .build()
            .map_err(build_error("device cgroup rule"))?;

        let mut linux = self.linux()?;
        let mut resources: LinuxResources = linux.resources().clone().unwrap_or_default();
        resources.set_devices(Some(vec![rule]));
        linux.set_resources(Some(resources));
        self.spec.set_linux(Some(linux));
        Ok(self)
    }

    /// Pass every device node under `dev_root` into the container.
    pub fn host_devices(mut self, dev_root: &Path) -> NestrunResult<Self> {
        let found = devices::host_devices(dev_root);
        let mut linux = self.linux()?;
        let mut all = linux.devices().clone().unwrap_or_default();
        all.extend(found);
        linux.set_devices(Some(all));
        self.spec.set_linux(Some(linux));
        Ok(self)
    }

    /// Drop the namespace entries so the container joins the host's.
    pub fn host_namespaces(mut self, shared: &[HostNamespace]) -> NestrunResult<Self> {
        let mut linux = self.linux()?;
        if let Some(namespaces) = linux.namespaces().clone() {
            let kept = namespaces
                .into_iter()
                .filter(|ns| !shared.iter().any(|h| h.namespace_type() == ns.typ()))
                .collect();
            linux.set_namespaces(Some(kept));
        }
        self.spec.set_linux(Some(linux));
        Ok(self)
    }

    /// Bind a host file read-only at the same path.
    pub fn host_file(mut self, path: &Path) -> NestrunResult<Self> {
        let mount = MountBuilder::default()
            .destination(path.to_path_buf())
            .typ("bind")
            .source(path.to_path_buf())
            .options(vec!["rbind".to_string(), "ro".to_string()])
            .build()
            .map_err(build_error("host file mount"))?;
        let mut mounts = self.spec.mounts().clone().unwrap_or_default();
        mounts.push(mount);
        self.spec.set_mounts(Some(mounts));
        Ok(self)
    }

    /// Set `key=value`, replacing an existing entry for `key`.
    pub fn env(mut self, key: &str, value: &str) -> NestrunResult<Self> {
        if key.is_empty() || key.contains('=') {
            return Err(NestrunError::SpecBuild(format!("invalid env key {:?}", key)));
        }
        let mut process = self.process()?;
        let mut env = process.env().clone().unwrap_or_default();
        replace_or_append_env(&mut env, format!("{}={}", key, value));
        process.set_env(Some(env));
        self.spec.set_process(Some(process));
        Ok(self)
    }

    /// Attach host mounts that have already been propagated.
    pub fn mounts(mut self, propagated: &PropagatedMounts) -> NestrunResult<Self> {
        let mut mounts = self.spec.mounts().clone().unwrap_or_default();
        mounts.extend(propagated.oci_mounts()?);
        self.spec.set_mounts(Some(mounts));
        Ok(self)
    }

    pub fn rootfs_propagation(mut self, update: FieldUpdate<String>) -> NestrunResult<Self> {
        update.apply_rootfs_propagation(&mut self.spec)?;
        Ok(self)
    }

    pub fn build(self) -> Spec {
        self.spec
    }

    fn process(&self) -> NestrunResult<Process> {
        self.spec
            .process()
            .clone()
            .ok_or_else(|| NestrunError::SpecBuild("spec has no process section".into()))
    }

    /// Current `linux` section, or an empty one.
    fn linux(&self) -> NestrunResult<Linux> {
        match self.spec.linux() {
            Some(linux) => Ok(linux.clone()),
            None => empty_linux(),
        }
    }
}

pub(crate) fn empty_linux() -> NestrunResult<Linux> {
    serde_json::from_str("{}")
        .map_err(|e| NestrunError::SpecBuild(format!("create linux section: {}", e)))
}

fn build_error<E: std::fmt::Display>(what: &'static str) -> impl Fn(E) -> NestrunError {
    move |e| NestrunError::SpecBuild(format!("{}: {}", what, e))
}

/// Replace the entry with the same key as `entry`, or append it.
pub fn replace_or_append_env(env: &mut Vec<String>, entry: String) {
    let key = entry.split('=').next().unwrap_or_default().to_string();
    match env
        .iter_mut()
        .find(|existing| existing.split('=').next() == Some(key.as_str()))
    {
        Some(existing) => *existing = entry,
        None => env.push(entry),
    }
}

/// Numeric `uid[:gid]`; `root` is accepted as uid 0.
fn parse_user(user: &str) -> NestrunResult<(u32, u32)> {
    let parse = |part: &str| -> NestrunResult<u32> {
        if part == "root" {
            return Ok(0);
        }
        part.parse::<u32>().map_err(|_| {
            NestrunError::SpecBuild(format!(
                "image user {:?} is not numeric; name lookup in the image rootfs is unsupported",
                user
            ))
        })
    };
    match user.split_once(':') {
        Some((uid, gid)) => Ok((parse(uid)?, parse(gid)?)),
        None => {
            let uid = parse(user)?;
            Ok((uid, uid))
        }
    }
}

/// Capabilities for a privileged process: the current bounding set.
#[cfg(target_os = "linux")]
fn all_capabilities() -> HashSet<Capability> {
    let current = caps::read(None, caps::CapSet::Bounding).unwrap_or_else(|e| {
        tracing::debug!(error = %e, "Cannot read bounding set, using every known capability");
        caps::all()
    });

    current
        .into_iter()
        .filter_map(|cap| {
            let name = cap.to_string();
            match serde_json::from_value::<Capability>(serde_json::Value::String(name.clone())) {
                Ok(cap) => Some(cap),
                Err(_) => {
                    tracing::debug!(capability = %name, "Capability unknown to the runtime spec");
                    None
                }
            }
        })
        .collect()
}

#[cfg(not(target_os = "linux"))]
fn all_capabilities() -> HashSet<Capability> {
    HashSet::new()
}
