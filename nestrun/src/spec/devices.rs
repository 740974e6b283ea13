//! Host device discovery.

use std::path::Path;

use oci_spec::runtime::LinuxDevice;

/// Directories under the device root that never hold devices to pass through.
const SKIPPED_DIRS: &[&str] = &["pts", "shm", "fd", "mqueue", ".lxc", ".lxd-mounts", ".udev"];

/// Every character and block device node under `root` (normally `/dev`).
///
/// Symlinks, the console and unreadable entries are skipped.
#[cfg(target_os = "linux")]
pub fn host_devices(root: &Path) -> Vec<LinuxDevice> {
    use nix::sys::stat::{major, minor};
    use oci_spec::runtime::{LinuxDeviceBuilder, LinuxDeviceType};
    use std::os::unix::fs::{FileTypeExt, MetadataExt};
    use walkdir::WalkDir;

    let mut devices = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .filter_entry(|entry| {
            !(entry.depth() > 0
                && entry.file_type().is_dir()
                && SKIPPED_DIRS.iter().any(|d| entry.file_name() == *d))
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                tracing::debug!(error = %e, "Skipping unreadable device entry");
                continue;
            }
        };
        if entry.file_name() == "console" {
            continue;
        }

        let file_type = entry.file_type();
        let typ = if file_type.is_char_device() {
            LinuxDeviceType::C
        } else if file_type.is_block_device() {
            LinuxDeviceType::B
        } else {
            continue;
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "Skipping device");
                continue;
            }
        };
        let rdev = metadata.rdev();

        let device = LinuxDeviceBuilder::default()
            .path(entry.path().to_path_buf())
            .typ(typ)
            .major(major(rdev) as i64)
            .minor(minor(rdev) as i64)
            .file_mode(metadata.mode() & 0o7777)
            .uid(metadata.uid())
            .gid(metadata.gid())
            .build();

        match device {
            Ok(device) => devices.push(device),
            Err(e) => {
                tracing::debug!(path = %entry.path().display(), error = %e, "Skipping device")
            }
        }
    }

    tracing::debug!(root = %root.display(), count = devices.len(), "Host devices discovered");
    devices
}

#[cfg(not(target_os = "linux"))]
pub fn host_devices(root: &Path) -> Vec<LinuxDevice> {
    tracing::debug!(root = %root.display(), "Host device passthrough is only supported on Linux");
    let _ = SKIPPED_DIRS;
    Vec::new()
}
