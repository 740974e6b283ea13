//! Mount syscalls through mount(2) and umount2(2).
//!
//! Requires CAP_SYS_ADMIN in the current mount namespace.

use std::io;
use std::path::Path;

use super::{MountSyscalls, PropagationMode};

/// Real mount table of the calling process.
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeMounts;

impl NativeMounts {
    pub fn new() -> Self {
        Self
    }
}

#[cfg(target_os = "linux")]
mod imp {
    use super::*;
    use nix::mount::{MntFlags, MsFlags, mount, umount2};

    fn propagation_flags(mode: PropagationMode) -> MsFlags {
        match mode {
            PropagationMode::Private => MsFlags::MS_PRIVATE,
            PropagationMode::Slave => MsFlags::MS_SLAVE,
            PropagationMode::Shared => MsFlags::MS_SHARED,
            PropagationMode::RShared => MsFlags::MS_SHARED | MsFlags::MS_REC,
        }
    }

    impl MountSyscalls for NativeMounts {
        fn bind(&self, source: &Path, target: &Path) -> io::Result<()> {
            mount(
                Some(source),
                target,
                None::<&str>,
                MsFlags::MS_BIND,
                None::<&str>,
            )?;
            tracing::debug!(
                source = %source.display(),
                target = %target.display(),
                "Bind mount created"
            );
            Ok(())
        }

        fn set_propagation(&self, target: &Path, mode: PropagationMode) -> io::Result<()> {
            mount(
                None::<&str>,
                target,
                None::<&str>,
                propagation_flags(mode),
                None::<&str>,
            )?;
            tracing::debug!(target = %target.display(), mode = %mode, "Propagation changed");
            Ok(())
        }

        fn unmount(&self, target: &Path) -> io::Result<()> {
            umount2(target, MntFlags::MNT_DETACH)?;
            tracing::debug!(target = %target.display(), "Mount detached");
            Ok(())
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn test_recursive_shared_sets_rec_flag() {
            let flags = propagation_flags(PropagationMode::RShared);
            assert!(flags.contains(MsFlags::MS_SHARED));
            assert!(flags.contains(MsFlags::MS_REC));
            assert!(!propagation_flags(PropagationMode::Shared).contains(MsFlags::MS_REC));
        }
    }
}

#[cfg(not(target_os = "linux"))]
impl MountSyscalls for NativeMounts {
    fn bind(&self, _source: &Path, _target: &Path) -> io::Result<()> {
        Err(unsupported())
    }

    fn set_propagation(&self, _target: &Path, _mode: PropagationMode) -> io::Result<()> {
        Err(unsupported())
    }

    fn unmount(&self, _target: &Path) -> io::Result<()> {
        Err(unsupported())
    }
}

#[cfg(not(target_os = "linux"))]
fn unsupported() -> io::Error {
    io::Error::new(
        io::ErrorKind::Unsupported,
        "mount propagation is only supported on Linux",
    )
}
