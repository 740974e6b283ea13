//! Host mount-table operations.
//!
//! Host directories the nested container shares with its parent are
//! self-bound and then switched to shared propagation, so mounts the nested
//! engine makes under them are visible on the host and vice versa.

mod mount;
mod native;
mod propagator;

pub use mount::{MountSpec, PropagationMode};
pub use native::NativeMounts;
pub use propagator::{MountPropagator, PropagatedMounts, RollbackPolicy};

use std::io;
use std::path::Path;

/// Raw mount syscalls, one method per mount(2) use.
///
/// [`NativeMounts`] is the real implementation. Tests substitute a recorder to
/// check the order of operations without privileges.
pub trait MountSyscalls: Send + Sync {
    /// Bind `source` onto `target` (non-recursive `MS_BIND`).
    fn bind(&self, source: &Path, target: &Path) -> io::Result<()>;

    /// Change the propagation type of the mount at `target`.
    fn set_propagation(&self, target: &Path, mode: PropagationMode) -> io::Result<()>;

    /// Lazily detach the mount at `target`.
    fn unmount(&self, target: &Path) -> io::Result<()>;
}
