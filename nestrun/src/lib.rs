//! nestrun: bootstrap a privileged container inside a container.
//!
//! Loads an OCI image archive into a container-runtime daemon, unpacks it,
//! self-binds and shares a fixed set of host directories, then launches the
//! image with host networking and waits for it to exit.

pub mod bootstrap;
pub mod daemon;
pub mod fs;
pub mod images;
pub mod logging;
pub mod pipeline;
pub mod runtime;
pub mod spec;
pub mod task;

pub use bootstrap::{Bootstrap, BootstrapCache, BootstrapOutcome};
pub use nestrun_shared::{NestrunError, NestrunResult};
pub use runtime::RuntimeClient;
pub use runtime::options::BootstrapOptions;
