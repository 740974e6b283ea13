//! Handle to the container-runtime daemon, scoped to one namespace.

pub mod constants;
pub mod options;

use std::path::Path;
use std::sync::Arc;

use nestrun_shared::NestrunResult;

use crate::daemon::{ContainerdDaemon, Daemon};

/// Connected daemon plus the namespace every operation runs in.
///
/// **Cloning**: cheap, clones share the same daemon handle.
#[derive(Clone)]
pub struct RuntimeClient {
    daemon: Arc<dyn Daemon>,
    namespace: String,
}

impl std::fmt::Debug for RuntimeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeClient")
            .field("namespace", &self.namespace)
            .finish_non_exhaustive()
    }
}

impl RuntimeClient {
    /// Connect to the containerd socket at `address`.
    ///
    /// Fails with `Connection` when the socket is unreachable or the peer does
    /// not answer a version request.
    pub async fn connect(address: &Path, namespace: impl Into<String>) -> NestrunResult<Self> {
        let daemon = ContainerdDaemon::connect(address).await?;
        Self::with_daemon(Arc::new(daemon), namespace).await
    }

    /// Wrap an already constructed daemon handle.
    pub async fn with_daemon(
        daemon: Arc<dyn Daemon>,
        namespace: impl Into<String>,
    ) -> NestrunResult<Self> {
        let version = daemon.ping().await?;
        let namespace = namespace.into();
        tracing::info!(namespace = %namespace, version = %version, "Connected to daemon");
        Ok(Self { daemon, namespace })
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn daemon(&self) -> &dyn Daemon {
        self.daemon.as_ref()
    }
}
