//! Fixed paths and names used by the bootstrap.
//!
//! Every default reproduces the reference launch of the engine container.

/// Defaults for [`BootstrapOptions`](super::options::BootstrapOptions).
pub mod defaults {
    /// Control socket of the container-runtime daemon.
    pub const DAEMON_ADDRESS: &str = "/run/containerd/containerd.sock";

    /// Logical namespace all daemon objects are created in.
    pub const NAMESPACE: &str = "dagger";

    /// Single-file image archive loaded at startup.
    pub const IMAGE_ARCHIVE: &str = "/image.tar";

    /// Name given to the image that targets the archive's whole index.
    pub const INDEX_NAME: &str = "dagger-engine";

    pub const SNAPSHOTTER: &str = "overlayfs";

    /// Container name, also used as its snapshot key.
    pub const CONTAINER_NAME: &str = "hello";

    pub const EXTRA_ARGS: &[&str] = &["--debug"];
}

/// Host paths touched by the bootstrap.
pub mod host_paths {
    /// Daemon runtime-socket directory.
    pub const RUNTIME_SOCKET_DIR: &str = "/run/containerd/";

    /// Daemon persistent-state directory.
    pub const DAEMON_STATE_DIR: &str = "/var/lib/containerd/";

    pub const TEMP_DIR: &str = "/tmp";

    /// State directory of the engine running inside the container.
    pub const ENGINE_STATE_DIR: &str = "/var/lib/dagger/";

    /// Created before mounting so the nested engine finds it.
    pub const CONTAINERS_RUN_DIR: &str = "/var/run/containers";

    pub const HOSTS: &str = "/etc/hosts";
    pub const RESOLV_CONF: &str = "/etc/resolv.conf";
    pub const DEV: &str = "/dev";
}

/// Annotation keys recognised on index manifests.
pub mod annotations {
    pub const IMAGE_NAME: &str = "io.containerd.image.name";
    pub const REF_NAME: &str = "org.opencontainers.image.ref.name";
}

/// Content transfer tuning.
pub mod content {
    /// Blob upload chunk size (1 MiB).
    pub const CHUNK_SIZE: usize = 1024 * 1024;

    /// Chunks queued ahead of the write stream.
    pub const WRITE_QUEUE: usize = 4;
}

/// containerd API names.
pub mod containerd {
    use std::time::Duration;

    /// gRPC metadata key selecting the namespace of a request.
    pub const NAMESPACE_HEADER: &str = "containerd-namespace";

    /// gRPC metadata key attaching a request to a lease.
    pub const LEASE_HEADER: &str = "containerd-lease";

    /// Lease label holding its expiry (RFC 3339).
    pub const LEASE_EXPIRE_LABEL: &str = "containerd.io/gc.expire";

    /// How long imported content and snapshots stay leased.
    pub const LEASE_TTL: Duration = Duration::from_secs(24 * 60 * 60);

    /// Content label prefix naming a child blob for garbage collection.
    pub const GC_REF_CONTENT: &str = "containerd.io/gc.ref.content";

    /// Runtime shim used for the engine container.
    pub const RUNTIME: &str = "io.containerd.runc.v2";

    /// Type URL of a runtime spec stored on a container record.
    pub const SPEC_TYPE_URL: &str = "types.containerd.io/opencontainers/runtime-spec/1/Spec";

    /// Bound on dialing the socket and the first round-trip.
    pub const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
}
