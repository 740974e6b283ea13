//! End-to-end bootstrap runs.

mod common;

use std::path::PathBuf;
use std::sync::Arc;

use common::{
    ENTRYPOINT, MemoryDaemon, RecordingMounts, oci_archive, oci_archive_without_platform,
    write_archive,
};
use nestrun::images::Platform;
use nestrun::{Bootstrap, BootstrapOptions};
use nestrun_shared::NestrunError;
use tokio::net::UnixListener;

fn options(dir: &std::path::Path, archive: PathBuf, address: PathBuf) -> BootstrapOptions {
    BootstrapOptions {
        daemon_address: address,
        image_archive: archive,
        host_mounts: Vec::new(),
        prepare_dirs: vec![dir.join("containers")],
        ..Default::default()
    }
}

#[tokio::test]
async fn test_engine_runs_to_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let archive = oci_archive("engine:test", "linux", "amd64");
    let archive_path = write_archive(dir.path(), &archive);

    let daemon = MemoryDaemon::new();
    let outcome = Bootstrap::new(options(dir.path(), archive_path, dir.path().join("unused.sock")))
        .with_daemon(daemon.clone())
        .with_mount_syscalls(RecordingMounts::new())
        .with_platform(Platform::new("linux", "amd64", None))
        .with_hostname("nested-host")
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    let names: Vec<_> = outcome.images.iter().map(|i| i.name.as_str()).collect();
    assert_eq!(names, vec!["engine:test", "dagger-engine"]);
    assert!(outcome.metrics.task_duration_ms("launch").is_some());
    assert!(dir.path().join("containers").is_dir());

    let container = daemon.container("hello").unwrap();
    let process = container.spec.process().clone().unwrap();
    assert_eq!(
        process.args().clone().unwrap(),
        vec![ENTRYPOINT.to_string(), "--debug".to_string()]
    );
    let env = process.env().clone().unwrap();
    assert!(env.contains(&"HOSTNAME=nested-host".to_string()));
    assert!(env.contains(&"ENGINE_MODE=nested".to_string()));

    let linux = container.spec.linux().clone().unwrap();
    assert_eq!(linux.rootfs_propagation().as_deref(), Some("shared"));
    let shares_host_network = linux
        .namespaces()
        .clone()
        .unwrap_or_default()
        .iter()
        .all(|ns| ns.typ() != oci_spec::runtime::LinuxNamespaceType::Network);
    assert!(shares_host_network);
}

#[tokio::test]
async fn test_archive_without_index_platform_runs_to_exit_zero() {
    let dir = tempfile::tempdir().unwrap();
    let archive = oci_archive_without_platform("engine:test", "linux", "amd64");
    let archive_path = write_archive(dir.path(), &archive);

    let daemon = MemoryDaemon::new();
    let outcome = Bootstrap::new(options(dir.path(), archive_path, dir.path().join("unused.sock")))
        .with_daemon(daemon.clone())
        .with_mount_syscalls(RecordingMounts::new())
        .with_platform(Platform::new("linux", "amd64", None))
        .with_hostname("nested-host")
        .run()
        .await
        .unwrap();

    assert_eq!(outcome.exit_code(), 0);
    assert_eq!(daemon.snapshot_parent("hello"), Some(Some(archive.diff_id.clone())));
}

#[tokio::test]
async fn test_nothing_listening_is_connection_error_before_import() {
    let dir = tempfile::tempdir().unwrap();
    let address = dir.path().join("stale.sock");
    drop(UnixListener::bind(&address).unwrap());
    assert!(address.exists());

    // The archive does not exist: reaching import would be an import error.
    let err = Bootstrap::new(options(
        dir.path(),
        dir.path().join("missing.tar"),
        address,
    ))
    .with_mount_syscalls(RecordingMounts::new())
    .run()
    .await
    .unwrap_err();

    match err {
        NestrunError::Connection(message) => assert!(message.contains("stale.sock")),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(!dir.path().join("containers").exists());
}

#[tokio::test]
async fn test_missing_archive_is_import_error() {
    let dir = tempfile::tempdir().unwrap();
    let daemon = MemoryDaemon::new();

    let err = Bootstrap::new(options(
        dir.path(),
        dir.path().join("missing.tar"),
        dir.path().join("unused.sock"),
    ))
    .with_daemon(daemon.clone())
    .with_mount_syscalls(RecordingMounts::new())
    .run()
    .await
    .unwrap_err();

    assert!(matches!(err, NestrunError::Import(_)), "{err:?}");
    assert_eq!(daemon.calls(), vec!["ping".to_string()]);
}

#[tokio::test]
async fn test_foreign_platform_stops_before_mounts() {
    let dir = tempfile::tempdir().unwrap();
    let archive = oci_archive("engine:test", "linux", "arm64");
    let archive_path = write_archive(dir.path(), &archive);
    let mounts = RecordingMounts::new();

    let mut opts = options(dir.path(), archive_path, dir.path().join("unused.sock"));
    opts.host_mounts = vec![nestrun::fs::MountSpec::self_bound(dir.path().join("state"))];

    let err = Bootstrap::new(opts)
        .with_daemon(MemoryDaemon::new())
        .with_mount_syscalls(mounts.clone())
        .with_platform(Platform::new("linux", "amd64", None))
        .run()
        .await
        .unwrap_err();

    assert!(matches!(err, NestrunError::Unpack(_)), "{err:?}");
    assert!(mounts.log().is_empty());
}

#[tokio::test]
async fn test_reported_container_error_is_container_exit() {
    let dir = tempfile::tempdir().unwrap();
    let archive = oci_archive("engine:test", "linux", "amd64");
    let archive_path = write_archive(dir.path(), &archive);
    let daemon: Arc<MemoryDaemon> = MemoryDaemon::exiting_with(1, Some("engine crashed"));

    let err = Bootstrap::new(options(dir.path(), archive_path, dir.path().join("unused.sock")))
        .with_daemon(daemon)
        .with_mount_syscalls(RecordingMounts::new())
        .with_platform(Platform::new("linux", "amd64", None))
        .with_hostname("nested-host")
        .run()
        .await
        .unwrap_err();

    match err {
        NestrunError::ContainerExit { exit_code, message } => {
            assert_eq!(exit_code, 1);
            assert_eq!(message, "engine crashed");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
