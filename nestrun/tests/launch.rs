//! Task launch ordering against a daemon whose task exits on start.

mod common;

use std::time::Duration;

use common::{MemoryDaemon, NAMESPACE, SNAPSHOTTER, oci_archive};
use nestrun::fs::MountPropagator;
use nestrun::images::{ImageImporter, ImageUnpacker, Platform, UnpackedImage};
use nestrun::spec::{EngineSpecInput, engine_spec};
use nestrun::task::{LaunchRequest, TaskSupervisor};
use nestrun::{BootstrapCache, RuntimeClient};
use nestrun_shared::NestrunError;
use oci_spec::runtime::Spec;

async fn prepared(daemon: std::sync::Arc<MemoryDaemon>) -> (RuntimeClient, UnpackedImage, Spec) {
    let client = RuntimeClient::with_daemon(daemon, NAMESPACE).await.unwrap();
    let archive = oci_archive("engine:test", "linux", "amd64");
    let images = ImageImporter::new(&client)
        .import(std::io::Cursor::new(archive.bytes), Some("dagger-engine"))
        .await
        .unwrap();
    let cache = BootstrapCache::new();
    let image = ImageUnpacker::new(&client, Platform::new("linux", "amd64", None), &cache)
        .unpack(&images[0], SNAPSHOTTER)
        .await
        .unwrap();

    let mounts = MountPropagator::new(common::RecordingMounts::new())
        .propagate(&[])
        .unwrap();
    let spec = engine_spec(EngineSpecInput {
        image: &image,
        mounts: &mounts,
        hostname: "nested-host",
        extra_args: &["--debug".to_string()],
        host_namespaces: &[nestrun::spec::HostNamespace::Network],
    })
    .unwrap();
    (client, image, spec)
}

#[tokio::test]
async fn test_immediate_exit_is_observed() {
    let daemon = MemoryDaemon::new();
    let (client, image, spec) = prepared(daemon.clone()).await;

    let exit = tokio::time::timeout(
        Duration::from_secs(10),
        TaskSupervisor::new(&client).launch(LaunchRequest {
            name: "hello",
            image: &image,
            spec,
        }),
    )
    .await
    .expect("launch hung waiting for an exit that was already delivered")
    .unwrap();

    assert_eq!(exit.exit_code(), 0);
    assert_eq!(exit.pid, 4242);
    assert!(exit.exited_at().is_some());
    assert_eq!(exit.container.snapshot_key, "hello");

    let calls = daemon.calls();
    let position = |name: &str| calls.iter().position(|c| c == name).unwrap();
    assert!(position("snapshot_prepare") < position("container_create"));
    assert!(position("container_create") < position("task_create"));
    assert!(position("task_create") < position("task_wait"));
    assert!(position("task_wait") < position("task_start"));
}

#[tokio::test]
async fn test_container_snapshot_sits_on_image_chain() {
    let daemon = MemoryDaemon::new();
    let (client, image, spec) = prepared(daemon.clone()).await;

    TaskSupervisor::new(&client)
        .launch(LaunchRequest {
            name: "hello",
            image: &image,
            spec,
        })
        .await
        .unwrap();

    assert_eq!(daemon.snapshot_parent("hello"), Some(Some(image.chain_id.clone())));
    let container = daemon.container("hello").unwrap();
    assert_eq!(container.image, "engine:test");
    assert_eq!(container.snapshotter, SNAPSHOTTER);
    assert_eq!(
        container.labels.get("org.opencontainers.image.title").map(String::as_str),
        Some("engine")
    );
}

#[tokio::test]
async fn test_nonzero_exit_is_reported_not_failed() {
    let daemon = MemoryDaemon::exiting_with(3, None);
    let (client, image, spec) = prepared(daemon).await;

    let exit = TaskSupervisor::new(&client)
        .launch(LaunchRequest {
            name: "hello",
            image: &image,
            spec,
        })
        .await
        .unwrap();

    assert_eq!(exit.exit_code(), 3);
    assert_eq!(exit.into_result().unwrap(), 3);
}

#[tokio::test]
async fn test_existing_container_name_is_container_create_error() {
    let daemon = MemoryDaemon::new();
    let (client, image, spec) = prepared(daemon.clone()).await;

    TaskSupervisor::new(&client)
        .launch(LaunchRequest {
            name: "hello",
            image: &image,
            spec: spec.clone(),
        })
        .await
        .unwrap();
    let err = TaskSupervisor::new(&client)
        .launch(LaunchRequest {
            name: "hello",
            image: &image,
            spec,
        })
        .await
        .unwrap_err();

    assert!(matches!(err, NestrunError::ContainerCreate(_)), "{err:?}");
}
