//! Test fixtures: an in-memory daemon, recorded mount calls and OCI archive
//! assembly.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use nestrun::daemon::{Daemon, ExitWaiter};
use nestrun::fs::{MountSyscalls, PropagationMode};
use nestrun_shared::records::{
    ContainerRecord, ContentInfo, ExitStatus, ImageRecord, SnapshotInfo, TaskStdio,
};
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::Descriptor;
use sha2::{Digest as _, Sha256};
use tokio::sync::oneshot;

pub const NAMESPACE: &str = "dagger";
pub const SNAPSHOTTER: &str = "overlayfs";
pub const ENTRYPOINT: &str = "/usr/local/bin/dagger-engine";
pub const DAEMON_VERSION: &str = "v1.7.0-memory";

// ============================================================================
// IN-MEMORY DAEMON
// ============================================================================

#[derive(Default)]
struct TaskEntry {
    container_id: String,
    waiters: Vec<oneshot::Sender<NestrunResult<ExitStatus>>>,
    started: bool,
}

#[derive(Default)]
struct State {
    content: HashMap<String, Vec<u8>>,
    content_labels: HashMap<String, HashMap<String, String>>,
    images: BTreeMap<String, ImageRecord>,
    /// Committed and active snapshots: key -> parent.
    snapshots: HashMap<String, Option<String>>,
    containers: HashMap<String, ContainerRecord>,
    tasks: HashMap<String, TaskEntry>,
    calls: Vec<String>,
    blob_writes: usize,
}

/// Daemon whose tasks exit the instant they start.
///
/// An exit with nobody waiting is dropped, like a real event stream.
#[derive(Default)]
pub struct MemoryDaemon {
    state: Mutex<State>,
    exit_code: u32,
    exit_error: Option<String>,
}

impl MemoryDaemon {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn exiting_with(exit_code: u32, error: Option<&str>) -> Arc<Self> {
        Arc::new(Self {
            exit_code,
            exit_error: error.map(String::from),
            ..Default::default()
        })
    }

    /// Daemon method names in call order.
    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    pub fn blob_writes(&self) -> usize {
        self.state.lock().unwrap().blob_writes
    }

    /// Labels the blob `digest` was committed with.
    pub fn content_labels(&self, digest: &str) -> Option<HashMap<String, String>> {
        self.state.lock().unwrap().content_labels.get(digest).cloned()
    }

    pub fn image(&self, name: &str) -> Option<ImageRecord> {
        self.state.lock().unwrap().images.get(name).cloned()
    }

    pub fn image_names(&self) -> Vec<String> {
        self.state.lock().unwrap().images.keys().cloned().collect()
    }

    pub fn container(&self, id: &str) -> Option<ContainerRecord> {
        self.state.lock().unwrap().containers.get(id).cloned()
    }

    pub fn snapshot_parent(&self, key: &str) -> Option<Option<String>> {
        self.state.lock().unwrap().snapshots.get(key).cloned()
    }

    fn record(&self, call: &str) {
        self.state.lock().unwrap().calls.push(call.to_string());
    }

    /// Store a complete blob after checking its digest.
    pub fn commit_blob(&self, descriptor: &Descriptor, bytes: Vec<u8>) -> NestrunResult<()> {
        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&bytes)));
        if digest != descriptor.digest().to_string() {
            return Err(NestrunError::Import(format!(
                "content digest {} does not match {}",
                digest,
                descriptor.digest()
            )));
        }
        let mut state = self.state.lock().unwrap();
        state.blob_writes += 1;
        state.content.insert(digest, bytes);
        Ok(())
    }
}

#[async_trait]
impl Daemon for MemoryDaemon {
    async fn ping(&self) -> NestrunResult<String> {
        self.record("ping");
        Ok(DAEMON_VERSION.to_string())
    }

    async fn content_info(&self, _ns: &str, digest: &str) -> NestrunResult<Option<ContentInfo>> {
        self.record("content_info");
        let state = self.state.lock().unwrap();
        Ok(state.content.get(digest).map(|bytes| ContentInfo {
            digest: digest.to_string(),
            size: bytes.len() as u64,
        }))
    }

    async fn content_write(
        &self,
        _ns: &str,
        descriptor: &Descriptor,
        blob: &Path,
        labels: &HashMap<String, String>,
    ) -> NestrunResult<()> {
        self.record("content_write");
        let bytes = std::fs::read(blob)?;
        self.commit_blob(descriptor, bytes)?;
        self.state
            .lock()
            .unwrap()
            .content_labels
            .insert(descriptor.digest().to_string(), labels.clone());
        Ok(())
    }

    async fn content_read(&self, _ns: &str, digest: &str) -> NestrunResult<Vec<u8>> {
        self.record("content_read");
        self.state
            .lock()
            .unwrap()
            .content
            .get(digest)
            .cloned()
            .ok_or_else(|| NestrunError::Unpack(format!("content {} not found", digest)))
    }

    async fn image_create(&self, _ns: &str, image: ImageRecord) -> NestrunResult<()> {
        self.record("image_create");
        let mut state = self.state.lock().unwrap();
        if !state.content.contains_key(&image.target.digest().to_string()) {
            return Err(NestrunError::Import(format!(
                "image {} targets missing content",
                image.name
            )));
        }
        state.images.insert(image.name.clone(), image);
        Ok(())
    }

    async fn snapshot_stat(
        &self,
        _ns: &str,
        _snapshotter: &str,
        key: &str,
    ) -> NestrunResult<Option<SnapshotInfo>> {
        self.record("snapshot_stat");
        let state = self.state.lock().unwrap();
        Ok(state.snapshots.get(key).map(|parent| SnapshotInfo {
            key: key.to_string(),
            parent: parent.clone(),
        }))
    }

    async fn snapshot_apply(
        &self,
        _ns: &str,
        _snapshotter: &str,
        key: &str,
        parent: Option<&str>,
        layer: &Descriptor,
    ) -> NestrunResult<()> {
        self.record("snapshot_apply");
        let mut state = self.state.lock().unwrap();
        if !state.content.contains_key(&layer.digest().to_string()) {
            return Err(NestrunError::Unpack(format!("layer {} not found", layer.digest())));
        }
        if let Some(parent) = parent
            && !state.snapshots.contains_key(parent)
        {
            return Err(NestrunError::Unpack(format!("parent {} not found", parent)));
        }
        state
            .snapshots
            .insert(key.to_string(), parent.map(String::from));
        Ok(())
    }

    async fn snapshot_prepare(
        &self,
        _ns: &str,
        _snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> NestrunResult<()> {
        self.record("snapshot_prepare");
        let mut state = self.state.lock().unwrap();
        if state.snapshots.contains_key(key) {
            return Err(NestrunError::ContainerCreate(format!(
                "snapshot {} already exists",
                key
            )));
        }
        if !state.snapshots.contains_key(parent) {
            return Err(NestrunError::ContainerCreate(format!(
                "parent snapshot {} not found",
                parent
            )));
        }
        state
            .snapshots
            .insert(key.to_string(), Some(parent.to_string()));
        Ok(())
    }

    async fn container_create(&self, _ns: &str, container: ContainerRecord) -> NestrunResult<()> {
        self.record("container_create");
        let mut state = self.state.lock().unwrap();
        if state.containers.contains_key(&container.id) {
            return Err(NestrunError::ContainerCreate(format!(
                "container {:?} already exists",
                container.id
            )));
        }
        state.containers.insert(container.id.clone(), container);
        Ok(())
    }

    async fn task_create(
        &self,
        _ns: &str,
        container_id: &str,
        _stdio: TaskStdio,
    ) -> NestrunResult<u32> {
        self.record("task_create");
        let mut state = self.state.lock().unwrap();
        if !state.containers.contains_key(container_id) {
            return Err(NestrunError::TaskCreate(format!(
                "container {} not found",
                container_id
            )));
        }
        state.tasks.insert(
            container_id.to_string(),
            TaskEntry {
                container_id: container_id.to_string(),
                ..Default::default()
            },
        );
        Ok(4242)
    }

    async fn task_wait(&self, _ns: &str, container_id: &str) -> NestrunResult<ExitWaiter> {
        self.record("task_wait");
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(container_id)
            .ok_or_else(|| NestrunError::TaskWait(format!("task {} not found", container_id)))?;
        let (tx, waiter) = ExitWaiter::channel();
        task.waiters.push(tx);
        Ok(waiter)
    }

    async fn task_start(&self, _ns: &str, container_id: &str) -> NestrunResult<()> {
        self.record("task_start");
        let mut state = self.state.lock().unwrap();
        let task = state
            .tasks
            .get_mut(container_id)
            .ok_or_else(|| NestrunError::TaskStart(format!("task {} not found", container_id)))?;
        task.started = true;

        // Exits immediately; listeners registered after this point miss it.
        for waiter in task.waiters.drain(..) {
            let _ = waiter.send(Ok(ExitStatus {
                exit_code: self.exit_code,
                exited_at: Some(chrono::Utc::now().to_rfc3339()),
                error: self.exit_error.clone(),
            }));
        }
        Ok(())
    }
}

// ============================================================================
// MOUNT SYSCALLS
// ============================================================================

/// Records mount calls and rejects propagation changes on unbound paths,
/// the way the kernel does for a path that is not a mount point.
#[derive(Default)]
pub struct RecordingMounts {
    bound: Mutex<Vec<PathBuf>>,
    pub log: Mutex<Vec<String>>,
}

impl RecordingMounts {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn log(&self) -> Vec<String> {
        self.log.lock().unwrap().clone()
    }
}

impl MountSyscalls for RecordingMounts {
    fn bind(&self, source: &Path, target: &Path) -> std::io::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("bind {} {}", source.display(), target.display()));
        self.bound.lock().unwrap().push(target.to_path_buf());
        Ok(())
    }

    fn set_propagation(&self, target: &Path, mode: PropagationMode) -> std::io::Result<()> {
        if !self.bound.lock().unwrap().iter().any(|p| p == target) {
            return Err(std::io::Error::from_raw_os_error(libc::EINVAL));
        }
        self.log
            .lock()
            .unwrap()
            .push(format!("{} {}", mode, target.display()));
        Ok(())
    }

    fn unmount(&self, target: &Path) -> std::io::Result<()> {
        self.log
            .lock()
            .unwrap()
            .push(format!("umount {}", target.display()));
        self.bound.lock().unwrap().retain(|p| p != target);
        Ok(())
    }
}

// ============================================================================
// OCI ARCHIVES
// ============================================================================

/// A single-manifest OCI layout archive.
pub struct TestArchive {
    pub bytes: Vec<u8>,
    pub manifest_digest: String,
    pub config_digest: String,
    pub diff_id: String,
}

fn sha256_digest(data: &[u8]) -> String {
    format!("sha256:{}", hex::encode(Sha256::digest(data)))
}

fn append(builder: &mut tar::Builder<Vec<u8>>, path: &str, data: &[u8]) {
    let mut header = tar::Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_cksum();
    builder.append_data(&mut header, path, data).unwrap();
}

fn append_blob(builder: &mut tar::Builder<Vec<u8>>, data: &[u8]) -> String {
    let digest = sha256_digest(data);
    let hex = digest.trim_start_matches("sha256:");
    append(builder, &format!("blobs/sha256/{}", hex), data);
    digest
}

/// Archive holding one image named `name` for `os/arch`.
pub fn oci_archive(name: &str, os: &str, arch: &str) -> TestArchive {
    build_archive(name, os, arch, true)
}

/// Like [`oci_archive`], but the index entry declares no platform; only the
/// image config names `os/arch`.
pub fn oci_archive_without_platform(name: &str, os: &str, arch: &str) -> TestArchive {
    build_archive(name, os, arch, false)
}

fn build_archive(name: &str, os: &str, arch: &str, index_platform: bool) -> TestArchive {
    let layer = {
        let mut layer = tar::Builder::new(Vec::new());
        append(&mut layer, "etc/engine.toml", b"debug = true\n");
        layer.into_inner().unwrap()
    };
    let diff_id = sha256_digest(&layer);

    let config = serde_json::to_vec(&serde_json::json!({
        "architecture": arch,
        "os": os,
        "config": {
            "Entrypoint": [ENTRYPOINT],
            "Cmd": ["--config", "/etc/engine.toml"],
            "Env": ["PATH=/usr/local/bin:/usr/bin:/bin", "ENGINE_MODE=nested"],
            "WorkingDir": "/var/lib/dagger",
            "Labels": {"org.opencontainers.image.title": "engine"}
        },
        "rootfs": {"type": "layers", "diff_ids": [diff_id]},
        "history": []
    }))
    .unwrap();

    let mut builder = tar::Builder::new(Vec::new());
    append(&mut builder, "oci-layout", br#"{"imageLayoutVersion":"1.0.0"}"#);
    let layer_digest = append_blob(&mut builder, &layer);
    let config_digest = append_blob(&mut builder, &config);

    let manifest = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "config": {
            "mediaType": "application/vnd.oci.image.config.v1+json",
            "digest": config_digest,
            "size": config.len()
        },
        "layers": [{
            "mediaType": "application/vnd.oci.image.layer.v1.tar",
            "digest": layer_digest,
            "size": layer.len()
        }]
    }))
    .unwrap();
    let manifest_digest = append_blob(&mut builder, &manifest);

    let mut entry = serde_json::json!({
        "mediaType": "application/vnd.oci.image.manifest.v1+json",
        "digest": manifest_digest,
        "size": manifest.len(),
        "annotations": {"io.containerd.image.name": name}
    });
    if index_platform {
        entry["platform"] = serde_json::json!({"os": os, "architecture": arch});
    }
    let index = serde_json::to_vec(&serde_json::json!({
        "schemaVersion": 2,
        "mediaType": "application/vnd.oci.image.index.v1+json",
        "manifests": [entry]
    }))
    .unwrap();
    append(&mut builder, "index.json", &index);

    TestArchive {
        bytes: builder.into_inner().unwrap(),
        manifest_digest,
        config_digest,
        diff_id,
    }
}

/// Write `archive` to `dir/image.tar`.
pub fn write_archive(dir: &Path, archive: &TestArchive) -> PathBuf {
    let path = dir.join("image.tar");
    std::fs::write(&path, &archive.bytes).unwrap();
    path
}
