//! containerd gRPC client.
//!
//! Requests carry the namespace in the `containerd-namespace` header.
//! Writes that create content, snapshots or containers also carry a lease,
//! created lazily per namespace, so nothing is collected before the image
//! and container records that reference it exist.

use std::collections::HashMap;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, TimeDelta, Utc};
use containerd_client::services::v1::container::Runtime;
use containerd_client::services::v1::containers_client::ContainersClient;
use containerd_client::services::v1::content_client::ContentClient;
use containerd_client::services::v1::diff_client::DiffClient;
use containerd_client::services::v1::images_client::ImagesClient;
use containerd_client::services::v1::leases_client::LeasesClient;
use containerd_client::services::v1::snapshots::snapshots_client::SnapshotsClient;
use containerd_client::services::v1::snapshots::{
    CommitSnapshotRequest, MountsRequest, PrepareSnapshotRequest, RemoveSnapshotRequest,
    StatSnapshotRequest,
};
use containerd_client::services::v1::tasks_client::TasksClient;
use containerd_client::services::v1::version_client::VersionClient;
use containerd_client::services::v1::{
    ApplyRequest, Container, CreateContainerRequest, CreateImageRequest, CreateRequest,
    CreateTaskRequest, GetContainerRequest, Image, InfoRequest, ReadContentRequest,
    StartRequest, UpdateImageRequest, WaitRequest, WaitResponse, WriteAction,
    WriteContentRequest,
};
use containerd_client::types::{Descriptor as ProtoDescriptor, Mount};
use hyper_util::rt::TokioIo;
use nestrun_shared::records::{
    ContainerRecord, ContentInfo, ExitStatus, ImageRecord, SnapshotInfo, TaskStdio,
};
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::Descriptor;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tokio::sync::{Mutex, mpsc};
use tokio_stream::wrappers::ReceiverStream;
use tonic::codegen::{Service, http::Uri};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::{Channel, Endpoint};
use tonic::{Code, Status};

use super::{Daemon, ExitWaiter};
use crate::runtime::constants::containerd::{
    CONNECT_TIMEOUT, LEASE_EXPIRE_LABEL, LEASE_HEADER, LEASE_TTL, NAMESPACE_HEADER, RUNTIME,
    SPEC_TYPE_URL,
};
use crate::runtime::constants::content::{CHUNK_SIZE, WRITE_QUEUE};

type ErrorKind = fn(String) -> NestrunError;

/// containerd reached through its gRPC socket.
///
/// One channel is multiplexed across every service client.
pub struct ContainerdDaemon {
    address: PathBuf,
    channel: Channel,
    /// Lease id per namespace.
    leases: Mutex<HashMap<String, String>>,
}

impl std::fmt::Debug for ContainerdDaemon {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ContainerdDaemon")
            .field("address", &self.address)
            .finish_non_exhaustive()
    }
}

impl ContainerdDaemon {
    /// Dial the containerd socket at `address`.
    ///
    /// Fails with `Connection` when nothing accepts connections at that path.
    pub async fn connect(address: impl Into<PathBuf>) -> NestrunResult<Self> {
        let address = address.into();
        let endpoint = Endpoint::from_static("http://[::]:50051");
        let dial = endpoint.connect_with_connector(UnixConnector::new(address.clone()));

        let channel = match tokio::time::timeout(CONNECT_TIMEOUT, dial).await {
            Ok(Ok(channel)) => channel,
            Ok(Err(e)) => return Err(connection_error(&address, &describe(&e))),
            Err(_) => {
                return Err(connection_error(
                    &address,
                    &format!("timed out after {:?}", CONNECT_TIMEOUT),
                ));
            }
        };

        tracing::debug!(address = %address.display(), "containerd socket reachable");
        Ok(Self {
            address,
            channel,
            leases: Mutex::new(HashMap::new()),
        })
    }

    pub fn address(&self) -> &Path {
        &self.address
    }

    /// Wrap `message` with the namespace header, and the lease when `leased`.
    async fn request<T>(
        &self,
        ns: &str,
        message: T,
        leased: bool,
        kind: ErrorKind,
    ) -> NestrunResult<tonic::Request<T>> {
        let mut request = tonic::Request::new(message);
        if !ns.is_empty() {
            request
                .metadata_mut()
                .insert(NAMESPACE_HEADER, header(ns, kind)?);
        }
        if leased {
            let lease = self.lease(ns, kind).await?;
            request
                .metadata_mut()
                .insert(LEASE_HEADER, header(&lease, kind)?);
        }
        Ok(request)
    }

    /// Lease for `ns`, created on first use and left to expire.
    async fn lease(&self, ns: &str, kind: ErrorKind) -> NestrunResult<String> {
        let mut leases = self.leases.lock().await;
        if let Some(id) = leases.get(ns) {
            return Ok(id.clone());
        }

        let ttl = TimeDelta::from_std(LEASE_TTL)
            .map_err(|e| NestrunError::Internal(format!("lease ttl: {}", e)))?;
        let expires = (Utc::now() + ttl).to_rfc3339_opts(SecondsFormat::Secs, true);
        let id = format!("nestrun-{}-{}", std::process::id(), unique_suffix());

        let mut request = tonic::Request::new(CreateRequest {
            id: id.clone(),
            labels: HashMap::from([(LEASE_EXPIRE_LABEL.to_string(), expires.clone())]),
        });
        if !ns.is_empty() {
            request
                .metadata_mut()
                .insert(NAMESPACE_HEADER, header(ns, kind)?);
        }
        LeasesClient::new(self.channel.clone())
            .create(request)
            .await
            .map_err(|s| status_error(kind, "create lease", &s))?;

        tracing::debug!(namespace = ns, lease = %id, expires = %expires, "Created lease");
        leases.insert(ns.to_string(), id.clone());
        Ok(id)
    }

    /// Remove a snapshot left behind by a failed apply.
    async fn discard_snapshot(&self, ns: &str, snapshotter: &str, key: &str) {
        let message = RemoveSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
        };
        let removed = match self.request(ns, message, true, NestrunError::Unpack).await {
            Ok(request) => SnapshotsClient::new(self.channel.clone())
                .remove(request)
                .await
                .map(|_| ())
                .map_err(|s| status_error(NestrunError::Unpack, "remove snapshot", &s)),
            Err(e) => Err(e),
        };
        if let Err(e) = removed {
            tracing::warn!(key, error = %e, "Failed to remove extraction snapshot");
        }
    }

    /// Drive one content write stream until the daemon closes it.
    async fn drain_write(
        &self,
        ns: &str,
        rx: mpsc::Receiver<WriteContentRequest>,
    ) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::Import;
        let request = self
            .request(ns, ReceiverStream::new(rx), true, kind)
            .await?;

        let mut responses = match ContentClient::new(self.channel.clone()).write(request).await {
            Ok(response) => response.into_inner(),
            Err(status) if status.code() == Code::AlreadyExists => return Ok(()),
            Err(status) => return Err(status_error(kind, "write content", &status)),
        };
        loop {
            match responses.message().await {
                Ok(Some(_)) => {}
                Ok(None) => return Ok(()),
                Err(status) if status.code() == Code::AlreadyExists => return Ok(()),
                Err(status) => return Err(status_error(kind, "write content", &status)),
            }
        }
    }
}

/// Connects the gRPC channel to a Unix socket instead of TCP.
struct UnixConnector {
    socket_path: PathBuf,
}

impl UnixConnector {
    fn new(socket_path: PathBuf) -> Self {
        Self { socket_path }
    }
}

impl Service<Uri> for UnixConnector {
    type Response = TokioIo<UnixStream>;
    type Error = std::io::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _: Uri) -> Self::Future {
        let socket_path = self.socket_path.clone();
        Box::pin(async move {
            let stream = UnixStream::connect(socket_path).await?;
            Ok(TokioIo::new(stream))
        })
    }
}

fn connection_error(address: &Path, reason: &str) -> NestrunError {
    NestrunError::Connection(format!(
        "failed to connect client to {:?}: {}. make sure the daemon is running",
        address.display().to_string(),
        reason
    ))
}

/// Error message with its source chain.
fn describe(error: &dyn std::error::Error) -> String {
    let mut message = error.to_string();
    let mut source = error.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    message
}

fn status_error(kind: ErrorKind, op: &str, status: &Status) -> NestrunError {
    kind(format!("{}: {} ({:?})", op, status.message(), status.code()))
}

fn header(value: &str, kind: ErrorKind) -> NestrunResult<MetadataValue<Ascii>> {
    value
        .parse()
        .map_err(|_| kind(format!("{:?} is not a valid gRPC header value", value)))
}

fn unique_suffix() -> i64 {
    Utc::now().timestamp_nanos_opt().unwrap_or_default()
}

fn proto_descriptor(descriptor: &Descriptor) -> ProtoDescriptor {
    ProtoDescriptor {
        media_type: descriptor.media_type().to_string(),
        digest: descriptor.digest().to_string(),
        size: i64::try_from(descriptor.size()).unwrap_or(i64::MAX),
        annotations: descriptor.annotations().clone().unwrap_or_default(),
    }
}

fn exit_status(response: WaitResponse) -> ExitStatus {
    let exited_at = response
        .exited_at
        .and_then(|ts| DateTime::from_timestamp(ts.seconds, u32::try_from(ts.nanos).ok()?))
        .map(|at| at.to_rfc3339());
    ExitStatus {
        exit_code: response.exit_status,
        exited_at,
        error: None,
    }
}

fn stdio_path(path: Option<PathBuf>) -> String {
    path.map(|p| p.display().to_string()).unwrap_or_default()
}

/// Read until `buf` is full or the reader is exhausted.
async fn read_chunk(file: &mut tokio::fs::File, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = file.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Stream `file` as write chunks followed by a commit.
///
/// Stops quietly when the daemon drops the stream; its status is the error.
async fn feed_blob(
    mut file: tokio::fs::File,
    reference: String,
    descriptor: Descriptor,
    labels: HashMap<String, String>,
    tx: mpsc::Sender<WriteContentRequest>,
) -> NestrunResult<()> {
    let total = i64::try_from(descriptor.size())
        .map_err(|_| NestrunError::Import(format!("blob {} too large", descriptor.digest())))?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut offset: i64 = 0;

    loop {
        let n = read_chunk(&mut file, &mut buf)
            .await
            .map_err(|e| NestrunError::from(e).into_phase(NestrunError::Import))?;
        if n == 0 {
            break;
        }
        let chunk = WriteContentRequest {
            action: WriteAction::Write as i32,
            r#ref: reference.clone(),
            total,
            offset,
            data: buf[..n].to_vec(),
            ..Default::default()
        };
        if tx.send(chunk).await.is_err() {
            return Ok(());
        }
        offset += n as i64;
    }

    if offset != total {
        return Err(NestrunError::Import(format!(
            "blob {} is {} bytes, descriptor says {}",
            descriptor.digest(),
            offset,
            total
        )));
    }

    let commit = WriteContentRequest {
        action: WriteAction::Commit as i32,
        r#ref: reference,
        total,
        offset,
        expected: descriptor.digest().to_string(),
        labels,
        ..Default::default()
    };
    let _ = tx.send(commit).await;
    Ok(())
}

#[async_trait]
impl Daemon for ContainerdDaemon {
    async fn ping(&self) -> NestrunResult<String> {
        let response = VersionClient::new(self.channel.clone())
            .version(())
            .await
            .map_err(|s| status_error(NestrunError::Connection, "version", &s))?
            .into_inner();
        Ok(response.version)
    }

    async fn content_info(&self, ns: &str, digest: &str) -> NestrunResult<Option<ContentInfo>> {
        let kind: ErrorKind = NestrunError::Import;
        let message = InfoRequest {
            digest: digest.to_string(),
        };
        let request = self.request(ns, message, false, kind).await?;
        match ContentClient::new(self.channel.clone()).info(request).await {
            Ok(response) => Ok(response.into_inner().info.map(|info| ContentInfo {
                digest: info.digest,
                size: u64::try_from(info.size).unwrap_or_default(),
            })),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_error(kind, "content info", &status)),
        }
    }

    async fn content_write(
        &self,
        ns: &str,
        descriptor: &Descriptor,
        blob: &Path,
        labels: &HashMap<String, String>,
    ) -> NestrunResult<()> {
        let file = tokio::fs::File::open(blob).await.map_err(|e| {
            NestrunError::Import(format!("open staged blob {}: {}", blob.display(), e))
        })?;

        let (tx, rx) = mpsc::channel(WRITE_QUEUE);
        let reference = format!("nestrun-{}", descriptor.digest());
        let feeder = tokio::spawn(feed_blob(
            file,
            reference,
            descriptor.clone(),
            labels.clone(),
            tx,
        ));

        let written = self.drain_write(ns, rx).await;
        feeder
            .await
            .map_err(|e| NestrunError::Internal(format!("blob upload task failed: {}", e)))??;
        written?;

        tracing::trace!(digest = %descriptor.digest(), size = descriptor.size(), "Uploaded blob");
        Ok(())
    }

    async fn content_read(&self, ns: &str, digest: &str) -> NestrunResult<Vec<u8>> {
        let kind: ErrorKind = NestrunError::Unpack;
        let message = ReadContentRequest {
            digest: digest.to_string(),
            ..Default::default()
        };
        let request = self.request(ns, message, false, kind).await?;
        let mut stream = ContentClient::new(self.channel.clone())
            .read(request)
            .await
            .map_err(|s| status_error(kind, "read content", &s))?
            .into_inner();

        let mut data = Vec::new();
        while let Some(chunk) = stream
            .message()
            .await
            .map_err(|s| status_error(kind, "read content", &s))?
        {
            data.extend_from_slice(&chunk.data);
        }
        Ok(data)
    }

    async fn image_create(&self, ns: &str, image: ImageRecord) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::Import;
        let record = Image {
            name: image.name.clone(),
            labels: image.labels,
            target: Some(proto_descriptor(&image.target)),
            ..Default::default()
        };

        let message = CreateImageRequest {
            image: Some(record.clone()),
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        match ImagesClient::new(self.channel.clone()).create(request).await {
            Ok(_) => return Ok(()),
            Err(status) if status.code() == Code::AlreadyExists => {}
            Err(status) => return Err(status_error(kind, "create image", &status)),
        }

        tracing::debug!(name = %image.name, "Image exists, updating its target");
        let message = UpdateImageRequest {
            image: Some(record),
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        ImagesClient::new(self.channel.clone())
            .update(request)
            .await
            .map_err(|s| status_error(kind, "update image", &s))?;
        Ok(())
    }

    async fn snapshot_stat(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
    ) -> NestrunResult<Option<SnapshotInfo>> {
        let kind: ErrorKind = NestrunError::Unpack;
        let message = StatSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
        };
        let request = self.request(ns, message, false, kind).await?;
        match SnapshotsClient::new(self.channel.clone()).stat(request).await {
            Ok(response) => Ok(response.into_inner().info.map(|info| SnapshotInfo {
                key: info.name,
                parent: Some(info.parent).filter(|p| !p.is_empty()),
            })),
            Err(status) if status.code() == Code::NotFound => Ok(None),
            Err(status) => Err(status_error(kind, "stat snapshot", &status)),
        }
    }

    async fn snapshot_apply(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: Option<&str>,
        layer: &Descriptor,
    ) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::Unpack;
        let extract = format!("extract-{}-{}", unique_suffix(), key);

        let message = PrepareSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: extract.clone(),
            parent: parent.unwrap_or_default().to_string(),
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        let mounts: Vec<Mount> = SnapshotsClient::new(self.channel.clone())
            .prepare(request)
            .await
            .map_err(|s| status_error(kind, "prepare extraction snapshot", &s))?
            .into_inner()
            .mounts;

        let message = ApplyRequest {
            diff: Some(proto_descriptor(layer)),
            mounts,
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        if let Err(status) = DiffClient::new(self.channel.clone()).apply(request).await {
            self.discard_snapshot(ns, snapshotter, &extract).await;
            return Err(status_error(
                kind,
                &format!("apply layer {}", layer.digest()),
                &status,
            ));
        }

        let message = CommitSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            name: key.to_string(),
            key: extract.clone(),
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        match SnapshotsClient::new(self.channel.clone()).commit(request).await {
            Ok(_) => Ok(()),
            Err(status) => {
                self.discard_snapshot(ns, snapshotter, &extract).await;
                if status.code() == Code::AlreadyExists {
                    tracing::debug!(key, "Snapshot committed concurrently");
                    Ok(())
                } else {
                    Err(status_error(kind, "commit snapshot", &status))
                }
            }
        }
    }

    async fn snapshot_prepare(
        &self,
        ns: &str,
        snapshotter: &str,
        key: &str,
        parent: &str,
    ) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::ContainerCreate;
        let message = PrepareSnapshotRequest {
            snapshotter: snapshotter.to_string(),
            key: key.to_string(),
            parent: parent.to_string(),
            ..Default::default()
        };
        let request = self.request(ns, message, true, kind).await?;
        SnapshotsClient::new(self.channel.clone())
            .prepare(request)
            .await
            .map_err(|s| status_error(kind, &format!("prepare snapshot {}", key), &s))?;
        Ok(())
    }

    async fn container_create(&self, ns: &str, container: ContainerRecord) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::ContainerCreate;
        let spec = serde_json::to_vec(&container.spec)
            .map_err(|e| NestrunError::from(e).into_phase(kind))?;

        let message = CreateContainerRequest {
            container: Some(Container {
                id: container.id.clone(),
                labels: container.labels,
                image: container.image,
                runtime: Some(Runtime {
                    name: RUNTIME.to_string(),
                    options: None,
                }),
                spec: Some(prost_types::Any {
                    type_url: SPEC_TYPE_URL.to_string(),
                    value: spec,
                }),
                snapshotter: container.snapshotter,
                snapshot_key: container.snapshot_key,
                ..Default::default()
            }),
        };
        let request = self.request(ns, message, true, kind).await?;
        ContainersClient::new(self.channel.clone())
            .create(request)
            .await
            .map_err(|s| status_error(kind, &format!("create container {:?}", container.id), &s))?;
        Ok(())
    }

    async fn task_create(
        &self,
        ns: &str,
        container_id: &str,
        stdio: TaskStdio,
    ) -> NestrunResult<u32> {
        let kind: ErrorKind = NestrunError::TaskCreate;

        let message = GetContainerRequest {
            id: container_id.to_string(),
        };
        let request = self.request(ns, message, false, kind).await?;
        let container = ContainersClient::new(self.channel.clone())
            .get(request)
            .await
            .map_err(|s| status_error(kind, "get container", &s))?
            .into_inner()
            .container
            .ok_or_else(|| kind(format!("container {} not found", container_id)))?;

        let message = MountsRequest {
            snapshotter: container.snapshotter,
            key: container.snapshot_key,
        };
        let request = self.request(ns, message, false, kind).await?;
        let rootfs = SnapshotsClient::new(self.channel.clone())
            .mounts(request)
            .await
            .map_err(|s| status_error(kind, "container rootfs mounts", &s))?
            .into_inner()
            .mounts;

        let message = CreateTaskRequest {
            container_id: container_id.to_string(),
            rootfs,
            stdin: stdio_path(stdio.stdin),
            stdout: stdio_path(stdio.stdout),
            stderr: stdio_path(stdio.stderr),
            terminal: stdio.terminal,
            ..Default::default()
        };
        let request = self.request(ns, message, false, kind).await?;
        let response = TasksClient::new(self.channel.clone())
            .create(request)
            .await
            .map_err(|s| status_error(kind, "create task", &s))?
            .into_inner();
        Ok(response.pid)
    }

    /// The daemon keeps a task's exit status until the task is deleted, so a
    /// wait issued after the exit still returns it.
    async fn task_wait(&self, ns: &str, container_id: &str) -> NestrunResult<ExitWaiter> {
        let kind: ErrorKind = NestrunError::TaskWait;
        let message = WaitRequest {
            container_id: container_id.to_string(),
            ..Default::default()
        };
        let request = self.request(ns, message, false, kind).await?;
        let mut client = TasksClient::new(self.channel.clone());

        let (tx, waiter) = ExitWaiter::channel();
        tokio::spawn(async move {
            let result = client
                .wait(request)
                .await
                .map(|response| exit_status(response.into_inner()))
                .map_err(|s| status_error(kind, "wait task", &s));
            let _ = tx.send(result);
        });
        Ok(waiter)
    }

    async fn task_start(&self, ns: &str, container_id: &str) -> NestrunResult<()> {
        let kind: ErrorKind = NestrunError::TaskStart;
        let message = StartRequest {
            container_id: container_id.to_string(),
            ..Default::default()
        };
        let request = self.request(ns, message, false, kind).await?;
        TasksClient::new(self.channel.clone())
            .start(request)
            .await
            .map_err(|s| status_error(kind, "start task", &s))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oci_spec::image::{DescriptorBuilder, Digest, MediaType};
    use sha2::{Digest as _, Sha256};

    #[tokio::test]
    async fn test_connect_to_missing_socket_is_connection_error() {
        let dir = tempfile::tempdir().unwrap();
        let address = dir.path().join("absent.sock");

        let err = ContainerdDaemon::connect(&address).await.unwrap_err();
        match err {
            NestrunError::Connection(message) => {
                assert!(message.contains("absent.sock"));
                assert!(message.contains("make sure the daemon is running"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_descriptor_keeps_digest_size_and_annotations() {
        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .digest(
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                    .parse::<Digest>()
                    .unwrap(),
            )
            .size(1024u64)
            .annotations(HashMap::from([("k".to_string(), "v".to_string())]))
            .build()
            .unwrap();

        let proto = proto_descriptor(&descriptor);
        assert_eq!(proto.media_type, "application/vnd.oci.image.layer.v1.tar");
        assert_eq!(proto.digest, descriptor.digest().to_string());
        assert_eq!(proto.size, 1024);
        assert_eq!(proto.annotations.get("k").map(String::as_str), Some("v"));
    }

    #[test]
    fn test_exit_status_carries_code_and_time() {
        let status = exit_status(WaitResponse {
            exit_status: 137,
            exited_at: Some(prost_types::Timestamp {
                seconds: 1_700_000_000,
                nanos: 0,
            }),
        });
        assert_eq!(status.exit_code, 137);
        assert_eq!(status.exited_at.as_deref(), Some("2023-11-14T22:13:20+00:00"));
        assert!(status.error.is_none());

        let bare = exit_status(WaitResponse {
            exit_status: 0,
            exited_at: None,
        });
        assert!(bare.exited_at.is_none());
    }

    #[test]
    fn test_status_error_keeps_phase_and_code() {
        let err = status_error(
            NestrunError::TaskStart,
            "start task",
            &Status::not_found("no such task"),
        );
        match err {
            NestrunError::TaskStart(message) => {
                assert!(message.contains("start task: no such task"));
                assert!(message.contains("NotFound"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_invalid_header_value_is_phase_error() {
        assert!(header("dagger", NestrunError::Import).is_ok());
        let err = header("bad\nnamespace", NestrunError::Import).unwrap_err();
        assert!(matches!(err, NestrunError::Import(_)));
    }

    #[tokio::test]
    async fn test_feeder_sends_chunks_then_commit_with_labels() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        let data = b"layer bytes".to_vec();
        std::fs::write(&path, &data).unwrap();

        let digest = format!("sha256:{}", hex::encode(Sha256::digest(&data)));
        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .digest(digest.parse::<Digest>().unwrap())
            .size(data.len() as u64)
            .build()
            .unwrap();
        let labels = HashMap::from([(
            "containerd.io/gc.ref.content.l.0".to_string(),
            digest.clone(),
        )]);

        let (tx, mut rx) = mpsc::channel(WRITE_QUEUE);
        let file = tokio::fs::File::open(&path).await.unwrap();
        feed_blob(file, "ref".into(), descriptor, labels.clone(), tx)
            .await
            .unwrap();

        let write = rx.recv().await.unwrap();
        assert_eq!(write.action, WriteAction::Write as i32);
        assert_eq!(write.data, data);
        assert_eq!(write.offset, 0);

        let commit = rx.recv().await.unwrap();
        assert_eq!(commit.action, WriteAction::Commit as i32);
        assert_eq!(commit.expected, digest);
        assert_eq!(commit.total, data.len() as i64);
        assert_eq!(commit.labels, labels);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_feeder_rejects_short_blob() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("blob");
        std::fs::write(&path, b"short").unwrap();

        let descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageLayer)
            .digest(
                "sha256:e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
                    .parse::<Digest>()
                    .unwrap(),
            )
            .size(64u64)
            .build()
            .unwrap();

        let (tx, _rx) = mpsc::channel(WRITE_QUEUE);
        let file = tokio::fs::File::open(&path).await.unwrap();
        let err = feed_blob(file, "ref".into(), descriptor, HashMap::new(), tx)
            .await
            .unwrap_err();
        assert!(matches!(err, NestrunError::Import(ref m) if m.contains("descriptor says 64")));
    }
}
