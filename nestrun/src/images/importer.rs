//! Load an image archive into the daemon's content store.

use std::collections::{HashMap, HashSet};
use std::io::Read;

use nestrun_shared::records::ImageRecord;
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::{Descriptor, ImageIndex, ImageManifest};

use super::archive::StagedArchive;
use super::{ImageRef, is_index, is_manifest};
use crate::runtime::RuntimeClient;
use crate::runtime::constants::annotations;
use crate::runtime::constants::containerd::GC_REF_CONTENT;

/// Nested indexes deeper than this are rejected.
const MAX_INDEX_DEPTH: usize = 4;

/// Imports archives through one runtime client.
pub struct ImageImporter<'a> {
    client: &'a RuntimeClient,
}

impl<'a> ImageImporter<'a> {
    pub fn new(client: &'a RuntimeClient) -> Self {
        Self { client }
    }

    /// Import every image in `reader`, in archive order.
    ///
    /// Each index manifest with a name annotation yields one image. When
    /// `index_name` is set, one more image named after it and targeting the
    /// whole index comes last. Blobs already in the content store
    /// are not uploaded again, so importing the same archive twice is a
    /// no-op apart from the image records being rewritten.
    pub async fn import<R>(&self, reader: R, index_name: Option<&str>) -> NestrunResult<Vec<ImageRef>>
    where
        R: Read + Send + 'static,
    {
        let staged = tokio::task::spawn_blocking(move || StagedArchive::stage(reader))
            .await
            .map_err(|e| NestrunError::Internal(format!("archive staging task failed: {}", e)))??;

        let manifests = staged.index().manifests();
        if manifests.is_empty() {
            return Err(NestrunError::Import("archive index lists no manifests".into()));
        }

        let mut uploaded = HashSet::new();
        self.upload(
            &staged,
            staged.index_descriptor(),
            index_gc_labels(staged.index()),
            &mut uploaded,
        )
        .await?;
        self.upload_index(&staged, staged.index(), &mut uploaded)
            .await?;

        let mut images: Vec<ImageRef> = manifests
            .iter()
            .filter_map(|manifest| image_name(manifest).map(|name| ImageRef::new(name, manifest.clone())))
            .collect();
        if let Some(name) = index_name {
            images.push(ImageRef::new(name, staged.index_descriptor().clone()));
        }

        let daemon = self.client.daemon();
        let ns = self.client.namespace();
        for image in &images {
            daemon
                .image_create(
                    ns,
                    ImageRecord {
                        name: image.name.clone(),
                        target: image.target.clone(),
                        labels: Default::default(),
                    },
                )
                .await?;
            tracing::info!(name = %image.name, digest = %image.digest(), "Image imported");
        }

        tracing::debug!(
            images = images.len(),
            blobs = uploaded.len(),
            "Archive import complete"
        );
        Ok(images)
    }

    /// Upload an index's manifests and everything they reference.
    async fn upload_index(
        &self,
        staged: &StagedArchive,
        index: &ImageIndex,
        uploaded: &mut HashSet<String>,
    ) -> NestrunResult<()> {
        let mut pending: Vec<(Descriptor, usize)> = index
            .manifests()
            .iter()
            .rev()
            .map(|d| (d.clone(), 0))
            .collect();

        while let Some((descriptor, depth)) = pending.pop() {
            let media_type = descriptor.media_type();
            if is_index(media_type) {
                if depth + 1 >= MAX_INDEX_DEPTH {
                    return Err(NestrunError::Import(format!(
                        "image indexes nested deeper than {}",
                        MAX_INDEX_DEPTH
                    )));
                }
                let bytes = staged.read_blob(descriptor.digest())?;
                let nested: ImageIndex = serde_json::from_slice(&bytes).map_err(|e| {
                    NestrunError::Import(format!("malformed index {}: {}", descriptor.digest(), e))
                })?;
                self.upload(staged, &descriptor, index_gc_labels(&nested), uploaded)
                    .await?;
                pending.extend(
                    nested
                        .manifests()
                        .iter()
                        .rev()
                        .map(|d| (d.clone(), depth + 1)),
                );
            } else if is_manifest(media_type) {
                let bytes = staged.read_blob(descriptor.digest())?;
                let manifest: ImageManifest = serde_json::from_slice(&bytes).map_err(|e| {
                    NestrunError::Import(format!(
                        "malformed manifest {}: {}",
                        descriptor.digest(),
                        e
                    ))
                })?;
                self.upload(staged, &descriptor, manifest_gc_labels(&manifest), uploaded)
                    .await?;
                self.upload(staged, manifest.config(), HashMap::new(), uploaded)
                    .await?;
                for layer in manifest.layers() {
                    self.upload(staged, layer, HashMap::new(), uploaded).await?;
                }
            } else {
                tracing::warn!(
                    digest = %descriptor.digest(),
                    media_type = %media_type,
                    "Skipping index entry with unknown media type"
                );
            }
        }
        Ok(())
    }

    /// Write one blob unless the content store already has it.
    ///
    /// `labels` name the blob's children so the daemon's collector keeps
    /// them alive as long as the blob is.
    async fn upload(
        &self,
        staged: &StagedArchive,
        descriptor: &Descriptor,
        labels: HashMap<String, String>,
        uploaded: &mut HashSet<String>,
    ) -> NestrunResult<()> {
        let digest = descriptor.digest().to_string();
        if !uploaded.insert(digest.clone()) {
            return Ok(());
        }

        let daemon = self.client.daemon();
        let ns = self.client.namespace();

        if let Some(info) = daemon.content_info(ns, &digest).await? {
            tracing::debug!(digest = %digest, size = info.size, "Blob already present");
            return Ok(());
        }

        let path = staged.blob_path(descriptor.digest()).ok_or_else(|| {
            NestrunError::Import(format!("blob {} referenced but missing from archive", digest))
        })?;
        daemon.content_write(ns, descriptor, &path, &labels).await?;
        tracing::debug!(digest = %digest, size = descriptor.size(), "Blob uploaded");
        Ok(())
    }
}

/// Content references from an index to its manifests.
fn index_gc_labels(index: &ImageIndex) -> HashMap<String, String> {
    index
        .manifests()
        .iter()
        .enumerate()
        .map(|(i, d)| (format!("{}.m.{}", GC_REF_CONTENT, i), d.digest().to_string()))
        .collect()
}

/// Content references from a manifest to its config and layers.
fn manifest_gc_labels(manifest: &ImageManifest) -> HashMap<String, String> {
    let mut labels: HashMap<String, String> = manifest
        .layers()
        .iter()
        .enumerate()
        .map(|(i, d)| (format!("{}.l.{}", GC_REF_CONTENT, i), d.digest().to_string()))
        .collect();
    labels.insert(
        format!("{}.config", GC_REF_CONTENT),
        manifest.config().digest().to_string(),
    );
    labels
}

/// Name annotation of an index entry.
fn image_name(descriptor: &Descriptor) -> Option<String> {
    let map = descriptor.annotations().as_ref()?;
    map.get(annotations::IMAGE_NAME)
        .or_else(|| map.get(annotations::REF_NAME))
        .filter(|name| !name.is_empty())
        .cloned()
}
