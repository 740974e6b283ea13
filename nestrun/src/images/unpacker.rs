//! Materialize image layers as snapshots.

use std::collections::HashMap;

use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::{Descriptor, ImageConfiguration, ImageIndex, ImageManifest};
use sha2::{Digest as _, Sha256};

use super::{ImageRef, Platform, is_index, is_manifest};
use crate::bootstrap::BootstrapCache;
use crate::runtime::RuntimeClient;

const MAX_INDEX_DEPTH: usize = 4;

/// Result of unpacking one image for one snapshotter.
#[derive(Debug, Clone)]
pub struct UnpackedImage {
    pub image: ImageRef,
    /// Manifest chosen for the platform.
    pub manifest_digest: String,
    pub config: ImageConfiguration,
    /// Chain ID of the top layer; parent of the container's snapshot.
    pub chain_id: String,
    pub snapshotter: String,
}

impl UnpackedImage {
    /// Labels from the image config.
    pub fn labels(&self) -> HashMap<String, String> {
        self.config
            .config()
            .as_ref()
            .and_then(|c| c.labels().clone())
            .unwrap_or_default()
    }
}

/// Chain IDs for a list of layer diff IDs.
///
/// `chain(0) = diff(0)`, `chain(n) = sha256(chain(n-1) + " " + diff(n))`.
pub fn chain_ids(diff_ids: &[String]) -> Vec<String> {
    let mut chain: Vec<String> = Vec::with_capacity(diff_ids.len());
    for diff_id in diff_ids {
        let next = match chain.last() {
            None => diff_id.clone(),
            Some(parent) => {
                let digest = Sha256::digest(format!("{} {}", parent, diff_id).as_bytes());
                format!("sha256:{}", hex::encode(digest))
            }
        };
        chain.push(next);
    }
    chain
}

/// Unpacks images for a fixed target platform.
pub struct ImageUnpacker<'a> {
    client: &'a RuntimeClient,
    platform: Platform,
    cache: &'a BootstrapCache,
}

impl<'a> ImageUnpacker<'a> {
    pub fn new(client: &'a RuntimeClient, platform: Platform, cache: &'a BootstrapCache) -> Self {
        Self {
            client,
            platform,
            cache,
        }
    }

    pub fn platform(&self) -> &Platform {
        &self.platform
    }

    /// Resolve `image` for the platform and apply its layers with `snapshotter`.
    ///
    /// Layers whose chain ID already exists as a snapshot are skipped. A
    /// second call for the same (digest, snapshotter) in this run returns the
    /// cached result without contacting the daemon.
    pub async fn unpack(&self, image: &ImageRef, snapshotter: &str) -> NestrunResult<UnpackedImage> {
        let digest = image.digest();
        if let Some(hit) = self.cache.unpacked(&digest, snapshotter) {
            tracing::debug!(name = %image.name, digest = %digest, "Unpack cache hit");
            return Ok(hit);
        }

        let (manifest_digest, manifest) = self.resolve_manifest(&image.target).await?;
        let config = self.load_config(&manifest).await?;

        let image_platform = config_platform(&config);
        if !self.platform.matches(&image_platform) {
            return Err(NestrunError::Unpack(format!(
                "image {} is {}, host platform is {}",
                image.name, image_platform, self.platform
            )));
        }

        let layers = manifest.layers();
        let diff_ids = config.rootfs().diff_ids();
        if layers.is_empty() {
            return Err(NestrunError::Unpack(format!("image {} has no layers", image.name)));
        }
        if layers.len() != diff_ids.len() {
            return Err(NestrunError::Unpack(format!(
                "image {} has {} layers but {} diff ids",
                image.name,
                layers.len(),
                diff_ids.len()
            )));
        }

        let chain = chain_ids(diff_ids);
        self.apply_layers(snapshotter, layers, &chain).await?;

        let chain_id = chain.last().cloned().unwrap_or_default();
        tracing::info!(
            name = %image.name,
            digest = %digest,
            chain_id = %chain_id,
            snapshotter,
            "Image unpacked"
        );

        let unpacked = UnpackedImage {
            image: image.clone(),
            manifest_digest,
            config,
            chain_id,
            snapshotter: snapshotter.to_string(),
        };
        self.cache.insert_unpacked(&digest, snapshotter, unpacked.clone());
        Ok(unpacked)
    }

    async fn apply_layers(
        &self,
        snapshotter: &str,
        layers: &[Descriptor],
        chain: &[String],
    ) -> NestrunResult<()> {
        let daemon = self.client.daemon();
        let ns = self.client.namespace();
        let mut parent: Option<&str> = None;

        for (layer, chain_id) in layers.iter().zip(chain) {
            if daemon.snapshot_stat(ns, snapshotter, chain_id).await?.is_some() {
                tracing::debug!(chain_id = %chain_id, "Layer snapshot exists");
            } else {
                daemon
                    .snapshot_apply(ns, snapshotter, chain_id, parent, layer)
                    .await?;
                tracing::debug!(
                    chain_id = %chain_id,
                    layer = %layer.digest(),
                    size = layer.size(),
                    "Layer applied"
                );
            }
            parent = Some(chain_id.as_str());
        }
        Ok(())
    }

    /// Follow the target down to a single manifest for the platform.
    async fn resolve_manifest(&self, target: &Descriptor) -> NestrunResult<(String, ImageManifest)> {
        let mut current = target.clone();

        for _ in 0..MAX_INDEX_DEPTH {
            let media_type = current.media_type();
            if is_manifest(media_type) {
                if let Some(platform) = current.platform() {
                    let platform = Platform::from_oci(platform);
                    if !self.platform.matches(&platform) {
                        return Err(self.no_match(&current));
                    }
                }
                let manifest: ImageManifest = self.read_json(&current).await?;
                return Ok((current.digest().to_string(), manifest));
            }
            if !is_index(media_type) {
                return Err(NestrunError::Unpack(format!(
                    "unsupported media type {} for {}",
                    media_type,
                    current.digest()
                )));
            }

            let index: ImageIndex = self.read_json(&current).await?;
            current = self
                .select(&index)
                .await?
                .ok_or_else(|| self.no_match(&current))?;
        }

        Err(NestrunError::Unpack(format!(
            "image indexes nested deeper than {}",
            MAX_INDEX_DEPTH
        )))
    }

    /// Pick the index entry for the platform.
    ///
    /// An entry declaring a matching platform wins. Otherwise entries without
    /// a platform are tried in order: a manifest is taken when its image
    /// config matches, a nested index is followed.
    async fn select(&self, index: &ImageIndex) -> NestrunResult<Option<Descriptor>> {
        let entries = index.manifests();
        let declared = entries.iter().find(|d| {
            d.platform()
                .as_ref()
                .is_some_and(|p| self.platform.matches(&Platform::from_oci(p)))
        });
        if let Some(entry) = declared {
            return Ok(Some(entry.clone()));
        }

        for entry in entries.iter().filter(|d| d.platform().is_none()) {
            if is_index(entry.media_type()) {
                return Ok(Some(entry.clone()));
            }
            if is_manifest(entry.media_type()) {
                let manifest: ImageManifest = self.read_json(entry).await?;
                let config = self.load_config(&manifest).await?;
                if self.platform.matches(&config_platform(&config)) {
                    return Ok(Some(entry.clone()));
                }
                tracing::debug!(
                    digest = %entry.digest(),
                    platform = %config_platform(&config),
                    "Skipping manifest for another platform"
                );
            }
        }
        Ok(None)
    }

    async fn load_config(&self, manifest: &ImageManifest) -> NestrunResult<ImageConfiguration> {
        self.read_json(manifest.config()).await
    }

    async fn read_json<T: serde::de::DeserializeOwned>(&self, descriptor: &Descriptor) -> NestrunResult<T> {
        let digest = descriptor.digest().to_string();
        let bytes = self
            .client
            .daemon()
            .content_read(self.client.namespace(), &digest)
            .await?;
        serde_json::from_slice(&bytes)
            .map_err(|e| NestrunError::Unpack(format!("malformed blob {}: {}", digest, e)))
    }

    fn no_match(&self, descriptor: &Descriptor) -> NestrunError {
        NestrunError::Unpack(format!(
            "no manifest for platform {} in {}",
            self.platform,
            descriptor.digest()
        ))
    }
}

fn config_platform(config: &ImageConfiguration) -> Platform {
    Platform::new(
        config.os().to_string(),
        config.architecture().to_string(),
        config.variant().as_deref(),
    )
}
