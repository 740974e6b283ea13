//! Image import and unpack.

mod archive;
mod importer;
mod platform;
mod unpacker;

pub use archive::StagedArchive;
pub use importer::ImageImporter;
pub use platform::Platform;
pub use unpacker::{ImageUnpacker, UnpackedImage, chain_ids};

use oci_spec::image::{Descriptor, MediaType};

/// Docker schema 2 media types accepted next to their OCI equivalents.
pub mod media_types {
    pub const DOCKER_MANIFEST_LIST: &str =
        "application/vnd.docker.distribution.manifest.list.v2+json";
    pub const DOCKER_MANIFEST: &str = "application/vnd.docker.distribution.manifest.v2+json";
}

/// A named image in the daemon, pointing at an index or a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageRef {
    pub name: String,
    pub target: Descriptor,
}

impl ImageRef {
    pub fn new(name: impl Into<String>, target: Descriptor) -> Self {
        Self {
            name: name.into(),
            target,
        }
    }

    /// Digest string of the target, e.g. `sha256:…`.
    pub fn digest(&self) -> String {
        self.target.digest().to_string()
    }

    /// Platform recorded on the target descriptor, if any.
    pub fn platform(&self) -> Option<Platform> {
        self.target.platform().as_ref().map(Platform::from_oci)
    }
}

pub(crate) fn is_index(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageIndex => true,
        other => other.to_string() == media_types::DOCKER_MANIFEST_LIST,
    }
}

pub(crate) fn is_manifest(media_type: &MediaType) -> bool {
    match media_type {
        MediaType::ImageManifest => true,
        other => other.to_string() == media_types::DOCKER_MANIFEST,
    }
}
