//! OCI image-layout archives staged on local disk.
//!
//! The archive is a tar stream (optionally gzip-compressed) holding
//! `oci-layout`, `index.json` and `blobs/<alg>/<hex>`. Staging extracts the
//! blobs into a private temp directory, verifying each digest on the way.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Write};
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use nestrun_shared::{NestrunError, NestrunResult};
use oci_spec::image::{Descriptor, DescriptorBuilder, Digest, ImageIndex, MediaType};
use sha2::{Digest as _, Sha256};
use tempfile::TempDir;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const INDEX_FILE: &str = "index.json";
const LAYOUT_FILE: &str = "oci-layout";
const BLOBS_DIR: &str = "blobs";

/// An extracted archive. The staging directory is removed on drop.
#[derive(Debug)]
pub struct StagedArchive {
    dir: TempDir,
    index: ImageIndex,
    index_descriptor: Descriptor,
}

impl StagedArchive {
    /// Extract `reader` into a temp directory.
    ///
    /// The reader is read to its end and dropped whether or not extraction
    /// succeeds.
    pub fn stage<R: Read>(reader: R) -> NestrunResult<Self> {
        let dir = tempfile::Builder::new()
            .prefix("nestrun-import-")
            .tempdir()
            .map_err(|e| NestrunError::Import(format!("create staging directory: {}", e)))?;

        let mut source = BufReader::new(reader);
        let extracted = extract(&mut source, dir.path());
        let drained = io::copy(&mut source, &mut io::sink());
        drop(source);

        let index_bytes = extracted?;
        drained.map_err(|e| NestrunError::Import(format!("drain archive: {}", e)))?;

        let index_bytes = index_bytes.ok_or_else(|| {
            NestrunError::Import(format!(
                "archive has no {}; only OCI image layouts are supported",
                INDEX_FILE
            ))
        })?;
        let index: ImageIndex = serde_json::from_slice(&index_bytes)
            .map_err(|e| NestrunError::Import(format!("malformed {}: {}", INDEX_FILE, e)))?;

        // The index itself becomes a blob so an image record can target it.
        let index_hex = hex::encode(Sha256::digest(&index_bytes));
        let index_path = dir.path().join(BLOBS_DIR).join("sha256").join(&index_hex);
        if !index_path.exists() {
            write_file(&index_path, &index_bytes)?;
        }
        let index_descriptor = DescriptorBuilder::default()
            .media_type(MediaType::ImageIndex)
            .digest(parse_digest(&format!("sha256:{}", index_hex))?)
            .size(index_bytes.len() as u64)
            .build()
            .map_err(|e| NestrunError::Import(format!("index descriptor: {}", e)))?;

        tracing::debug!(
            dir = %dir.path().display(),
            manifests = index.manifests().len(),
            "Archive staged"
        );

        Ok(Self {
            dir,
            index,
            index_descriptor,
        })
    }

    pub fn index(&self) -> &ImageIndex {
        &self.index
    }

    /// Descriptor of `index.json` as a content blob.
    pub fn index_descriptor(&self) -> &Descriptor {
        &self.index_descriptor
    }

    /// Local path of a staged blob, or `None` if the archive lacks it.
    pub fn blob_path(&self, digest: &Digest) -> Option<PathBuf> {
        let path = self
            .dir
            .path()
            .join(BLOBS_DIR)
            .join(digest.algorithm().to_string())
            .join(digest.digest());
        path.is_file().then_some(path)
    }

    pub fn read_blob(&self, digest: &Digest) -> NestrunResult<Vec<u8>> {
        let path = self.blob_path(digest).ok_or_else(|| {
            NestrunError::Import(format!("blob {} referenced but missing from archive", digest))
        })?;
        std::fs::read(&path).map_err(|e| NestrunError::Import(format!("read blob {}: {}", digest, e)))
    }
}

/// Walk the tar stream, staging blobs and returning the raw `index.json`.
fn extract<R: BufRead>(source: &mut R, dir: &Path) -> NestrunResult<Option<Vec<u8>>> {
    let gzipped = source
        .fill_buf()
        .map_err(|e| NestrunError::Import(format!("read archive: {}", e)))?
        .starts_with(&GZIP_MAGIC);

    let stream: Box<dyn Read + '_> = if gzipped {
        Box::new(GzDecoder::new(source))
    } else {
        Box::new(source)
    };

    let mut archive = tar::Archive::new(stream);
    let entries = archive
        .entries()
        .map_err(|e| NestrunError::Import(format!("malformed archive: {}", e)))?;

    let mut index = None;
    let mut entry_count = 0usize;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| NestrunError::Import(format!("malformed archive entry: {}", e)))?;
        entry_count += 1;

        if !entry.header().entry_type().is_file() {
            continue;
        }
        let path = entry
            .path()
            .map_err(|e| NestrunError::Import(format!("bad entry path: {}", e)))?
            .into_owned();
        let parts = normal_components(&path)?;

        match parts.as_slice() {
            [name] if name == INDEX_FILE => {
                let mut bytes = Vec::new();
                entry
                    .read_to_end(&mut bytes)
                    .map_err(|e| NestrunError::Import(format!("read {}: {}", INDEX_FILE, e)))?;
                index = Some(bytes);
            }
            [name] if name == LAYOUT_FILE => {
                check_layout(&mut entry)?;
            }
            [blobs, algorithm, hex_digest] if blobs == BLOBS_DIR => {
                stage_blob(&mut entry, dir, algorithm, hex_digest)?;
            }
            _ => {
                tracing::trace!(path = %path.display(), "Skipping archive entry");
            }
        }
    }

    if entry_count == 0 {
        return Err(NestrunError::Import("archive is empty".into()));
    }
    Ok(index)
}

/// Path components with `.` removed; rejects absolute and `..` paths.
fn normal_components(path: &Path) -> NestrunResult<Vec<String>> {
    let mut parts = Vec::new();
    for component in path.components() {
        match component {
            Component::Normal(part) => parts.push(part.to_string_lossy().into_owned()),
            Component::CurDir => {}
            _ => {
                return Err(NestrunError::Import(format!(
                    "archive entry escapes layout: {}",
                    path.display()
                )));
            }
        }
    }
    Ok(parts)
}

fn check_layout<R: Read>(entry: &mut R) -> NestrunResult<()> {
    let layout: serde_json::Value = serde_json::from_reader(entry)
        .map_err(|e| NestrunError::Import(format!("malformed {}: {}", LAYOUT_FILE, e)))?;
    match layout.get("imageLayoutVersion").and_then(|v| v.as_str()) {
        Some(version) => {
            tracing::trace!(version, "OCI layout version");
            Ok(())
        }
        None => Err(NestrunError::Import(format!(
            "{} has no imageLayoutVersion",
            LAYOUT_FILE
        ))),
    }
}

fn stage_blob<R: Read>(
    entry: &mut R,
    dir: &Path,
    algorithm: &str,
    hex_digest: &str,
) -> NestrunResult<()> {
    if algorithm != "sha256" {
        return Err(NestrunError::Import(format!(
            "unsupported digest algorithm {:?}",
            algorithm
        )));
    }

    let parent = dir.join(BLOBS_DIR).join(algorithm);
    std::fs::create_dir_all(&parent)
        .map_err(|e| NestrunError::Import(format!("create {}: {}", parent.display(), e)))?;
    let path = parent.join(hex_digest);
    let mut file = File::create(&path)
        .map_err(|e| NestrunError::Import(format!("create {}: {}", path.display(), e)))?;

    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = entry
            .read(&mut buf)
            .map_err(|e| NestrunError::Import(format!("read blob {}: {}", hex_digest, e)))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        file.write_all(&buf[..n])
            .map_err(|e| NestrunError::Import(format!("write {}: {}", path.display(), e)))?;
    }

    let actual = hex::encode(hasher.finalize());
    if actual != hex_digest {
        return Err(NestrunError::Import(format!(
            "blob sha256:{} has digest sha256:{}",
            hex_digest, actual
        )));
    }
    Ok(())
}

fn write_file(path: &Path, bytes: &[u8]) -> NestrunResult<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| NestrunError::Import(format!("create {}: {}", parent.display(), e)))?;
    }
    std::fs::write(path, bytes)
        .map_err(|e| NestrunError::Import(format!("write {}: {}", path.display(), e)))
}

pub(crate) fn parse_digest(s: &str) -> NestrunResult<Digest> {
    s.parse::<Digest>()
        .map_err(|e| NestrunError::Import(format!("invalid digest {:?}: {}", s, e)))
}
