//! OCI image layout on disk.
//!
//! ```text
//! <root>/
//! |-- oci-layout         # {"imageLayoutVersion": "1.0.0"}
//! |-- index.json         # manifests, each named by a ref.name annotation
//! |-- blobs/sha256/<hex> # content-addressed blobs, stored once
//! ```
//!
//! The layout is not safe for concurrent writers: index updates are
//! read-modify-write and partial blobs use a fixed staging name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use crate::error::{OciError, Result};
use crate::manifest::{
    hex_encode, sha256_digest, validate_digest, Descriptor, ImageIndex, ResolvedManifest,
    ANNOTATION_REF_NAME,
};
use crate::transport::{BlobKind, BlobReader, ImageDestination, ImageSource};

const OCI_LAYOUT_FILE: &str = "oci-layout";
const INDEX_FILE: &str = "index.json";
const IMAGE_LAYOUT_VERSION: &str = "1.0.0";

#[derive(Debug, Serialize, Deserialize)]
struct LayoutMarker {
    #[serde(rename = "imageLayoutVersion")]
    image_layout_version: String,
}

/// Number and total size of the blobs in a layout.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BlobStats {
    pub count: usize,
    pub bytes: u64,
}

/// Content-addressed image store rooted at a directory.
#[derive(Debug, Clone)]
pub struct OciLayout {
    root: PathBuf,
}

impl OciLayout {
    /// Refer to an existing layout without touching the filesystem.
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    /// Create the layout skeleton under `root` if it is not there yet.
    pub async fn init(root: PathBuf) -> Result<Self> {
        let layout = Self { root };
        fs::create_dir_all(layout.blobs_dir()).await?;

        let marker = layout.root.join(OCI_LAYOUT_FILE);
        if !fs::try_exists(&marker).await? {
            let body = serde_json::to_vec(&LayoutMarker {
                image_layout_version: IMAGE_LAYOUT_VERSION.to_string(),
            })?;
            fs::write(&marker, body).await?;
        }
        if !fs::try_exists(layout.root.join(INDEX_FILE)).await? {
            layout.write_index(&ImageIndex::default()).await?;
        }
        Ok(layout)
    }

    /// Return a reference to the layout root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory that holds all blobs: `<root>/blobs/sha256/`.
    fn blobs_dir(&self) -> PathBuf {
        self.root.join("blobs").join("sha256")
    }

    /// Return the expected path for a blob with the given digest.  Malformed
    /// digests are rejected so they can never name a path outside the store.
    pub fn blob_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self.blobs_dir().join(validate_digest(digest)?))
    }

    fn staging_path(&self, digest: &str) -> Result<PathBuf> {
        Ok(self
            .blobs_dir()
            .join(format!(".{}.partial", validate_digest(digest)?)))
    }

    /// Check whether a blob for `digest` already exists on disk.
    pub async fn has_blob(&self, digest: &str) -> Result<bool> {
        Ok(fs::try_exists(self.blob_path(digest)?).await?)
    }

    /// Stream `reader` into the store under `desc.digest`, verifying digest
    /// and size before the blob becomes visible.
    pub async fn write_blob(&self, desc: &Descriptor, mut reader: BlobReader) -> Result<PathBuf> {
        let path = self.blob_path(&desc.digest)?;
        let staging = self.staging_path(&desc.digest)?;
        let mut file = fs::File::create(&staging).await?;

        let mut hasher = Sha256::new();
        let mut written: u64 = 0;
        let mut buf = vec![0u8; 64 * 1024];
        let copied: std::io::Result<()> = async {
            loop {
                let n = reader.read(&mut buf).await?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                file.write_all(&buf[..n]).await?;
                written += n as u64;
            }
            file.flush().await
        }
        .await;
        drop(file);

        let actual = format!("sha256:{}", hex_encode(&hasher.finalize()));
        let verdict: Result<()> = match copied {
            Err(e) => Err(e.into()),
            Ok(()) if actual != desc.digest => Err(OciError::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            }),
            Ok(()) if desc.size != written => Err(OciError::Layer(format!(
                "blob {} is {} bytes, expected {}",
                desc.digest, written, desc.size
            ))),
            Ok(()) => Ok(()),
        };
        if let Err(e) = verdict {
            let _ = fs::remove_file(&staging).await;
            return Err(e);
        }

        fs::rename(&staging, &path).await?;
        debug!(path = %path.display(), size = written, "stored blob");
        Ok(path)
    }

    /// Persist `data` under `digest` after checking it hashes to `digest`.
    pub async fn write_blob_bytes(&self, digest: &str, data: &[u8]) -> Result<PathBuf> {
        let actual = sha256_digest(data);
        if actual != digest {
            return Err(OciError::DigestMismatch {
                expected: digest.to_string(),
                actual,
            });
        }
        let path = self.blob_path(digest)?;
        if !fs::try_exists(&path).await? {
            let staging = self.staging_path(digest)?;
            fs::write(&staging, data).await?;
            fs::rename(&staging, &path).await?;
            debug!(path = %path.display(), "stored blob");
        }
        Ok(path)
    }

    pub async fn read_blob(&self, digest: &str) -> Result<Vec<u8>> {
        fs::read(self.blob_path(digest)?)
            .await
            .map_err(|e| missing_blob(digest, e))
    }

    pub async fn open_blob(&self, digest: &str) -> Result<fs::File> {
        fs::File::open(self.blob_path(digest)?)
            .await
            .map_err(|e| missing_blob(digest, e))
    }

    pub async fn read_index(&self) -> Result<ImageIndex> {
        let data = fs::read(self.root.join(INDEX_FILE)).await?;
        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_index(&self, index: &ImageIndex) -> Result<()> {
        let path = self.root.join(INDEX_FILE);
        let tmp = self.root.join(format!("{}.tmp", INDEX_FILE));
        fs::write(&tmp, serde_json::to_vec_pretty(index)?).await?;
        fs::rename(&tmp, &path).await?;
        Ok(())
    }

    /// Store `manifest` and name it `tag` in `index.json`, replacing any
    /// previous manifest with the same name.
    pub async fn tag_manifest(&self, tag: &str, manifest: &ResolvedManifest) -> Result<()> {
        if tag.is_empty() {
            return Err(OciError::Layout("empty tag".to_string()));
        }
        self.write_blob_bytes(&manifest.digest, &manifest.raw)
            .await?;

        let mut desc = manifest.descriptor();
        desc.annotations = Some(BTreeMap::from([(
            ANNOTATION_REF_NAME.to_string(),
            tag.to_string(),
        )]));

        let mut index = self.read_index().await?;
        index.manifests.retain(|d| d.ref_name() != Some(tag));
        index.manifests.push(desc);
        self.write_index(&index).await?;
        debug!(tag, digest = %manifest.digest, "tagged manifest");
        Ok(())
    }

    /// Look up the manifest descriptor named `tag`.
    pub async fn resolve_tag(&self, tag: &str) -> Result<Descriptor> {
        let index = self.read_index().await?;
        index
            .manifests
            .into_iter()
            .find(|d| d.ref_name() == Some(tag))
            .ok_or_else(|| {
                OciError::NotFound(format!("tag {} in layout {}", tag, self.root.display()))
            })
    }

    /// Count committed blobs; staging files are ignored.
    pub async fn blob_stats(&self) -> Result<BlobStats> {
        let mut stats = BlobStats::default();
        let mut entries = fs::read_dir(self.blobs_dir()).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_name().to_string_lossy().starts_with('.') {
                continue;
            }
            stats.count += 1;
            stats.bytes += entry.metadata().await?.len();
        }
        Ok(stats)
    }

    /// Writable handle for the image named `tag`.
    pub fn destination(&self, tag: impl Into<String>) -> LayoutDestination {
        LayoutDestination {
            layout: self.clone(),
            tag: tag.into(),
        }
    }

    /// Readable handle for the image named `tag`.
    pub fn source(&self, tag: impl Into<String>) -> LayoutSource {
        LayoutSource {
            layout: self.clone(),
            tag: tag.into(),
        }
    }
}

fn missing_blob(digest: &str, err: std::io::Error) -> OciError {
    if err.kind() == std::io::ErrorKind::NotFound {
        OciError::NotFound(format!("blob {}", digest))
    } else {
        err.into()
    }
}

// ---------------------------------------------------------------------------
// Source / destination adapters
// ---------------------------------------------------------------------------

/// An image in the layout, as a copy destination.
pub struct LayoutDestination {
    layout: OciLayout,
    tag: String,
}

#[async_trait]
impl ImageDestination for LayoutDestination {
    fn describe(&self) -> String {
        format!("oci:{}:{}", self.layout.root.display(), self.tag)
    }

    async fn has_blob(&self, desc: &Descriptor) -> Result<bool> {
        self.layout.has_blob(&desc.digest).await
    }

    async fn put_blob(
        &mut self,
        desc: &Descriptor,
        _kind: BlobKind,
        blob: BlobReader,
    ) -> Result<()> {
        self.layout.write_blob(desc, blob).await.map(|_| ())
    }

    async fn put_manifest(&mut self, manifest: &ResolvedManifest) -> Result<()> {
        self.layout.tag_manifest(&self.tag, manifest).await
    }
}

/// An image in the layout, as a copy source.
pub struct LayoutSource {
    layout: OciLayout,
    tag: String,
}

#[async_trait]
impl ImageSource for LayoutSource {
    fn describe(&self) -> String {
        format!("oci:{}:{}", self.layout.root.display(), self.tag)
    }

    async fn manifest(&self) -> Result<ResolvedManifest> {
        let desc = self.layout.resolve_tag(&self.tag).await?;
        let raw = self.layout.read_blob(&desc.digest).await?;
        let resolved = ResolvedManifest::from_raw(raw, Some(&desc.media_type))?;
        if resolved.digest != desc.digest {
            return Err(OciError::DigestMismatch {
                expected: desc.digest,
                actual: resolved.digest,
            });
        }
        Ok(resolved)
    }

    async fn blob(&self, desc: &Descriptor) -> Result<BlobReader> {
        let file = self.layout.open_blob(&desc.digest).await?;
        Ok(Box::pin(file))
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
