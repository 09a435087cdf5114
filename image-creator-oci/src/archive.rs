//! docker-archive writer.
//!
//! Produces the tarball understood by `docker load` and `podman load`:
//!
//! ```text
//! <config-hex>.json   # image configuration, one per distinct config
//! <diffid-hex>.tar    # uncompressed layer, one per distinct diff id
//! manifest.json       # [{"Config", "RepoTags", "Layers"}], one item per image
//! repositories        # legacy {"repo": {"tag": "<top layer>"}} map
//! ```
//!
//! Blobs shared between images are written once; every image still gets its
//! own `manifest.json` item.  The writer is synchronous because the tar
//! stream may block on a pipe; [`DockerArchive`] hands out async
//! [`ImageDestination`]s that drive it from blocking tasks.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;
use tokio_util::io::SyncIoBridge;
use tracing::debug;

use crate::compression::decompressor;
use crate::error::{OciError, Result};
use crate::manifest::{digest_hex, hex_encode, sha256_digest, Descriptor, ImageConfig, ResolvedManifest};
use crate::transport::{BlobKind, BlobReader, ImageDestination};

const MANIFEST_FILE: &str = "manifest.json";
const REPOSITORIES_FILE: &str = "repositories";

/// One entry of `manifest.json`.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
struct ManifestItem {
    config: String,
    repo_tags: Vec<String>,
    layers: Vec<String>,
}

/// Synchronous docker-archive builder over any writer.
pub struct DockerArchiveWriter<W: Write> {
    builder: tar::Builder<Detachable<W>>,
    /// Entry names already present in the tar stream.
    files: HashSet<String>,
    /// Compressed layer digest to diff id.
    layers: HashMap<String, String>,
    /// Config digest to raw config bytes.
    configs: HashMap<String, Vec<u8>>,
    items: Vec<ManifestItem>,
    repositories: BTreeMap<String, BTreeMap<String, String>>,
}

impl<W: Write> DockerArchiveWriter<W> {
    pub fn new(inner: W) -> Self {
        let mut builder = tar::Builder::new(Detachable(Some(inner)));
        builder.mode(tar::HeaderMode::Deterministic);
        Self {
            builder,
            files: HashSet::new(),
            layers: HashMap::new(),
            configs: HashMap::new(),
            items: Vec::new(),
            repositories: BTreeMap::new(),
        }
    }

    /// Whether the blob with `digest` has already been written.
    pub fn has_blob(&self, digest: &str) -> bool {
        self.layers.contains_key(digest) || self.configs.contains_key(digest)
    }

    /// Number of images recorded so far.
    pub fn image_count(&self) -> usize {
        self.items.len()
    }

    /// Add an image configuration blob as `<hex>.json`.
    pub fn put_config(&mut self, desc: &Descriptor, data: Vec<u8>) -> Result<()> {
        let actual = sha256_digest(&data);
        if actual != desc.digest {
            return Err(OciError::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }
        serde_json::from_slice::<ImageConfig>(&data)?;

        let name = format!("{}.json", digest_hex(&desc.digest));
        if self.files.insert(name.clone()) {
            append_entry(&mut self.builder, &name, data.len() as u64, data.as_slice())?;
            debug!(file = %name, "wrote config");
        }
        self.configs.insert(desc.digest.clone(), data);
        Ok(())
    }

    /// Decompress a layer blob and add it as `<diffid-hex>.tar`.  Returns the
    /// layer's diff id.
    ///
    /// The uncompressed stream is spooled to an anonymous temp file because
    /// its size must be known before the tar header is written.
    pub fn put_layer<R: Read + Send>(&mut self, desc: &Descriptor, blob: R) -> Result<String> {
        let mut compressed = Hashing::new(blob);
        let mut spool = Hashing::new(tempfile::tempfile()?);
        {
            let (_, mut decoded) = decompressor(BufReader::new(&mut compressed))?;
            io::copy(&mut decoded, &mut spool)
                .map_err(|e| OciError::Layer(format!("decompress {}: {}", desc.digest, e)))?;
        }
        // Trailing bytes after the compressed stream still count toward the digest.
        io::copy(&mut compressed, &mut io::sink())?;

        let (actual, size) = compressed.finish();
        if actual != desc.digest {
            return Err(OciError::DigestMismatch {
                expected: desc.digest.clone(),
                actual,
            });
        }
        if size != desc.size {
            return Err(OciError::Layer(format!(
                "blob {} is {} bytes, expected {}",
                desc.digest, size, desc.size
            )));
        }

        let (diff_id, uncompressed_size) = spool.finish_hash();
        let name = format!("{}.tar", digest_hex(&diff_id));
        if self.files.insert(name.clone()) {
            let mut file = spool.into_inner();
            file.seek(SeekFrom::Start(0))?;
            append_entry(&mut self.builder, &name, uncompressed_size, file)?;
            debug!(file = %name, size = uncompressed_size, "wrote layer");
        }
        self.layers.insert(desc.digest.clone(), diff_id.clone());
        Ok(diff_id)
    }

    /// Record an image whose config and layers were already added.
    ///
    /// `repo_tag` is the `name:tag` under which the image loads; `None`
    /// leaves it untagged.
    pub fn add_image(&mut self, manifest: &ResolvedManifest, repo_tag: Option<&str>) -> Result<()> {
        let config_digest = &manifest.manifest.config.digest;
        let config = self.configs.get(config_digest).ok_or_else(|| {
            OciError::Archive(format!("config {} was not written", config_digest))
        })?;
        let config: ImageConfig = serde_json::from_slice(config)?;

        let mut diff_ids = Vec::with_capacity(manifest.manifest.layers.len());
        for layer in &manifest.manifest.layers {
            let diff_id = self.layers.get(&layer.digest).ok_or_else(|| {
                OciError::Archive(format!("layer {} was not written", layer.digest))
            })?;
            diff_ids.push(diff_id.clone());
        }
        if let Some(rootfs) = &config.rootfs {
            if rootfs.diff_ids != diff_ids {
                return Err(OciError::Archive(format!(
                    "layers of {} do not match the diff ids in its config",
                    manifest.digest
                )));
            }
        }

        if let (Some(tag), Some(top)) = (repo_tag, diff_ids.last()) {
            let (repo, tag_part) = split_repo_tag(tag);
            self.repositories
                .entry(repo.to_string())
                .or_default()
                .insert(tag_part.to_string(), digest_hex(top).to_string());
        }

        self.items.push(ManifestItem {
            config: format!("{}.json", digest_hex(config_digest)),
            repo_tags: repo_tag.map(|t| vec![t.to_string()]).unwrap_or_default(),
            layers: diff_ids
                .iter()
                .map(|d| format!("{}.tar", digest_hex(d)))
                .collect(),
        });
        debug!(repo_tag = ?repo_tag, digest = %manifest.digest, "recorded image");
        Ok(())
    }

    /// Write `manifest.json` and `repositories`, terminate the tar stream and
    /// return the underlying writer.
    pub fn finish(mut self) -> Result<W> {
        let manifest = serde_json::to_vec(&self.items)?;
        append_entry(&mut self.builder, MANIFEST_FILE, manifest.len() as u64, manifest.as_slice())?;
        if !self.repositories.is_empty() {
            let repositories = serde_json::to_vec(&self.repositories)?;
            append_entry(
                &mut self.builder,
                REPOSITORIES_FILE,
                repositories.len() as u64,
                repositories.as_slice(),
            )?;
        }
        let mut inner = self
            .builder
            .into_inner()?
            .0
            .ok_or_else(|| OciError::Archive("archive writer already detached".to_string()))?;
        inner.flush()?;
        Ok(inner)
    }

    /// Give up on the archive and return the writer without terminating the
    /// tar stream, so a reader sees a truncated archive rather than a
    /// complete one missing `manifest.json`.
    pub fn abandon(mut self) -> Option<W> {
        self.builder.get_mut().0.take()
    }
}

/// Writer that can be taken away from the tar builder.  Once detached,
/// writes fail, which turns the builder's end-of-archive trailer on drop
/// into a no-op.
struct Detachable<W>(Option<W>);

impl<W: Write> Write for Detachable<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.0 {
            Some(inner) => inner.write(buf),
            None => Err(io::Error::new(io::ErrorKind::BrokenPipe, "archive writer detached")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.0 {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

fn append_entry<W: Write, R: Read>(
    builder: &mut tar::Builder<W>,
    path: &str,
    size: u64,
    data: R,
) -> Result<()> {
    let mut header = tar::Header::new_gnu();
    header.set_path(path)?;
    header.set_size(size);
    header.set_mode(0o644);
    header.set_mtime(0);
    header.set_cksum();
    builder.append(&header, data)?;
    Ok(())
}

/// Split `name:tag`, ignoring colons that belong to a registry port.
fn split_repo_tag(repo_tag: &str) -> (&str, &str) {
    match repo_tag.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo, tag),
        _ => (repo_tag, crate::reference::DEFAULT_TAG),
    }
}

/// Pass-through reader/writer that hashes everything it sees.
struct Hashing<T> {
    inner: T,
    hasher: Sha256,
    bytes: u64,
}

impl<T> Hashing<T> {
    fn new(inner: T) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (String, u64) {
        (format!("sha256:{}", hex_encode(&self.hasher.finalize())), self.bytes)
    }

    fn finish_hash(&mut self) -> (String, u64) {
        let hasher = std::mem::take(&mut self.hasher);
        (format!("sha256:{}", hex_encode(&hasher.finalize())), self.bytes)
    }

    fn into_inner(self) -> T {
        self.inner
    }
}

impl<T: Read> Read for Hashing<T> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }
}

impl<T: Write> Write for Hashing<T> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

// ---------------------------------------------------------------------------
// Async handle
// ---------------------------------------------------------------------------

type Shared<W> = Arc<Mutex<DockerArchiveWriter<W>>>;

fn lock<W: Write>(shared: &Shared<W>) -> Result<MutexGuard<'_, DockerArchiveWriter<W>>> {
    shared
        .lock()
        .map_err(|_| OciError::Archive("archive writer poisoned by an earlier failure".to_string()))
}

/// Shared docker-archive that any number of images can be copied into.
pub struct DockerArchive<W: Write + Send + 'static> {
    inner: Shared<W>,
}

impl<W: Write + Send + 'static> DockerArchive<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner: Arc::new(Mutex::new(DockerArchiveWriter::new(inner))),
        }
    }

    /// A destination that records the copied image under `repo_tag`.
    pub fn new_reference(&self, repo_tag: Option<String>) -> ArchiveImageDestination<W> {
        ArchiveImageDestination {
            archive: Arc::clone(&self.inner),
            repo_tag,
        }
    }

    /// Seal the archive.  Fails if a destination handed out by
    /// [`new_reference`](Self::new_reference) is still alive.
    pub fn finish(self) -> Result<W> {
        let writer = Arc::try_unwrap(self.inner)
            .map_err(|_| OciError::Archive("archive still has open references".to_string()))?
            .into_inner()
            .map_err(|_| {
                OciError::Archive("archive writer poisoned by an earlier failure".to_string())
            })?;
        writer.finish()
    }

    /// Drop the archive without writing its trailer and hand back the
    /// writer.  See [`DockerArchiveWriter::abandon`].
    pub fn abandon(self) -> Result<W> {
        let writer = Arc::try_unwrap(self.inner)
            .map_err(|_| OciError::Archive("archive still has open references".to_string()))?
            .into_inner()
            .unwrap_or_else(PoisonError::into_inner);
        writer
            .abandon()
            .ok_or_else(|| OciError::Archive("archive writer already detached".to_string()))
    }
}

/// One image slot inside a [`DockerArchive`].
pub struct ArchiveImageDestination<W: Write + Send + 'static> {
    archive: Shared<W>,
    repo_tag: Option<String>,
}

#[async_trait]
impl<W: Write + Send + 'static> ImageDestination for ArchiveImageDestination<W> {
    fn describe(&self) -> String {
        format!(
            "docker-archive:{}",
            self.repo_tag.as_deref().unwrap_or("<untagged>")
        )
    }

    async fn has_blob(&self, desc: &Descriptor) -> Result<bool> {
        Ok(lock(&self.archive)?.has_blob(&desc.digest))
    }

    async fn put_blob(
        &mut self,
        desc: &Descriptor,
        kind: BlobKind,
        mut blob: BlobReader,
    ) -> Result<()> {
        let archive = Arc::clone(&self.archive);
        let desc = desc.clone();
        let task = match kind {
            BlobKind::Config => {
                let mut data = Vec::with_capacity(desc.size as usize);
                blob.read_to_end(&mut data).await?;
                tokio::task::spawn_blocking(move || {
                    let mut writer = lock(&archive)?;
                    writer.put_config(&desc, data)
                })
            }
            BlobKind::Layer => {
                let bridge = SyncIoBridge::new(blob);
                tokio::task::spawn_blocking(move || {
                    let mut writer = lock(&archive)?;
                    writer.put_layer(&desc, bridge).map(|_| ())
                })
            }
        };
        task.await
            .map_err(|e| OciError::Archive(format!("archive task failed: {}", e)))?
    }

    async fn put_manifest(&mut self, manifest: &ResolvedManifest) -> Result<()> {
        lock(&self.archive)?.add_image(manifest, self.repo_tag.as_deref())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
