//! Stage 2: write the cached images into one docker-archive.

use std::fs::Permissions;
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use image_creator_oci::{copy_image, CopyOptions, DockerArchive, ImageRef, OciError, PolicyContext};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{slot_tag, CacheStore};
use crate::config::{check_destination, OutputTarget};
use crate::error::{Error, Result};
use crate::pipe::PipeStreamer;

const ARCHIVE_FILE_MODE: u32 = 0o644;

/// Result of a completed archiving stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveOutcome {
    pub images: usize,
    /// Set when streaming to stdout reported a problem after the archive
    /// itself was written.
    pub stream_warning: Option<String>,
}

/// Copy every cache slot into the archive at `target`, in request order.
pub async fn archive_images(
    images: &[String],
    cache: &CacheStore,
    target: &OutputTarget,
    force: bool,
    stdout_is_terminal: bool,
    policy: &PolicyContext,
    cancel: &CancellationToken,
) -> Result<ArchiveOutcome> {
    info!(total = images.len(), "stage 2: creating docker archive from cache");
    check_destination(target, force, stdout_is_terminal)?;

    match target {
        OutputTarget::File(path) => {
            let images = archive_to_file(path, force, images, cache, policy, cancel).await?;
            Ok(ArchiveOutcome {
                images,
                stream_warning: None,
            })
        }
        OutputTarget::Stdout => archive_to_stdout(images, cache, policy, cancel).await,
    }
}

/// Write to a temporary sibling of `path` and rename it into place once the
/// archive is sealed, so a failed run never leaves a truncated archive.
async fn archive_to_file(
    path: &Path,
    force: bool,
    images: &[String],
    cache: &CacheStore,
    policy: &PolicyContext,
    cancel: &CancellationToken,
) -> Result<usize> {
    if force {
        match tokio::fs::remove_file(path).await {
            Ok(()) => info!(path = %path.display(), "removed existing archive"),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(Error::Io(e)),
        }
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let staging = tempfile::Builder::new()
        .prefix(".image-creator-")
        .suffix(".tar.partial")
        .tempfile_in(parent)?;
    staging
        .as_file()
        .set_permissions(Permissions::from_mode(ARCHIVE_FILE_MODE))?;

    let archive = DockerArchive::new(staging.as_file().try_clone()?);
    let count = match write_entries(&archive, images, cache, policy, cancel).await {
        Ok(count) => count,
        Err(e) => {
            // The staging file is discarded; skip writing a trailer into it.
            drop(archive.abandon());
            return Err(e);
        }
    };
    let file = seal(archive).await?;
    file.sync_all()?;
    drop(file);

    staging.persist(path).map_err(|e| Error::Io(e.error))?;
    Ok(count)
}

async fn archive_to_stdout(
    images: &[String],
    cache: &CacheStore,
    policy: &PolicyContext,
    cancel: &CancellationToken,
) -> Result<ArchiveOutcome> {
    let streamer = PipeStreamer::start().map_err(Error::Pipe)?;
    stream_archive(streamer, images, cache, policy, cancel).await
}

/// Write the archive into the FIFO of `streamer` and wait for it to drain.
///
/// On failure the tar stream is left unterminated, so whatever reads the
/// stream sees a truncated archive instead of a well-formed one that lacks
/// `manifest.json`.
async fn stream_archive(
    mut streamer: PipeStreamer,
    images: &[String],
    cache: &CacheStore,
    policy: &PolicyContext,
    cancel: &CancellationToken,
) -> Result<ArchiveOutcome> {
    let written = async {
        let pipe = streamer.open_writer().await.map_err(Error::Pipe)?;
        let archive = DockerArchive::new(pipe);
        match write_entries(&archive, images, cache, policy, cancel).await {
            Ok(count) => {
                // Dropping the write end lets the drain task see EOF.
                drop(seal(archive).await?);
                Ok(count)
            }
            Err(e) => {
                if let Err(abandon) = archive.abandon() {
                    warn!(error = %abandon, "failed to detach archive writer");
                }
                Err(e)
            }
        }
    }
    .await;

    let stream_warning = match streamer.finish().await {
        Ok(bytes) => {
            info!(bytes, "archive streamed to stdout");
            None
        }
        Err(e) => {
            warn!(error = %e, "error writing to pipe");
            Some(e.to_string())
        }
    };

    Ok(ArchiveOutcome {
        images: written?,
        stream_warning,
    })
}

async fn write_entries<W: Write + Send + 'static>(
    archive: &DockerArchive<W>,
    images: &[String],
    cache: &CacheStore,
    policy: &PolicyContext,
    cancel: &CancellationToken,
) -> Result<usize> {
    let total = images.len();
    let options = CopyOptions { progress: false };

    for (index, reference) in images.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!(index = index + 1, total, reference = %reference, "archiving");

        let failed = |source: OciError| match source {
            OciError::Cancelled => Error::Cancelled,
            source => Error::Archiving {
                index,
                reference: reference.clone(),
                source,
            },
        };
        let repo_tag = ImageRef::parse_transport(reference)
            .map_err(failed)?
            .tagged_name();
        let source = cache.layout().source(slot_tag(index));
        let mut destination = archive.new_reference(Some(repo_tag));
        copy_image(policy, &mut destination, &source, &options, cancel)
            .await
            .map_err(failed)?;
    }
    Ok(total)
}

/// Write the archive trailer off the async runtime; the sink may be a pipe.
async fn seal<W: Write + Send + 'static>(archive: DockerArchive<W>) -> Result<W> {
    tokio::task::spawn_blocking(move || archive.finish())
        .await
        .map_err(|e| Error::ArchiveSeal(OciError::Archive(format!("seal task failed: {}", e))))?
        .map_err(Error::ArchiveSeal)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::{self, Read};
    use std::sync::{Arc, Mutex};

    use image_creator_oci::manifest::{
        sha256_digest, ResolvedManifest, MEDIA_TYPE_OCI_CONFIG, MEDIA_TYPE_OCI_MANIFEST,
    };

    /// Cache image `index` as a single uncompressed layer holding `file`.
    async fn seed_slot(cache: &CacheStore, index: usize, file: &str) {
        let mut builder = tar::Builder::new(Vec::new());
        let mut header = tar::Header::new_gnu();
        header.set_path(file).unwrap();
        header.set_size(file.len() as u64);
        header.set_mode(0o644);
        header.set_cksum();
        builder.append(&header, file.as_bytes()).unwrap();
        let layer = builder.into_inner().unwrap();
        let layer_digest = sha256_digest(&layer);

        let config = serde_json::to_vec(&serde_json::json!({
            "architecture": "amd64",
            "os": "linux",
            "rootfs": {"type": "layers", "diff_ids": [layer_digest]},
        }))
        .unwrap();
        let raw = serde_json::to_vec(&serde_json::json!({
            "schemaVersion": 2,
            "mediaType": MEDIA_TYPE_OCI_MANIFEST,
            "config": {
                "mediaType": MEDIA_TYPE_OCI_CONFIG,
                "digest": sha256_digest(&config),
                "size": config.len(),
            },
            "layers": [{
                "mediaType": "application/vnd.oci.image.layer.v1.tar",
                "digest": layer_digest,
                "size": layer.len(),
            }],
        }))
        .unwrap();

        let layout = cache.layout();
        layout
            .write_blob_bytes(&sha256_digest(&config), &config)
            .await
            .unwrap();
        layout.write_blob_bytes(&layer_digest, &layer).await.unwrap();
        let manifest = ResolvedManifest::from_raw(raw, None).unwrap();
        layout.tag_manifest(&slot_tag(index), &manifest).await.unwrap();
    }

    #[derive(Clone, Default)]
    struct Captured(Arc<Mutex<Vec<u8>>>);

    impl Write for Captured {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Takes every byte, then fails to flush, like a consumer that went
    /// away at the very end.
    struct FailsOnFlush;

    impl Write for FailsOnFlush {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Err(io::Error::new(io::ErrorKind::BrokenPipe, "stdout closed"))
        }
    }

    fn tar_entries(bytes: &[u8]) -> HashMap<String, Vec<u8>> {
        let mut out = HashMap::new();
        let mut archive = tar::Archive::new(bytes);
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().to_string();
            let mut body = Vec::new();
            entry.read_to_end(&mut body).unwrap();
            out.insert(name, body);
        }
        out
    }

    fn accept() -> PolicyContext {
        PolicyContext::new(image_creator_oci::Policy::accept_anything()).unwrap()
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn streams_every_image_through_the_pipe() {
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        seed_slot(&cache, 0, "bin/busybox").await;
        seed_slot(&cache, 1, "etc/alpine-release").await;

        let sink = Captured::default();
        let streamer = PipeStreamer::start_with(sink.clone()).unwrap();
        let images = vec!["busybox".to_string(), "alpine:3.19".to_string()];
        let outcome = stream_archive(streamer, &images, &cache, &accept(), &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(
            outcome,
            ArchiveOutcome {
                images: 2,
                stream_warning: None,
            }
        );

        let entries = tar_entries(&sink.0.lock().unwrap());
        let manifest: serde_json::Value = serde_json::from_slice(&entries["manifest.json"]).unwrap();
        assert_eq!(manifest[0]["RepoTags"], serde_json::json!(["busybox:latest"]));
        assert_eq!(manifest[1]["RepoTags"], serde_json::json!(["alpine:3.19"]));
        cache.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sink_failure_becomes_a_stream_warning() {
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        seed_slot(&cache, 0, "bin/busybox").await;

        let streamer = PipeStreamer::start_with(FailsOnFlush).unwrap();
        let outcome = stream_archive(
            streamer,
            &["busybox".to_string()],
            &cache,
            &accept(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.images, 1);
        let warning = outcome.stream_warning.unwrap();
        assert!(warning.contains("stdout closed"), "{warning}");
        cache.destroy().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_stream_is_left_unterminated() {
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        seed_slot(&cache, 0, "bin/busybox").await;

        let sink = Captured::default();
        let streamer = PipeStreamer::start_with(sink.clone()).unwrap();
        // Slot 1 was never cached.
        let images = vec!["busybox".to_string(), "alpine:3.19".to_string()];
        let err = stream_archive(streamer, &images, &cache, &accept(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Archiving { index: 1, .. }), "{err}");

        let bytes = sink.0.lock().unwrap().clone();
        assert!(!bytes.is_empty());
        let mut archive = tar::Archive::new(bytes.as_slice());
        let mut end = 0;
        let mut names = Vec::new();
        for entry in archive.entries().unwrap() {
            let entry = entry.unwrap();
            names.push(entry.path().unwrap().to_string_lossy().to_string());
            end = entry.raw_file_position() + entry.size().div_ceil(512) * 512;
        }
        // No end-of-archive blocks after the last entry.
        assert_eq!(end, bytes.len() as u64);
        assert!(!names.iter().any(|n| n == "manifest.json"));
        cache.destroy().await;
    }

    #[tokio::test]
    async fn terminal_output_is_refused() {
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        let policy = PolicyContext::new(image_creator_oci::Policy::accept_anything()).unwrap();
        let err = archive_images(
            &["alpine".to_string()],
            &cache,
            &OutputTarget::Stdout,
            false,
            true,
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TerminalOutput));
        cache.destroy().await;
    }

    #[tokio::test]
    async fn missing_slot_is_an_archiving_error_and_leaves_no_file() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("out.tar");
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        let policy = PolicyContext::new(image_creator_oci::Policy::accept_anything()).unwrap();
        let err = archive_images(
            &["alpine:3.19".to_string()],
            &cache,
            &OutputTarget::File(out.clone()),
            false,
            false,
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Archiving { index: 0, .. }));
        assert!(!out.exists());
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
        cache.destroy().await;
    }

    #[tokio::test]
    async fn empty_request_writes_empty_archive() {
        let tmp = tempfile::tempdir().unwrap();
        let out = tmp.path().join("empty.tar");
        let cache = CacheStore::create(&crate::config::CacheLocation::Temporary)
            .await
            .unwrap();
        let policy = PolicyContext::new(image_creator_oci::Policy::accept_anything()).unwrap();
        let outcome = archive_images(
            &[],
            &cache,
            &OutputTarget::File(out.clone()),
            false,
            false,
            &policy,
            &CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(outcome.images, 0);
        let mode = std::fs::metadata(&out).unwrap().permissions().mode() & 0o777;
        assert_eq!(mode, 0o644);
        cache.destroy().await;
    }
}
