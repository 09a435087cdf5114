//! Stage 1: pull every requested image into the cache.

use image_creator_oci::{copy_image, CopyOptions, ImageRef, OciError, PolicyContext, Transport};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cache::{slot_tag, CacheStore};
use crate::error::{Error, ImageFailure, Result};

/// Counts for a finished acquisition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AcquireSummary {
    pub images: usize,
    pub blobs_copied: usize,
    pub blobs_reused: usize,
}

/// Copy each image into cache slot `img-<i>`, one at a time.
///
/// A failing image does not stop the others; all failures are reported
/// together once the list is exhausted.  Cancellation stops at once.
pub async fn acquire_images(
    images: &[String],
    transport: &dyn Transport,
    cache: &CacheStore,
    policy: &PolicyContext,
    quiet: bool,
    cancel: &CancellationToken,
) -> Result<AcquireSummary> {
    let total = images.len();
    info!(total, path = %cache.path().display(), "stage 1: downloading images to cache");

    let options = CopyOptions { progress: !quiet };
    let mut summary = AcquireSummary::default();
    let mut failures = Vec::new();

    for (index, reference) in images.iter().enumerate() {
        if cancel.is_cancelled() {
            return Err(Error::Cancelled);
        }
        info!(index = index + 1, total, reference = %reference, "downloading");
        match acquire_one(reference, index, transport, cache, policy, &options, cancel).await {
            Ok(report) => {
                summary.images += 1;
                summary.blobs_copied += report.blobs_copied;
                summary.blobs_reused += report.blobs_reused;
            }
            Err(OciError::Cancelled) => return Err(Error::Cancelled),
            Err(cause) => {
                warn!(index = index + 1, reference = %reference, error = %cause, "download failed");
                failures.push(ImageFailure {
                    index,
                    reference: reference.clone(),
                    cause,
                });
            }
        }
    }

    if !failures.is_empty() {
        return Err(Error::Acquisition { failures });
    }
    info!(
        images = summary.images,
        blobs_copied = summary.blobs_copied,
        blobs_reused = summary.blobs_reused,
        "all images cached",
    );
    Ok(summary)
}

async fn acquire_one(
    reference: &str,
    index: usize,
    transport: &dyn Transport,
    cache: &CacheStore,
    policy: &PolicyContext,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> image_creator_oci::Result<image_creator_oci::CopyReport> {
    let image = ImageRef::parse_transport(reference)?;
    let source = transport.open(&image).await?;
    let mut destination = cache.layout().destination(slot_tag(index));
    copy_image(policy, &mut destination, source.as_ref(), options, cancel).await
}
