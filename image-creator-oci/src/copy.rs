//! Image copy between any source and destination.

use indicatif::{MultiProgress, ProgressBar, ProgressDrawTarget, ProgressStyle};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::{OciError, Result};
use crate::manifest::{digest_hex, Descriptor};
use crate::policy::PolicyContext;
use crate::transport::{BlobKind, BlobReader, ImageDestination, ImageSource};

const PROGRESS_TEMPLATE: &str =
    "  {msg:<12} [{bar:30.cyan/blue}] {bytes:>10}/{total_bytes:<10} {bytes_per_sec}";

#[derive(Debug, Clone, Default)]
pub struct CopyOptions {
    /// Draw a progress bar per transferred blob on stderr.
    pub progress: bool,
}

/// What a copy moved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CopyReport {
    pub manifest_digest: String,
    pub blobs_copied: usize,
    /// Blobs the destination already had.
    pub blobs_reused: usize,
    pub bytes_copied: u64,
}

/// Copy the image behind `src` into `dest`.
///
/// The policy is consulted first.  Config and layer blobs follow, skipping
/// any the destination already holds, and the manifest is committed last so
/// a destination never references missing blobs.  Cancelling `cancel` aborts
/// the transfer with [`OciError::Cancelled`].
pub async fn copy_image(
    policy: &PolicyContext,
    dest: &mut dyn ImageDestination,
    src: &dyn ImageSource,
    options: &CopyOptions,
    cancel: &CancellationToken,
) -> Result<CopyReport> {
    if cancel.is_cancelled() {
        return Err(OciError::Cancelled);
    }
    policy.check_source(src)?;

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(OciError::Cancelled),
        result = transfer(dest, src, options) => result,
    }
}

async fn transfer(
    dest: &mut dyn ImageDestination,
    src: &dyn ImageSource,
    options: &CopyOptions,
) -> Result<CopyReport> {
    let manifest = src.manifest().await?;
    manifest.manifest.check_digests()?;
    debug!(
        source = %src.describe(),
        destination = %dest.describe(),
        digest = %manifest.digest,
        layers = manifest.manifest.layers.len(),
        "copying image",
    );

    let bars = MultiProgress::with_draw_target(if options.progress {
        ProgressDrawTarget::stderr()
    } else {
        ProgressDrawTarget::hidden()
    });

    let mut report = CopyReport {
        manifest_digest: manifest.digest.clone(),
        ..CopyReport::default()
    };
    let blobs = std::iter::once((&manifest.manifest.config, BlobKind::Config)).chain(
        manifest
            .manifest
            .layers
            .iter()
            .map(|layer| (layer, BlobKind::Layer)),
    );
    for (desc, kind) in blobs {
        if dest.has_blob(desc).await? {
            debug!(digest = %desc.digest, "blob already present, skipping");
            report.blobs_reused += 1;
            continue;
        }

        let reader = src.blob(desc).await?;
        let bar = options.progress.then(|| bars.add(progress_bar(desc)));
        let reader: BlobReader = match &bar {
            Some(bar) => Box::pin(bar.wrap_async_read(reader)),
            None => reader,
        };
        dest.put_blob(desc, kind, reader).await?;
        if let Some(bar) = bar {
            bar.finish_with_message("done");
        }

        report.blobs_copied += 1;
        report.bytes_copied += desc.size;
    }

    dest.put_manifest(&manifest).await?;
    Ok(report)
}

fn progress_bar(desc: &Descriptor) -> ProgressBar {
    let style = ProgressStyle::with_template(PROGRESS_TEMPLATE)
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("=> ");
    let short: String = digest_hex(&desc.digest).chars().take(12).collect();
    ProgressBar::new(desc.size).with_style(style).with_message(short)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
