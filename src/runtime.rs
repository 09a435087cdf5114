//! Run orchestration: cache setup, both stages, cache teardown.

use image_creator_oci::{Policy, PolicyContext, Transport};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::acquire::{acquire_images, AcquireSummary};
use crate::archive::archive_images;
use crate::cache::CacheStore;
use crate::config::{check_destination, OutputTarget, RunConfig};
use crate::error::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub images: usize,
    pub output: OutputTarget,
    pub cached: AcquireSummary,
    /// Problem reported while streaming to stdout; the run still succeeded.
    pub stream_warning: Option<String>,
}

/// Pull `config.images` through `transport` and write them to
/// `config.output`.
///
/// Destination problems that need no network access are reported first.
/// The cache directory is removed whether or not the run succeeds.
pub async fn run(
    config: &RunConfig,
    transport: &dyn Transport,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    check_destination(&config.output, config.force, config.stdout_is_terminal)?;

    let cache = CacheStore::create(&config.cache).await?;
    let result = run_stages(config, transport, &cache, cancel).await;
    cache.destroy().await;
    result
}

async fn run_stages(
    config: &RunConfig,
    transport: &dyn Transport,
    cache: &CacheStore,
    cancel: &CancellationToken,
) -> Result<RunReport> {
    let policy = PolicyContext::new(Policy::accept_anything()).map_err(Error::Policy)?;

    let cached = acquire_images(
        &config.images,
        transport,
        cache,
        &policy,
        config.quiet,
        cancel,
    )
    .await?;

    let outcome = archive_images(
        &config.images,
        cache,
        &config.output,
        config.force,
        config.stdout_is_terminal,
        &policy,
        cancel,
    )
    .await?;
    info!(images = outcome.images, "docker archive complete");

    Ok(RunReport {
        images: outcome.images,
        output: config.output.clone(),
        cached,
        stream_warning: outcome.stream_warning,
    })
}
