//! Seams between the copy operation and the places images live.
//!
//! A [`Transport`] turns a reference into an [`ImageSource`]; the OCI layout
//! and the docker-archive writer provide [`ImageDestination`]s.

use std::pin::Pin;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncRead;

use crate::error::Result;
use crate::manifest::{Descriptor, Platform, ResolvedManifest};
use crate::reference::ImageRef;
use crate::registry::RegistryClient;

/// A streaming blob body.
pub type BlobReader = Pin<Box<dyn AsyncRead + Send>>;

/// What a blob is used for inside an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlobKind {
    Config,
    Layer,
}

/// Somewhere an image can be read from.
#[async_trait]
pub trait ImageSource: Send + Sync {
    /// Human readable name of the source for logs, errors and policy checks.
    fn describe(&self) -> String;

    /// The registry reference behind this source, if it has one.
    fn reference(&self) -> Option<&ImageRef> {
        None
    }

    /// Resolve the single-platform manifest of this image.
    async fn manifest(&self) -> Result<ResolvedManifest>;

    /// Open the blob described by `desc` for reading.
    async fn blob(&self, desc: &Descriptor) -> Result<BlobReader>;
}

/// Somewhere an image can be written to.
#[async_trait]
pub trait ImageDestination: Send {
    fn describe(&self) -> String;

    /// Whether the destination already holds `desc`; such blobs are skipped.
    async fn has_blob(&self, desc: &Descriptor) -> Result<bool>;

    /// Store a blob.  Implementations verify what they can of `desc`.
    async fn put_blob(&mut self, desc: &Descriptor, kind: BlobKind, blob: BlobReader)
        -> Result<()>;

    /// Commit the manifest once every blob it references has been stored.
    async fn put_manifest(&mut self, manifest: &ResolvedManifest) -> Result<()>;
}

/// Resolves references to readable image sources.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn open(&self, image: &ImageRef) -> Result<Box<dyn ImageSource>>;
}

// ---------------------------------------------------------------------------
// Registry transport
// ---------------------------------------------------------------------------

/// Pulls images from OCI Distribution registries.
pub struct RegistryTransport {
    client: Arc<RegistryClient>,
    platform: Platform,
}

impl RegistryTransport {
    pub fn new(client: RegistryClient) -> Self {
        Self {
            client: Arc::new(client),
            platform: Platform::host(),
        }
    }

    /// Override the platform selected from multi-arch image indexes.
    pub fn with_platform(mut self, platform: Platform) -> Self {
        self.platform = platform;
        self
    }
}

#[async_trait]
impl Transport for RegistryTransport {
    async fn open(&self, image: &ImageRef) -> Result<Box<dyn ImageSource>> {
        Ok(Box::new(RegistrySource {
            client: Arc::clone(&self.client),
            image: image.clone(),
            platform: self.platform.clone(),
        }))
    }
}

struct RegistrySource {
    client: Arc<RegistryClient>,
    image: ImageRef,
    platform: Platform,
}

#[async_trait]
impl ImageSource for RegistrySource {
    fn describe(&self) -> String {
        format!("docker://{}", self.image)
    }

    fn reference(&self) -> Option<&ImageRef> {
        Some(&self.image)
    }

    async fn manifest(&self) -> Result<ResolvedManifest> {
        self.client
            .resolve_manifest(&self.image, &self.platform)
            .await
    }

    async fn blob(&self, desc: &Descriptor) -> Result<BlobReader> {
        self.client.blob_reader(&self.image, &desc.digest).await
    }
}
