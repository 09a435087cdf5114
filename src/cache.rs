//! Run-scoped blob cache.
//!
//! The cache is an OCI layout that every image of a run is pulled into, so
//! blobs shared between images are downloaded and stored once.  Each image
//! occupies a positional slot tagged `img-<index>`.  The directory is wiped
//! when the run starts and removed when it ends.

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use image_creator_oci::OciLayout;
use tempfile::TempDir;
use tokio::fs;
use tracing::{debug, error, info};

use crate::config::CacheLocation;
use crate::error::{Error, Result};

const CACHE_DIR_MODE: u32 = 0o750;

/// Tag of the cache slot holding the image at `index` of the request list.
pub fn slot_tag(index: usize) -> String {
    format!("img-{index}")
}

enum Backing {
    Explicit(PathBuf),
    Temporary(TempDir),
    Destroyed,
}

pub struct CacheStore {
    layout: OciLayout,
    backing: Backing,
}

impl CacheStore {
    /// Prepare an empty cache directory.
    ///
    /// An explicit directory is removed first together with everything in
    /// it, then recreated with mode 0750.
    pub async fn create(location: &CacheLocation) -> Result<Self> {
        let (root, backing) = match location {
            CacheLocation::Explicit(path) => {
                wipe(path).await.map_err(|source| Error::Setup {
                    path: path.clone(),
                    source,
                })?;
                fs::DirBuilder::new()
                    .recursive(true)
                    .mode(CACHE_DIR_MODE)
                    .create(path)
                    .await
                    .map_err(|source| Error::Setup {
                        path: path.clone(),
                        source,
                    })?;
                (path.clone(), Backing::Explicit(path.clone()))
            }
            CacheLocation::Temporary => {
                let dir = tempfile::Builder::new()
                    .prefix("image-creator-cache-")
                    .tempdir()
                    .map_err(|source| Error::Setup {
                        path: std::env::temp_dir(),
                        source,
                    })?;
                (dir.path().to_path_buf(), Backing::Temporary(dir))
            }
        };

        // The umask may have narrowed the mode.
        fs::set_permissions(&root, std::fs::Permissions::from_mode(CACHE_DIR_MODE))
            .await
            .map_err(|source| Error::Setup {
                path: root.clone(),
                source,
            })?;

        let layout = OciLayout::init(root.clone()).await.map_err(|e| Error::Setup {
            path: root.clone(),
            source: std::io::Error::other(e),
        })?;
        info!(path = %root.display(), "cache directory ready");
        Ok(Self { layout, backing })
    }

    pub fn layout(&self) -> &OciLayout {
        &self.layout
    }

    pub fn path(&self) -> &Path {
        self.layout.root()
    }

    /// Remove the cache directory.  Failures are logged, never returned.
    pub async fn destroy(mut self) {
        let path = self.path().to_path_buf();
        let result = match std::mem::replace(&mut self.backing, Backing::Destroyed) {
            Backing::Explicit(dir) => fs::remove_dir_all(&dir).await,
            Backing::Temporary(dir) => dir.close(),
            Backing::Destroyed => Ok(()),
        };
        match result {
            Ok(()) => debug!(path = %path.display(), "cache directory removed"),
            Err(e) => error!(path = %path.display(), error = %e, "failed to clean up cache directory"),
        }
    }
}

impl Drop for CacheStore {
    fn drop(&mut self) {
        // TempDir cleans up after itself when dropped.
        if let Backing::Explicit(dir) = &self.backing {
            if let Err(e) = std::fs::remove_dir_all(dir) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    error!(path = %dir.display(), error = %e, "failed to clean up cache directory");
                }
            }
        }
    }
}

/// Remove whatever is at `path`, if anything.
async fn wipe(path: &Path) -> std::io::Result<()> {
    match fs::symlink_metadata(path).await {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path).await,
        Ok(_) => fs::remove_file(path).await,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
