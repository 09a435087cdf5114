//! image-creator: bundle container images into a single docker-archive
//!
//! Images are pulled one after another into a shared OCI layout cache, so
//! blobs common to several images are downloaded once, and are then copied
//! from the cache into one archive that both `docker load` and
//! `podman load` accept.  The archive goes to a file or is streamed to
//! stdout.
//!
//! # Example
//!
//! ```no_run
//! use image_creator::{run, OutputTarget, RunConfig};
//! use image_creator_oci::{RegistryClient, RegistryTransport};
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let transport = RegistryTransport::new(RegistryClient::anonymous()?);
//!     let config = RunConfig::new(
//!         vec!["alpine:3.19".into(), "busybox".into()],
//!         OutputTarget::File("images.tar".into()),
//!     );
//!     let report = run(&config, &transport, &CancellationToken::new()).await?;
//!     println!("archived {} images", report.images);
//!     Ok(())
//! }
//! ```

pub mod acquire;
pub mod archive;
pub mod cache;
pub mod config;
pub mod error;
pub mod pipe;
pub mod runtime;

pub use config::{CacheLocation, OutputTarget, RunConfig};
pub use error::{Error, ImageFailure, Result};
pub use runtime::{run, RunReport};
