//! Image plumbing for `image-creator`: registry pulls, an on-disk OCI
//! layout, docker-archive output and the copy operation tying them together.
//!
//! ```text
//!   RegistryTransport ──copy_image──▶ OciLayout (img-0, img-1, …)
//!   OciLayout         ──copy_image──▶ DockerArchive (one entry per image)
//! ```

pub mod archive;
pub mod compression;
pub mod copy;
pub mod credentials;
pub mod error;
pub mod layout;
pub mod manifest;
pub mod policy;
pub mod reference;
pub mod registry;
pub mod transport;

pub use archive::{ArchiveImageDestination, DockerArchive, DockerArchiveWriter};
pub use copy::{copy_image, CopyOptions, CopyReport};
pub use credentials::DockerCredentials;
pub use error::{OciError, Result};
pub use layout::OciLayout;
pub use policy::{Policy, PolicyContext, PolicyRequirement};
pub use reference::ImageRef;
pub use registry::RegistryClient;
pub use transport::{BlobKind, BlobReader, ImageDestination, ImageSource, RegistryTransport, Transport};
