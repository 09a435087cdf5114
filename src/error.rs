//! Error types for image-creator

use std::fmt;
use std::path::PathBuf;

use image_creator_oci::OciError;
use thiserror::Error;

/// Result type alias using image-creator Error
pub type Result<T> = std::result::Result<T, Error>;

/// One image that could not be pulled into the cache.
#[derive(Debug)]
pub struct ImageFailure {
    /// Zero-based position of the image on the command line.  Displayed
    /// one-based, matching the progress logs.
    pub index: usize,
    pub reference: String,
    pub cause: OciError,
}

impl fmt::Display for ImageFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.index + 1, self.reference, self.cause)
    }
}

/// Errors that end a run
#[derive(Error, Debug)]
pub enum Error {
    /// The cache directory could not be prepared
    #[error("failed to set up cache directory {}: {source}", .path.display())]
    Setup {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The trust policy could not be built
    #[error("failed to create policy context: {0}")]
    Policy(#[source] OciError),

    /// One or more images failed to download
    #[error(
        "failed to download {} image(s): {}",
        .failures.len(),
        join_failures(.failures)
    )]
    Acquisition { failures: Vec<ImageFailure> },

    /// An image could not be written into the archive
    #[error("failed to archive image {reference} (#{}): {source}", .index + 1)]
    Archiving {
        index: usize,
        reference: String,
        #[source]
        source: OciError,
    },

    /// The archive could not be sealed
    #[error("failed to close archive writer: {0}")]
    ArchiveSeal(#[source] OciError),

    #[error("output file {} already exists. Use -f to overwrite", .0.display())]
    AlreadyExists(PathBuf),

    #[error(
        "refusing to write archive to terminal. Use -o to specify an output file or redirect to a file/pipe"
    )]
    TerminalOutput,

    #[error("operation cancelled")]
    Cancelled,

    /// Failure to set up the stdout pipe
    #[error("failed to set up pipe: {0}")]
    Pipe(#[source] std::io::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Oci(#[from] OciError),
}

fn join_failures(failures: &[ImageFailure]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}
