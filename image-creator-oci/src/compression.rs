//! Layer compression detection and decompression.
//!
//! Registries hand out layers gzip or zstd compressed, but a docker-archive
//! stores them as plain tar.  The format is sniffed from the stream itself
//! because media types are not always trustworthy.

use std::io::{BufRead, Read};

use crate::error::{OciError, Result};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const ZSTD_MAGIC: [u8; 4] = [0x28, 0xb5, 0x2f, 0xfd];

/// Compression applied to a layer stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
    Zstd,
}

impl Compression {
    /// Classify a stream by its first bytes.
    pub fn detect(prefix: &[u8]) -> Self {
        if prefix.starts_with(&GZIP_MAGIC) {
            Compression::Gzip
        } else if prefix.starts_with(&ZSTD_MAGIC) {
            Compression::Zstd
        } else {
            Compression::None
        }
    }
}

/// Wrap `reader` in the decoder matching its content.  Plain streams pass
/// through untouched.
pub fn decompressor<'a, R>(mut reader: R) -> Result<(Compression, Box<dyn Read + Send + 'a>)>
where
    R: BufRead + Send + 'a,
{
    let compression = Compression::detect(reader.fill_buf()?);
    let decoded: Box<dyn Read + Send + 'a> = match compression {
        Compression::Gzip => Box::new(flate2::bufread::MultiGzDecoder::new(reader)),
        Compression::Zstd => Box::new(
            zstd::Decoder::with_buffer(reader)
                .map_err(|e| OciError::Layer(format!("zstd init: {}", e)))?,
        ),
        Compression::None => Box::new(reader),
    };
    Ok((compression, decoded))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
