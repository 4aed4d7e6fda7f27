//! Payload compression providers.

use thiserror::Error;

/// A compression or decompression failure.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{0}")]
pub struct CompressionError(pub String);

/// Transforms node payloads on their way to and from the ensemble.
///
/// Failures are data errors, never connection errors: the engine surfaces
/// them as [`crate::ClientError::Encoding`] and does not retry.
pub trait CompressionProvider: Send + Sync {
    /// Compresses an outgoing payload for `path`.
    fn compress(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError>;

    /// Decompresses an incoming payload for `path`.
    fn decompress(&self, path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError>;
}

/// Passes payloads through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCompression;

impl CompressionProvider for NoCompression {
    fn compress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }

    fn decompress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        Ok(data.to_vec())
    }
}

/// LZ4 block compression with a little-endian length prefix.
///
/// Empty payloads stay empty in both directions so nodes created without
/// data (e.g. parents created on demand) read back cleanly.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4CompressionProvider;

impl CompressionProvider for Lz4CompressionProvider {
    fn compress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        Ok(lz4_flex::compress_prepend_size(data))
    }

    fn decompress(&self, _path: &str, data: &[u8]) -> Result<Vec<u8>, CompressionError> {
        if data.is_empty() {
            return Ok(Vec::new());
        }
        lz4_flex::decompress_size_prepended(data).map_err(|e| CompressionError(e.to_string()))
    }
}
