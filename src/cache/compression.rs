//! Compression Support
//!
//! Codecs are reached through the [`Compressor`] trait, keyed by
//! [`CompressionType`] plus a format version.
//!
//! # Example
//!
//! ```
//! use tiercache::cache::compression::{compressor_for, CompressionType};
//!
//! let codec = compressor_for(CompressionType::Lz4);
//! let data = b"block block block block block block block block";
//!
//! let compressed = codec.compress(data, 2).unwrap();
//! let restored = codec.decompress(&compressed, data.len(), 2).unwrap();
//! assert_eq!(restored, data);
//! ```

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Format versions understood by the codecs
pub const SUPPORTED_FORMAT_VERSIONS: &[u32] = &[1, 2];

// =============================================================================
// Compression Type
// =============================================================================

/// Supported compression types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    /// No compression
    None,
    /// LZ4 block compression
    #[default]
    Lz4,
}

impl CompressionType {
    /// Get human-readable name
    pub fn name(&self) -> &'static str {
        match self {
            CompressionType::None => "none",
            CompressionType::Lz4 => "lz4",
        }
    }

    /// Tag stored in secondary cache headers
    pub fn tag(&self) -> u8 {
        match self {
            CompressionType::None => 0,
            CompressionType::Lz4 => 1,
        }
    }

    /// Inverse of [`CompressionType::tag`]
    pub fn from_tag(tag: u8) -> Option<Self> {
        match tag {
            0 => Some(CompressionType::None),
            1 => Some(CompressionType::Lz4),
            _ => None,
        }
    }

    /// Get list of available types
    pub fn available() -> Vec<Self> {
        vec![Self::None, Self::Lz4]
    }
}

impl std::fmt::Display for CompressionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl FromStr for CompressionType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "none" | "kNoCompression" => Ok(CompressionType::None),
            "lz4" | "kLZ4Compression" => Ok(CompressionType::Lz4),
            other => Err(Error::invalid(format!(
                "unsupported compression type '{}'",
                other
            ))),
        }
    }
}

/// Check a format version against [`SUPPORTED_FORMAT_VERSIONS`]
pub fn validate_format_version(version: u32) -> Result<()> {
    if SUPPORTED_FORMAT_VERSIONS.contains(&version) {
        Ok(())
    } else {
        Err(Error::invalid(format!(
            "unsupported compress_format_version {}",
            version
        )))
    }
}

// =============================================================================
// Compressor Trait
// =============================================================================

/// Trait for compression implementations
pub trait Compressor: Send + Sync {
    /// Get the type identifier
    fn compression_type(&self) -> CompressionType;

    /// Compress data
    fn compress(&self, data: &[u8], format_version: u32) -> Result<Vec<u8>>;

    /// Decompress data, which must restore exactly `uncompressed_len` bytes
    fn decompress(&self, data: &[u8], uncompressed_len: usize, format_version: u32)
        -> Result<Vec<u8>>;
}

/// Get the codec for a compression type
pub fn compressor_for(compression_type: CompressionType) -> &'static dyn Compressor {
    static NOOP: NoopCompressor = NoopCompressor;
    static LZ4: Lz4Compressor = Lz4Compressor::new();
    match compression_type {
        CompressionType::None => &NOOP,
        CompressionType::Lz4 => &LZ4,
    }
}

// =============================================================================
// No-Op Compressor
// =============================================================================

/// Pass-through compressor (no compression)
pub struct NoopCompressor;

impl Compressor for NoopCompressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::None
    }

    fn compress(&self, data: &[u8], _format_version: u32) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, data: &[u8], uncompressed_len: usize, _format_version: u32) -> Result<Vec<u8>> {
        if data.len() != uncompressed_len {
            return Err(Error::DecompressionFailed {
                algorithm: "none".into(),
                reason: format!("expected {} bytes, found {}", uncompressed_len, data.len()),
            });
        }
        Ok(data.to_vec())
    }
}

// =============================================================================
// LZ4 Compressor
// =============================================================================

/// LZ4 compressor (fast compression)
///
/// Format version 1 stores the raw block; version 2 prefixes the block with
/// the uncompressed size.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lz4Compressor;

/// Upper bound on the LZ4 block expansion ratio
const MAX_LZ4_EXPANSION: usize = 255;

impl Lz4Compressor {
    /// Create new LZ4 compressor with default settings
    pub const fn new() -> Self {
        Self
    }
}

/// Largest output a well-formed LZ4 block of `compressed_len` bytes can decode to
fn max_decompressed_len(compressed_len: usize) -> usize {
    compressed_len.saturating_mul(MAX_LZ4_EXPANSION).saturating_add(16)
}

impl Compressor for Lz4Compressor {
    fn compression_type(&self) -> CompressionType {
        CompressionType::Lz4
    }

    fn compress(&self, data: &[u8], format_version: u32) -> Result<Vec<u8>> {
        validate_format_version(format_version)?;
        lz4::block::compress(data, None, format_version >= 2).map_err(|e| {
            Error::CompressionFailed {
                algorithm: "LZ4".into(),
                reason: e.to_string(),
            }
        })
    }

    fn decompress(&self, data: &[u8], uncompressed_len: usize, format_version: u32) -> Result<Vec<u8>> {
        let fail = |reason: String| Error::DecompressionFailed {
            algorithm: "LZ4".into(),
            reason,
        };
        validate_format_version(format_version).map_err(|e| fail(e.to_string()))?;

        if uncompressed_len > max_decompressed_len(data.len()) {
            return Err(fail(format!(
                "declared length {} is impossible for a {} byte block",
                uncompressed_len,
                data.len()
            )));
        }

        let size_hint = if format_version >= 2 {
            // The block carries its own size prefix, which must agree
            let prefix = data
                .get(..4)
                .and_then(|b| <[u8; 4]>::try_from(b).ok())
                .map(|b| u32::from_le_bytes(b) as usize)
                .ok_or_else(|| fail("missing size prefix".into()))?;
            if prefix != uncompressed_len {
                return Err(fail(format!(
                    "size prefix {} disagrees with expected {}",
                    prefix, uncompressed_len
                )));
            }
            None
        } else {
            Some(i32::try_from(uncompressed_len).map_err(|_| fail("block too large".into()))?)
        };
        let out = lz4::block::decompress(data, size_hint).map_err(|e| fail(e.to_string()))?;
        if out.len() != uncompressed_len {
            return Err(fail(format!(
                "expected {} bytes, found {}",
                uncompressed_len,
                out.len()
            )));
        }
        Ok(out)
    }
}
