//! Compressed Secondary Cache
//!
//! Stores values compressed in an inner [`ShardedCache`] with its own
//! capacity and shard layout.
//!
//! # Stored Format
//!
//! ```text
//! ┌──────────┬────────────────┬───────┬──────────────────┬─────────────────┐
//! │ type (1) │ version (4 LE) │ flags │ raw length (4 LE)│ payload         │
//! └──────────┴────────────────┴───────┴──────────────────┴─────────────────┘
//! payload (contiguous): compressed bytes
//! payload (split):      repeated [chunk length (4 LE)][chunk bytes]
//! ```
//!
//! Entries whose header does not match what this cache writes are treated
//! as misses.

use std::sync::Arc;

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tracing::{debug, warn};

use super::compression::{compressor_for, CompressionType};
use super::config::{CacheOptions, CompressedSecondaryCacheOptions};
use super::entry::Priority;
use super::secondary::SecondaryCache;
use super::sharded::ShardedCache;
use crate::error::{Error, Result};

/// Registry name of the compressed secondary cache
pub const COMPRESSED_SECONDARY_CACHE_NAME: &str = "compressed_secondary_cache";

/// Configuration string prefix selecting the compressed secondary cache
pub const COMPRESSED_SECONDARY_CACHE_SCHEME: &str = "compressed_secondary_cache://";

const HEADER_LEN: usize = 10;
const FLAG_SPLIT: u8 = 0x01;

/// Chunk sizes used by the split representation
const CHUNK_BINS: &[usize] = &[128, 256, 512, 1024, 2048, 4096, 8192, 16384];

/// Cut a payload into size-class chunks; the last chunk takes the remainder
fn split_chunks(payload: &[u8]) -> Vec<&[u8]> {
    let mut chunks = Vec::new();
    let mut rest = payload;
    while !rest.is_empty() {
        let size = CHUNK_BINS
            .iter()
            .rev()
            .copied()
            .find(|&bin| bin <= rest.len())
            .unwrap_or(rest.len());
        let (chunk, tail) = rest.split_at(size);
        chunks.push(chunk);
        rest = tail;
    }
    chunks
}

/// Reassemble a split payload
fn merge_chunks(mut framed: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(framed.len());
    while framed.has_remaining() {
        if framed.remaining() < 4 {
            return Err(Error::corruption("truncated chunk header"));
        }
        let len = framed.get_u32_le() as usize;
        if len == 0 || len > framed.remaining() {
            return Err(Error::corruption(format!(
                "chunk length {} with {} bytes left",
                len,
                framed.remaining()
            )));
        }
        out.extend_from_slice(&framed[..len]);
        framed.advance(len);
    }
    Ok(out)
}

/// Secondary cache holding compressed values
pub struct CompressedSecondaryCache {
    cache: ShardedCache,
    options: CompressedSecondaryCacheOptions,
}

impl CompressedSecondaryCache {
    pub fn new(options: &CompressedSecondaryCacheOptions) -> Result<Self> {
        options.validate()?;
        let inner = CacheOptions {
            capacity: options.capacity,
            num_shard_bits: options.num_shard_bits,
            strict_capacity_limit: true,
            high_pri_pool_ratio: 0.0,
            low_pri_pool_ratio: 0.0,
        };
        Ok(Self {
            cache: ShardedCache::new(&inner)?,
            options: options.clone(),
        })
    }

    /// Registry constructor taking `key=value;...` arguments
    pub fn from_args(args: &str) -> Result<Arc<dyn SecondaryCache>> {
        let options = CompressedSecondaryCacheOptions::from_config_str(args)?;
        Ok(Arc::new(Self::new(&options)?))
    }

    pub fn options(&self) -> &CompressedSecondaryCacheOptions {
        &self.options
    }

    /// Number of stored entries
    pub fn len(&self) -> usize {
        self.cache.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cache.is_empty()
    }

    pub fn set_capacity(&self, capacity: usize) {
        self.cache.set_capacity(capacity);
    }

    /// Serialize a value into the stored format
    pub(crate) fn encode(&self, value: &[u8]) -> Result<Bytes> {
        let version = self.options.compress_format_version;
        let raw_len = u32::try_from(value.len())
            .map_err(|_| Error::invalid(format!("value of {} bytes too large", value.len())))?;

        let mut compression_type = self.options.compression_type;
        let compressed = if compression_type == CompressionType::None {
            None
        } else {
            match compressor_for(compression_type).compress(value, version) {
                Ok(out) if out.len() < value.len() => Some(out),
                Ok(_) => None,
                Err(e) => {
                    debug!("compression failed, storing raw: {}", e);
                    None
                }
            }
        };
        let payload: &[u8] = match &compressed {
            Some(out) => out,
            None => {
                compression_type = CompressionType::None;
                value
            }
        };

        let split = self.options.enable_custom_split_merge;
        let chunks = if split { split_chunks(payload) } else { Vec::new() };

        let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + 4 * chunks.len());
        buf.put_u8(compression_type.tag());
        buf.put_u32_le(version);
        buf.put_u8(if split { FLAG_SPLIT } else { 0 });
        buf.put_u32_le(raw_len);
        if split {
            for chunk in chunks {
                buf.put_u32_le(chunk.len() as u32);
                buf.put_slice(chunk);
            }
        } else {
            buf.put_slice(payload);
        }
        Ok(buf.freeze())
    }

    /// Restore a value from the stored format, failing closed on any mismatch
    pub(crate) fn decode(&self, stored: &[u8]) -> Result<Bytes> {
        if stored.len() < HEADER_LEN {
            return Err(Error::corruption(format!(
                "entry of {} bytes is shorter than its header",
                stored.len()
            )));
        }
        let (mut header, body) = stored.split_at(HEADER_LEN);
        let tag = header.get_u8();
        let version = header.get_u32_le();
        let flags = header.get_u8();
        let raw_len = header.get_u32_le() as usize;

        let compression_type = CompressionType::from_tag(tag)
            .ok_or_else(|| Error::corruption(format!("unknown compression tag {}", tag)))?;
        if version != self.options.compress_format_version {
            return Err(Error::corruption(format!(
                "format version {} does not match configured {}",
                version, self.options.compress_format_version
            )));
        }
        if flags & !FLAG_SPLIT != 0 {
            return Err(Error::corruption(format!("unknown flags {:#04x}", flags)));
        }

        let merged;
        let payload: &[u8] = if flags & FLAG_SPLIT != 0 {
            merged = merge_chunks(body)?;
            &merged
        } else {
            body
        };

        let restored = compressor_for(compression_type).decompress(payload, raw_len, version)?;
        Ok(Bytes::from(restored))
    }
}

impl SecondaryCache for CompressedSecondaryCache {
    fn name(&self) -> &'static str {
        COMPRESSED_SECONDARY_CACHE_NAME
    }

    fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        let stored = self.encode(value)?;
        let charge = stored.len();
        self.cache.insert(key, stored, charge, Priority::Low)
    }

    /// A hit is removed from this tier since the caller promotes it
    fn lookup(&self, key: &[u8]) -> Option<Bytes> {
        let handle = self.cache.lookup(key)?;
        let stored = handle.value().clone();
        handle.release();
        self.cache.erase(key);

        match self.decode(&stored) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key_len = key.len(), "dropping unreadable secondary cache entry: {}", e);
                None
            }
        }
    }

    fn erase(&self, key: &[u8]) {
        self.cache.erase(key);
    }

    fn capacity(&self) -> usize {
        self.cache.capacity()
    }

    fn usage(&self) -> usize {
        self.cache.usage()
    }
}

impl std::fmt::Debug for CompressedSecondaryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressedSecondaryCache")
            .field("options", &self.options)
            .field("usage", &self.cache.usage())
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn secondary(
        compression_type: CompressionType,
        version: u32,
        split: bool,
    ) -> CompressedSecondaryCache {
        CompressedSecondaryCache::new(&CompressedSecondaryCacheOptions {
            capacity: 1 << 20,
            num_shard_bits: 1,
            compression_type,
            compress_format_version: version,
            enable_custom_split_merge: split,
        })
        .unwrap()
    }

    fn block(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 17) as u8).collect()
    }

    #[test]
    fn test_roundtrip_all_variants() {
        let values = [block(0), block(5), block(300), block(40_000)];
        for compression_type in CompressionType::available() {
            for version in [1, 2] {
                for split in [false, true] {
                    let cache = secondary(compression_type, version, split);
                    for (i, value) in values.iter().enumerate() {
                        let key = format!("k{}", i);
                        cache.insert(key.as_bytes(), value).unwrap();
                        let restored = cache.lookup(key.as_bytes()).unwrap();
                        assert_eq!(
                            restored.as_ref(),
                            value.as_slice(),
                            "{} v{} split={} len={}",
                            compression_type,
                            version,
                            split,
                            value.len()
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_compression_reduces_usage() {
        let cache = secondary(CompressionType::Lz4, 2, false);
        let value = block(8192);
        cache.insert(b"k", &value).unwrap();
        assert!(cache.usage() < value.len());
    }

    #[test]
    fn test_incompressible_stored_raw() {
        let cache = secondary(CompressionType::Lz4, 2, false);
        let stored = cache.encode(b"abc").unwrap();
        assert_eq!(stored[0], CompressionType::None.tag());
        assert_eq!(stored.len(), HEADER_LEN + 3);
        assert_eq!(cache.decode(&stored).unwrap().as_ref(), b"abc");
    }

    #[test]
    fn test_lookup_removes_entry() {
        let cache = secondary(CompressionType::Lz4, 2, false);
        cache.insert(b"k", &block(1000)).unwrap();
        assert!(cache.lookup(b"k").is_some());
        assert!(cache.lookup(b"k").is_none());
        assert_eq!(cache.usage(), 0);
    }

    #[test]
    fn test_split_chunks_follow_bins() {
        let payload = block(16384 + 300 + 50);
        let chunks = split_chunks(&payload);
        let sizes: Vec<usize> = chunks.iter().map(|c| c.len()).collect();
        assert_eq!(sizes, vec![16384, 256, 94]);

        let mut framed = Vec::new();
        for chunk in &chunks {
            framed.extend_from_slice(&(chunk.len() as u32).to_le_bytes());
            framed.extend_from_slice(chunk);
        }
        assert_eq!(merge_chunks(&framed).unwrap(), payload);

        assert!(split_chunks(&[]).is_empty());
        assert_eq!(split_chunks(&block(100)).len(), 1);
    }

    #[test]
    fn test_version_mismatch_fails_closed() {
        let writer = secondary(CompressionType::Lz4, 1, false);
        let reader = secondary(CompressionType::Lz4, 2, false);

        let stored = writer.encode(&block(4096)).unwrap();
        assert_matches!(reader.decode(&stored), Err(Error::Corruption(_)));
    }

    #[test]
    fn test_corrupt_entries_fail_closed() {
        let cache = secondary(CompressionType::Lz4, 2, true);
        let stored = cache.encode(&block(4096)).unwrap();

        // Truncated header
        assert!(cache.decode(&stored[..4]).is_err());

        // Unknown compression tag
        let mut bad_tag = stored.to_vec();
        bad_tag[0] = 0x7f;
        assert_matches!(cache.decode(&bad_tag), Err(Error::Corruption(_)));

        // Unknown flag bits
        let mut bad_flags = stored.to_vec();
        bad_flags[5] |= 0x80;
        assert_matches!(cache.decode(&bad_flags), Err(Error::Corruption(_)));

        // Truncated chunk
        assert!(cache.decode(&stored[..stored.len() - 1]).is_err());

        // Wrong raw length
        let mut bad_len = stored.to_vec();
        bad_len[6] = bad_len[6].wrapping_add(1);
        assert!(cache.decode(&bad_len).is_err());
    }

    #[test]
    fn test_corrupt_entry_is_a_miss() {
        let cache = secondary(CompressionType::Lz4, 2, false);
        cache
            .cache
            .insert(b"k", Bytes::from_static(b"\x01\x02"), 2, Priority::Low)
            .unwrap();
        assert!(cache.lookup(b"k").is_none());
        assert!(!cache.cache.contains(b"k"));
    }

    #[test]
    fn test_rejects_when_over_capacity() {
        let cache = CompressedSecondaryCache::new(&CompressedSecondaryCacheOptions {
            capacity: 64,
            num_shard_bits: 0,
            compression_type: CompressionType::None,
            ..Default::default()
        })
        .unwrap();
        assert_matches!(
            cache.insert(b"k", &block(100)),
            Err(Error::MemoryLimitExceeded { .. })
        );
        assert!(cache.lookup(b"k").is_none());
    }
}
