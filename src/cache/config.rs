//! Cache Configuration
//!
//! Turns configuration text into typed option structs, then constructs the
//! cache they describe. Parsing is pure; construction validates again, so
//! options built in code or deserialized with serde get the same checks.
//!
//! # Grammar
//!
//! ```text
//! primary:    "<size>"                        e.g. "1048576", "64M"
//!             "<key>=<value>;<key>=<value>"   capacity, num_shard_bits,
//!                                             strict_capacity_limit,
//!                                             high_pri_pool_ratio,
//!                                             low_pri_pool_ratio
//! secondary:  "compressed_secondary_cache://<key>=<value>;..."
//!             "<registered name>[://<args>]"
//! ```

use std::collections::HashSet;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use super::compressed::{CompressedSecondaryCache, COMPRESSED_SECONDARY_CACHE_SCHEME};
use super::compression::{validate_format_version, CompressionType};
use super::secondary::{SecondaryCache, SecondaryCacheRegistry};
use super::sharded::ShardedCache;
use crate::error::{Error, Result};

/// Largest accepted `num_shard_bits`
pub const MAX_NUM_SHARD_BITS: i32 = 19;

/// Target shard size when `num_shard_bits` is left automatic
pub const MIN_SHARD_SIZE: usize = 512 * 1024;

/// Upper bound on automatically chosen shard bits
pub const MAX_DEFAULT_SHARD_BITS: u32 = 6;

/// Default primary cache capacity (8MB)
pub const DEFAULT_CACHE_CAPACITY: usize = 8 * 1024 * 1024;

/// Default High pool share
pub const DEFAULT_HIGH_PRI_POOL_RATIO: f64 = 0.5;

/// Shard bits for a capacity: one shard per [`MIN_SHARD_SIZE`], capped
pub fn default_shard_bits(capacity: usize) -> u32 {
    let mut num_shards = capacity / MIN_SHARD_SIZE;
    let mut bits = 0;
    while num_shards > 1 && bits < MAX_DEFAULT_SHARD_BITS {
        num_shards >>= 1;
        bits += 1;
    }
    bits
}

// =============================================================================
// Primitive Parsers
// =============================================================================

/// Parse a byte size with an optional K/M/G/T suffix (powers of 1024)
pub fn parse_size(value: &str) -> Result<usize> {
    let trimmed = value.trim();
    let (digits, shift) = match trimmed.chars().last() {
        Some('k' | 'K') => (&trimmed[..trimmed.len() - 1], 10),
        Some('m' | 'M') => (&trimmed[..trimmed.len() - 1], 20),
        Some('g' | 'G') => (&trimmed[..trimmed.len() - 1], 30),
        Some('t' | 'T') => (&trimmed[..trimmed.len() - 1], 40),
        _ => (trimmed, 0),
    };

    let base: u64 = digits
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("invalid size '{}'", value)))?;
    let bytes = base
        .checked_mul(1u64 << shift)
        .ok_or_else(|| Error::invalid(format!("size '{}' overflows", value)))?;
    usize::try_from(bytes).map_err(|_| Error::invalid(format!("size '{}' overflows", value)))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" => Ok(true),
        "false" | "0" => Ok(false),
        _ => Err(Error::invalid(format!("invalid boolean for {}: '{}'", key, value))),
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| Error::invalid(format!("invalid value for {}: '{}'", key, value)))
}

/// Split `k=v;k=v` into pairs, rejecting malformed and duplicate keys
pub fn parse_key_values(text: &str) -> Result<Vec<(String, String)>> {
    let mut seen = HashSet::new();
    let mut pairs = Vec::new();

    for piece in text.split(';') {
        let piece = piece.trim();
        if piece.is_empty() {
            continue;
        }
        let (key, value) = piece
            .split_once('=')
            .ok_or_else(|| Error::invalid(format!("expected key=value, found '{}'", piece)))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(Error::invalid(format!("missing key in '{}'", piece)));
        }
        if !seen.insert(key.to_string()) {
            return Err(Error::invalid(format!("duplicate option '{}'", key)));
        }
        pairs.push((key.to_string(), value.trim().to_string()));
    }
    Ok(pairs)
}

fn validate_shard_bits(num_shard_bits: i32) -> Result<()> {
    if num_shard_bits > MAX_NUM_SHARD_BITS {
        return Err(Error::invalid(format!(
            "num_shard_bits {} exceeds {}",
            num_shard_bits, MAX_NUM_SHARD_BITS
        )));
    }
    if num_shard_bits < -1 {
        return Err(Error::invalid(format!(
            "num_shard_bits {} is negative",
            num_shard_bits
        )));
    }
    Ok(())
}

#[cfg(not(feature = "lite"))]
fn ensure_struct_parsing(_what: &str, _text: &str) -> Result<()> {
    Ok(())
}

#[cfg(feature = "lite")]
fn ensure_struct_parsing(what: &str, text: &str) -> Result<()> {
    Err(Error::not_supported(format!(
        "Cannot load {} in lite mode: {}",
        what, text
    )))
}

// =============================================================================
// Primary Cache Options
// =============================================================================

/// Options for a [`ShardedCache`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheOptions {
    /// Total capacity in bytes
    pub capacity: usize,
    /// log2 of the shard count; -1 picks one from the capacity
    pub num_shard_bits: i32,
    /// Reject inserts that cannot fit after eviction
    pub strict_capacity_limit: bool,
    /// Share of each shard reserved for the High pool
    pub high_pri_pool_ratio: f64,
    /// Share of each shard for the Low pool; the remainder is Low too
    pub low_pri_pool_ratio: f64,
}

impl Default for CacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            num_shard_bits: -1,
            strict_capacity_limit: false,
            high_pri_pool_ratio: DEFAULT_HIGH_PRI_POOL_RATIO,
            low_pri_pool_ratio: 0.0,
        }
    }
}

impl CacheOptions {
    /// Default-shaped options for a capacity
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            ..Default::default()
        }
    }

    /// Parse a plain size or a `key=value;...` list
    pub fn from_config_str(text: &str) -> Result<Self> {
        if !text.contains('=') {
            return Ok(Self::with_capacity(parse_size(text)?));
        }
        ensure_struct_parsing("cache", text)?;

        let mut options = Self::default();
        for (key, value) in parse_key_values(text)? {
            match key.as_str() {
                "capacity" => options.capacity = parse_size(&value)?,
                "num_shard_bits" => options.num_shard_bits = parse_number(&key, &value)?,
                "strict_capacity_limit" => {
                    options.strict_capacity_limit = parse_bool(&key, &value)?
                }
                "high_pri_pool_ratio" => options.high_pri_pool_ratio = parse_number(&key, &value)?,
                "low_pri_pool_ratio" => options.low_pri_pool_ratio = parse_number(&key, &value)?,
                _ => return Err(Error::invalid(format!("unknown cache option '{}'", key))),
            }
        }
        options.validate()?;
        Ok(options)
    }

    /// Check pool ratios: each within [0, 1], summing to at most 1
    pub fn validate_ratios(high: f64, low: f64) -> Result<()> {
        for (name, ratio) in [("high_pri_pool_ratio", high), ("low_pri_pool_ratio", low)] {
            if !(0.0..=1.0).contains(&ratio) {
                return Err(Error::invalid(format!(
                    "{} must be within [0, 1], found {}",
                    name, ratio
                )));
            }
        }
        if high + low > 1.0 {
            return Err(Error::invalid(format!(
                "high_pri_pool_ratio + low_pri_pool_ratio = {} exceeds 1.0",
                high + low
            )));
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        validate_shard_bits(self.num_shard_bits)?;
        Self::validate_ratios(self.high_pri_pool_ratio, self.low_pri_pool_ratio)
    }

    /// Shard bits after resolving the automatic setting
    pub fn resolved_num_shard_bits(&self) -> u32 {
        if self.num_shard_bits < 0 {
            default_shard_bits(self.capacity)
        } else {
            self.num_shard_bits as u32
        }
    }
}

// =============================================================================
// Compressed Secondary Cache Options
// =============================================================================

/// Options for a [`CompressedSecondaryCache`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressedSecondaryCacheOptions {
    /// Capacity of the secondary tier in bytes (after compression)
    pub capacity: usize,
    /// log2 of the inner cache's shard count; -1 picks one from the capacity
    pub num_shard_bits: i32,
    /// Codec for stored payloads
    pub compression_type: CompressionType,
    /// Payload format version
    pub compress_format_version: u32,
    /// Store payloads as size-class chunks instead of one buffer
    pub enable_custom_split_merge: bool,
}

impl Default for CompressedSecondaryCacheOptions {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_CACHE_CAPACITY,
            num_shard_bits: -1,
            compression_type: CompressionType::Lz4,
            compress_format_version: 2,
            enable_custom_split_merge: false,
        }
    }
}

impl CompressedSecondaryCacheOptions {
    /// Parse a `key=value;...` list (without the scheme prefix)
    pub fn from_config_str(text: &str) -> Result<Self> {
        ensure_struct_parsing("compressed secondary cache", text)?;

        let mut options = Self::default();
        for (key, value) in parse_key_values(text)? {
            match key.as_str() {
                "capacity" => options.capacity = parse_size(&value)?,
                "num_shard_bits" => options.num_shard_bits = parse_number(&key, &value)?,
                "compression_type" => options.compression_type = value.parse()?,
                "compress_format_version" => {
                    options.compress_format_version = parse_number(&key, &value)?
                }
                "enable_custom_split_merge" => {
                    options.enable_custom_split_merge = parse_bool(&key, &value)?
                }
                _ => {
                    return Err(Error::invalid(format!(
                        "unknown compressed secondary cache option '{}'",
                        key
                    )))
                }
            }
        }
        options.validate()?;
        Ok(options)
    }

    pub fn validate(&self) -> Result<()> {
        validate_shard_bits(self.num_shard_bits)?;
        validate_format_version(self.compress_format_version)
    }
}

// =============================================================================
// Construction
// =============================================================================

/// Build a primary cache from configuration text
pub fn new_cache_from_string(text: &str) -> Result<Arc<ShardedCache>> {
    let options = CacheOptions::from_config_str(text)?;
    let cache = ShardedCache::new(&options)?;
    info!(
        capacity = options.capacity,
        num_shards = cache.num_shards(),
        "cache configured from '{}'",
        text
    );
    Ok(Arc::new(cache))
}

/// Build a primary cache from configuration text, backed by `secondary`
pub fn new_cache_with_secondary(
    text: &str,
    secondary: Arc<dyn SecondaryCache>,
) -> Result<Arc<ShardedCache>> {
    let options = CacheOptions::from_config_str(text)?;
    Ok(Arc::new(ShardedCache::with_secondary(
        &options,
        Some(secondary),
    )?))
}

/// Build a secondary cache from configuration text using the global registry
pub fn new_secondary_cache_from_string(text: &str) -> Result<Arc<dyn SecondaryCache>> {
    if let Some(args) = text.strip_prefix(COMPRESSED_SECONDARY_CACHE_SCHEME) {
        let options = CompressedSecondaryCacheOptions::from_config_str(args)?;
        let cache = CompressedSecondaryCache::new(&options)?;
        info!(
            capacity = options.capacity,
            compression = %options.compression_type,
            "secondary cache configured from '{}'",
            text
        );
        return Ok(Arc::new(cache));
    }

    ensure_struct_parsing("secondary cache", text)?;
    SecondaryCacheRegistry::global().read().create(text)
}

// =============================================================================
// Tests
// =============================================================================
