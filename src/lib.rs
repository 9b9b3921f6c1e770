//! tiercache - Sharded Two-Tier Block Cache
//!
//! The block cache of an embedded storage engine: a capacity-bounded,
//! highly concurrent key to blob store that lets repeated reads of the same
//! block skip device I/O.
//!
//! # Architecture
//!
//! ```text
//! caller ─► ShardedCache ─► EvictionShard (High/Low LRU pools)
//!                │ miss            │ evict
//!                ▼                 ▼
//!          SecondaryCache ◄────────┘   (compressed, own capacity)
//! ```
//!
//! # Features
//!
//! - Lock-per-shard eviction with High/Low priority pools
//! - Pinned handles that survive erase and eviction
//! - Owner-id allocation for per-owner byte accounting
//! - Compressed secondary tier (LZ4) with fail-closed decoding
//! - Construction from configuration strings
//!
//! # Modules
//!
//! - [`cache`] - Cache engine, secondary tier and configuration
//! - [`error`] - Error types
//!
//! # Example
//!
//! ```
//! use bytes::Bytes;
//! use tiercache::cache::{new_cache_from_string, Priority};
//!
//! let cache = new_cache_from_string("capacity=4096;num_shard_bits=1").unwrap();
//! cache.insert(b"block-1", Bytes::from_static(b"data"), 4, Priority::Low).unwrap();
//!
//! let handle = cache.lookup(b"block-1").unwrap();
//! assert_eq!(handle.value().as_ref(), b"data");
//! cache.release(handle);
//! ```

pub mod cache;
pub mod error;

// Re-export commonly used types
pub use cache::{
    CacheHandle, CacheOptions, CompressedSecondaryCache, CompressedSecondaryCacheOptions,
    CompressionType, OwnerId, Priority, SecondaryCache, ShardedCache,
};
pub use error::{Error, Result};

/// Returns true when built with the restricted `lite` profile
pub fn is_lite() -> bool {
    cfg!(feature = "lite")
}
