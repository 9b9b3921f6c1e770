//! Two-Tier Block Cache
//!
//! Capacity-bounded, sharded key to blob cache with priority pools, pinning,
//! per-owner accounting and an optional compressed secondary tier.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                           ShardedCache                                    │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  hash(key) & mask ──► EvictionShard[0..2^bits]     OwnerIdAllocator       │
//! │                       ┌───────────────────────┐                          │
//! │                       │ table  slab  High│Low │                          │
//! │                       └───────────────────────┘                          │
//! │         miss │                     ▲          │ evict                    │
//! │              ▼                     │ promote  ▼                          │
//! │  ┌────────────────────────────────────────────────────────────────────┐  │
//! │  │ SecondaryCache (CompressedSecondaryCache: inner ShardedCache + LZ4) │  │
//! │  └────────────────────────────────────────────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Design Principles
//!
//! - One lock per shard, held only for table and list mutation
//! - Pinned entries are never evicted; erased entries are reclaimed on last release
//! - Compression and secondary-tier work run outside shard locks

pub mod compressed;
pub mod compression;
pub mod config;
mod entry;
pub mod metrics;
pub mod owner_id;
#[cfg(test)]
mod proptest;
pub mod secondary;
mod shard;
mod sharded;

pub use compressed::{
    CompressedSecondaryCache, COMPRESSED_SECONDARY_CACHE_NAME, COMPRESSED_SECONDARY_CACHE_SCHEME,
};
pub use compression::{CompressionType, Compressor, Lz4Compressor, NoopCompressor};
pub use config::{
    new_cache_from_string, new_cache_with_secondary, new_secondary_cache_from_string,
    parse_size, CacheOptions, CompressedSecondaryCacheOptions,
};
pub use entry::{hash_key, Priority};
pub use metrics::CacheStatsSnapshot;
pub use owner_id::{OwnerId, OwnerIdAllocator, UNKNOWN_OWNER_ID};
pub use secondary::{SecondaryCache, SecondaryCacheFactory, SecondaryCacheRegistry};
pub use shard::{CacheHandle, EvictionShard};
pub use sharded::{split_capacity, ShardedCache};
