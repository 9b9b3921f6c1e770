//! Sharded Cache
//!
//! Routes every key to one [`EvictionShard`] by hash and exposes the public
//! cache contract. Owns the owner-id allocator and, optionally, a secondary
//! tier that is consulted on miss and fed with evicted entries.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, warn};

use super::config::CacheOptions;
use super::entry::{hash_key, Priority};
use super::metrics::CacheStatsSnapshot;
use super::owner_id::{OwnerId, OwnerIdAllocator, UNKNOWN_OWNER_ID};
use super::secondary::SecondaryCache;
use super::shard::{CacheHandle, EvictionShard, Probe};
use crate::error::Result;

/// Split `capacity` over `num_shards`, giving the remainder to the first shards
pub fn split_capacity(capacity: usize, num_shards: usize) -> Vec<usize> {
    let per_shard = capacity / num_shards;
    let remainder = capacity % num_shards;
    (0..num_shards)
        .map(|i| per_shard + usize::from(i < remainder))
        .collect()
}

/// Capacity-bounded, sharded key to blob cache
pub struct ShardedCache {
    shards: Vec<Arc<EvictionShard>>,
    num_shard_bits: u32,
    shard_mask: u64,
    /// Total capacity; the lock serializes capacity changes
    capacity: Mutex<usize>,
    strict_capacity_limit: AtomicBool,
    high_pri_pool_ratio: Mutex<f64>,
    low_pri_pool_ratio: f64,
    owner_ids: OwnerIdAllocator,
    secondary: Option<Arc<dyn SecondaryCache>>,
}

impl ShardedCache {
    /// Create a cache without a secondary tier
    pub fn new(options: &CacheOptions) -> Result<Self> {
        Self::with_secondary(options, None)
    }

    /// Create a cache, optionally backed by a secondary tier
    pub fn with_secondary(
        options: &CacheOptions,
        secondary: Option<Arc<dyn SecondaryCache>>,
    ) -> Result<Self> {
        options.validate()?;
        let num_shard_bits = options.resolved_num_shard_bits();
        let num_shards = 1usize << num_shard_bits;

        let shards = split_capacity(options.capacity, num_shards)
            .into_iter()
            .map(|capacity| {
                Arc::new(EvictionShard::with_secondary(
                    capacity,
                    options.strict_capacity_limit,
                    options.high_pri_pool_ratio,
                    secondary.clone(),
                ))
            })
            .collect();

        debug!(
            capacity = options.capacity,
            num_shard_bits,
            strict = options.strict_capacity_limit,
            secondary = secondary.as_ref().map(|s| s.name()),
            "created sharded cache"
        );

        Ok(Self {
            shards,
            num_shard_bits,
            shard_mask: (num_shards as u64) - 1,
            capacity: Mutex::new(options.capacity),
            strict_capacity_limit: AtomicBool::new(options.strict_capacity_limit),
            high_pri_pool_ratio: Mutex::new(options.high_pri_pool_ratio),
            low_pri_pool_ratio: options.low_pri_pool_ratio,
            owner_ids: OwnerIdAllocator::new(),
            secondary,
        })
    }

    #[inline]
    fn shard_index(&self, key: &[u8]) -> usize {
        (hash_key(key) & self.shard_mask) as usize
    }

    #[inline]
    fn shard_for(&self, key: &[u8]) -> &Arc<EvictionShard> {
        &self.shards[self.shard_index(key)]
    }

    // =========================================================================
    // Lookup / Insert / Erase
    // =========================================================================

    /// Look up a key, consulting the secondary tier on primary miss
    ///
    /// A secondary hit is promoted into the owning shard only if the shard's
    /// key table is unchanged since the primary miss, so an insert or erase
    /// that completed meanwhile is never undone. A value that became
    /// resident meanwhile is returned instead. If the shard rejects or skips
    /// the promotion, the caller still gets the value through a handle that
    /// is not resident in the cache.
    ///
    /// A promoted entry is charged its value length and belongs to no owner,
    /// so bytes an owner inserted stop counting toward its `owner_usage` once
    /// they pass through the secondary tier.
    pub fn lookup(&self, key: &[u8]) -> Option<CacheHandle> {
        let shard = self.shard_for(key);
        let generation = match shard.probe(key) {
            Probe::Hit(handle) => return Some(handle),
            Probe::Miss { generation } => generation,
        };

        let secondary = self.secondary.as_ref()?;
        let Some(value) = secondary.lookup(key) else {
            shard.metrics().record_secondary_miss();
            return None;
        };
        shard.metrics().record_secondary_hit();

        let key = Bytes::copy_from_slice(key);
        let charge = value.len();
        match shard.promote(key.clone(), value.clone(), charge, generation) {
            Ok(Some(handle)) => Some(handle),
            Ok(None) => Some(CacheHandle::detached(key, value, charge)),
            Err(e) => {
                debug!(charge, "secondary hit not promoted: {}", e);
                Some(CacheHandle::detached(key, value, charge))
            }
        }
    }

    /// Insert a value with no owner
    pub fn insert(&self, key: &[u8], value: Bytes, charge: usize, priority: Priority) -> Result<()> {
        self.insert_for_owner(key, value, charge, priority, UNKNOWN_OWNER_ID)
    }

    /// Insert a value whose bytes are attributed to `owner_id`
    pub fn insert_for_owner(
        &self,
        key: &[u8],
        value: Bytes,
        charge: usize,
        priority: Priority,
        owner_id: OwnerId,
    ) -> Result<()> {
        self.shard_for(key)
            .insert(
                Bytes::copy_from_slice(key),
                value,
                charge,
                priority,
                owner_id,
                false,
            )
            .map(|_| ())
    }

    /// Insert a value and return it pinned
    ///
    /// Without strict capacity limit the entry is admitted even when the
    /// shard is full; the overflow lasts until the handle is released.
    pub fn insert_pinned(
        &self,
        key: &[u8],
        value: Bytes,
        charge: usize,
        priority: Priority,
    ) -> Result<CacheHandle> {
        let key = Bytes::copy_from_slice(key);
        let shard = self.shard_for(&key);
        match shard.insert(key.clone(), value.clone(), charge, priority, UNKNOWN_OWNER_ID, true)? {
            Some(handle) => Ok(handle),
            None => Ok(CacheHandle::detached(key, value, charge)),
        }
    }

    /// Release a pinned handle
    pub fn release(&self, handle: CacheHandle) {
        handle.release();
    }

    /// Erase a key from both tiers; pinned storage survives until released
    pub fn erase(&self, key: &[u8]) -> bool {
        // Secondary first: a lookup that misses the primary after the shard
        // erase can then no longer find the key below
        if let Some(secondary) = &self.secondary {
            secondary.erase(key);
        }
        self.shard_for(key).erase(key)
    }

    /// Check residency in the primary tier without pinning
    pub fn contains(&self, key: &[u8]) -> bool {
        self.shard_for(key).contains(key)
    }

    /// Drop every unpinned entry from the primary tier
    pub fn erase_unreferenced(&self) -> usize {
        self.shards.iter().map(|s| s.erase_unreferenced()).sum()
    }

    // =========================================================================
    // Owner Ids
    // =========================================================================

    /// Grant an owner id, or the unknown id when the space is exhausted
    pub fn get_next_item_owner_id(&self) -> OwnerId {
        match self.owner_ids.allocate() {
            Ok(id) => id,
            Err(e) => {
                warn!("owner id allocation failed: {}", e);
                UNKNOWN_OWNER_ID
            }
        }
    }

    /// Grant an owner id, reporting exhaustion as an error
    pub fn try_next_item_owner_id(&self) -> Result<OwnerId> {
        self.owner_ids.allocate()
    }

    /// Return an owner id; the caller's copy is reset to unknown
    pub fn discard_item_owner_id(&self, owner_id: &mut OwnerId) {
        self.owner_ids.free(owner_id);
    }

    /// Bytes currently charged to `owner_id` across all shards
    pub fn owner_usage(&self, owner_id: OwnerId) -> usize {
        self.shards.iter().map(|s| s.owner_usage(owner_id)).sum()
    }

    // =========================================================================
    // Capacity
    // =========================================================================

    /// Change total capacity, redistributing it over the shards
    pub fn set_capacity(&self, capacity: usize) {
        let mut total = self.capacity.lock();
        for (shard, share) in self
            .shards
            .iter()
            .zip(split_capacity(capacity, self.shards.len()))
        {
            shard.set_capacity(share);
        }
        debug!(old = *total, new = capacity, "cache capacity changed");
        *total = capacity;
    }

    pub fn set_strict_capacity_limit(&self, strict: bool) {
        self.strict_capacity_limit.store(strict, Ordering::Relaxed);
        for shard in &self.shards {
            shard.set_strict_capacity_limit(strict);
        }
    }

    /// Change the High pool share; must keep the pool ratios summing to at most 1
    pub fn set_high_pri_pool_ratio(&self, ratio: f64) -> Result<()> {
        CacheOptions::validate_ratios(ratio, self.low_pri_pool_ratio)?;
        let mut current = self.high_pri_pool_ratio.lock();
        for shard in &self.shards {
            shard.set_high_pri_pool_ratio(ratio);
        }
        *current = ratio;
        Ok(())
    }

    pub fn capacity(&self) -> usize {
        *self.capacity.lock()
    }

    pub fn strict_capacity_limit(&self) -> bool {
        self.strict_capacity_limit.load(Ordering::Relaxed)
    }

    pub fn high_pri_pool_ratio(&self) -> f64 {
        *self.high_pri_pool_ratio.lock()
    }

    pub fn low_pri_pool_ratio(&self) -> f64 {
        self.low_pri_pool_ratio
    }

    /// Bytes held by the primary tier, pinned entries included
    pub fn usage(&self) -> usize {
        self.shards.iter().map(|s| s.usage()).sum()
    }

    pub fn pinned_usage(&self) -> usize {
        self.shards.iter().map(|s| s.pinned_usage()).sum()
    }

    /// Number of resident entries
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.shards.iter().all(|s| s.is_empty())
    }

    pub fn num_shard_bits(&self) -> u32 {
        self.num_shard_bits
    }

    pub fn num_shards(&self) -> usize {
        self.shards.len()
    }

    /// Capacity of each shard, in shard order
    pub fn shard_capacities(&self) -> Vec<usize> {
        self.shards.iter().map(|s| s.capacity()).collect()
    }

    pub fn secondary_cache(&self) -> Option<&Arc<dyn SecondaryCache>> {
        self.secondary.as_ref()
    }

    /// Aggregate statistics across shards
    pub fn stats(&self) -> CacheStatsSnapshot {
        let mut snapshot = CacheStatsSnapshot {
            capacity: self.capacity(),
            ..Default::default()
        };
        for shard in &self.shards {
            shard.metrics().accumulate(&mut snapshot);
            let usage = shard.usage();
            snapshot.usage += usage;
            snapshot.pinned_usage += shard.pinned_usage();
            snapshot.entries += shard.len();
            snapshot.shard_usage.push(usage);
        }
        snapshot
    }
}

impl std::fmt::Debug for ShardedCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShardedCache")
            .field("capacity", &self.capacity())
            .field("num_shard_bits", &self.num_shard_bits)
            .field("strict_capacity_limit", &self.strict_capacity_limit())
            .field("secondary", &self.secondary.as_ref().map(|s| s.name()))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
