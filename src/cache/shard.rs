//! Eviction Shard
//!
//! One lock-isolated slice of the keyspace with its own capacity budget.
//!
//! # Design
//!
//! - Entries live in a slab; the key table and recency lists hold slot indices
//! - Two recency lists: High (protected pool) and Low, most recent at the head
//! - Pinned entries are unlinked from both lists, so they are never evicted
//! - Eviction takes the Low tail first, then the High tail
//! - An unpinned entry that was hit, or was inserted as High, returns to the
//!   head of High; High overflow spills its tail into the head of Low
//! - Evicted entries are offered to the secondary tier after the lock drops

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::debug;

use super::entry::{CacheEntry, EntrySlab, Pool, Priority, NIL};
use super::metrics::ShardMetrics;
use super::owner_id::{OwnerId, UNKNOWN_OWNER_ID};
use super::secondary::SecondaryCache;
use crate::error::{Error, Result};

/// Doubly-linked recency list threaded through the slab
#[derive(Debug, Clone, Copy)]
struct RecencyList {
    head: usize,
    tail: usize,
    len: usize,
}

impl RecencyList {
    const fn new() -> Self {
        Self {
            head: NIL,
            tail: NIL,
            len: 0,
        }
    }
}

/// Outcome of a primary lookup
pub(crate) enum Probe {
    Hit(CacheHandle),
    /// Key absent; `generation` identifies the key table state at the miss
    Miss { generation: u64 },
}

/// An entry waiting to be admitted
struct Admission {
    key: Bytes,
    value: Bytes,
    charge: usize,
    priority: Priority,
    owner_id: OwnerId,
    pin: bool,
}

/// Mutable state guarded by the shard lock
struct ShardState {
    table: HashMap<Bytes, usize>,
    slab: EntrySlab,
    high: RecencyList,
    low: RecencyList,
    capacity: usize,
    usage: usize,
    pinned_usage: usize,
    high_pool_usage: usize,
    high_pool_capacity: usize,
    high_pri_pool_ratio: f64,
    strict_capacity_limit: bool,
    owner_usage: HashMap<OwnerId, usize>,
    /// Bumped by every insert into and erase from the key table
    generation: u64,
}

impl ShardState {
    fn new(capacity: usize, strict_capacity_limit: bool, high_pri_pool_ratio: f64) -> Self {
        let mut state = Self {
            table: HashMap::new(),
            slab: EntrySlab::new(),
            high: RecencyList::new(),
            low: RecencyList::new(),
            capacity,
            usage: 0,
            pinned_usage: 0,
            high_pool_usage: 0,
            high_pool_capacity: 0,
            high_pri_pool_ratio,
            strict_capacity_limit,
            owner_usage: HashMap::new(),
            generation: 0,
        };
        state.recompute_pools();
        state
    }

    fn recompute_pools(&mut self) {
        self.high_pool_capacity = (self.capacity as f64 * self.high_pri_pool_ratio) as usize;
    }

    fn low_pool_capacity(&self) -> usize {
        self.capacity - self.high_pool_capacity
    }

    fn list_mut(&mut self, pool: Pool) -> &mut RecencyList {
        match pool {
            Pool::High => &mut self.high,
            Pool::Low => &mut self.low,
        }
    }

    /// Link an unpinned, resident entry at the head of its pool
    fn lru_insert(&mut self, slot: usize) {
        let use_high = self.high_pri_pool_ratio > 0.0;
        let Some(entry) = self.slab.get(slot) else {
            return;
        };
        debug_assert!(entry.is_evictable());
        let pool = if use_high && (entry.priority == Priority::High || entry.has_hit) {
            Pool::High
        } else {
            Pool::Low
        };
        let charge = entry.charge;

        self.push_front(pool, slot);
        if pool == Pool::High {
            self.high_pool_usage += charge;
            self.maintain_pool_size();
        }
    }

    /// Unlink an entry from whichever list holds it
    fn lru_remove(&mut self, slot: usize) {
        let Some(entry) = self.slab.get(slot) else {
            return;
        };
        let Some(pool) = entry.pool else {
            return;
        };
        let (prev, next, charge) = (entry.prev, entry.next, entry.charge);

        if prev != NIL {
            if let Some(p) = self.slab.get_mut(prev) {
                p.next = next;
            }
        }
        if next != NIL {
            if let Some(n) = self.slab.get_mut(next) {
                n.prev = prev;
            }
        }

        let list = self.list_mut(pool);
        if list.head == slot {
            list.head = next;
        }
        if list.tail == slot {
            list.tail = prev;
        }
        list.len -= 1;

        if let Some(entry) = self.slab.get_mut(slot) {
            entry.pool = None;
            entry.prev = NIL;
            entry.next = NIL;
        }
        if pool == Pool::High {
            self.high_pool_usage -= charge;
        }
    }

    fn push_front(&mut self, pool: Pool, slot: usize) {
        let old_head = self.list_mut(pool).head;
        if let Some(entry) = self.slab.get_mut(slot) {
            entry.pool = Some(pool);
            entry.prev = NIL;
            entry.next = old_head;
        }
        if old_head != NIL {
            if let Some(h) = self.slab.get_mut(old_head) {
                h.prev = slot;
            }
        }
        let list = self.list_mut(pool);
        list.head = slot;
        if list.tail == NIL {
            list.tail = slot;
        }
        list.len += 1;
    }

    /// Spill the High tail into Low until High fits its budget
    fn maintain_pool_size(&mut self) {
        while self.high_pool_usage > self.high_pool_capacity {
            let tail = self.high.tail;
            if tail == NIL {
                break;
            }
            self.lru_remove(tail);
            self.push_front(Pool::Low, tail);
        }
    }

    /// Reclaim a slot and release its charge
    fn free_entry(&mut self, slot: usize) -> Option<CacheEntry> {
        let entry = self.slab.remove(slot)?;
        self.usage -= entry.charge;
        if let Some(owned) = self.owner_usage.get_mut(&entry.owner_id) {
            *owned -= entry.charge;
            if *owned == 0 {
                self.owner_usage.remove(&entry.owner_id);
            }
        }
        Some(entry)
    }

    /// Evict unpinned entries, Low tail first, until `charge` more bytes fit
    fn evict_from_lru(&mut self, charge: usize, evicted: &mut Vec<CacheEntry>) {
        while self.usage.saturating_add(charge) > self.capacity {
            let victim = if self.low.tail != NIL {
                self.low.tail
            } else if self.high.tail != NIL {
                self.high.tail
            } else {
                break;
            };

            self.lru_remove(victim);
            if let Some(entry) = self.slab.get_mut(victim) {
                entry.in_cache = false;
                let key = entry.key.clone();
                self.table.remove(&key);
            }
            if let Some(entry) = self.free_entry(victim) {
                evicted.push(entry);
            }
        }
    }

    /// Pin an entry, unlinking it from the recency lists on the first pin
    fn pin(&mut self, slot: usize) {
        let Some(entry) = self.slab.get(slot) else {
            return;
        };
        let first_pin = entry.refs == 0;
        let charge = entry.charge;
        if first_pin {
            self.lru_remove(slot);
            self.pinned_usage += charge;
        }
        if let Some(entry) = self.slab.get_mut(slot) {
            entry.refs += 1;
        }
    }

    /// Mark a resident entry as erased, reclaiming it if unpinned
    fn detach(&mut self, slot: usize) -> Option<CacheEntry> {
        let entry = self.slab.get_mut(slot)?;
        entry.in_cache = false;
        if entry.refs > 0 {
            return None;
        }
        self.lru_remove(slot);
        self.free_entry(slot)
    }
}

/// One independent, lock-isolated slice of the cache
pub struct EvictionShard {
    state: Mutex<ShardState>,
    metrics: ShardMetrics,
    secondary: Option<Arc<dyn SecondaryCache>>,
}

impl EvictionShard {
    /// Create a shard without a demotion target
    pub fn new(capacity: usize, strict_capacity_limit: bool, high_pri_pool_ratio: f64) -> Self {
        Self::with_secondary(capacity, strict_capacity_limit, high_pri_pool_ratio, None)
    }

    /// Create a shard that demotes evicted entries into `secondary`
    pub fn with_secondary(
        capacity: usize,
        strict_capacity_limit: bool,
        high_pri_pool_ratio: f64,
        secondary: Option<Arc<dyn SecondaryCache>>,
    ) -> Self {
        Self {
            state: Mutex::new(ShardState::new(
                capacity,
                strict_capacity_limit,
                high_pri_pool_ratio,
            )),
            metrics: ShardMetrics::new(),
            secondary,
        }
    }

    /// Look up a key, pinning the entry on hit
    pub fn lookup(self: &Arc<Self>, key: &[u8]) -> Option<CacheHandle> {
        match self.probe(key) {
            Probe::Hit(handle) => Some(handle),
            Probe::Miss { .. } => None,
        }
    }

    /// Look up a key; a miss reports the generation to hand to [`promote`](Self::promote)
    pub(crate) fn probe(self: &Arc<Self>, key: &[u8]) -> Probe {
        let probe = {
            let mut state = self.state.lock();
            match state.table.get(key).copied() {
                Some(slot) => {
                    state.pin(slot);
                    match state.slab.get_mut(slot) {
                        Some(entry) => {
                            entry.has_hit = true;
                            Probe::Hit(CacheHandle::pinned(Arc::clone(self), slot, entry))
                        }
                        None => Probe::Miss {
                            generation: state.generation,
                        },
                    }
                }
                None => Probe::Miss {
                    generation: state.generation,
                },
            }
        };

        match &probe {
            Probe::Hit(_) => self.metrics.record_hit(),
            Probe::Miss { .. } => self.metrics.record_miss(),
        }
        probe
    }

    /// Check whether a key is resident without pinning it
    pub fn contains(&self, key: &[u8]) -> bool {
        self.state.lock().table.contains_key(key)
    }

    /// Insert an entry, optionally returning it pinned
    ///
    /// Returns `MemoryLimitExceeded` when strict capacity limit is on and
    /// eviction cannot make room. Without strict limit, a pinned insert is
    /// admitted over capacity, while an unpinned one that cannot fit is
    /// dropped immediately.
    pub fn insert(
        self: &Arc<Self>,
        key: Bytes,
        value: Bytes,
        charge: usize,
        priority: Priority,
        owner_id: OwnerId,
        pin: bool,
    ) -> Result<Option<CacheHandle>> {
        let mut evicted = Vec::new();
        let mut replaced = None;

        let result = {
            let mut state = self.state.lock();
            self.admit(
                &mut state,
                Admission {
                    key,
                    value,
                    charge,
                    priority,
                    owner_id,
                    pin,
                },
                &mut evicted,
                &mut replaced,
            )
        };

        match &result {
            Ok(_) => self.metrics.record_insert(),
            Err(_) => self.metrics.record_insert_failure(),
        }
        drop(replaced);
        self.demote(evicted);
        result
    }

    /// Install a value fetched from the secondary tier, returned pinned
    ///
    /// A key that became resident since the miss is pinned and returned
    /// instead. Returns `Ok(None)` without installing when the key table
    /// changed since `generation`, so a newer insert or a completed erase is
    /// never overwritten by the older secondary copy.
    pub(crate) fn promote(
        self: &Arc<Self>,
        key: Bytes,
        value: Bytes,
        charge: usize,
        generation: u64,
    ) -> Result<Option<CacheHandle>> {
        let mut evicted = Vec::new();
        let mut replaced = None;

        let result = {
            let mut state = self.state.lock();
            if let Some(slot) = state.table.get(&key).copied() {
                state.pin(slot);
                return Ok(state.slab.get_mut(slot).map(|entry| {
                    entry.has_hit = true;
                    CacheHandle::pinned(Arc::clone(self), slot, entry)
                }));
            }
            if state.generation != generation {
                debug!(charge, "secondary hit not promoted: key changed since miss");
                return Ok(None);
            }
            self.admit(
                &mut state,
                Admission {
                    key,
                    value,
                    charge,
                    priority: Priority::Low,
                    owner_id: UNKNOWN_OWNER_ID,
                    pin: true,
                },
                &mut evicted,
                &mut replaced,
            )
        };

        match &result {
            Ok(_) => self.metrics.record_insert(),
            Err(_) => self.metrics.record_insert_failure(),
        }
        drop(replaced);
        self.demote(evicted);
        result
    }

    /// Admission rules shared by insert and promotion; runs under the lock
    fn admit(
        self: &Arc<Self>,
        state: &mut ShardState,
        admission: Admission,
        evicted: &mut Vec<CacheEntry>,
        replaced: &mut Option<CacheEntry>,
    ) -> Result<Option<CacheHandle>> {
        let Admission {
            key,
            value,
            charge,
            priority,
            owner_id,
            pin,
        } = admission;
        state.evict_from_lru(charge, evicted);

        let Some(new_usage) = state.usage.checked_add(charge) else {
            return Err(Error::MemoryLimitExceeded {
                charge,
                capacity: state.capacity,
            });
        };
        let fits = new_usage <= state.capacity;
        if !fits && state.strict_capacity_limit {
            return Err(Error::MemoryLimitExceeded {
                charge,
                capacity: state.capacity,
            });
        }
        if !fits && !pin {
            debug!(charge, capacity = state.capacity, "entry dropped on insert: over capacity");
            return Ok(None);
        }

        let entry = CacheEntry::new(key.clone(), value, charge, priority, owner_id);
        let slot = state.slab.insert(entry);
        state.usage = new_usage;
        *state.owner_usage.entry(owner_id).or_insert(0) += charge;
        state.generation = state.generation.wrapping_add(1);

        if let Some(old_slot) = state.table.insert(key, slot) {
            *replaced = state.detach(old_slot);
        }

        if pin {
            state.pin(slot);
            Ok(state
                .slab
                .get(slot)
                .map(|entry| CacheHandle::pinned(Arc::clone(self), slot, entry)))
        } else {
            state.lru_insert(slot);
            Ok(None)
        }
    }

    /// Remove a key from the table; storage survives while pinned
    pub fn erase(&self, key: &[u8]) -> bool {
        let freed = {
            let mut state = self.state.lock();
            state.generation = state.generation.wrapping_add(1);
            match state.table.remove(key) {
                Some(slot) => Some(state.detach(slot)),
                None => None,
            }
        };
        freed.is_some()
    }

    /// Drop every resident entry that is not pinned
    pub fn erase_unreferenced(&self) -> usize {
        let mut freed = Vec::new();
        {
            let mut state = self.state.lock();
            state.generation = state.generation.wrapping_add(1);
            for pool in [Pool::Low, Pool::High] {
                loop {
                    let tail = match pool {
                        Pool::Low => state.low.tail,
                        Pool::High => state.high.tail,
                    };
                    if tail == NIL {
                        break;
                    }
                    state.lru_remove(tail);
                    if let Some(key) = state.slab.get(tail).map(|e| e.key.clone()) {
                        state.table.remove(&key);
                    }
                    if let Some(entry) = state.free_entry(tail) {
                        freed.push(entry);
                    }
                }
            }
        }
        freed.len()
    }

    /// Drop one pin; the last pin reclaims erased or overflowing entries
    fn release_slot(&self, slot: usize) {
        let mut evicted = Vec::new();
        let mut dropped = None;
        {
            let mut state = self.state.lock();
            let Some(entry) = state.slab.get_mut(slot) else {
                return;
            };
            debug_assert!(entry.refs > 0);
            entry.refs -= 1;
            if entry.refs > 0 {
                return;
            }
            let (charge, in_cache, key) = (entry.charge, entry.in_cache, entry.key.clone());
            state.pinned_usage -= charge;

            if !in_cache {
                dropped = state.free_entry(slot);
            } else if state.usage > state.capacity {
                state.table.remove(&key);
                if let Some(entry) = state.slab.get_mut(slot) {
                    entry.in_cache = false;
                }
                if let Some(entry) = state.free_entry(slot) {
                    evicted.push(entry);
                }
            } else {
                state.lru_insert(slot);
            }
        }
        drop(dropped);
        self.demote(evicted);
    }

    /// Offer evicted entries to the secondary tier; failures are absorbed
    fn demote(&self, evicted: Vec<CacheEntry>) {
        if evicted.is_empty() {
            return;
        }
        self.metrics.record_evictions(evicted.len() as u64);

        let Some(secondary) = &self.secondary else {
            return;
        };
        for entry in evicted {
            match secondary.insert(&entry.key, &entry.value) {
                Ok(()) => self.metrics.record_demotion(),
                Err(e) => debug!(
                    secondary = secondary.name(),
                    charge = entry.charge,
                    "demotion to secondary cache failed: {}",
                    e
                ),
            }
        }
    }

    /// Change the capacity, evicting down to it
    pub fn set_capacity(&self, capacity: usize) {
        let mut evicted = Vec::new();
        {
            let mut state = self.state.lock();
            state.capacity = capacity;
            state.recompute_pools();
            state.maintain_pool_size();
            state.evict_from_lru(0, &mut evicted);
        }
        self.demote(evicted);
    }

    pub fn set_strict_capacity_limit(&self, strict: bool) {
        self.state.lock().strict_capacity_limit = strict;
    }

    /// Change the share of capacity reserved for the High pool
    pub fn set_high_pri_pool_ratio(&self, ratio: f64) {
        let mut state = self.state.lock();
        state.high_pri_pool_ratio = ratio;
        state.recompute_pools();
        state.maintain_pool_size();
    }

    pub fn capacity(&self) -> usize {
        self.state.lock().capacity
    }

    pub fn usage(&self) -> usize {
        self.state.lock().usage
    }

    pub fn pinned_usage(&self) -> usize {
        self.state.lock().pinned_usage
    }

    /// Budgets of the (High, Low) pools
    pub fn pool_capacities(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.high_pool_capacity, state.low_pool_capacity())
    }

    pub fn high_pool_usage(&self) -> usize {
        self.state.lock().high_pool_usage
    }

    /// Number of resident (non-erased) entries
    pub fn len(&self) -> usize {
        self.state.lock().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes charged to `owner_id`, including pinned entries
    pub fn owner_usage(&self, owner_id: OwnerId) -> usize {
        self.state
            .lock()
            .owner_usage
            .get(&owner_id)
            .copied()
            .unwrap_or(0)
    }

    pub fn metrics(&self) -> &ShardMetrics {
        &self.metrics
    }

    /// Number of entries still held in the slab (resident plus erased-but-pinned)
    pub(crate) fn live_entries(&self) -> usize {
        self.state.lock().slab.live()
    }

    #[cfg(test)]
    fn check_invariants(&self) {
        let state = self.state.lock();
        let mut listed = 0;
        let mut high_usage = 0;
        for (pool, list) in [(Pool::High, state.high), (Pool::Low, state.low)] {
            let mut cursor = list.head;
            let mut count = 0;
            while cursor != NIL {
                let entry = state.slab.get(cursor).expect("linked slot is live");
                assert_eq!(entry.pool, Some(pool));
                assert!(entry.is_evictable());
                if pool == Pool::High {
                    high_usage += entry.charge;
                }
                count += 1;
                cursor = entry.next;
            }
            assert_eq!(count, list.len);
            listed += count;
        }
        assert_eq!(high_usage, state.high_pool_usage);
        assert!(listed <= state.table.len());
    }
}

impl std::fmt::Debug for EvictionShard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("EvictionShard")
            .field("capacity", &state.capacity)
            .field("usage", &state.usage)
            .field("entries", &state.table.len())
            .finish()
    }
}

// =============================================================================
// Cache Handle
// =============================================================================

/// A pinned reference to a cache entry
///
/// The entry cannot be evicted or reclaimed while the handle is alive.
/// Dropping the handle releases the pin.
pub struct CacheHandle {
    shard: Option<Arc<EvictionShard>>,
    slot: usize,
    key: Bytes,
    value: Bytes,
    charge: usize,
    owner_id: OwnerId,
}

impl CacheHandle {
    fn pinned(shard: Arc<EvictionShard>, slot: usize, entry: &CacheEntry) -> Self {
        Self {
            shard: Some(shard),
            slot,
            key: entry.key.clone(),
            value: entry.value.clone(),
            charge: entry.charge,
            owner_id: entry.owner_id,
        }
    }

    /// A handle for a value that is not resident in any shard
    pub(crate) fn detached(key: Bytes, value: Bytes, charge: usize) -> Self {
        Self {
            shard: None,
            slot: NIL,
            key,
            value,
            charge,
            owner_id: UNKNOWN_OWNER_ID,
        }
    }

    pub fn key(&self) -> &[u8] {
        &self.key
    }

    pub fn value(&self) -> &Bytes {
        &self.value
    }

    pub fn charge(&self) -> usize {
        self.charge
    }

    pub fn owner_id(&self) -> OwnerId {
        self.owner_id
    }

    /// True when the value is held by the cache rather than only by this handle
    pub fn is_resident(&self) -> bool {
        self.shard.is_some()
    }

    /// Release the pin explicitly
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for CacheHandle {
    fn drop(&mut self) {
        if let Some(shard) = self.shard.take() {
            shard.release_slot(self.slot);
        }
    }
}

impl std::fmt::Debug for CacheHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheHandle")
            .field("key", &self.key)
            .field("charge", &self.charge)
            .field("resident", &self.is_resident())
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

    fn shard(capacity: usize, strict: bool, high_ratio: f64) -> Arc<EvictionShard> {
        Arc::new(EvictionShard::new(capacity, strict, high_ratio))
    }

    fn put(shard: &Arc<EvictionShard>, key: &str, charge: usize, priority: Priority) -> Result<()> {
        shard
            .insert(
                Bytes::copy_from_slice(key.as_bytes()),
                Bytes::copy_from_slice(key.as_bytes()),
                charge,
                priority,
                UNKNOWN_OWNER_ID,
                false,
            )
            .map(|_| ())
    }

    #[test]
    fn test_insert_lookup() {
        let s = shard(1000, false, 0.5);
        put(&s, "a", 100, Priority::Low).unwrap();

        let handle = s.lookup(b"a").unwrap();
        assert_eq!(handle.value().as_ref(), b"a");
        assert_eq!(handle.charge(), 100);
        assert_eq!(s.pinned_usage(), 100);
        handle.release();

        assert_eq!(s.pinned_usage(), 0);
        assert_eq!(s.usage(), 100);
        assert!(s.lookup(b"missing").is_none());
        assert_eq!(s.metrics().hits(), 1);
        assert_eq!(s.metrics().misses(), 1);
        s.check_invariants();
    }

    #[test]
    fn test_evicts_until_fit() {
        let s = shard(1000, true, 0.0);
        put(&s, "a", 600, Priority::Low).unwrap();
        put(&s, "b", 600, Priority::Low).unwrap();

        assert!(!s.contains(b"a"));
        assert!(s.contains(b"b"));
        assert_eq!(s.usage(), 600);
        assert_eq!(s.metrics().evictions(), 1);
        s.check_invariants();
    }

    #[test]
    fn test_strict_limit_rejects_when_pinned() {
        let s = shard(1000, true, 0.0);
        put(&s, "a", 600, Priority::Low).unwrap();
        let pinned = s.lookup(b"a").unwrap();

        let result = put(&s, "b", 600, Priority::Low);
        assert_matches!(
            result,
            Err(Error::MemoryLimitExceeded {
                charge: 600,
                capacity: 1000
            })
        );
        assert!(s.contains(b"a"));
        assert!(!s.contains(b"b"));
        assert!(s.usage() <= s.capacity());

        drop(pinned);
        put(&s, "b", 600, Priority::Low).unwrap();
        assert!(!s.contains(b"a"));
    }

    #[test]
    fn test_non_strict_unpinned_overflow_is_dropped() {
        let s = shard(100, false, 0.0);
        put(&s, "big", 500, Priority::Low).unwrap();
        assert!(!s.contains(b"big"));
        assert_eq!(s.usage(), 0);
    }

    #[test]
    fn test_non_strict_pinned_overflow_is_transient() {
        let s = shard(100, false, 0.0);
        let handle = s
            .insert(
                Bytes::from_static(b"big"),
                Bytes::from_static(b"payload"),
                500,
                Priority::Low,
                UNKNOWN_OWNER_ID,
                true,
            )
            .unwrap()
            .unwrap();
        assert_eq!(s.usage(), 500);
        assert_eq!(handle.value().as_ref(), b"payload");

        drop(handle);
        assert_eq!(s.usage(), 0);
        assert!(!s.contains(b"big"));
    }

    #[test]
    fn test_low_evicted_before_high() {
        let s = shard(300, false, 0.5);
        put(&s, "high", 100, Priority::High).unwrap();
        put(&s, "low1", 100, Priority::Low).unwrap();
        put(&s, "low2", 100, Priority::Low).unwrap();

        put(&s, "low3", 100, Priority::Low).unwrap();
        assert!(s.contains(b"high"));
        assert!(!s.contains(b"low1"));
        assert!(s.contains(b"low2"));
        s.check_invariants();
    }

    #[test]
    fn test_hit_promotes_into_high_pool() {
        let s = shard(400, false, 0.5);
        for key in ["a", "b", "c", "d"] {
            put(&s, key, 100, Priority::Low).unwrap();
        }
        assert_eq!(s.high_pool_usage(), 0);

        // "a" is the oldest; a hit protects it
        s.lookup(b"a").unwrap().release();
        assert_eq!(s.high_pool_usage(), 100);

        // A scan of new keys evicts the untouched entries first
        for key in ["e", "f", "g"] {
            put(&s, key, 100, Priority::Low).unwrap();
        }
        assert!(s.contains(b"a"));
        assert!(!s.contains(b"b"));
        assert!(!s.contains(b"c"));
        assert!(!s.contains(b"d"));
        s.check_invariants();
    }

    #[test]
    fn test_high_pool_overflow_spills_to_low() {
        let s = shard(1000, false, 0.2);
        put(&s, "a", 100, Priority::High).unwrap();
        put(&s, "b", 100, Priority::High).unwrap();
        put(&s, "c", 100, Priority::High).unwrap();

        assert_eq!(s.pool_capacities(), (200, 800));
        assert_eq!(s.high_pool_usage(), 200);
        s.check_invariants();
    }

    #[test]
    fn test_zero_high_ratio_uses_low_only() {
        let s = shard(1000, false, 0.0);
        put(&s, "a", 100, Priority::High).unwrap();
        s.lookup(b"a").unwrap().release();
        assert_eq!(s.high_pool_usage(), 0);
        s.check_invariants();
    }

    #[test]
    fn test_pinned_entry_never_evicted() {
        let s = shard(200, false, 0.0);
        put(&s, "a", 100, Priority::Low).unwrap();
        let pinned = s.lookup(b"a").unwrap();

        put(&s, "b", 100, Priority::Low).unwrap();
        put(&s, "c", 100, Priority::Low).unwrap();

        assert!(s.contains(b"a"));
        assert!(!s.contains(b"b"));
        assert!(s.contains(b"c"));
        drop(pinned);
        s.check_invariants();
    }

    #[test]
    fn test_erase_while_pinned() {
        let s = shard(1000, false, 0.5);
        put(&s, "a", 100, Priority::Low).unwrap();
        let handle = s.lookup(b"a").unwrap();

        assert!(s.erase(b"a"));
        assert!(!s.contains(b"a"));
        assert!(s.lookup(b"a").is_none());

        // Storage survives for the pinned caller
        assert_eq!(handle.value().as_ref(), b"a");
        assert_eq!(s.usage(), 100);
        assert_eq!(s.live_entries(), 1);

        drop(handle);
        assert_eq!(s.usage(), 0);
        assert_eq!(s.live_entries(), 0);
        assert!(!s.erase(b"a"));
    }

    #[test]
    fn test_replace_existing_key() {
        let s = shard(1000, false, 0.5);
        put(&s, "a", 100, Priority::Low).unwrap();
        let old = s.lookup(b"a").unwrap();

        s.insert(
            Bytes::from_static(b"a"),
            Bytes::from_static(b"new"),
            300,
            Priority::Low,
            UNKNOWN_OWNER_ID,
            false,
        )
        .unwrap();

        assert_eq!(old.value().as_ref(), b"a");
        assert_eq!(s.usage(), 400);
        drop(old);
        assert_eq!(s.usage(), 300);
        assert_eq!(s.lookup(b"a").unwrap().value().as_ref(), b"new");
        s.check_invariants();
    }

    #[test]
    fn test_set_capacity_evicts() {
        let s = shard(1000, false, 0.5);
        for i in 0..10 {
            put(&s, &format!("k{}", i), 100, Priority::Low).unwrap();
        }
        assert_eq!(s.usage(), 1000);

        s.set_capacity(500);
        assert_eq!(s.usage(), 500);
        assert_eq!(s.len(), 5);
        assert_eq!(s.pool_capacities(), (250, 250));
        s.check_invariants();
    }

    #[test]
    fn test_owner_usage() {
        let s = shard(1000, false, 0.5);
        s.insert(Bytes::from_static(b"a"), Bytes::new(), 100, Priority::Low, 7, false)
            .unwrap();
        s.insert(Bytes::from_static(b"b"), Bytes::new(), 50, Priority::Low, 7, false)
            .unwrap();
        s.insert(Bytes::from_static(b"c"), Bytes::new(), 30, Priority::Low, 9, false)
            .unwrap();

        assert_eq!(s.owner_usage(7), 150);
        assert_eq!(s.owner_usage(9), 30);

        s.erase(b"a");
        assert_eq!(s.owner_usage(7), 50);
        assert_eq!(s.owner_usage(42), 0);
    }

    #[test]
    fn test_erase_unreferenced() {
        let s = shard(1000, false, 0.5);
        put(&s, "a", 100, Priority::High).unwrap();
        put(&s, "b", 100, Priority::Low).unwrap();
        let pinned = s.lookup(b"b").unwrap();

        assert_eq!(s.erase_unreferenced(), 1);
        assert!(!s.contains(b"a"));
        assert!(s.contains(b"b"));
        drop(pinned);
        s.check_invariants();
    }

    #[test]
    fn test_multiple_pins() {
        let s = shard(1000, false, 0.5);
        put(&s, "a", 100, Priority::Low).unwrap();
        let h1 = s.lookup(b"a").unwrap();
        let h2 = s.lookup(b"a").unwrap();
        s.erase(b"a");

        drop(h1);
        assert_eq!(s.usage(), 100);
        drop(h2);
        assert_eq!(s.usage(), 0);
    }
}
