//! Cache Entry Types
//!
//! Resident entries live in a per-shard slab and are addressed by slot
//! index. Recency lists link slots through `prev`/`next` indices.

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use super::owner_id::OwnerId;

/// Sentinel slot index meaning "no link"
pub(crate) const NIL: usize = usize::MAX;

/// Eviction priority of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Priority {
    /// Resists eviction; lives in the high-priority pool
    High,
    /// Evicted first
    #[default]
    Low,
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Low => write!(f, "low"),
        }
    }
}

/// Which recency list an entry is currently linked into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Pool {
    High,
    Low,
}

/// Fast non-cryptographic hash of key bytes (FxHash algorithm)
#[inline]
pub fn hash_key(bytes: &[u8]) -> u64 {
    const SEED: u64 = 0x517cc1b727220a95;
    let mut hash = SEED;
    for &byte in bytes {
        hash = hash.rotate_left(5) ^ (byte as u64);
        hash = hash.wrapping_mul(SEED);
    }
    // Fold the high bits down so the low shard-selection bits see them.
    hash ^ (hash >> 32)
}

/// A resident cache entry
#[derive(Debug)]
pub(crate) struct CacheEntry {
    pub key: Bytes,
    pub value: Bytes,
    pub charge: usize,
    pub priority: Priority,
    pub owner_id: OwnerId,
    /// Outstanding pins
    pub refs: u32,
    /// Present in the shard's key table
    pub in_cache: bool,
    /// Looked up at least once since insertion
    pub has_hit: bool,
    /// Recency list membership (only when unpinned and in cache)
    pub pool: Option<Pool>,
    pub prev: usize,
    pub next: usize,
}

impl CacheEntry {
    pub fn new(key: Bytes, value: Bytes, charge: usize, priority: Priority, owner_id: OwnerId) -> Self {
        Self {
            key,
            value,
            charge,
            priority,
            owner_id,
            refs: 0,
            in_cache: true,
            has_hit: false,
            pool: None,
            prev: NIL,
            next: NIL,
        }
    }

    /// Eligible for a recency list: resident and not pinned
    #[inline]
    pub fn is_evictable(&self) -> bool {
        self.in_cache && self.refs == 0
    }
}

/// Slab of entries addressed by stable slot index
#[derive(Debug, Default)]
pub(crate) struct EntrySlab {
    slots: Vec<Option<CacheEntry>>,
    free: Vec<usize>,
    live: usize,
}

impl EntrySlab {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store an entry, returning its slot
    pub fn insert(&mut self, entry: CacheEntry) -> usize {
        self.live += 1;
        match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = Some(entry);
                slot
            }
            None => {
                self.slots.push(Some(entry));
                self.slots.len() - 1
            }
        }
    }

    /// Reclaim a slot, returning the entry stored there
    pub fn remove(&mut self, slot: usize) -> Option<CacheEntry> {
        let entry = self.slots.get_mut(slot)?.take()?;
        self.free.push(slot);
        self.live -= 1;
        Some(entry)
    }

    #[inline]
    pub fn get(&self, slot: usize) -> Option<&CacheEntry> {
        self.slots.get(slot).and_then(|s| s.as_ref())
    }

    #[inline]
    pub fn get_mut(&mut self, slot: usize) -> Option<&mut CacheEntry> {
        self.slots.get_mut(slot).and_then(|s| s.as_mut())
    }

    /// Number of live entries, including erased-but-pinned ones
    pub fn live(&self) -> usize {
        self.live
    }
}

// =============================================================================
// Tests
// =============================================================================
