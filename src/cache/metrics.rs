//! Cache Metrics Collection
//!
//! Per-shard counters, aggregated into snapshots by the sharded cache.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Counters kept by one eviction shard
#[derive(Debug, Default)]
pub struct ShardMetrics {
    hits: AtomicU64,
    misses: AtomicU64,
    inserts: AtomicU64,
    insert_failures: AtomicU64,
    evictions: AtomicU64,
    secondary_hits: AtomicU64,
    secondary_misses: AtomicU64,
    demotions: AtomicU64,
}

impl ShardMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert(&self) {
        self.inserts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_insert_failure(&self) {
        self.insert_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_evictions(&self, count: u64) {
        self.evictions.fetch_add(count, Ordering::Relaxed);
    }

    pub fn record_secondary_hit(&self) {
        self.secondary_hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_secondary_miss(&self) {
        self.secondary_misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_demotion(&self) {
        self.demotions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Add this shard's counters into an aggregate snapshot
    pub(crate) fn accumulate(&self, snapshot: &mut CacheStatsSnapshot) {
        snapshot.hits += self.hits();
        snapshot.misses += self.misses();
        snapshot.inserts += self.inserts.load(Ordering::Relaxed);
        snapshot.insert_failures += self.insert_failures.load(Ordering::Relaxed);
        snapshot.evictions += self.evictions();
        snapshot.secondary_hits += self.secondary_hits.load(Ordering::Relaxed);
        snapshot.secondary_misses += self.secondary_misses.load(Ordering::Relaxed);
        snapshot.demotions += self.demotions.load(Ordering::Relaxed);
    }
}

/// Point-in-time view of a sharded cache
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheStatsSnapshot {
    pub capacity: usize,
    pub usage: usize,
    pub pinned_usage: usize,
    pub entries: usize,
    pub hits: u64,
    pub misses: u64,
    pub inserts: u64,
    pub insert_failures: u64,
    pub evictions: u64,
    pub secondary_hits: u64,
    pub secondary_misses: u64,
    pub demotions: u64,
    /// Usage of each shard, in shard order
    pub shard_usage: Vec<usize>,
}

impl CacheStatsSnapshot {
    /// Primary tier hit ratio (0.0 - 1.0)
    pub fn hit_ratio(&self) -> f64 {
        let hits = self.hits as f64;
        let total = hits + self.misses as f64;
        if total == 0.0 {
            0.0
        } else {
            hits / total
        }
    }

    /// Utilization (0.0 - 1.0), may exceed 1.0 during pinned overflow
    pub fn utilization(&self) -> f64 {
        if self.capacity == 0 {
            0.0
        } else {
            self.usage as f64 / self.capacity as f64
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accumulate() {
        let a = ShardMetrics::new();
        let b = ShardMetrics::new();
        a.record_hit();
        a.record_hit();
        b.record_miss();
        b.record_evictions(3);
        b.record_demotion();

        let mut snapshot = CacheStatsSnapshot::default();
        a.accumulate(&mut snapshot);
        b.accumulate(&mut snapshot);

        assert_eq!(snapshot.hits, 2);
        assert_eq!(snapshot.misses, 1);
        assert_eq!(snapshot.evictions, 3);
        assert_eq!(snapshot.demotions, 1);
        assert!((snapshot.hit_ratio() - 2.0 / 3.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_ratios() {
        let snapshot = CacheStatsSnapshot::default();
        assert_eq!(snapshot.hit_ratio(), 0.0);
        assert_eq!(snapshot.utilization(), 0.0);
    }
}
