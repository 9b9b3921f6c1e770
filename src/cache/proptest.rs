//! Property-Based Tests for the Cache
//!
//! # Test Properties
//!
//! 1. **Capacity Split**: shard capacities always sum to the total
//! 2. **Strict Limit**: usage never exceeds capacity at rest
//! 3. **Pin Safety**: a pinned value is unchanged until released
//! 4. **Owner Ids**: no id is granted twice while held
//! 5. **Secondary Roundtrip**: insert then lookup restores the original bytes

#![cfg(test)]

use std::collections::HashSet;

use bytes::Bytes;
use proptest::prelude::*;

use super::compressed::CompressedSecondaryCache;
use super::compression::CompressionType;
use super::config::{CacheOptions, CompressedSecondaryCacheOptions};
use super::entry::Priority;
use super::owner_id::{OwnerId, OwnerIdAllocator};
use super::secondary::SecondaryCache;
use super::sharded::{split_capacity, ShardedCache};

// =============================================================================
// Property Strategies
// =============================================================================

#[derive(Debug, Clone)]
enum Op {
    Insert { key: u8, charge: usize, high: bool },
    Lookup { key: u8, hold: bool },
    Erase { key: u8 },
    ReleaseAll,
    SetCapacity { capacity: usize },
}

fn op_strategy() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0u8..24, 1usize..400, any::<bool>())
            .prop_map(|(key, charge, high)| Op::Insert { key, charge, high }),
        3 => (0u8..24, any::<bool>()).prop_map(|(key, hold)| Op::Lookup { key, hold }),
        1 => (0u8..24).prop_map(|key| Op::Erase { key }),
        1 => Just(Op::ReleaseAll),
        1 => (200usize..3000).prop_map(|capacity| Op::SetCapacity { capacity }),
    ]
}

fn compression_strategy() -> impl Strategy<Value = CompressionType> {
    prop_oneof![Just(CompressionType::None), Just(CompressionType::Lz4)]
}

/// Mostly repetitive data so LZ4 actually compresses some inputs
fn value_strategy() -> impl Strategy<Value = Vec<u8>> {
    prop_oneof![
        prop::collection::vec(any::<u8>(), 0..5000),
        (any::<u8>(), 0usize..20_000).prop_map(|(byte, len)| vec![byte; len]),
    ]
}

// =============================================================================
// Properties
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(100))]

    #[test]
    fn prop_capacity_split_is_exact(capacity in 0usize..10_000_000, bits in 0u32..10) {
        let shards = split_capacity(capacity, 1 << bits);
        prop_assert_eq!(shards.len(), 1usize << bits);
        prop_assert_eq!(shards.iter().sum::<usize>(), capacity);

        let max = shards.iter().max().copied().unwrap_or(0);
        let min = shards.iter().min().copied().unwrap_or(0);
        prop_assert!(max - min <= 1);
    }

    #[test]
    fn prop_strict_limit_holds_at_rest(
        bits in 0i32..3,
        ops in prop::collection::vec(op_strategy(), 1..200),
    ) {
        let cache = ShardedCache::new(&CacheOptions {
            capacity: 2000,
            num_shard_bits: bits,
            strict_capacity_limit: true,
            ..Default::default()
        }).unwrap();
        let mut held = Vec::new();

        for op in ops {
            match op {
                Op::Insert { key, charge, high } => {
                    let priority = if high { Priority::High } else { Priority::Low };
                    let _ = cache.insert(&[key], Bytes::from(vec![key; 4]), charge, priority);
                }
                Op::Lookup { key, hold } => {
                    if let Some(handle) = cache.lookup(&[key]) {
                        prop_assert_eq!(handle.value().as_ref(), &[key; 4][..]);
                        if hold {
                            held.push(handle);
                        }
                    }
                }
                Op::Erase { key } => {
                    cache.erase(&[key]);
                }
                Op::ReleaseAll => held.clear(),
                Op::SetCapacity { capacity } => {
                    // Shrinking below pinned usage is the one sanctioned overflow
                    cache.set_capacity(capacity);
                }
            }

            for (share, usage) in cache
                .shard_capacities()
                .into_iter()
                .zip(cache.stats().shard_usage)
            {
                if held.is_empty() {
                    prop_assert!(usage <= share, "usage {} > capacity {}", usage, share);
                }
            }
        }

        held.clear();
        prop_assert_eq!(cache.pinned_usage(), 0);
        prop_assert!(cache.usage() <= cache.capacity());
    }

    #[test]
    fn prop_pinned_value_is_stable(
        ops in prop::collection::vec(op_strategy(), 1..100),
    ) {
        let cache = ShardedCache::new(&CacheOptions {
            capacity: 1500,
            num_shard_bits: 0,
            ..Default::default()
        }).unwrap();
        cache.insert(b"pinned", Bytes::from_static(b"original"), 100, Priority::Low).unwrap();
        let pinned = cache.lookup(b"pinned").unwrap();

        for op in ops {
            match op {
                Op::Insert { key, charge, .. } => {
                    let _ = cache.insert(&[key], Bytes::from(vec![key; 2]), charge, Priority::Low);
                    let _ = cache.insert(b"pinned", Bytes::from_static(b"replaced"), charge, Priority::Low);
                }
                Op::Erase { .. } => {
                    cache.erase(b"pinned");
                }
                Op::SetCapacity { capacity } => cache.set_capacity(capacity),
                _ => {}
            }
            prop_assert_eq!(pinned.value().as_ref(), b"original");
        }
        drop(pinned);
        prop_assert_eq!(cache.pinned_usage(), 0);
    }

    #[test]
    fn prop_owner_ids_unique_while_held(
        steps in prop::collection::vec(any::<(bool, u8)>(), 1..300),
    ) {
        let allocator = OwnerIdAllocator::with_limits(64, 8);
        let mut live: Vec<OwnerId> = Vec::new();

        for (allocate, pick) in steps {
            if allocate || live.is_empty() {
                match allocator.allocate() {
                    Ok(id) => {
                        prop_assert!(!live.contains(&id), "id {} granted twice", id);
                        live.push(id);
                    }
                    Err(_) => prop_assert!(allocator.free_list_len() == 0),
                }
            } else {
                let mut id = live.swap_remove(pick as usize % live.len());
                allocator.free(&mut id);
            }
        }

        let unique: HashSet<_> = live.iter().collect();
        prop_assert_eq!(unique.len(), live.len());
    }

    #[test]
    fn prop_secondary_roundtrip(
        value in value_strategy(),
        compression_type in compression_strategy(),
        version in 1u32..=2,
        split in any::<bool>(),
    ) {
        let cache = CompressedSecondaryCache::new(&CompressedSecondaryCacheOptions {
            capacity: 1 << 20,
            num_shard_bits: 0,
            compression_type,
            compress_format_version: version,
            enable_custom_split_merge: split,
        }).unwrap();

        cache.insert(b"key", &value).unwrap();
        let restored = cache.lookup(b"key").unwrap();
        prop_assert_eq!(restored.as_ref(), value.as_slice());
    }
}
