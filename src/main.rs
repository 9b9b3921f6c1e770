//! cache_bench
//!
//! Builds a cache from a configuration string and drives a multi-threaded
//! synthetic block workload against it, then reports hit ratio, evictions
//! and secondary-tier traffic.
//!
//! ```text
//! cache_bench --cache "capacity=64M;num_shard_bits=4" \
//!             --secondary-cache "compressed_secondary_cache://capacity=32M" \
//!             --threads 8 --ops-per-thread 200000
//! ```

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::Parser;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::cache::{
    new_cache_from_string, new_cache_with_secondary, new_secondary_cache_from_string,
    CacheStatsSnapshot, OwnerId, Priority, ShardedCache,
};

// =============================================================================
// CLI Arguments
// =============================================================================

/// Synthetic workload driver for the block cache
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Primary cache configuration ("<size>" or "key=value;...")
    #[arg(long, env = "CACHE_CONFIG", default_value = "capacity=64M;num_shard_bits=4")]
    cache: String,

    /// Secondary cache configuration
    #[arg(long, env = "SECONDARY_CACHE_CONFIG")]
    secondary_cache: Option<String>,

    /// Worker threads
    #[arg(long, env = "BENCH_THREADS", default_value = "4")]
    threads: usize,

    /// Operations per worker thread
    #[arg(long, default_value = "100000")]
    ops_per_thread: u64,

    /// Number of distinct keys
    #[arg(long, default_value = "100000")]
    key_space: u64,

    /// Bytes per value
    #[arg(long, default_value = "4096")]
    value_size: usize,

    /// Percentage of operations that are lookups (misses insert)
    #[arg(long, default_value = "90")]
    lookup_percent: u64,

    /// Percentage of operations that are erases
    #[arg(long, default_value = "1")]
    erase_percent: u64,

    /// Number of owners to spread inserts over
    #[arg(long, default_value = "4")]
    owners: usize,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    json_logs: bool,

    /// Print the final statistics as JSON
    #[arg(long)]
    json_report: bool,
}

// =============================================================================
// Main
// =============================================================================

fn main() -> Result<()> {
    let args = Args::parse();
    init_logging(&args);

    let cache = build_cache(&args)?;
    info!(
        capacity = cache.capacity(),
        shards = cache.num_shards(),
        lite = tiercache::is_lite(),
        secondary = ?cache.secondary_cache().map(|s| s.name()),
        "starting workload"
    );

    let owners: Vec<OwnerId> = (0..args.owners.max(1))
        .map(|_| cache.get_next_item_owner_id())
        .collect();

    let start = Instant::now();
    crossbeam::thread::scope(|scope| {
        for worker in 0..args.threads.max(1) {
            let cache = Arc::clone(&cache);
            let owners = &owners;
            let args = &args;
            scope.spawn(move |_| run_worker(worker as u64, &cache, owners, args));
        }
    })
    .map_err(|_| anyhow::anyhow!("worker thread panicked"))?;
    let elapsed = start.elapsed();

    let stats = cache.stats();
    report(&args, &cache, &owners, &stats, elapsed)?;

    let mut owners = owners;
    for owner in owners.iter_mut() {
        cache.discard_item_owner_id(owner);
    }
    Ok(())
}

fn build_cache(args: &Args) -> Result<Arc<ShardedCache>> {
    match &args.secondary_cache {
        Some(text) => {
            let secondary = new_secondary_cache_from_string(text)
                .with_context(|| format!("invalid secondary cache config '{}'", text))?;
            new_cache_with_secondary(&args.cache, secondary)
                .with_context(|| format!("invalid cache config '{}'", args.cache))
        }
        None => new_cache_from_string(&args.cache)
            .with_context(|| format!("invalid cache config '{}'", args.cache)),
    }
}

/// xorshift64* step; the workload only needs a cheap, seeded sequence
fn next_random(state: &mut u64) -> u64 {
    *state ^= *state >> 12;
    *state ^= *state << 25;
    *state ^= *state >> 27;
    state.wrapping_mul(0x2545_f491_4f6c_dd1d)
}

fn run_worker(worker: u64, cache: &ShardedCache, owners: &[OwnerId], args: &Args) {
    let mut rng = 0x9e37_79b9_7f4a_7c15 ^ (worker + 1).wrapping_mul(0xbf58_476d_1ce4_e5b9);
    let value = Bytes::from(
        (0..args.value_size)
            .map(|i| (i % 251) as u8)
            .collect::<Vec<u8>>(),
    );
    let key_space = args.key_space.max(1);

    for _ in 0..args.ops_per_thread {
        let roll = next_random(&mut rng) % 100;
        // Square the draw to skew toward low keys, giving a hot set
        let draw = next_random(&mut rng) % key_space;
        let key_id = draw * draw / key_space;
        let key = key_id.to_le_bytes();

        if roll < args.erase_percent {
            cache.erase(&key);
        } else if roll < args.erase_percent + args.lookup_percent {
            match cache.lookup(&key) {
                Some(handle) => cache.release(handle),
                None => insert(cache, &key, key_id, &value, owners),
            }
        } else {
            insert(cache, &key, key_id, &value, owners);
        }
    }
}

fn insert(cache: &ShardedCache, key: &[u8], key_id: u64, value: &Bytes, owners: &[OwnerId]) {
    let priority = if key_id % 10 == 0 {
        Priority::High
    } else {
        Priority::Low
    };
    let owner = owners[(key_id as usize) % owners.len()];
    // Rejection under strict capacity limit is an expected outcome here
    let _ = cache.insert_for_owner(key, value.clone(), value.len(), priority, owner);
}

fn report(
    args: &Args,
    cache: &ShardedCache,
    owners: &[OwnerId],
    stats: &CacheStatsSnapshot,
    elapsed: Duration,
) -> Result<()> {
    let total_ops = args.ops_per_thread * args.threads.max(1) as u64;
    let ops_per_sec = total_ops as f64 / elapsed.as_secs_f64().max(f64::EPSILON);

    if args.json_report {
        println!("{}", serde_json::to_string_pretty(stats)?);
        return Ok(());
    }

    println!("operations        : {} in {:.2?} ({:.0} ops/sec)", total_ops, elapsed, ops_per_sec);
    println!("capacity / usage  : {} / {} ({:.1}%)", stats.capacity, stats.usage, stats.utilization() * 100.0);
    println!("entries           : {}", stats.entries);
    println!("hits / misses     : {} / {} (hit ratio {:.3})", stats.hits, stats.misses, stats.hit_ratio());
    println!("inserts / failed  : {} / {}", stats.inserts, stats.insert_failures);
    println!("evictions         : {}", stats.evictions);
    println!("secondary hits    : {} (misses {})", stats.secondary_hits, stats.secondary_misses);
    println!("demotions         : {}", stats.demotions);
    if let Some(secondary) = cache.secondary_cache() {
        println!("secondary usage   : {} / {}", secondary.usage(), secondary.capacity());
    }
    for owner in owners {
        println!("owner {:<5}       : {} bytes", owner, cache.owner_usage(*owner));
    }
    Ok(())
}

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env().add_directive(level.into());

    if args.json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
