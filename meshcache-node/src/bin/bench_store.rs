//! # Store Workload Driver
//!
//! Purpose: Drive the cache store with a reproducible mixed read/write
//! workload so throughput changes show up between revisions.
//!
//! ## Design Principles
//! 1. **One Mixed Loop**: Reads and writes interleave under a configurable
//!    read ratio, which is closer to cache traffic than separate passes.
//! 2. **Reproducible**: A seeded SplitMix64 picks keys and operations, so
//!    two runs on the same build touch the same sequence.
//! 3. **Same Surface As Production**: The driver goes through `CacheStore`
//!    with TTLs and stats, exactly as the node façade does.
//!
//! Usage: `bench_store [entries] [ops] [value_bytes] [read_percent]`

use std::env;
use std::hint::black_box;
use std::sync::Arc;
use std::time::{Duration, Instant};

use meshcache_common::{CacheConfig, CacheResult, EvictionPolicy, ReplicationMode};
use meshcache_store::CacheStore;

const CACHE: &str = "bench";
const ORIGIN: &str = "bench-node";
const SEED: u64 = 0x6D65_7368_6361_6368;

struct Workload {
    entries: usize,
    ops: usize,
    value_bytes: usize,
    read_percent: u64,
}

impl Workload {
    fn from_args() -> Self {
        let args: Vec<String> = env::args().skip(1).collect();
        let numeric = |position: usize, fallback: usize| {
            args.get(position)
                .and_then(|raw| raw.parse().ok())
                .unwrap_or(fallback)
        };
        Workload {
            entries: numeric(0, 50_000).max(1),
            ops: numeric(1, 1_000_000),
            value_bytes: numeric(2, 256),
            read_percent: numeric(3, 90).min(100) as u64,
        }
    }
}

/// SplitMix64; small enough to inline and stable across platforms.
struct SplitMix64 {
    seed: u64,
}

impl SplitMix64 {
    fn new(seed: u64) -> Self {
        SplitMix64 { seed }
    }

    fn next(&mut self) -> u64 {
        self.seed = self.seed.wrapping_add(0x9E37_79B9_7F4A_7C15);
        let mut mixed = self.seed;
        mixed = (mixed ^ (mixed >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        mixed = (mixed ^ (mixed >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        mixed ^ (mixed >> 31)
    }
}

fn main() {
    if let Err(err) = run() {
        eprintln!("bench_store failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> CacheResult<()> {
    let workload = Workload::from_args();
    let store = CacheStore::new();
    store.configure(
        CACHE,
        CacheConfig {
            ttl: Duration::from_secs(3_600),
            eviction_policy: EvictionPolicy::Lru,
            max_entries: workload.entries * 2,
            memory_cap_bytes: u64::MAX / 2,
            replication_mode: ReplicationMode::None,
        },
    )?;

    let keys: Vec<String> = (0..workload.entries)
        .map(|index| format!("entry/{index}"))
        .collect();
    let payload: Arc<[u8]> = Arc::from(vec![0x42u8; workload.value_bytes]);

    let warm_started = Instant::now();
    for key in &keys {
        store.put(CACHE, key.clone(), Arc::clone(&payload), None, ORIGIN);
    }
    println!(
        "warmed {} entries ({} byte values) in {:.3}s",
        keys.len(),
        workload.value_bytes,
        warm_started.elapsed().as_secs_f64()
    );

    let mut rng = SplitMix64::new(SEED);
    let mut reads = 0u64;
    let mut writes = 0u64;
    let run_started = Instant::now();
    for _ in 0..workload.ops {
        let key = &keys[(rng.next() as usize) % keys.len()];
        if rng.next() % 100 < workload.read_percent {
            black_box(store.get(CACHE, key));
            reads += 1;
        } else {
            store.put(CACHE, key.clone(), Arc::clone(&payload), None, ORIGIN);
            writes += 1;
        }
    }
    let elapsed = run_started.elapsed().as_secs_f64();

    println!(
        "mixed: {} ops ({reads} reads / {writes} writes) in {elapsed:.3}s = {:.0} ops/s",
        workload.ops,
        workload.ops as f64 / elapsed
    );
    let snapshot = store.stats(CACHE);
    println!(
        "store: size={} memory={}B hits={} misses={} evictions={}",
        snapshot.size,
        snapshot.estimated_memory_bytes,
        snapshot.hits,
        snapshot.misses,
        snapshot.evictions
    );

    Ok(())
}
