//! # Memory Accounting
//!
//! The store holds serializer output, so the footprint of an entry is known
//! exactly: a fixed bookkeeping overhead plus the key and payload lengths.
//! The estimate is monotone in true usage and never negative.

/// Fixed bookkeeping overhead charged per entry.
pub const ENTRY_OVERHEAD: usize = 64;

/// Fraction of the cache evicted when the memory cap is reached.
pub const MEMORY_EVICTION_FRACTION: f64 = 0.1;

/// Bytes charged against the memory cap for one entry.
pub fn entry_footprint(key: &str, value_len: usize) -> u64 {
    (ENTRY_OVERHEAD + key.len() + value_len) as u64
}

/// Number of entries to evict when the memory cap is reached.
pub fn memory_eviction_batch(size: usize) -> usize {
    ((size as f64) * MEMORY_EVICTION_FRACTION).ceil() as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn footprint_is_monotone_in_key_and_value() {
        let base = entry_footprint("k", 10);
        assert!(entry_footprint("key", 10) > base);
        assert!(entry_footprint("k", 100) > base);
    }

    #[test]
    fn footprint_is_never_below_overhead() {
        assert_eq!(entry_footprint("", 0), ENTRY_OVERHEAD as u64);
    }

    #[test]
    fn eviction_batch_rounds_up() {
        assert_eq!(memory_eviction_batch(0), 0);
        assert_eq!(memory_eviction_batch(1), 1);
        assert_eq!(memory_eviction_batch(10), 1);
        assert_eq!(memory_eviction_batch(11), 2);
        assert_eq!(memory_eviction_batch(100), 10);
    }
}
