//! Bloom filters for skipping run probes.
//!
//! Every run (and each memtable) carries a filter over its keys. A negative
//! answer proves the key is absent, letting the read path skip the binary
//! search; a positive answer may be a false positive and falls through to
//! the actual lookup. Filters live only in memory: they are rebuilt from
//! run metadata at startup and discarded with their run.

use std::collections::hash_map::DefaultHasher;
use std::hash::Hasher;

/// Filter width in bits. Fixed; the filter is not resized online.
pub const FILTER_BITS: usize = 10_000;

/// Number of hash probes per key.
pub const FILTER_HASHES: u64 = 3;

/// A fixed-width Bloom filter keyed by byte strings.
///
/// Probe `i` for a key hashes to bit `(H(key) + i) mod FILTER_BITS`, where
/// `H` is a single 64-bit hash of the key bytes.
#[derive(Clone)]
pub struct BloomFilter {
    bits: Box<[u8]>,
}

impl BloomFilter {
    pub fn new() -> Self {
        Self {
            bits: vec![0u8; FILTER_BITS.div_ceil(8)].into_boxed_slice(),
        }
    }

    /// Insert a key into the filter.
    pub fn add(&mut self, key: &[u8]) {
        for i in 0..FILTER_HASHES {
            let bit = Self::bit_index(key, i);
            self.bits[bit / 8] |= 1 << (bit % 8);
        }
    }

    /// Check whether a key may be present. `false` means definitely absent.
    pub fn contains(&self, key: &[u8]) -> bool {
        (0..FILTER_HASHES).all(|i| {
            let bit = Self::bit_index(key, i);
            self.bits[bit / 8] & (1 << (bit % 8)) != 0
        })
    }

    /// Reset all bits.
    pub fn clear(&mut self) {
        self.bits.fill(0);
    }

    fn bit_index(key: &[u8], probe: u64) -> usize {
        let mut hasher = DefaultHasher::new();
        hasher.write(key);
        (hasher.finish().wrapping_add(probe) % FILTER_BITS as u64) as usize
    }
}

impl Default for BloomFilter {
    fn default() -> Self {
        Self::new()
    }
}
