//! In-memory sorted table absorbing writes before they reach disk.
//!
//! Backed by a crossbeam `SkipMap`, which keeps keys in lexicographic order
//! and supports concurrent readers, and paired with a Bloom filter so the
//! read path can skip the lookup entirely for most absent keys. Two
//! memtables exist at most: the active one accepting writes and a frozen
//! one awaiting flush. Freezing is a plain ownership move — the active
//! memtable (with its filter) is swapped out wholesale and parked in the
//! frozen slot, so there is no per-entry copying and no shared mutable
//! state between the slots.

use crossbeam_skiplist::SkipMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use super::bloom::BloomFilter;
use super::value::Value;

pub struct Memtable {
    data: SkipMap<Vec<u8>, Value>,
    filter: BloomFilter,
    size: AtomicUsize,
}

impl Memtable {
    pub fn new() -> Self {
        Self {
            data: SkipMap::new(),
            filter: BloomFilter::new(),
            size: AtomicUsize::new(0),
        }
    }

    /// Insert or update an entry. Size grows by |key| + |value| per insert;
    /// overwrites are not reclaimed, matching the flush-trigger accounting.
    pub fn put(&mut self, key: Vec<u8>, value: Value) {
        let entry_size = key.len() + value.len();
        self.filter.add(&key);
        self.data.insert(key, value);
        self.size.fetch_add(entry_size, Ordering::SeqCst);
    }

    pub fn get(&self, key: &[u8]) -> Option<Value> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Bloom probe. A `false` here proves the key was never inserted.
    pub fn filter_contains(&self, key: &[u8]) -> bool {
        self.filter.contains(key)
    }

    /// Accumulated |key| + |value| bytes.
    pub fn size(&self) -> usize {
        self.size.load(Ordering::SeqCst)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Visit all entries in key order. Used by the flusher, which relies on
    /// the ordering to emit a sorted run in a single pass.
    pub fn for_each(&self, mut f: impl FnMut(&[u8], &Value)) {
        for entry in self.data.iter() {
            f(entry.key(), entry.value());
        }
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new()
    }
}
