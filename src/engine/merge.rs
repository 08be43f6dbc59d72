//! K-way merge of sorted runs for compaction.
//!
//! All runs of a tier are scanned in lockstep and merged into a single
//! sorted stream. A min-heap holds the current entry of each source; ties
//! between sources holding the same key are broken toward the higher source
//! index, because within a tier, higher-numbered runs are newer. Once a key
//! has been emitted, the stale copies of that key surfacing from other
//! sources are consumed and skipped, so every source advances past an
//! emitted key and the output is strictly increasing.

use std::cmp::Ordering;
use std::collections::BinaryHeap;

use super::run::RunCursor;
use crate::error::Result;

struct HeapEntry {
    key: Vec<u8>,
    slot: Vec<u8>,
    source: usize,
}

impl PartialEq for HeapEntry {
    fn eq(&self, other: &Self) -> bool {
        self.key == other.key && self.source == other.source
    }
}

impl Eq for HeapEntry {}

impl PartialOrd for HeapEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for HeapEntry {
    fn cmp(&self, other: &Self) -> Ordering {
        // Reversed key order for min-heap behavior; on equal keys the
        // higher source index (newer run) must surface first.
        match self.key.cmp(&other.key) {
            Ordering::Equal => self.source.cmp(&other.source),
            other => other.reverse(),
        }
    }
}

/// Merges the entries of multiple run cursors into one sorted,
/// newest-wins stream of `(key, value slot)` pairs.
pub struct MergeIterator {
    sources: Vec<RunCursor>,
    heap: BinaryHeap<HeapEntry>,
    last_key: Option<Vec<u8>>,
}

impl MergeIterator {
    /// `sources` must be ordered oldest first (run 1 at index 0), matching
    /// the tier's run numbering.
    pub fn new(mut sources: Vec<RunCursor>) -> Result<Self> {
        let mut heap = BinaryHeap::new();
        for (source, cursor) in sources.iter_mut().enumerate() {
            if let Some((key, slot)) = cursor.next_entry()? {
                heap.push(HeapEntry { key, slot, source });
            }
        }
        Ok(Self {
            sources,
            heap,
            last_key: None,
        })
    }

    fn refill(&mut self, source: usize) -> Result<()> {
        if let Some((key, slot)) = self.sources[source].next_entry()? {
            self.heap.push(HeapEntry { key, slot, source });
        }
        Ok(())
    }

    fn next_merged(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        while let Some(entry) = self.heap.pop() {
            // A stale duplicate of the key just emitted; consume it so its
            // source advances, and move on.
            if self.last_key.as_deref() == Some(entry.key.as_slice()) {
                self.refill(entry.source)?;
                continue;
            }

            self.last_key = Some(entry.key.clone());
            self.refill(entry.source)?;
            return Ok(Some((entry.key, entry.slot)));
        }
        Ok(None)
    }
}

impl Iterator for MergeIterator {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_merged().transpose()
    }
}
