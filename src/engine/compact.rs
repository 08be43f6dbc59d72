//! Tiered compaction: merging all runs of one tier into a single run of
//! the next.
//!
//! When a tier accumulates `min_runs` runs, the compactor streams all of
//! them through a k-way merge (newest run wins on duplicate keys) and
//! writes one merged run into the next tier. If the next tier does not
//! exist yet, the source tier is currently the deepest and tombstones are
//! dropped from the output: a deletion that has sunk to the bottom has
//! nothing left to shadow. Otherwise tombstones are carried forward.
//!
//! The merged run is installed into the target tier before the source runs
//! are deleted, so every key remains continuously readable; the read path
//! visits the source tier first and simply sees the newer copy. If the
//! target tier reaches its own threshold, the compaction cascades,
//! retaining the target's merge permit into the recursive step.
//!
//! Requests arrive on a queue with the source tier's merge permit already
//! held by the requester (the flusher hands tier 1's permit over). The
//! queue is drained even during shutdown so no handed-off permit is
//! orphaned.

use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use super::merge::MergeIterator;
use super::run::{RunReader, RunWriter};
use super::store::Shared;
use super::tier;
use super::value::Value;
use crate::error::Result;

#[derive(Default)]
struct Queue {
    pending: VecDeque<usize>,
    shutdown: bool,
}

/// Work queue feeding the compactor thread. Each entry is a tier number
/// whose merge permit the requester already holds.
pub(crate) struct CompactSignal {
    queue: Mutex<Queue>,
    trigger: Condvar,
}

impl CompactSignal {
    pub fn new() -> Self {
        Self {
            queue: Mutex::new(Queue::default()),
            trigger: Condvar::new(),
        }
    }

    /// Enqueue a compaction of `tier_number`. Caller must hold that tier's
    /// merge permit; ownership passes to the compactor.
    pub fn request(&self, tier_number: usize) {
        self.queue.lock().unwrap().pending.push_back(tier_number);
        self.trigger.notify_one();
    }

    /// Next tier to compact, or `None` once shut down and drained.
    fn wait_for_work(&self) -> Option<usize> {
        let mut queue = self.queue.lock().unwrap();
        loop {
            if let Some(tier_number) = queue.pending.pop_front() {
                return Some(tier_number);
            }
            if queue.shutdown {
                return None;
            }
            queue = self.trigger.wait(queue).unwrap();
        }
    }

    pub fn shutdown(&self) {
        self.queue.lock().unwrap().shutdown = true;
        self.trigger.notify_all();
    }
}

/// Compactor thread body.
pub(crate) fn run_compactor(shared: Arc<Shared>) {
    while let Some(tier_number) = shared.compact.wait_for_work() {
        if let Err(e) = compact_tier(&shared, tier_number) {
            tracing::error!(tier = tier_number, error = %e, "compaction failed, stopping engine");
            shared.poison();
            return;
        }
    }
}

/// Merge all runs of tier `number` into one run of tier `number + 1`.
///
/// The caller must hold tier `number`'s merge permit; it is released before
/// returning. Cascades into deeper tiers as thresholds are crossed.
pub(crate) fn compact_tier(shared: &Shared, number: usize) -> Result<()> {
    let Some(source) = shared.tiers.get(number) else {
        return Ok(());
    };

    // The merge permit excludes every other run-set rewrite, so the count
    // is stable for the duration of the merge.
    let run_count = source.lock.read().count;
    if run_count == 0 {
        source.merge_permit.release();
        return Ok(());
    }

    // Deepest tier iff nothing lies below; decided before the target tier
    // is created.
    let deepest = shared.tiers.get(number + 1).is_none();
    let target = shared.tiers.get_or_create(number + 1)?;

    let mut cursors = Vec::with_capacity(run_count);
    for j in 1..=run_count {
        let reader = RunReader::open(
            &tier::run_path(&source.dir, j),
            &tier::metadata_path(&source.dir, j),
        )?;
        cursors.push(reader.cursor()?);
    }

    let data_path = tier::temp_run_path(&target.dir);
    let metadata_path = tier::temp_metadata_path(&target.dir);
    let mut writer = RunWriter::create(&data_path, &metadata_path)?;

    let mut dropped = 0u64;
    for entry in MergeIterator::new(cursors)? {
        let (key, slot) = entry?;
        if deepest && Value::slot_is_tombstone(&slot) {
            dropped += 1;
            continue;
        }
        writer.add(&key, &slot)?;
    }
    let entries = writer.count();
    let filter = writer.finish()?;

    // Install into the target tier first; delete the sources afterwards, so
    // the merged data never goes dark.
    let mut target_count = 0;
    if entries > 0 {
        target.merge_permit.acquire();
        {
            let mut runs = target.lock.write();
            let next = runs.count + 1;
            std::fs::rename(&data_path, tier::run_path(&target.dir, next))?;
            std::fs::rename(&metadata_path, tier::metadata_path(&target.dir, next))?;
            runs.filters.push(filter);
            runs.count = next;
            target_count = next;
        }
    } else {
        // Every record was a tombstone bound for the deepest tier; there is
        // no run to install.
        std::fs::remove_file(&data_path)?;
        std::fs::remove_file(&metadata_path)?;
    }

    {
        let mut runs = source.lock.write();
        let count = runs.count;
        for j in 1..=count {
            std::fs::remove_file(tier::run_path(&source.dir, j))?;
            std::fs::remove_file(tier::metadata_path(&source.dir, j))?;
        }
        runs.filters.clear();
        runs.count = 0;
    }
    source.merge_permit.release();

    tracing::info!(
        source = number,
        target = number + 1,
        runs_merged = run_count,
        entries,
        tombstones_dropped = dropped,
        "compacted tier"
    );

    if entries > 0 {
        if target_count >= shared.config.min_runs {
            // Cascade, keeping the target's merge permit.
            return compact_tier(shared, number + 1);
        }
        target.merge_permit.release();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::engine::flush::{self, FlushOutcome};
    use crate::engine::memtable::Memtable;
    use crate::engine::store::{Shared, WAL_FILE};
    use crate::engine::wal::Wal;
    use crate::tmpfs::TempDir;

    fn test_shared(dir: &TempDir, min_runs: usize) -> Shared {
        let config = StoreConfig::new(dir.path())
            .mem_limit(1 << 20)
            .min_runs(min_runs);
        let wal = Wal::create(dir.path().join(WAL_FILE)).expect("create wal");
        Shared::new(config, Memtable::new(), wal, Vec::new())
    }

    /// Write a batch into the active memtable and flush it into a tier-1
    /// run, driving the flusher's own functions synchronously.
    fn flush_batch(shared: &Shared, entries: &[(&str, Value)]) -> FlushOutcome {
        {
            let mut active = shared.active.write();
            for (key, value) in entries {
                active.memtable.put(key.as_bytes().to_vec(), value.clone());
            }
        }
        flush::freeze(shared).expect("freeze");
        flush::flush_frozen(shared).expect("flush")
    }

    fn tier_count(shared: &Shared, number: usize) -> usize {
        shared
            .tiers
            .get(number)
            .map_or(0, |tier| tier.lock.read().count)
    }

    fn read_run(shared: &Shared, number: usize, run: usize) -> Vec<(String, Value)> {
        let tier_handle = shared.tiers.get(number).expect("tier exists");
        let reader = RunReader::open(
            &tier::run_path(&tier_handle.dir, run),
            &tier::metadata_path(&tier_handle.dir, run),
        )
        .expect("open run");
        let mut cursor = reader.cursor().expect("cursor");
        let mut entries = Vec::new();
        while let Some((key, slot)) = cursor.next_entry().expect("entry") {
            entries.push((
                String::from_utf8(key).expect("utf8 key"),
                Value::decode(&slot).expect("decode"),
            ));
        }
        entries
    }

    fn put(value: &str) -> Value {
        Value::Put(value.as_bytes().to_vec())
    }

    #[test]
    fn test_compact_merges_and_clears_source() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir, 2);

        assert!(matches!(
            flush_batch(&shared, &[("a", put("1")), ("k", put("old"))]),
            FlushOutcome::Done
        ));
        assert!(matches!(
            flush_batch(&shared, &[("k", put("new")), ("z", put("9"))]),
            FlushOutcome::CompactPending
        ));
        compact_tier(&shared, 1).expect("compact");

        assert_eq!(tier_count(&shared, 1), 0);
        assert_eq!(tier_count(&shared, 2), 1);
        assert_eq!(
            read_run(&shared, 2, 1),
            vec![
                ("a".to_string(), put("1")),
                ("k".to_string(), put("new")),
                ("z".to_string(), put("9")),
            ]
        );

        // The source run files are gone.
        let tier_1 = shared.tiers.get(1).expect("tier 1");
        assert!(!tier::run_path(&tier_1.dir, 1).exists());
        assert!(!tier::run_path(&tier_1.dir, 2).exists());
    }

    #[test]
    fn test_tombstones_dropped_when_creating_deepest_tier() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir, 2);

        flush_batch(&shared, &[("a", put("1")), ("b", put("2"))]);
        assert!(matches!(
            flush_batch(&shared, &[("a", Value::Tombstone)]),
            FlushOutcome::CompactPending
        ));
        // Tier 2 does not exist yet, so this compaction is into the
        // deepest tier and the tombstone vanishes with its shadowed value.
        compact_tier(&shared, 1).expect("compact");

        assert_eq!(read_run(&shared, 2, 1), vec![("b".to_string(), put("2"))]);
    }

    #[test]
    fn test_tombstones_carried_when_deeper_tier_exists() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir, 3);

        // Populate tier 2 so it pre-exists.
        flush_batch(&shared, &[("x", put("1"))]);
        flush_batch(&shared, &[("y", put("2"))]);
        assert!(matches!(
            flush_batch(&shared, &[("z", put("3"))]),
            FlushOutcome::CompactPending
        ));
        compact_tier(&shared, 1).expect("first compact");
        assert_eq!(tier_count(&shared, 2), 1);

        // A tombstone for "x" sinks from tier 1 into the existing tier 2;
        // it must survive there to keep shadowing tier 2's older "x".
        flush_batch(&shared, &[("a", put("4"))]);
        flush_batch(&shared, &[("b", put("5"))]);
        assert!(matches!(
            flush_batch(&shared, &[("x", Value::Tombstone)]),
            FlushOutcome::CompactPending
        ));
        compact_tier(&shared, 1).expect("second compact");

        assert_eq!(tier_count(&shared, 2), 2);
        let entries = read_run(&shared, 2, 2);
        assert!(
            entries.contains(&("x".to_string(), Value::Tombstone)),
            "tombstone dropped too early: {entries:?}"
        );
    }

    #[test]
    fn test_empty_merge_output_installs_nothing() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir, 2);

        flush_batch(&shared, &[("a", put("1"))]);
        assert!(matches!(
            flush_batch(&shared, &[("a", Value::Tombstone)]),
            FlushOutcome::CompactPending
        ));
        compact_tier(&shared, 1).expect("compact");

        // Everything collapsed: no run in either tier, no temp leftovers.
        assert_eq!(tier_count(&shared, 1), 0);
        assert_eq!(tier_count(&shared, 2), 0);
        let tier_2 = shared.tiers.get(2).expect("tier 2 created");
        assert!(!tier::temp_run_path(&tier_2.dir).exists());
        assert!(!tier::temp_metadata_path(&tier_2.dir).exists());
    }

    #[test]
    fn test_compaction_cascades() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir, 2);

        flush_batch(&shared, &[("a", put("1"))]);
        assert!(matches!(
            flush_batch(&shared, &[("b", put("2"))]),
            FlushOutcome::CompactPending
        ));
        compact_tier(&shared, 1).expect("first compact");
        assert_eq!(tier_count(&shared, 2), 1);

        flush_batch(&shared, &[("c", put("3"))]);
        assert!(matches!(
            flush_batch(&shared, &[("a", put("updated"))]),
            FlushOutcome::CompactPending
        ));
        // Installing into tier 2 brings it to the threshold; the cascade
        // merges it straight into a new tier 3.
        compact_tier(&shared, 1).expect("cascading compact");

        assert_eq!(tier_count(&shared, 1), 0);
        assert_eq!(tier_count(&shared, 2), 0);
        assert_eq!(tier_count(&shared, 3), 1);
        assert_eq!(
            read_run(&shared, 3, 1),
            vec![
                ("a".to_string(), put("updated")),
                ("b".to_string(), put("2")),
                ("c".to_string(), put("3")),
            ]
        );
    }
}
