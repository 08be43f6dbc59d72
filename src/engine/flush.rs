//! Background flush: freeze-swap of the active memtable and its drain into
//! a tier-1 run.
//!
//! The writer path requests a flush when the active memtable crosses the
//! configured byte limit; the flusher thread then performs the freeze
//! itself: under the tier-0 and frozen-slot write locks it swaps a fresh
//! memtable into the active slot, rotates the WAL, and wakes any writers
//! blocked on the handshake. The swapped-out memtable sits in the frozen
//! slot, still serving reads, while it is streamed into a new run. The run
//! is installed into tier 1 before the frozen slot is cleared, so there is
//! no moment at which the flushed data is invisible to readers.
//!
//! At most one frozen memtable exists: the flusher only freezes at the top
//! of its loop, after the previous frozen memtable has been cleared.

use std::sync::{Arc, Condvar, Mutex};

use super::store::{Shared, WAL_FROZEN_FILE};
use super::run::RunWriter;
use super::tier;
use crate::error::{Error, Result};

/// Result of flushing the frozen memtable.
pub(crate) enum FlushOutcome {
    Done,
    /// Tier 1 reached the compaction threshold. The flusher retains tier 1's
    /// merge permit; it is released by whoever performs the compaction.
    CompactPending,
}

enum Work {
    Flush,
    Shutdown,
}

#[derive(Default)]
struct Flags {
    requested: bool,
    shutdown: bool,
}

/// Condvar handshake between the writer path and the flusher thread.
///
/// `requested` is raised by a writer that fills the memtable and lowered by
/// the flusher once the freeze-swap is done. Writers arriving while it is
/// raised wait on `complete`; the flusher waits on `trigger`.
pub(crate) struct FlushSignal {
    flags: Mutex<Flags>,
    trigger: Condvar,
    complete: Condvar,
}

impl FlushSignal {
    pub fn new() -> Self {
        Self {
            flags: Mutex::new(Flags::default()),
            trigger: Condvar::new(),
            complete: Condvar::new(),
        }
    }

    /// Raise the flush request and wake the flusher.
    pub fn request(&self) {
        self.flags.lock().unwrap().requested = true;
        self.trigger.notify_one();
    }

    pub fn is_requested(&self) -> bool {
        self.flags.lock().unwrap().requested
    }

    /// Lower the request and wake writers waiting for memtable space.
    fn complete(&self) {
        self.flags.lock().unwrap().requested = false;
        self.complete.notify_all();
    }

    /// Block the calling writer while a freeze is pending.
    pub fn wait_until_idle(&self) -> Result<()> {
        let mut flags = self.flags.lock().unwrap();
        while flags.requested && !flags.shutdown {
            flags = self.complete.wait(flags).unwrap();
        }
        if flags.shutdown {
            return Err(Error::Shutdown);
        }
        Ok(())
    }

    fn wait_for_work(&self) -> Work {
        let mut flags = self.flags.lock().unwrap();
        while !flags.requested && !flags.shutdown {
            flags = self.trigger.wait(flags).unwrap();
        }
        if flags.shutdown {
            Work::Shutdown
        } else {
            Work::Flush
        }
    }

    /// Stop the flusher and fail any writers blocked on the handshake.
    pub fn shutdown(&self) {
        self.flags.lock().unwrap().shutdown = true;
        self.trigger.notify_all();
        self.complete.notify_all();
    }
}

/// Flusher thread body.
pub(crate) fn run_flusher(shared: Arc<Shared>) {
    loop {
        match shared.flush.wait_for_work() {
            Work::Shutdown => return,
            Work::Flush => {}
        }
        if let Err(e) = flush_cycle(&shared) {
            tracing::error!(error = %e, "flush failed, stopping engine");
            shared.poison();
            return;
        }
    }
}

/// One full freeze + flush, including the compaction handoff.
fn flush_cycle(shared: &Shared) -> Result<()> {
    freeze(shared)?;
    match flush_frozen(shared)? {
        FlushOutcome::CompactPending => shared.compact.request(1),
        FlushOutcome::Done => {}
    }
    Ok(())
}

/// Swap the active memtable into the frozen slot and rotate the WAL.
///
/// Takes the tier-0 write lock, then the frozen-slot write lock. Requires
/// the frozen slot to be empty, which the flusher loop structure
/// guarantees. Completes the flush handshake so blocked writers resume
/// against the fresh memtable while the disk work proceeds.
pub(crate) fn freeze(shared: &Shared) -> Result<()> {
    {
        let mut active = shared.active.write();
        let mut frozen = shared.frozen.write();
        debug_assert!(frozen.is_none(), "freeze with an occupied frozen slot");

        let full = std::mem::take(&mut active.memtable);
        active.wal.rotate(&shared.config.dir.join(WAL_FROZEN_FILE))?;
        *frozen = Some(full);
    }
    shared.flush.complete();
    Ok(())
}

/// Drain the frozen memtable into a new tier-1 run, install it, then clear
/// the frozen slot and delete the frozen WAL.
pub(crate) fn flush_frozen(shared: &Shared) -> Result<FlushOutcome> {
    let tier = shared.tiers.get_or_create(1)?;

    let mut outcome = FlushOutcome::Done;
    let mut flushed = 0u64;
    {
        let frozen = shared.frozen.read();
        let Some(memtable) = frozen.as_ref() else {
            return Ok(FlushOutcome::Done);
        };

        if !memtable.is_empty() {
            // The memtable iterates in key order, so a single pass yields a
            // sorted run; the filter is built in the same pass.
            let data_path = tier::temp_run_path(&tier.dir);
            let metadata_path = tier::temp_metadata_path(&tier.dir);
            let mut writer = RunWriter::create(&data_path, &metadata_path)?;

            let mut write_result = Ok(());
            memtable.for_each(|key, value| {
                if write_result.is_ok() {
                    write_result = writer.add(key, &value.encode());
                }
            });
            write_result?;
            flushed = writer.count();
            let filter = writer.finish()?;

            tier.merge_permit.acquire();
            {
                let mut runs = tier.lock.write();
                let next = runs.count + 1;
                std::fs::rename(&data_path, tier::run_path(&tier.dir, next))?;
                std::fs::rename(&metadata_path, tier::metadata_path(&tier.dir, next))?;
                runs.filters.push(filter);
                runs.count = next;

                if next >= shared.config.min_runs {
                    outcome = FlushOutcome::CompactPending;
                }
            }
            if matches!(outcome, FlushOutcome::Done) {
                tier.merge_permit.release();
            }
        }
    }

    // The run is live; the frozen memtable and its WAL are now redundant.
    *shared.frozen.write() = None;
    let frozen_wal = shared.config.dir.join(WAL_FROZEN_FILE);
    if frozen_wal.exists() {
        std::fs::remove_file(&frozen_wal)?;
    }

    tracing::info!(entries = flushed, "flushed memtable into tier 1");
    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::engine::memtable::Memtable;
    use crate::engine::run::RunReader;
    use crate::engine::store::WAL_FILE;
    use crate::engine::value::Value;
    use crate::engine::wal::Wal;
    use crate::tmpfs::TempDir;

    fn test_shared(dir: &TempDir) -> Shared {
        let config = StoreConfig::new(dir.path()).mem_limit(1 << 20).min_runs(4);
        let wal = Wal::create(dir.path().join(WAL_FILE)).expect("create wal");
        Shared::new(config, Memtable::new(), wal, Vec::new())
    }

    fn put_all(shared: &Shared, entries: &[(&str, &str)]) {
        let mut active = shared.active.write();
        for (key, value) in entries {
            let value = Value::Put(value.as_bytes().to_vec());
            active.wal.append(key.as_bytes(), &value).expect("wal append");
            active.memtable.put(key.as_bytes().to_vec(), value);
        }
    }

    #[test]
    fn test_freeze_swaps_memtable_and_rotates_wal() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir);
        put_all(&shared, &[("a", "1"), ("b", "2")]);

        freeze(&shared).expect("freeze");

        assert!(shared.active.read().memtable.is_empty());
        let frozen = shared.frozen.read();
        let memtable = frozen.as_ref().expect("frozen slot occupied");
        assert_eq!(memtable.len(), 2);
        assert_eq!(memtable.get(b"a"), Some(Value::Put(b"1".to_vec())));

        // The frozen WAL holds the swapped-out records; the active WAL is
        // fresh and empty.
        let frozen_wal = dir.path().join(WAL_FROZEN_FILE);
        assert_eq!(Wal::replay(&frozen_wal).expect("replay").count(), 2);
        assert_eq!(
            Wal::replay(&dir.path().join(WAL_FILE)).expect("replay").count(),
            0
        );
    }

    #[test]
    fn test_flush_installs_sorted_run_and_clears_frozen() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir);
        // Unsorted inserts; the run must come out sorted.
        put_all(&shared, &[("cherry", "3"), ("apple", "1"), ("banana", "2")]);

        freeze(&shared).expect("freeze");
        assert!(matches!(
            flush_frozen(&shared).expect("flush"),
            FlushOutcome::Done
        ));

        assert!(shared.frozen.read().is_none());
        assert!(!dir.path().join(WAL_FROZEN_FILE).exists());

        let tier_1 = shared.tiers.get(1).expect("tier 1 exists");
        {
            let runs = tier_1.lock.read();
            assert_eq!(runs.count, 1);
            assert!(runs.filters[0].contains(b"apple"));
            assert!(runs.filters[0].contains(b"banana"));
            assert!(runs.filters[0].contains(b"cherry"));
        }

        let mut reader = RunReader::open(
            &tier::run_path(&tier_1.dir, 1),
            &tier::metadata_path(&tier_1.dir, 1),
        )
        .expect("open run");
        assert_eq!(reader.entry_count(), 3);
        let mut cursor = RunReader::open(
            &tier::run_path(&tier_1.dir, 1),
            &tier::metadata_path(&tier_1.dir, 1),
        )
        .expect("reopen")
        .cursor()
        .expect("cursor");
        let (first_key, _) = cursor.next_entry().expect("entry").expect("first");
        assert_eq!(first_key, b"apple");

        assert_eq!(
            reader.find(b"banana").expect("find"),
            Some(Value::Put(b"2".to_vec()))
        );
    }

    #[test]
    fn test_flush_with_empty_frozen_slot_is_a_noop() {
        let dir = TempDir::new().expect("tempdir");
        let shared = test_shared(&dir);

        assert!(matches!(
            flush_frozen(&shared).expect("flush"),
            FlushOutcome::Done
        ));
        assert_eq!(
            shared.tiers.get(1).expect("tier 1").lock.read().count,
            0
        );
    }

    #[test]
    fn test_signal_handshake() {
        let signal = FlushSignal::new();
        assert!(!signal.is_requested());
        assert!(signal.wait_until_idle().is_ok());

        signal.request();
        assert!(signal.is_requested());

        signal.complete();
        assert!(!signal.is_requested());
        assert!(signal.wait_until_idle().is_ok());

        signal.shutdown();
        assert!(matches!(signal.wait_until_idle(), Err(Error::Shutdown)));
    }
}
