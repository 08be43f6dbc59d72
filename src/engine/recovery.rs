//! Startup recovery: rebuilding in-memory state from the directory.
//!
//! Two independent recoveries run at open. The tier scan walks the
//! `Tier_i` directories in order, counts the live runs of each and rebuilds
//! their Bloom filters from the offset indexes; leftover temp files from a
//! flush or compaction that died mid-write are discarded. The WAL replay
//! reconstructs the active memtable from whichever of the two rotating log
//! files survived, handling the case where both exist because the process
//! died with a flush in flight.

use super::bloom::BloomFilter;
use super::memtable::Memtable;
use super::run::RunReader;
use super::store::{WAL_FILE, WAL_FROZEN_FILE, WAL_PREV_FILE};
use super::tier;
use super::wal::Wal;
use crate::config::StoreConfig;
use crate::error::Result;

use std::path::Path;

pub(crate) struct Recovered {
    /// Per-tier filter vectors; `tier_filters[i]` belongs to tier `i + 1`
    /// and its length is the tier's run count.
    pub tier_filters: Vec<Vec<BloomFilter>>,
    pub memtable: Memtable,
    pub wal: Wal,
}

pub(crate) fn recover(config: &StoreConfig) -> Result<Recovered> {
    let tier_filters = load_tiers(&config.dir)?;
    let (memtable, wal) = replay_wals(&config.dir)?;

    tracing::info!(
        tiers = tier_filters.len(),
        runs = tier_filters.iter().map(Vec::len).sum::<usize>(),
        memtable_entries = memtable.len(),
        "recovered database state"
    );

    Ok(Recovered {
        tier_filters,
        memtable,
        wal,
    })
}

/// Scan tier directories in order, rebuilding each run's filter from its
/// metadata and cleaning up orphaned temp files.
fn load_tiers(root: &Path) -> Result<Vec<Vec<BloomFilter>>> {
    let mut tiers = Vec::new();

    for number in 1.. {
        let dir = tier::tier_dir(root, number);
        if !dir.is_dir() {
            break;
        }

        for temp in [tier::temp_run_path(&dir), tier::temp_metadata_path(&dir)] {
            if temp.exists() {
                tracing::warn!(path = %temp.display(), "discarding incomplete run left by a crash");
                std::fs::remove_file(&temp)?;
            }
        }

        let mut filters = Vec::new();
        for run in 1.. {
            let data_path = tier::run_path(&dir, run);
            let metadata_path = tier::metadata_path(&dir, run);
            if !data_path.is_file() || !metadata_path.is_file() {
                break;
            }
            let reader = RunReader::open(&data_path, &metadata_path)?;
            filters.push(reader.build_filter()?);
        }
        tiers.push(filters);
    }

    Ok(tiers)
}

/// Reconstruct the active memtable from the WAL files.
///
/// The frozen WAL (`WAL_temp.bin`), when present, predates the active one:
/// it covered a memtable whose flush never completed. Recovery parks the
/// active WAL under a unique intermediate name, promotes the frozen WAL to
/// active, replays it, and then replays the parked records while
/// re-appending them to the active log, so every replayed record is durable
/// again before the intermediate file is deleted. A crash during this
/// sequence is itself recoverable: replay order makes a duplicated prefix
/// idempotent, and a leftover intermediate file is picked up on the next
/// open.
fn replay_wals(root: &Path) -> Result<(Memtable, Wal)> {
    let active_path = root.join(WAL_FILE);
    let frozen_path = root.join(WAL_FROZEN_FILE);
    let prev_path = root.join(WAL_PREV_FILE);

    if frozen_path.exists() {
        if active_path.exists() {
            std::fs::rename(&active_path, &prev_path)?;
        }
        std::fs::rename(&frozen_path, &active_path)?;
    }

    // Creates the active WAL when none survived.
    let mut wal = Wal::open_append(&active_path)?;

    let mut memtable = Memtable::new();
    for record in Wal::replay(&active_path)? {
        let (key, value) = record?;
        memtable.put(key, value);
    }

    if prev_path.exists() {
        for record in Wal::replay(&prev_path)? {
            let (key, value) = record?;
            wal.append(&key, &value)?;
            memtable.put(key, value);
        }
        std::fs::remove_file(&prev_path)?;
    }

    Ok((memtable, wal))
}
