//! On-disk tier registry.
//!
//! Tier `i` (1-based) lives in directory `Tier_i` under the database root
//! and holds runs numbered `1..=count`, each a `j.bin`/`metadataj.bin` file
//! pair. Alongside the run count, each tier keeps the in-memory Bloom
//! filters for its runs and owns the two primitives of the locking
//! protocol: the reader-writer lock over its run set and the merge permit
//! serializing bulk rewrites. The registry only grows; a tier, once
//! created, exists for the lifetime of the store even when its run count
//! drops back to zero.

use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock as StdRwLock};

use super::bloom::BloomFilter;
use super::sync::{RwLock, Semaphore};
use crate::error::Result;

/// Mutable view of a tier: its live runs and their filters, guarded by the
/// tier's writer-preferring lock.
pub struct TierRuns {
    /// Number of live runs; runs are named 1..=count.
    pub count: usize,
    /// One filter per run, filters[j - 1] belonging to run j.
    pub filters: Vec<BloomFilter>,
}

pub struct Tier {
    pub number: usize,
    pub dir: PathBuf,
    pub lock: RwLock<TierRuns>,
    pub merge_permit: Semaphore,
}

impl Tier {
    fn new(number: usize, dir: PathBuf, filters: Vec<BloomFilter>) -> Self {
        Self {
            number,
            dir,
            lock: RwLock::new(TierRuns {
                count: filters.len(),
                filters,
            }),
            merge_permit: Semaphore::new(1),
        }
    }
}

/// Path of tier `i`'s directory under the database root.
pub fn tier_dir(root: &Path, number: usize) -> PathBuf {
    root.join(format!("Tier_{number}"))
}

/// Data file of run `j` within a tier directory.
pub fn run_path(tier_dir: &Path, run: usize) -> PathBuf {
    tier_dir.join(format!("{run}.bin"))
}

/// Offset index of run `j` within a tier directory.
pub fn metadata_path(tier_dir: &Path, run: usize) -> PathBuf {
    tier_dir.join(format!("metadata{run}.bin"))
}

/// Transient output names used while a flush or compaction is writing a new
/// run; renamed to their final names on installation.
pub fn temp_run_path(tier_dir: &Path) -> PathBuf {
    tier_dir.join("temp.bin")
}

pub fn temp_metadata_path(tier_dir: &Path) -> PathBuf {
    tier_dir.join("metadata_temp.bin")
}

/// The ordered list of on-disk tiers. Grow-only; guarded by a plain std
/// lock since mutation is rare (a new deepest tier) and never blocks on
/// I/O.
pub struct TierRegistry {
    root: PathBuf,
    tiers: StdRwLock<Vec<Arc<Tier>>>,
}

impl TierRegistry {
    pub fn new(root: PathBuf, recovered: Vec<Vec<BloomFilter>>) -> Self {
        let tiers = recovered
            .into_iter()
            .enumerate()
            .map(|(i, filters)| Arc::new(Tier::new(i + 1, tier_dir(&root, i + 1), filters)))
            .collect();
        Self {
            root,
            tiers: StdRwLock::new(tiers),
        }
    }

    /// Tier `number` if it exists.
    pub fn get(&self, number: usize) -> Option<Arc<Tier>> {
        self.tiers.read().unwrap().get(number - 1).cloned()
    }

    /// Number of tiers currently known.
    pub fn len(&self) -> usize {
        self.tiers.read().unwrap().len()
    }

    /// Tier `number`, creating its directory and registry entry (and any
    /// missing shallower tiers) if needed.
    pub fn get_or_create(&self, number: usize) -> Result<Arc<Tier>> {
        if let Some(tier) = self.get(number) {
            return Ok(tier);
        }

        let mut tiers = self.tiers.write().unwrap();
        while tiers.len() < number {
            let next = tiers.len() + 1;
            let dir = tier_dir(&self.root, next);
            std::fs::create_dir_all(&dir)?;
            tiers.push(Arc::new(Tier::new(next, dir, Vec::new())));
        }
        Ok(tiers[number - 1].clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    #[test]
    fn test_paths() {
        let root = Path::new("/db");
        let dir = tier_dir(root, 2);
        assert_eq!(dir, Path::new("/db/Tier_2"));
        assert_eq!(run_path(&dir, 3), Path::new("/db/Tier_2/3.bin"));
        assert_eq!(metadata_path(&dir, 3), Path::new("/db/Tier_2/metadata3.bin"));
        assert_eq!(temp_run_path(&dir), Path::new("/db/Tier_2/temp.bin"));
        assert_eq!(
            temp_metadata_path(&dir),
            Path::new("/db/Tier_2/metadata_temp.bin")
        );
    }

    #[test]
    fn test_registry_growth() {
        let dir = TempDir::new().expect("tempdir");
        let registry = TierRegistry::new(dir.path().to_path_buf(), Vec::new());
        assert_eq!(registry.len(), 0);
        assert!(registry.get(1).is_none());

        let tier = registry.get_or_create(2).expect("create");
        assert_eq!(tier.number, 2);
        assert_eq!(registry.len(), 2);
        assert!(tier_dir(dir.path(), 1).is_dir());
        assert!(tier_dir(dir.path(), 2).is_dir());

        // Idempotent.
        let again = registry.get_or_create(2).expect("again");
        assert_eq!(again.number, 2);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_registry_recovered_filters() {
        let dir = TempDir::new().expect("tempdir");
        let mut filter = BloomFilter::new();
        filter.add(b"present");

        let registry = TierRegistry::new(dir.path().to_path_buf(), vec![vec![filter]]);
        let tier = registry.get(1).expect("tier 1");
        let runs = tier.lock.read();
        assert_eq!(runs.count, 1);
        assert!(runs.filters[0].contains(b"present"));
    }
}
