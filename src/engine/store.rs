//! The store façade: public API, the write/read paths, and engine
//! lifecycle.
//!
//! A [`Store`] owns one database directory. Opening it locks the directory,
//! rebuilds the tier registry and memtable from disk, settles any backlog
//! the previous process left behind (over-threshold tiers, an over-full
//! replayed memtable), and then starts the two background workers: the
//! flusher and the compactor. Dropping the store shuts both down in order.
//!
//! Writes are linearized by the tier-0 write lock: append to the WAL
//! (durable before return), insert into the active memtable, and raise the
//! flush handshake when the memtable crosses its byte limit. Reads walk the
//! layers from newest to oldest — active memtable, frozen memtable, then
//! each tier's runs from the highest run number down — and stop at the
//! first hit, which is always the freshest version of the key.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use super::compact::{self, CompactSignal};
use super::flush::{self, FlushOutcome, FlushSignal};
use super::memtable::Memtable;
use super::run::RunReader;
use super::sync::RwLock;
use super::tier::{self, TierRegistry};
use super::value::Value;
use super::wal::Wal;
use crate::config::StoreConfig;
use crate::error::{Error, Result};
use crate::errinput;
use crate::flock::FileLock;

pub(crate) const WAL_FILE: &str = "WAL.bin";
pub(crate) const WAL_FROZEN_FILE: &str = "WAL_temp.bin";
pub(crate) const WAL_PREV_FILE: &str = "WAL_prev.bin";

const LOCK_FILE: &str = "tierdb.lock";

/// Tier-0 write state: the active memtable and the WAL that covers it.
/// Guarded by the tier-0 writer-preferring lock.
pub(crate) struct WriteState {
    pub memtable: Memtable,
    pub wal: Wal,
}

/// State shared between the caller-facing API and the background workers.
pub(crate) struct Shared {
    pub config: StoreConfig,
    /// Tier 0: active memtable + WAL.
    pub active: RwLock<WriteState>,
    /// The frozen memtable slot, under its own lock so the flusher can
    /// clear it without stalling tier-0 traffic.
    pub frozen: RwLock<Option<Memtable>>,
    pub tiers: TierRegistry,
    pub flush: FlushSignal,
    pub compact: CompactSignal,
    poisoned: AtomicBool,
}

impl Shared {
    pub fn new(
        config: StoreConfig,
        memtable: Memtable,
        wal: Wal,
        tier_filters: Vec<Vec<super::bloom::BloomFilter>>,
    ) -> Self {
        Self {
            tiers: TierRegistry::new(config.dir.clone(), tier_filters),
            active: RwLock::new(WriteState { memtable, wal }),
            frozen: RwLock::new(None),
            flush: FlushSignal::new(),
            compact: CompactSignal::new(),
            poisoned: AtomicBool::new(false),
            config,
        }
    }

    /// Mark the engine failed after a background fault: stop both workers
    /// and fail blocked or future callers instead of losing writes
    /// silently.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        self.flush.shutdown();
        self.compact.shutdown();
    }

    fn check_alive(&self) -> Result<()> {
        if self.poisoned.load(Ordering::SeqCst) {
            return Err(Error::Shutdown);
        }
        Ok(())
    }
}

/// A persistent tiered LSM-tree key-value store over one directory.
pub struct Store {
    shared: Arc<Shared>,
    flusher: Option<JoinHandle<()>>,
    compactor: Option<JoinHandle<()>>,
    _lock: FileLock,
}

impl std::fmt::Debug for Store {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Store").finish_non_exhaustive()
    }
}

impl Store {
    /// Open a store with default configuration.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        Self::open_with_config(StoreConfig::new(dir))
    }

    /// Open a store, recovering any state the directory holds.
    pub fn open_with_config(config: StoreConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.dir)?;

        let lock = FileLock::lock(config.dir.join(LOCK_FILE))
            .map_err(|e| Error::Locked(e.to_string()))?;

        let recovered = super::recovery::recover(&config)?;

        let shared = Arc::new(Shared::new(
            config,
            recovered.memtable,
            recovered.wal,
            recovered.tier_filters,
        ));

        // Settle backlog inherited from the previous process before
        // accepting traffic: compact over-threshold tiers deepest-first
        // (shallow compactions may cascade into the deeper ones just
        // settled), then flush a replayed memtable that is already full.
        for number in (1..=shared.tiers.len()).rev() {
            if let Some(tier) = shared.tiers.get(number) {
                if tier.lock.read().count >= shared.config.min_runs {
                    tier.merge_permit.acquire();
                    compact::compact_tier(&shared, number)?;
                }
            }
        }

        if shared.active.read().memtable.size() >= shared.config.mem_limit {
            flush::freeze(&shared)?;
            if let FlushOutcome::CompactPending = flush::flush_frozen(&shared)? {
                compact::compact_tier(&shared, 1)?;
            }
        }

        let flusher = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tierdb-flush".to_string())
                .spawn(move || flush::run_flusher(shared))?
        };
        let compactor = {
            let shared = shared.clone();
            std::thread::Builder::new()
                .name("tierdb-compact".to_string())
                .spawn(move || compact::run_compactor(shared))?
        };

        tracing::info!(
            dir = %shared.config.dir.display(),
            tiers = shared.tiers.len(),
            "store opened"
        );

        Ok(Self {
            shared,
            flusher: Some(flusher),
            compactor: Some(compactor),
            _lock: lock,
        })
    }

    /// Insert or update a key. Durable when this returns.
    pub fn set(&self, key: &[u8], value: Vec<u8>) -> Result<()> {
        if key.len() + value.len() >= self.shared.config.mem_limit {
            return errinput!(
                "record of {} bytes exceeds the limit of {}",
                key.len() + value.len(),
                self.shared.config.mem_limit
            );
        }
        self.write(key, Value::Put(value))
    }

    /// Delete a key by writing a tombstone over it.
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        if key.len() >= self.shared.config.mem_limit {
            return errinput!(
                "key of {} bytes exceeds the limit of {}",
                key.len(),
                self.shared.config.mem_limit
            );
        }
        self.write(key, Value::Tombstone)
    }

    fn write(&self, key: &[u8], value: Value) -> Result<()> {
        self.shared.check_alive()?;

        // If a freeze is pending, wait for the flusher to swap in a fresh
        // memtable; re-check after taking the lock since the request may
        // have been raised while we acquired it.
        let mut active = loop {
            self.shared.flush.wait_until_idle()?;
            let guard = self.shared.active.write();
            if !self.shared.flush.is_requested() {
                break guard;
            }
            drop(guard);
        };

        active.wal.append(key, &value)?;
        active.memtable.put(key.to_vec(), value);

        if active.memtable.size() >= self.shared.config.mem_limit {
            self.shared.flush.request();
        }
        Ok(())
    }

    /// Look up a key. `Ok(None)` when absent or deleted.
    pub fn get(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.shared.check_alive()?;

        // Active memtable.
        {
            let active = self.shared.active.read();
            if active.memtable.filter_contains(key) {
                if let Some(value) = active.memtable.get(key) {
                    return Ok(Self::resolve(value));
                }
            }
        }

        // Frozen memtable, if a flush is in flight.
        {
            let frozen = self.shared.frozen.read();
            if let Some(memtable) = frozen.as_ref() {
                if memtable.filter_contains(key) {
                    if let Some(value) = memtable.get(key) {
                        return Ok(Self::resolve(value));
                    }
                }
            }
        }

        // On-disk tiers, shallowest tier first, newest run first within
        // each. The registry is consulted per iteration so a tier installed
        // by a concurrent compaction is not missed.
        for number in 1.. {
            let Some(tier) = self.shared.tiers.get(number) else {
                break;
            };
            let runs = tier.lock.read();
            for j in (1..=runs.count).rev() {
                if !runs.filters[j - 1].contains(key) {
                    continue;
                }
                let mut reader = RunReader::open(
                    &tier::run_path(&tier.dir, j),
                    &tier::metadata_path(&tier.dir, j),
                )?;
                if let Some(value) = reader.find(key)? {
                    return Ok(Self::resolve(value));
                }
                // Filter false positive; keep probing older runs.
            }
        }

        Ok(None)
    }

    /// A found value is definitive: a tombstone means the key is deleted
    /// everywhere below this layer.
    fn resolve(value: Value) -> Option<Vec<u8>> {
        match value {
            Value::Put(bytes) => Some(bytes),
            Value::Tombstone => None,
        }
    }
}

impl Drop for Store {
    fn drop(&mut self) {
        // Stop the flusher first: it may be waiting on a merge permit the
        // compactor holds, and the compactor drains its queue before
        // exiting, so this order cannot strand either thread.
        self.shared.flush.shutdown();
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }
        self.shared.compact.shutdown();
        if let Some(handle) = self.compactor.take() {
            let _ = handle.join();
        }
        tracing::info!(dir = %self.shared.config.dir.display(), "store closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tmpfs::TempDir;

    fn small_store(dir: &TempDir) -> Store {
        // A tiny memtable limit so a handful of writes exercises the full
        // flush and compaction machinery.
        let config = StoreConfig::new(dir.path()).mem_limit(256).min_runs(2);
        Store::open_with_config(config).expect("failed to open store")
    }

    fn wait_for_flush(store: &Store) {
        // Flush completion is observable as an empty frozen slot with no
        // request pending.
        for _ in 0..500 {
            let idle =
                !store.shared.flush.is_requested() && store.shared.frozen.read().is_none();
            if idle {
                return;
            }
            std::thread::sleep(std::time::Duration::from_millis(10));
        }
        panic!("flush did not complete");
    }

    #[test]
    fn test_set_get_delete() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path()).expect("open");

        store.set(b"key1", b"value1".to_vec()).unwrap();
        store.set(b"key2", b"value2".to_vec()).unwrap();

        assert_eq!(store.get(b"key1").unwrap(), Some(b"value1".to_vec()));
        assert_eq!(store.get(b"key2").unwrap(), Some(b"value2".to_vec()));
        assert_eq!(store.get(b"missing").unwrap(), None);

        store.delete(b"key1").unwrap();
        assert_eq!(store.get(b"key1").unwrap(), None);
        assert_eq!(store.get(b"key2").unwrap(), Some(b"value2".to_vec()));
    }

    #[test]
    fn test_overwrite_returns_latest() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path()).expect("open");

        store.set(b"k", b"v1".to_vec()).unwrap();
        store.set(b"k", b"v2".to_vec()).unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_oversize_record_rejected() {
        let dir = TempDir::new().expect("tempdir");
        let config = StoreConfig::new(dir.path()).mem_limit(64);
        let store = Store::open_with_config(config).expect("open");

        let result = store.set(b"key", vec![0u8; 64]);
        assert!(matches!(result, Err(Error::InvalidInput(_))));

        // A record just under the limit is fine.
        store.set(b"key", vec![0u8; 32]).unwrap();
        assert_eq!(store.get(b"key").unwrap(), Some(vec![0u8; 32]));
    }

    #[test]
    fn test_exclusive_directory_access() {
        let dir = TempDir::new().expect("tempdir");
        let store = Store::open(dir.path()).expect("open");

        match Store::open(dir.path()) {
            Err(Error::Locked(_)) => {}
            other => panic!("expected lock error, got {other:?}"),
        }

        drop(store);
        let _store = Store::open(dir.path()).expect("reopen after drop");
    }

    #[test]
    fn test_flush_preserves_reads() {
        let dir = TempDir::new().expect("tempdir");
        let store = small_store(&dir);

        for i in 0..20 {
            let key = format!("key_{i:02}");
            store.set(key.as_bytes(), vec![b'x'; 32]).unwrap();
        }
        wait_for_flush(&store);

        // At least one flush must have happened with a 256-byte limit.
        let tier = store.shared.tiers.get(1).expect("tier 1 exists");
        drop(tier);

        for i in 0..20 {
            let key = format!("key_{i:02}");
            assert_eq!(
                store.get(key.as_bytes()).unwrap(),
                Some(vec![b'x'; 32]),
                "lost {key} across flush"
            );
        }
    }

    #[test]
    fn test_delete_survives_flush() {
        let dir = TempDir::new().expect("tempdir");
        let store = small_store(&dir);

        store.set(b"victim", vec![b'v'; 32]).unwrap();
        store.delete(b"victim").unwrap();

        // Push enough data through to flush the tombstone into a run.
        for i in 0..20 {
            store.set(format!("pad_{i:02}").as_bytes(), vec![b'p'; 32]).unwrap();
        }
        wait_for_flush(&store);

        assert_eq!(store.get(b"victim").unwrap(), None);
    }

    #[test]
    fn test_reopen_recovers_all_layers() {
        let dir = TempDir::new().expect("tempdir");
        {
            let store = small_store(&dir);
            for i in 0..30 {
                store.set(format!("key_{i:02}").as_bytes(), vec![b'd'; 32]).unwrap();
            }
            wait_for_flush(&store);
            // A few writes that stay in the memtable and WAL only.
            store.set(b"tail_1", b"t1".to_vec()).unwrap();
            store.set(b"tail_2", b"t2".to_vec()).unwrap();
        }

        let store = small_store(&dir);
        for i in 0..30 {
            let key = format!("key_{i:02}");
            assert_eq!(
                store.get(key.as_bytes()).unwrap(),
                Some(vec![b'd'; 32]),
                "lost {key} across restart"
            );
        }
        assert_eq!(store.get(b"tail_1").unwrap(), Some(b"t1".to_vec()));
        assert_eq!(store.get(b"tail_2").unwrap(), Some(b"t2".to_vec()));
    }
}
