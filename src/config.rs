use std::path::PathBuf;

/// Default memtable byte limit before a freeze is forced.
pub const DEFAULT_MEM_LIMIT: usize = 4_000_000;

/// Default number of runs a tier accumulates before it is compacted into the
/// next tier.
pub const DEFAULT_MIN_RUNS: usize = 4;

/// Configuration for the store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Directory path for the database
    pub dir: PathBuf,

    /// Combined key+value byte size at which the active memtable is frozen
    /// and flushed (default: 4,000,000). Also bounds the size of a single
    /// record: any record with |key| + |value| >= mem_limit is rejected.
    pub mem_limit: usize,

    /// Run count threshold that triggers compaction of a tier (default: 4)
    pub min_runs: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            dir: PathBuf::from("./Database"),
            mem_limit: DEFAULT_MEM_LIMIT,
            min_runs: DEFAULT_MIN_RUNS,
        }
    }
}

impl StoreConfig {
    /// Create a new config with the given directory
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            ..Default::default()
        }
    }

    /// Set the memtable byte limit
    pub fn mem_limit(mut self, limit: usize) -> Self {
        self.mem_limit = limit;
        self
    }

    /// Set the per-tier compaction threshold
    pub fn min_runs(mut self, min_runs: usize) -> Self {
        self.min_runs = min_runs;
        self
    }
}
