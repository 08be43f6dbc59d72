//! Tiered LSM-tree storage engine.
//!
//! The engine organizes data in tiers of increasing age. Tier 0 is in
//! memory; tiers 1 and deeper are directories of immutable sorted runs:
//!
//! ```text
//!  ┌─────────────────┐     ┌──────────────────┐
//!  │ Active memtable │──┬──│ Frozen memtable  │
//!  │   (SkipMap)     │  │  │ (at most one)    │
//!  └─────────────────┘  │  └──────────────────┘
//!          │            │            │ flush
//!          ▼            │            ▼
//!     ┌─────────┐       │   ┌─────────────────┐
//!     │ WAL.bin │       └── │ Tier_1          │
//!     └─────────┘  rotate   │  1.bin … L₁.bin │
//!                           └─────────────────┘
//!                                    │ compact (L₁ ≥ min_runs)
//!                                    ▼
//!                           ┌─────────────────┐
//!                           │ Tier_2  …       │
//!                           └─────────────────┘
//! ```
//!
//! # Write path
//!
//! 1. Append the record to the WAL; the append fsyncs, so an acknowledged
//!    write survives any crash.
//! 2. Insert into the active memtable.
//! 3. When the memtable crosses the byte limit, the writer raises the
//!    flush handshake. The flusher swaps in a fresh memtable, rotates the
//!    WAL, streams the frozen memtable into a new tier-1 run, and deletes
//!    the frozen WAL.
//! 4. When a tier accumulates `min_runs` runs, the compactor merges them
//!    all into a single run of the next tier, cascading as deeper tiers
//!    fill up. Tombstones are dropped once they reach the deepest tier.
//!
//! # Read path
//!
//! Layers are probed newest-first — active memtable, frozen memtable, then
//! each tier's runs from the highest run number down — and the first hit
//! wins. Every memtable and run carries a Bloom filter so most absent-key
//! probes skip the lookup; a hit falls through to the ordered map or to a
//! binary search over the run's offset index.
//!
//! # Concurrency
//!
//! Each tier has a writer-preferring reader-writer lock over its run set
//! and a merge permit serializing bulk rewrites; the frozen memtable has
//! its own lock so the flusher can clear it without stalling tier-0
//! traffic. Readers run concurrently with the writer, the flusher, and the
//! compactor; writers are linearized by the tier-0 lock.

pub mod bloom;
pub mod compact;
pub mod flush;
pub mod memtable;
pub mod merge;
pub mod recovery;
pub mod run;
pub mod store;
pub mod sync;
pub mod tier;
pub mod value;
pub mod wal;

pub use store::Store;
pub use value::Value;
