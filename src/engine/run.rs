//! On-disk runs: immutable sorted key-value files with an offset index.
//!
//! A run is a pair of files. The data file is the concatenation of keys and
//! value slots with no separators; the metadata file is the offset index
//! that makes the data file navigable:
//!
//! ```text
//! data:      k0 v0 k1 v1 ... k(n-1) v(n-1)
//! metadata:  o[0]=0 | o[1] | o[2] | ... | o[2n] | n
//! ```
//!
//! Every field in the metadata file is a little-endian u64. For entry `i`,
//! `o[2i]` is the start of its key, `o[2i+1]` the end of its key (= start of
//! its value slot), and `o[2i+2]` the end of its value slot. The trailing
//! count `n` is authoritative. Point lookups binary-search the index with
//! three offset reads per probe; compaction scans runs sequentially with
//! buffered readers.
//!
//! Runs are written under temporary names and renamed into place once
//! synced, so a partially written run is never visible under a live name.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use super::bloom::BloomFilter;
use super::value::Value;
use crate::error::{Error, Result};

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Streaming writer for a new run. Entries must be added in strictly
/// increasing key order; the writer builds the offset index and the run's
/// Bloom filter in the same pass.
pub struct RunWriter {
    data: BufWriter<File>,
    metadata: BufWriter<File>,
    filter: BloomFilter,
    offset: u64,
    count: u64,
    #[cfg(debug_assertions)]
    last_key: Option<Vec<u8>>,
}

impl RunWriter {
    pub fn create(data_path: &Path, metadata_path: &Path) -> Result<Self> {
        let data = BufWriter::new(File::create(data_path)?);
        let mut metadata = BufWriter::new(File::create(metadata_path)?);
        metadata.write_u64::<LittleEndian>(0)?;

        Ok(Self {
            data,
            metadata,
            filter: BloomFilter::new(),
            offset: 0,
            count: 0,
            #[cfg(debug_assertions)]
            last_key: None,
        })
    }

    /// Append one entry. `slot` is the encoded value (tag byte + payload).
    pub fn add(&mut self, key: &[u8], slot: &[u8]) -> Result<()> {
        #[cfg(debug_assertions)]
        {
            if let Some(last) = &self.last_key {
                debug_assert!(key > last.as_slice(), "run keys must strictly increase");
            }
            self.last_key = Some(key.to_vec());
        }

        self.data.write_all(key)?;
        self.offset += key.len() as u64;
        self.metadata.write_u64::<LittleEndian>(self.offset)?;

        self.data.write_all(slot)?;
        self.offset += slot.len() as u64;
        self.metadata.write_u64::<LittleEndian>(self.offset)?;

        self.filter.add(key);
        self.count += 1;
        Ok(())
    }

    pub fn count(&self) -> u64 {
        self.count
    }

    /// Write the trailing entry count, fsync both files, and return the
    /// filter built during the pass.
    pub fn finish(mut self) -> Result<BloomFilter> {
        self.metadata.write_u64::<LittleEndian>(self.count)?;

        let data = self.data.into_inner().map_err(|e| Error::Io(e.to_string()))?;
        data.sync_all()?;
        let metadata = self
            .metadata
            .into_inner()
            .map_err(|e| Error::Io(e.to_string()))?;
        metadata.sync_all()?;

        Ok(self.filter)
    }
}

/// Read handle for an existing run.
pub struct RunReader {
    data: File,
    metadata: File,
    data_path: PathBuf,
    metadata_path: PathBuf,
    entries: u64,
}

impl RunReader {
    pub fn open(data_path: &Path, metadata_path: &Path) -> Result<Self> {
        let data = File::open(data_path)?;
        let mut metadata = File::open(metadata_path)?;

        // The last u64 of the metadata file is the authoritative count.
        metadata.seek(SeekFrom::End(-8))?;
        let entries = metadata.read_u64::<LittleEndian>()?;

        Ok(Self {
            data,
            metadata,
            data_path: data_path.to_path_buf(),
            metadata_path: metadata_path.to_path_buf(),
            entries,
        })
    }

    pub fn entry_count(&self) -> u64 {
        self.entries
    }

    /// Binary search for a key. Each probe reads the three offsets bounding
    /// the candidate entry, then the key bytes; the value slot is read only
    /// on a hit.
    pub fn find(&mut self, key: &[u8]) -> Result<Option<Value>> {
        if self.entries == 0 {
            return Ok(None);
        }

        let mut lo: i64 = 0;
        let mut hi: i64 = self.entries as i64 - 1;

        while lo <= hi {
            let mid = (lo + hi) / 2;

            self.metadata.seek(SeekFrom::Start(16 * mid as u64))?;
            let key_start = self.metadata.read_u64::<LittleEndian>()?;
            let key_end = self.metadata.read_u64::<LittleEndian>()?;
            let value_end = self.metadata.read_u64::<LittleEndian>()?;

            self.data.seek(SeekFrom::Start(key_start))?;
            let mut candidate = vec![0u8; (key_end - key_start) as usize];
            self.data.read_exact(&mut candidate)?;

            match key.cmp(candidate.as_slice()) {
                std::cmp::Ordering::Equal => {
                    let mut slot = vec![0u8; (value_end - key_end) as usize];
                    self.data.read_exact(&mut slot)?;
                    return Ok(Some(Value::decode(&slot)?));
                }
                std::cmp::Ordering::Less => hi = mid - 1,
                std::cmp::Ordering::Greater => lo = mid + 1,
            }
        }

        Ok(None)
    }

    /// Sequential scan over all entries, yielding keys and raw value slots.
    pub fn cursor(self) -> Result<RunCursor> {
        let mut metadata = BufReader::new(File::open(&self.metadata_path)?);
        let start = metadata.read_u64::<LittleEndian>()?;
        Ok(RunCursor {
            data: BufReader::new(File::open(&self.data_path)?),
            metadata,
            prev_offset: start,
            remaining: self.entries,
        })
    }

    /// Rebuild the run's Bloom filter by walking the offset index and
    /// reading only the key ranges of the data file. Used at startup.
    pub fn build_filter(&self) -> Result<BloomFilter> {
        let mut filter = BloomFilter::new();
        let mut metadata = BufReader::new(File::open(&self.metadata_path)?);
        let mut data = BufReader::new(File::open(&self.data_path)?);

        let mut prev = metadata.read_u64::<LittleEndian>()?;
        for _ in 0..self.entries {
            let key_end = metadata.read_u64::<LittleEndian>()?;
            let value_end = metadata.read_u64::<LittleEndian>()?;

            let mut key = vec![0u8; (key_end - prev) as usize];
            data.read_exact(&mut key)?;
            filter.add(&key);

            data.seek_relative((value_end - key_end) as i64)?;
            prev = value_end;
        }

        Ok(filter)
    }
}

/// Buffered forward scan of a run, used by the compaction merge.
pub struct RunCursor {
    data: BufReader<File>,
    metadata: BufReader<File>,
    prev_offset: u64,
    remaining: u64,
}

impl RunCursor {
    /// Read the next entry, or `None` past the end.
    pub fn next_entry(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        if self.remaining == 0 {
            return Ok(None);
        }

        let key_end = self.metadata.read_u64::<LittleEndian>()?;
        let value_end = self.metadata.read_u64::<LittleEndian>()?;

        let mut key = vec![0u8; (key_end - self.prev_offset) as usize];
        self.data.read_exact(&mut key)?;
        let mut slot = vec![0u8; (value_end - key_end) as usize];
        self.data.read_exact(&mut slot)?;

        self.prev_offset = value_end;
        self.remaining -= 1;
        Ok(Some((key, slot)))
    }
}
