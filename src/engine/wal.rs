//! Write-ahead log for durability and crash recovery.
//!
//! Every mutation is appended (and fsynced) here before it becomes visible
//! in the memtable, so a crash can never lose an acknowledged write. Exactly
//! two WAL files rotate: the active log covers the active memtable, and the
//! frozen log covers the frozen memtable until its flush completes, at which
//! point the frozen log is deleted.
//!
//! # Record format
//!
//! ```text
//! +---------------+------------------------------------------+-----------+
//! | frame_len:u32 | payload                                  | crc32:u32 |
//! +---------------+------------------------------------------+-----------+
//!                 | key_len:u64 | val_len:u64 | key | value  |
//!                 +------------------------------------------+
//! ```
//!
//! All integers are little-endian. `value` is the tagged slot encoding from
//! [`Value`], so `val_len` is always at least 1. The CRC32 covers the
//! payload. Replay verifies each frame and treats the first invalid or
//! truncated record as the end of the log: a torn tail write is discarded
//! rather than replayed as garbage.

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc::{Crc, CRC_32_ISCSI};

use super::value::Value;
use crate::errdata;
use crate::error::Result;

use std::fs::{File, OpenOptions};
use std::io::{BufReader, Cursor, Read, Write};
use std::path::{Path, PathBuf};

pub const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

/// Append handle for the active WAL file.
pub struct Wal {
    file: File,
    path: PathBuf,
}

impl Wal {
    /// Create a fresh, empty WAL, truncating any existing file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    /// Open an existing WAL for appending, keeping its contents (recovery).
    pub fn open_append(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append one record and fsync. Returns only once the bytes are durable.
    pub fn append(&mut self, key: &[u8], value: &Value) -> Result<()> {
        let slot = value.encode();

        let mut payload = Vec::with_capacity(16 + key.len() + slot.len());
        payload.write_u64::<LittleEndian>(key.len() as u64)?;
        payload.write_u64::<LittleEndian>(slot.len() as u64)?;
        payload.extend_from_slice(key);
        payload.extend_from_slice(&slot);

        let checksum = CRC32.checksum(&payload);

        let mut frame = Vec::with_capacity(8 + payload.len());
        frame.write_u32::<LittleEndian>(payload.len() as u32)?;
        frame.extend_from_slice(&payload);
        frame.write_u32::<LittleEndian>(checksum)?;

        self.file.write_all(&frame)?;
        self.file.sync_data()?;

        Ok(())
    }

    /// Rotate: move the active file to the frozen slot name and start a
    /// fresh active WAL at the original path.
    pub fn rotate(&mut self, frozen_path: &Path) -> Result<()> {
        self.file.sync_data()?;
        std::fs::rename(&self.path, frozen_path)?;
        self.file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&self.path)?;
        Ok(())
    }

    /// Stream the records of a WAL file.
    pub fn replay(path: &Path) -> Result<ReplayIterator> {
        ReplayIterator::new(path)
    }
}

/// Iterates the records of a WAL file, stopping at the first invalid record.
pub struct ReplayIterator {
    reader: BufReader<File>,
    path: PathBuf,
    done: bool,
}

impl ReplayIterator {
    fn new(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        Ok(Self {
            reader: BufReader::new(file),
            path: path.to_path_buf(),
            done: false,
        })
    }

    /// Read one frame. `Ok(None)` is a clean end of log: either EOF on a
    /// frame boundary, or a truncated/corrupt tail record.
    fn read_record(&mut self) -> Result<Option<(Vec<u8>, Value)>> {
        let frame_len = match self.reader.read_u32::<LittleEndian>() {
            Ok(len) => len as usize,
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut payload = vec![0u8; frame_len];
        if self.reader.read_exact(&mut payload).is_err() {
            tracing::warn!(path = %self.path.display(), "truncated record at WAL tail, discarding");
            return Ok(None);
        }
        let stored_crc = match self.reader.read_u32::<LittleEndian>() {
            Ok(crc) => crc,
            Err(_) => {
                tracing::warn!(path = %self.path.display(), "truncated checksum at WAL tail, discarding");
                return Ok(None);
            }
        };
        if CRC32.checksum(&payload) != stored_crc {
            tracing::warn!(path = %self.path.display(), "checksum mismatch in WAL, stopping replay");
            return Ok(None);
        }

        let mut cursor = Cursor::new(&payload);
        let key_len = cursor.read_u64::<LittleEndian>()? as usize;
        let val_len = cursor.read_u64::<LittleEndian>()? as usize;

        if 16 + key_len + val_len != frame_len {
            return errdata!(
                "WAL record length mismatch: frame {frame_len}, key {key_len}, value {val_len}"
            );
        }

        let mut key = vec![0u8; key_len];
        cursor.read_exact(&mut key)?;
        let mut slot = vec![0u8; val_len];
        cursor.read_exact(&mut slot)?;

        Ok(Some((key, Value::decode(&slot)?)))
    }
}

impl Iterator for ReplayIterator {
    type Item = Result<(Vec<u8>, Value)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
