//! The value slot of a record: either user bytes or a deletion marker.
//!
//! Deletes are recorded as tombstones and shadow older versions of the key
//! as they sink through the tiers, until a compaction into the deepest tier
//! drops them. On disk a value slot is one tag byte followed by the value
//! bytes, so any byte string (including the empty string) is a valid user
//! value.

use crate::errdata;
use crate::error::Result;

const TAG_TOMBSTONE: u8 = 0;
const TAG_PUT: u8 = 1;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Value {
    Put(Vec<u8>),
    Tombstone,
}

impl Value {
    /// The user-visible payload length. Tombstones count as zero bytes
    /// toward the memtable size.
    pub fn len(&self) -> usize {
        match self {
            Value::Put(bytes) => bytes.len(),
            Value::Tombstone => 0,
        }
    }

    /// Serialize into the on-disk slot encoding: tag byte + payload.
    pub fn encode(&self) -> Vec<u8> {
        match self {
            Value::Put(bytes) => {
                let mut buf = Vec::with_capacity(1 + bytes.len());
                buf.push(TAG_PUT);
                buf.extend_from_slice(bytes);
                buf
            }
            Value::Tombstone => vec![TAG_TOMBSTONE],
        }
    }

    /// Decode an on-disk value slot.
    pub fn decode(slot: &[u8]) -> Result<Self> {
        match slot.split_first() {
            Some((&TAG_PUT, bytes)) => Ok(Value::Put(bytes.to_vec())),
            Some((&TAG_TOMBSTONE, [])) => Ok(Value::Tombstone),
            Some((&TAG_TOMBSTONE, _)) => errdata!("tombstone slot with payload"),
            Some((tag, _)) => errdata!("unknown value tag {tag}"),
            None => errdata!("empty value slot"),
        }
    }

    /// Whether an encoded slot holds a tombstone, without decoding the
    /// payload. Used by the compactor when re-emitting raw slots.
    pub fn slot_is_tombstone(slot: &[u8]) -> bool {
        slot.first() == Some(&TAG_TOMBSTONE)
    }
}
