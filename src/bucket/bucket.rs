//! Bucket blocks
//!
//! A bucket is one block holding up to `capacity` placement entries. Every
//! entry's hash shares the bucket's `depth`-bit prefix.

use serde::{Deserialize, Serialize};

use crate::error::{HashKvError, Result};
use crate::hash;
use crate::record::{alloc_len, frame_len, FRAME_HEADER_SIZE};
use crate::storage::{seal, unseal, SEAL_OVERHEAD};

/// Bytes of key stored inline for a quick mismatch check
pub const KEY_PREFIX_LEN: usize = 4;

/// Encoded size of one entry: hash (8) + offset (8) + key size (4) +
/// data size (4) + key prefix (4)
pub const ENTRY_SIZE: usize = 28;

/// Seal (8) + depth (4) + entry count (8)
pub const BUCKET_OVERHEAD: usize = SEAL_OVERHEAD + 4 + 8;

/// Entries that fit in one block of `block_size` bytes
pub fn capacity_for(block_size: u32) -> u32 {
    ((block_size as usize).saturating_sub(BUCKET_OVERHEAD) / ENTRY_SIZE) as u32
}

/// Placement of one record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketEntry {
    pub hash: u64,
    /// Offset of the record frame
    pub offset: u64,
    pub key_size: u32,
    pub data_size: u32,
    pub key_prefix: [u8; KEY_PREFIX_LEN],
}

impl BucketEntry {
    pub fn new(hash: u64, offset: u64, key: &[u8], data_size: usize) -> Self {
        Self {
            hash,
            offset,
            key_size: key.len() as u32,
            data_size: data_size as u32,
            key_prefix: key_prefix(key),
        }
    }

    /// Offset of the key bytes
    pub fn key_offset(&self) -> u64 {
        self.offset + FRAME_HEADER_SIZE
    }

    /// Offset of the data bytes
    pub fn data_offset(&self) -> u64 {
        self.key_offset() + self.key_size as u64
    }

    /// Unpadded frame length
    pub fn frame_len(&self) -> u64 {
        frame_len(self.key_size as usize, self.data_size as usize)
    }

    /// Bytes the frame occupies in the page store
    pub fn alloc_len(&self) -> u64 {
        alloc_len(self.key_size as usize, self.data_size as usize)
    }

    /// Cheap pre-check before comparing stored key bytes
    pub fn may_match(&self, key_hash: u64, key: &[u8]) -> bool {
        self.hash == key_hash
            && self.key_size as usize == key.len()
            && self.key_prefix == key_prefix(key)
    }
}

fn key_prefix(key: &[u8]) -> [u8; KEY_PREFIX_LEN] {
    let mut prefix = [0u8; KEY_PREFIX_LEN];
    let n = key.len().min(KEY_PREFIX_LEN);
    prefix[..n].copy_from_slice(&key[..n]);
    prefix
}

/// A decoded bucket
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    /// Number of hash bits shared by all entries
    pub depth: u32,
    pub entries: Vec<BucketEntry>,
}

impl Bucket {
    pub fn new(depth: u32) -> Self {
        Self {
            depth,
            entries: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_full(&self, capacity: usize) -> bool {
        self.entries.len() >= capacity
    }

    /// Encode as a sealed block zero padded to `block_size`
    pub fn encode(&self, block_size: u32) -> Result<Vec<u8>> {
        let mut bytes = seal(self)?;
        if bytes.len() > block_size as usize {
            return Err(HashKvError::Serialization(format!(
                "bucket of {} entries does not fit a {} byte block",
                self.entries.len(),
                block_size
            )));
        }
        bytes.resize(block_size as usize, 0);
        Ok(bytes)
    }

    /// Decode a bucket block and check it against `capacity`
    pub fn decode(bytes: &[u8], capacity: usize) -> Result<Self> {
        let bucket: Bucket = unseal(bytes, "bucket")?;
        if bucket.entries.len() > capacity {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket holds {} entries, capacity is {}",
                bucket.entries.len(),
                capacity
            )));
        }
        if bucket.depth > 64 {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket depth {} out of range",
                bucket.depth
            )));
        }
        Ok(bucket)
    }

    /// Check that every entry carries the `prefix` this bucket owns
    pub fn check_prefix(&self, prefix: u64) -> Result<()> {
        for entry in &self.entries {
            if hash::prefix(entry.hash, self.depth) != prefix {
                return Err(HashKvError::CorruptStructure(format!(
                    "bucket entry hash {:016x} outside bucket prefix {:x}/{}",
                    entry.hash, prefix, self.depth
                )));
            }
        }
        Ok(())
    }

    /// Redistribute entries into two buckets one bit deeper
    pub fn split(&self) -> (Bucket, Bucket) {
        let mut low = Bucket::new(self.depth + 1);
        let mut high = Bucket::new(self.depth + 1);
        for entry in &self.entries {
            if hash::split_bit(entry.hash, self.depth) {
                high.entries.push(*entry);
            } else {
                low.entries.push(*entry);
            }
        }
        (low, high)
    }

    /// Combine two buddy buckets into one bucket one bit shallower
    pub fn merge(low: &Bucket, high: &Bucket) -> Bucket {
        debug_assert_eq!(low.depth, high.depth);
        let mut merged = Bucket::new(low.depth.saturating_sub(1));
        merged.entries.extend_from_slice(&low.entries);
        merged.entries.extend_from_slice(&high.entries);
        merged
    }
}
