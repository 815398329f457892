//! Directory
//!
//! Maps the top `bits` bits of a key hash to a bucket offset. A bucket of
//! depth `d` owns an aligned range of `2^(bits - d)` consecutive slots.
//!
//! ## On-disk form
//! A sealed `{ bits: u32, slots: Vec<u64> }` in a region named by the header.

use serde::{Deserialize, Serialize};

use crate::error::{HashKvError, Result};
use crate::hash;
use crate::storage::{align_up, seal, unseal, PageStore, RegionPtr, ALIGN};

/// Largest directory: 2^24 slots (128 MiB of pointers)
pub const MAX_DIRECTORY_BITS: u32 = 24;

#[derive(Serialize, Deserialize)]
struct DirectoryImage {
    bits: u32,
    slots: Vec<u64>,
}

/// In-memory directory
#[derive(Debug, Clone)]
pub struct Directory {
    bits: u32,
    slots: Vec<u64>,
    /// Region currently holding the persisted directory
    region: RegionPtr,
}

impl Directory {
    /// A directory of one slot pointing at `bucket_offset`
    pub fn new(bucket_offset: u64) -> Self {
        Self {
            bits: 0,
            slots: vec![bucket_offset],
            region: RegionPtr::NONE,
        }
    }

    /// Build from explicit slots; `slots.len()` must be `2^bits`
    pub fn from_slots(bits: u32, slots: Vec<u64>) -> Result<Self> {
        if bits > MAX_DIRECTORY_BITS || slots.len() != 1usize << bits {
            return Err(HashKvError::CorruptStructure(format!(
                "directory: {} slots do not match {} bits",
                slots.len(),
                bits
            )));
        }
        Ok(Self {
            bits,
            slots,
            region: RegionPtr::NONE,
        })
    }

    /// Load the directory named by the store's header
    pub fn load(store: &mut PageStore) -> Result<Self> {
        let region = store.header().directory;
        if region.is_none() {
            return Err(HashKvError::CorruptStructure(
                "header names no directory".to_string(),
            ));
        }

        let bytes = store.read(region.offset, region.size as usize)?;
        let mut directory = Self::decode(&bytes)?;
        directory.validate_pointers(store.block_size() as u64, store.header().next_block)?;
        directory.region = region;
        Ok(directory)
    }

    /// Decode a sealed directory image
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let image: DirectoryImage = unseal(bytes, "directory")?;
        Self::from_slots(image.bits, image.slots)
    }

    /// Encode as a sealed directory image
    pub fn encode(&self) -> Result<Vec<u8>> {
        seal(&DirectoryImage {
            bits: self.bits,
            slots: self.slots.clone(),
        })
    }

    /// Check that every slot points at an aligned offset inside
    /// `[start, end)`
    pub fn validate_pointers(&self, start: u64, end: u64) -> Result<()> {
        for (slot, &offset) in self.slots.iter().enumerate() {
            if offset < start || offset >= end || offset % ALIGN != 0 {
                return Err(HashKvError::CorruptStructure(format!(
                    "directory slot {} points outside allocated space ({})",
                    slot, offset
                )));
            }
        }
        Ok(())
    }

    // =========================================================================
    // Lookup
    // =========================================================================

    /// Number of hash bits used for routing
    pub fn bits(&self) -> u32 {
        self.bits
    }

    pub fn slots(&self) -> &[u64] {
        &self.slots
    }

    /// Number of directory slots (`2^bits`)
    pub fn bucket_count(&self) -> usize {
        self.slots.len()
    }

    /// Slot a hash routes to
    pub fn slot_for(&self, key_hash: u64) -> usize {
        hash::prefix(key_hash, self.bits) as usize
    }

    /// Bucket offset a hash routes to
    pub fn bucket_for(&self, key_hash: u64) -> u64 {
        self.slots[self.slot_for(key_hash)]
    }

    /// Slot range `(start, len)` owned by a bucket of `depth` containing
    /// `slot`
    pub fn range_of(&self, slot: usize, depth: u32) -> (usize, usize) {
        debug_assert!(depth <= self.bits);
        let len = 1usize << (self.bits - depth);
        (slot & !(len - 1), len)
    }

    /// Distinct buckets in directory order as `(first slot, offset)`
    pub fn distinct_buckets(&self) -> Vec<(usize, u64)> {
        let mut out: Vec<(usize, u64)> = Vec::new();
        for (slot, &offset) in self.slots.iter().enumerate() {
            if out.last().map(|&(_, last)| last) != Some(offset) {
                out.push((slot, offset));
            }
        }
        out
    }

    // =========================================================================
    // Mutation
    // =========================================================================

    /// Double the directory: slot `i` becomes slots `2i` and `2i + 1`
    pub fn grow(&mut self) -> Result<()> {
        if self.bits >= MAX_DIRECTORY_BITS {
            return Err(HashKvError::DirectoryFull { bits: self.bits });
        }

        let mut slots = Vec::with_capacity(self.slots.len() * 2);
        for &offset in &self.slots {
            slots.push(offset);
            slots.push(offset);
        }
        self.slots = slots;
        self.bits += 1;

        tracing::debug!(bits = self.bits, slots = self.slots.len(), "Directory doubled");
        Ok(())
    }

    /// Point `len` slots starting at `start` at `offset`
    pub fn set_range(&mut self, start: usize, len: usize, offset: u64) {
        for slot in &mut self.slots[start..start + len] {
            *slot = offset;
        }
    }

    /// Write the directory back.
    ///
    /// The image always goes to a freshly allocated region; the header commit
    /// that names it also frees the previous one, so a torn write never
    /// damages the directory the header currently points at.
    pub fn persist(&mut self, store: &mut PageStore) -> Result<()> {
        let bytes = self.encode()?;

        let block = store.block_size() as u64;
        let size = align_up((bytes.len() as u64).div_ceil(block) * block);
        let offset = store.allocate(size)?;
        store.write(offset, &bytes)?;

        let old = self.region;
        self.region = RegionPtr::new(offset, size);
        store.header_mut().directory = self.region;
        if !old.is_none() {
            store.free(old.offset, old.size)?;
        }
        store.commit()
    }

    /// Region holding the persisted directory
    pub fn region(&self) -> RegionPtr {
        self.region
    }
}
