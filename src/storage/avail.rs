//! Free-space list
//!
//! Free regions sorted by offset and kept coalesced, so two entries never
//! touch. Allocation is best-fit, carving from the front of the chosen
//! region.

use serde::{Deserialize, Serialize};

use crate::error::{HashKvError, Result};

use super::ALIGN;

/// One free region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct AvailBlock {
    pub offset: u64,
    pub size: u64,
}

impl AvailBlock {
    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// In-memory free-space list
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AvailList {
    blocks: Vec<AvailBlock>,
}

impl AvailList {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuild a list loaded from disk, validating that it is sorted,
    /// aligned, non-overlapping and below `limit`.
    pub fn from_blocks(blocks: Vec<AvailBlock>, limit: u64) -> Result<Self> {
        let mut prev_end = 0u64;
        for block in &blocks {
            if block.size == 0 || block.offset % ALIGN != 0 || block.size % ALIGN != 0 {
                return Err(HashKvError::CorruptStructure(format!(
                    "free list: misaligned region {}+{}",
                    block.offset, block.size
                )));
            }
            if block.offset < prev_end || block.end() > limit {
                return Err(HashKvError::CorruptStructure(format!(
                    "free list: region {}+{} overlaps or exceeds allocated space",
                    block.offset, block.size
                )));
            }
            prev_end = block.end();
        }
        Ok(Self { blocks })
    }

    pub fn blocks(&self) -> &[AvailBlock] {
        &self.blocks
    }

    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Total free bytes
    pub fn total_free(&self) -> u64 {
        self.blocks.iter().map(|b| b.size).sum()
    }

    /// Take `size` bytes (already aligned) from the smallest region that
    /// fits. Returns the offset, or `None` when nothing fits.
    pub fn take(&mut self, size: u64) -> Option<u64> {
        let (index, _) = self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, b)| b.size >= size)
            .min_by_key(|(_, b)| b.size)?;

        let block = &mut self.blocks[index];
        let offset = block.offset;
        if block.size == size {
            self.blocks.remove(index);
        } else {
            block.offset += size;
            block.size -= size;
        }
        Some(offset)
    }

    /// Return a region to the list, merging it with adjacent regions.
    ///
    /// Overlap with a region already free is a double free and reported as
    /// corruption.
    pub fn release(&mut self, offset: u64, size: u64) -> Result<()> {
        if size == 0 {
            return Ok(());
        }
        let end = offset + size;
        let index = self.blocks.partition_point(|b| b.offset < offset);

        if index > 0 && self.blocks[index - 1].end() > offset {
            return Err(double_free(offset, size));
        }
        if index < self.blocks.len() && self.blocks[index].offset < end {
            return Err(double_free(offset, size));
        }

        let merges_prev = index > 0 && self.blocks[index - 1].end() == offset;
        let merges_next = index < self.blocks.len() && self.blocks[index].offset == end;

        match (merges_prev, merges_next) {
            (true, true) => {
                let next = self.blocks.remove(index);
                self.blocks[index - 1].size += size + next.size;
            }
            (true, false) => self.blocks[index - 1].size += size,
            (false, true) => {
                self.blocks[index].offset = offset;
                self.blocks[index].size += size;
            }
            (false, false) => self.blocks.insert(index, AvailBlock { offset, size }),
        }
        Ok(())
    }

    /// Remove and return the last region if it ends exactly at `end`
    pub fn pop_tail(&mut self, end: u64) -> Option<AvailBlock> {
        match self.blocks.last() {
            Some(last) if last.end() == end => self.blocks.pop(),
            _ => None,
        }
    }
}

fn double_free(offset: u64, size: u64) -> HashKvError {
    HashKvError::CorruptStructure(format!(
        "free list: region {}+{} is already free",
        offset, size
    ))
}
