//! Page Store
//!
//! Allocation, free-space management and metadata commit on top of a
//! [`PageFile`].
//!
//! ## Concurrency:
//! - Owned by exactly one handle; every method takes `&mut self`
//! - Cross-process exclusion comes from the file lock held by `PageFile`

use crate::config::SyncStrategy;
use crate::error::{HashKvError, Result};

use super::avail::{AvailBlock, AvailList};
use super::file::PageFile;
use super::header::{read_header, FileHeader, RegionPtr};
use super::seal::{seal, unseal};
use super::align_up;

/// Block store for one database file
pub struct PageStore {
    file: PageFile,
    header: FileHeader,
    avail: AvailList,

    /// Header (and maybe free list) differ from what is on disk
    meta_dirty: bool,

    /// Free list differs from what is on disk
    avail_dirty: bool,

    read_only: bool,
    sync_strategy: SyncStrategy,

    /// Mutations since the last fsync
    unsynced_ops: usize,
}

impl PageStore {
    /// Format an empty file: header block only, nothing allocated yet
    pub fn format(
        mut file: PageFile,
        block_size: u32,
        bucket_capacity: u32,
        sync_strategy: SyncStrategy,
    ) -> Result<Self> {
        let header = FileHeader::new(block_size, bucket_capacity);
        file.set_len(header.next_block)?;

        let mut store = Self {
            file,
            header,
            avail: AvailList::new(),
            meta_dirty: true,
            avail_dirty: false,
            read_only: false,
            sync_strategy,
            unsynced_ops: 0,
        };
        store.commit()?;
        Ok(store)
    }

    /// Open an existing file.
    ///
    /// Validates the header, the file length against the end of allocated
    /// space and loads the current free list.
    pub fn open(mut file: PageFile, read_only: bool, sync_strategy: SyncStrategy) -> Result<Self> {
        let header = read_header(&mut file)?;

        if file.len() < header.next_block {
            return Err(HashKvError::CorruptStructure(format!(
                "file truncated: {} bytes on disk, {} allocated",
                file.len(),
                header.next_block
            )));
        }

        let avail = load_avail(&mut file, &header)?;

        Ok(Self {
            file,
            header,
            avail,
            meta_dirty: false,
            avail_dirty: false,
            read_only,
            sync_strategy,
            unsynced_ops: 0,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn header(&self) -> &FileHeader {
        &self.header
    }

    /// Mutable header access; the header is rewritten on the next commit
    pub fn header_mut(&mut self) -> &mut FileHeader {
        self.meta_dirty = true;
        &mut self.header
    }

    pub fn block_size(&self) -> u32 {
        self.header.block_size
    }

    pub fn avail(&self) -> &AvailList {
        &self.avail
    }

    pub fn file(&self) -> &PageFile {
        &self.file
    }

    pub fn file_mut(&mut self) -> &mut PageFile {
        &mut self.file
    }

    /// Claim the next record sequence number
    pub fn next_seq(&mut self) -> u64 {
        let seq = self.header.next_seq;
        self.header_mut().next_seq = seq + 1;
        seq
    }

    // =========================================================================
    // Allocation
    // =========================================================================

    /// Allocate a region of at least `size` bytes.
    ///
    /// Served from the free list when possible, otherwise by extending the
    /// file. The allocation is committed before the next data write.
    pub fn allocate(&mut self, size: u64) -> Result<u64> {
        self.ensure_writable()?;
        if size == 0 {
            return Err(HashKvError::InvalidArgument(
                "cannot allocate an empty region".to_string(),
            ));
        }

        let size = align_up(size);
        if let Some(offset) = self.avail.take(size) {
            self.avail_dirty = true;
            self.meta_dirty = true;
            return Ok(offset);
        }
        self.extend(size)
    }

    /// Return a region to the free list
    pub fn free(&mut self, offset: u64, size: u64) -> Result<()> {
        self.ensure_writable()?;
        let size = align_up(size);
        if offset < self.header.block_size as u64 || offset + size > self.header.next_block {
            return Err(HashKvError::CorruptStructure(format!(
                "free of region {}+{} outside allocated space",
                offset, size
            )));
        }

        self.avail.release(offset, size)?;
        while let Some(tail) = self.avail.pop_tail(self.header.next_block) {
            self.header.next_block = tail.offset;
        }
        self.avail_dirty = true;
        self.meta_dirty = true;
        Ok(())
    }

    /// Grow the allocated space by `size` bytes.
    ///
    /// The file is extended before the header can record the new end, so the
    /// file is never shorter than a committed header claims.
    fn extend(&mut self, size: u64) -> Result<u64> {
        let offset = self.header.next_block;
        let end = offset + size;
        if self.file.len() < end {
            self.file.set_len(end)?;
        }
        self.header.next_block = end;
        self.meta_dirty = true;
        Ok(offset)
    }

    // =========================================================================
    // I/O
    // =========================================================================

    /// Read `len` bytes at `offset`; the range must lie in allocated space
    pub fn read(&mut self, offset: u64, len: usize) -> Result<Vec<u8>> {
        if offset < self.header.block_size as u64
            || offset + len as u64 > self.header.next_block
        {
            return Err(HashKvError::CorruptStructure(format!(
                "read of {} bytes at offset {} outside allocated space",
                len, offset
            )));
        }
        let mut buf = vec![0u8; len];
        self.file.read_at(offset, &mut buf)?;
        Ok(buf)
    }

    /// Write `data` at `offset`, committing pending metadata first
    pub fn write(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.ensure_writable()?;
        if self.meta_dirty {
            self.commit()?;
        }
        self.file.write_at(offset, data)
    }

    /// Persist the free list (if changed) and the header
    pub fn commit(&mut self) -> Result<()> {
        if !self.meta_dirty {
            return Ok(());
        }
        self.ensure_writable()?;

        if self.avail_dirty {
            self.write_avail()?;
            self.avail_dirty = false;
        }

        let bytes = self.header.encode()?;
        self.file.write_at(0, &bytes)?;
        self.meta_dirty = false;
        Ok(())
    }

    /// Commit, marking every frame written so far as belonging to a
    /// completed operation
    pub fn commit_records(&mut self) -> Result<()> {
        let last = self.header.next_seq - 1;
        if self.header.committed_seq != last {
            self.header.committed_seq = last;
            self.meta_dirty = true;
        }
        self.commit()
    }

    /// Commit and force everything to the storage device
    pub fn flush(&mut self) -> Result<()> {
        if self.read_only {
            return Ok(());
        }
        self.commit()?;
        self.file.sync()?;
        self.unsynced_ops = 0;
        Ok(())
    }

    /// Mark the end of one mutating operation: commit, then fsync as the
    /// sync strategy demands.
    pub fn operation_done(&mut self) -> Result<()> {
        self.commit_records()?;
        self.unsynced_ops += 1;

        let due = match self.sync_strategy {
            SyncStrategy::OnDemand => false,
            SyncStrategy::EveryWrite => true,
            SyncStrategy::EveryNWrites { count } => self.unsynced_ops >= count,
        };
        if due {
            self.file.sync()?;
            self.unsynced_ops = 0;
        }
        Ok(())
    }

    /// Write the free list into the slot that is not current, growing it if
    /// needed, and make it current. Only the header write that follows
    /// publishes the switch.
    fn write_avail(&mut self) -> Result<()> {
        let target = 1 - (self.header.avail_current & 1) as usize;

        loop {
            let slot = self.header.avail[target];
            if self.avail.is_empty() && slot.is_none() {
                break;
            }

            let bytes = seal(&self.avail.blocks())?;
            if bytes.len() as u64 <= slot.size {
                self.file.write_at(slot.offset, &bytes)?;
                break;
            }

            // The replacement region always comes from the end of the file so
            // the list being written does not change underneath us.
            let size = align_up((bytes.len() as u64 * 2).max(self.header.block_size as u64));
            let offset = self.extend(size)?;
            self.header.avail[target] = RegionPtr::new(offset, size);
            if !slot.is_none() {
                self.avail.release(slot.offset, slot.size)?;
            }
        }

        self.header.avail_current = target as u8;
        Ok(())
    }

    fn ensure_writable(&self) -> Result<()> {
        if self.read_only {
            return Err(HashKvError::ReadOnly);
        }
        Ok(())
    }
}

/// Load the free list the header marks as current
fn load_avail(file: &mut PageFile, header: &FileHeader) -> Result<AvailList> {
    let region = header.current_avail();
    if region.is_none() {
        return Ok(AvailList::new());
    }
    if region.end() > header.next_block {
        return Err(HashKvError::CorruptStructure(format!(
            "free list region {}+{} outside allocated space",
            region.offset, region.size
        )));
    }

    let mut buf = vec![0u8; region.size as usize];
    file.read_at(region.offset, &mut buf)?;
    let blocks: Vec<AvailBlock> = unseal(&buf, "free list")?;
    AvailList::from_blocks(blocks, header.next_block)
}

/// Validate the metadata of a file without building a store.
///
/// Used by structural checks; returns the header on success.
pub(crate) fn inspect_metadata(file: &mut PageFile) -> Result<FileHeader> {
    let header = read_header(file)?;
    if file.len() < header.next_block {
        return Err(HashKvError::CorruptStructure(format!(
            "file truncated: {} bytes on disk, {} allocated",
            file.len(),
            header.next_block
        )));
    }
    load_avail(file, &header)?;
    Ok(header)
}
