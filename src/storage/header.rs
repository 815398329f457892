//! File header
//!
//! The sealed header at offset 0 is the commit point of the file: it names
//! the directory region, the current free-list region and the end of
//! allocated space.

use serde::{Deserialize, Serialize};

use crate::config::{validate_block_size, MIN_BLOCK_SIZE};
use crate::error::{HashKvError, Result};

use super::file::PageFile;
use super::seal::{seal, unseal, SEAL_OVERHEAD};

/// Magic bytes identifying a hashkv database file
pub const MAGIC: [u8; 4] = *b"HSKV";

/// Current on-disk format version
pub const FORMAT_VERSION: u16 = 1;

/// Bytes read when looking for a header; every valid header fits
const HEADER_READ_LEN: u64 = MIN_BLOCK_SIZE as u64;

/// Location and size of an allocated region (size 0 means none)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegionPtr {
    pub offset: u64,
    pub size: u64,
}

impl RegionPtr {
    pub const NONE: RegionPtr = RegionPtr { offset: 0, size: 0 };

    pub fn new(offset: u64, size: u64) -> Self {
        Self { offset, size }
    }

    pub fn is_none(&self) -> bool {
        self.size == 0
    }

    pub fn end(&self) -> u64 {
        self.offset + self.size
    }
}

/// Database file header
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileHeader {
    pub magic: [u8; 4],
    pub version: u16,
    pub block_size: u32,
    pub bucket_capacity: u32,
    /// Directory region
    pub directory: RegionPtr,
    /// Two alternating free-list regions
    pub avail: [RegionPtr; 2],
    /// Index into `avail` of the region holding the current free list
    pub avail_current: u8,
    /// End of allocated space; the file is at least this long
    pub next_block: u64,
    /// Sequence number for the next record frame
    pub next_seq: u64,
    /// Highest sequence number written by a completed operation. Frames
    /// above it belong to an operation that never finished.
    pub committed_seq: u64,
}

impl FileHeader {
    /// Header for a freshly formatted file
    pub fn new(block_size: u32, bucket_capacity: u32) -> Self {
        Self {
            magic: MAGIC,
            version: FORMAT_VERSION,
            block_size,
            bucket_capacity,
            directory: RegionPtr::NONE,
            avail: [RegionPtr::NONE; 2],
            avail_current: 0,
            next_block: block_size as u64,
            next_seq: 1,
            committed_seq: 0,
        }
    }

    /// The region holding the current free list
    pub fn current_avail(&self) -> RegionPtr {
        self.avail[(self.avail_current & 1) as usize]
    }

    /// Encode as a sealed block
    pub fn encode(&self) -> Result<Vec<u8>> {
        seal(self)
    }

    /// Decode and validate a sealed header
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if !has_magic(bytes) {
            return Err(HashKvError::CorruptStructure(
                "not a hashkv database (bad magic)".to_string(),
            ));
        }

        let header: FileHeader = unseal(bytes, "header")?;

        if header.version != FORMAT_VERSION {
            return Err(HashKvError::CorruptStructure(format!(
                "unsupported format version {} (expected {})",
                header.version, FORMAT_VERSION
            )));
        }
        validate_block_size(header.block_size)
            .map_err(|e| HashKvError::CorruptStructure(format!("header: {}", e)))?;
        if header.bucket_capacity == 0 {
            return Err(HashKvError::CorruptStructure(
                "header: bucket capacity is zero".to_string(),
            ));
        }
        if header.next_block < header.block_size as u64 {
            return Err(HashKvError::CorruptStructure(format!(
                "header: end of allocation {} inside header block",
                header.next_block
            )));
        }
        if header.committed_seq >= header.next_seq {
            return Err(HashKvError::CorruptStructure(format!(
                "header: committed sequence {} not below next sequence {}",
                header.committed_seq, header.next_seq
            )));
        }
        Ok(header)
    }
}

fn has_magic(bytes: &[u8]) -> bool {
    bytes.len() >= SEAL_OVERHEAD + MAGIC.len()
        && bytes[SEAL_OVERHEAD..SEAL_OVERHEAD + MAGIC.len()] == MAGIC
}

fn read_prefix(file: &mut PageFile) -> Result<Vec<u8>> {
    let len = file.len().min(HEADER_READ_LEN) as usize;
    let mut buf = vec![0u8; len];
    file.read_at(0, &mut buf)?;
    Ok(buf)
}

/// Fail unless the file starts with the hashkv magic.
///
/// A file without the magic is not a damaged database but a foreign file,
/// and is never handed to recovery.
pub fn check_magic(file: &mut PageFile) -> Result<()> {
    if file.len() == 0 {
        return Err(HashKvError::EmptyDatabase);
    }
    let prefix = read_prefix(file)?;
    if !has_magic(&prefix) {
        return Err(HashKvError::InvalidArgument(format!(
            "{} is not a hashkv database",
            file.path().display()
        )));
    }
    Ok(())
}

/// Read and validate the header of an open file
pub fn read_header(file: &mut PageFile) -> Result<FileHeader> {
    if file.len() == 0 {
        return Err(HashKvError::EmptyDatabase);
    }
    let prefix = read_prefix(file)?;
    FileHeader::decode(&prefix)
}
