//! Image Rebuilder
//!
//! Writes a complete, compact database image from a stream of records.
//! Used by `reorganize` and `recover`, which both build the image in a
//! temporary file beside the database and rename it over the original.
//!
//! ## Image layout
//! ```text
//! ┌────────────┬──────────────────────────┬───────────────┬───────────┐
//! │ Header     │ Record frames            │ Bucket blocks │ Directory │
//! │ (1 block)  │ (in the order added)     │ (minimal)     │           │
//! └────────────┴──────────────────────────┴───────────────┴───────────┘
//! ```
//! The bucket partition is the shallowest one in which no bucket exceeds
//! its capacity, so the image carries no free space.

use std::fs::File;
use std::io::{BufWriter, Seek, SeekFrom, Write};
use std::path::Path;

use tempfile::NamedTempFile;

use crate::bucket::{capacity_for, Bucket, BucketEntry};
use crate::config::validate_block_size;
use crate::directory::{Directory, MAX_DIRECTORY_BITS};
use crate::error::{HashKvError, Result};
use crate::hash::{self, key_hash};
use crate::record;
use crate::storage::{align_up, FileHeader, RegionPtr};

/// Create an empty temporary file in the directory holding `path`
pub fn temp_image(path: &Path) -> Result<NamedTempFile> {
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "hashkv".to_string());

    let temp = tempfile::Builder::new()
        .prefix(&format!(".{}.", name))
        .suffix(".tmp")
        .tempfile_in(dir)?;
    Ok(temp)
}

/// One bucket of the final partition
struct Leaf {
    depth: u32,
    prefix: u64,
    entries: Vec<BucketEntry>,
}

/// Sequential writer of a fresh database image.
///
/// Keys passed to [`ImageBuilder::add`] must be unique.
pub struct ImageBuilder {
    writer: BufWriter<File>,
    block_size: u32,
    capacity: usize,
    /// Offset of the next frame
    current_offset: u64,
    entries: Vec<BucketEntry>,
    next_seq: u64,
}

impl ImageBuilder {
    /// Start an image in `file`, discarding its previous contents
    pub fn new(file: File, block_size: u32) -> Result<Self> {
        validate_block_size(block_size)?;
        file.set_len(0)?;

        let mut writer = BufWriter::new(file);
        writer.seek(SeekFrom::Start(0))?;
        // Header block placeholder, rewritten by finish()
        writer.write_all(&vec![0u8; block_size as usize])?;

        Ok(Self {
            writer,
            block_size,
            capacity: capacity_for(block_size) as usize,
            current_offset: block_size as u64,
            entries: Vec::new(),
            next_seq: 1,
        })
    }

    /// Append one record
    pub fn add(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        let frame = record::encode(self.next_seq, self.current_offset, key, value)?;
        self.writer.write_all(&frame)?;

        self.entries
            .push(BucketEntry::new(key_hash(key), self.current_offset, key, value.len()));
        self.current_offset += frame.len() as u64;
        self.next_seq += 1;
        Ok(())
    }

    /// Records added so far
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Write buckets, directory and header, sync, and hand back the file
    pub fn finish(mut self) -> Result<File> {
        let mut entries = std::mem::take(&mut self.entries);
        entries.sort_by_key(|e| e.hash);

        let mut leaves = Vec::new();
        partition(&entries, 0, 0, self.capacity, &mut leaves)?;
        let bits = leaves.iter().map(|l| l.depth).max().unwrap_or(0);

        // Buckets
        let block = self.block_size as u64;
        let mut slots = vec![0u64; 1usize << bits];
        for leaf in &leaves {
            let bucket = Bucket {
                depth: leaf.depth,
                entries: leaf.entries.clone(),
            };
            self.writer.write_all(&bucket.encode(self.block_size)?)?;

            let len = 1usize << (bits - leaf.depth);
            let start = (leaf.prefix as usize) << (bits - leaf.depth);
            for slot in &mut slots[start..start + len] {
                *slot = self.current_offset;
            }
            self.current_offset += block;
        }

        // Directory, in a region of whole blocks
        let directory = Directory::from_slots(bits, slots)?.encode()?;
        let region_size = align_up((directory.len() as u64).div_ceil(block) * block);
        let mut region = directory;
        region.resize(region_size as usize, 0);
        self.writer.write_all(&region)?;
        let directory_region = RegionPtr::new(self.current_offset, region_size);
        self.current_offset += region_size;

        // Header last
        let mut header = FileHeader::new(self.block_size, self.capacity as u32);
        header.directory = directory_region;
        header.next_block = self.current_offset;
        header.next_seq = self.next_seq;
        header.committed_seq = self.next_seq - 1;

        self.writer.flush()?;
        let mut file = self.writer.into_inner().map_err(|e| e.into_error())?;
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header.encode()?)?;
        file.set_len(header.next_block)?;
        file.sync_all()?;

        tracing::debug!(
            records = entries.len(),
            buckets = leaves.len(),
            bits,
            size = header.next_block,
            "Image written"
        );
        Ok(file)
    }
}

/// Split hash-sorted `entries` on successive hash bits until every part
/// fits a bucket.
fn partition(
    entries: &[BucketEntry],
    depth: u32,
    prefix: u64,
    capacity: usize,
    leaves: &mut Vec<Leaf>,
) -> Result<()> {
    if entries.len() <= capacity {
        leaves.push(Leaf {
            depth,
            prefix,
            entries: entries.to_vec(),
        });
        return Ok(());
    }
    if depth >= MAX_DIRECTORY_BITS {
        return Err(HashKvError::DirectoryFull { bits: depth });
    }

    let mid = entries.partition_point(|e| !hash::split_bit(e.hash, depth));
    partition(&entries[..mid], depth + 1, prefix << 1, capacity, leaves)?;
    partition(&entries[mid..], depth + 1, (prefix << 1) | 1, capacity, leaves)
}
