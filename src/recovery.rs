//! Recovery Module
//!
//! Structural checks and salvage of damaged database files.
//!
//! ## Health
//! ```text
//! Healthy ──(corruption detected)──▶ NeedsRecovery ──(recover)──▶ Healthy
//!                                                    └───────────▶ Unrecoverable
//! ```
//!
//! ## Salvage scan
//! The file is read linearly at the 16-byte allocation granule. Every live
//! frame whose checksum verifies at the offset it was found is a candidate;
//! when several frames carry the same key the highest sequence number wins.
//! Frames newer than the header's committed sequence were written by an
//! operation that never completed and are skipped. Frames marked dead are
//! stepped over granule by granule, since their space may have been reused.
//! The survivors are written into a fresh image that replaces the file.

use std::collections::HashMap;
use std::fs::File;
use std::path::{Path, PathBuf};

use crate::bucket::{capacity_for, Bucket};
use crate::config::MIN_BLOCK_SIZE;
use crate::directory::Directory;
use crate::error::{ErrorKind, HashKvError, Result};
use crate::rebuild::ImageBuilder;
use crate::record::{self, RecordHeader, FRAME_HEADER_SIZE};
use crate::storage::{align_up, inspect_metadata, read_header, FileHeader, PageFile, ALIGN};

/// Bytes read from the file per scan window
const SCAN_WINDOW: usize = 1 << 20;

/// State of a database handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Health {
    Healthy,
    /// Corruption was detected; only recovery is permitted
    NeedsRecovery,
    /// A recovery attempt failed
    Unrecoverable,
}

/// Options for [`Database::recover`](crate::Database::recover)
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryOptions {
    /// Keep the damaged file as `<name>.~N~`
    pub backup: bool,
    /// Give up (leaving the file untouched) when more frames than this
    /// fail their checksum
    pub max_failures: Option<u64>,
    /// Rebuild even when the file checks out healthy
    pub force: bool,
}

impl RecoveryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn backup(mut self) -> Self {
        self.backup = true;
        self
    }

    pub fn max_failures(mut self, max: u64) -> Self {
        self.max_failures = Some(max);
        self
    }

    pub fn force(mut self) -> Self {
        self.force = true;
        self
    }
}

/// Outcome of a recovery
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Records written to the new image
    pub recovered: u64,
    /// Live frames rejected (bad checksum or running past end of file)
    pub discarded: u64,
    /// Older frames superseded by a newer frame of the same key
    pub duplicates: u64,
    /// Frames left behind by an operation that never completed
    pub uncommitted: u64,
    /// Where the damaged file was kept, if a backup was requested
    pub backup_path: Option<PathBuf>,
}

// =============================================================================
// Structural checks
// =============================================================================

/// Check header, free list and directory. `Ok(None)` when they are sound,
/// `Ok(Some(reason))` when they are damaged; I/O failures are errors.
pub fn check_metadata(file: &mut PageFile) -> Result<Option<String>> {
    as_damage(verify_metadata(file).map(|_| ()))
}

/// Full structural check: metadata plus every bucket
pub fn check_structure(file: &mut PageFile) -> Result<Option<String>> {
    as_damage(verify_structure(file))
}

fn as_damage(result: Result<()>) -> Result<Option<String>> {
    match result {
        Ok(()) => Ok(None),
        Err(e) if e.kind() == ErrorKind::CorruptStructure => Ok(Some(e.to_string())),
        Err(e) => Err(e),
    }
}

fn read_region(file: &mut PageFile, offset: u64, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    file.read_at(offset, &mut buf)?;
    Ok(buf)
}

fn verify_metadata(file: &mut PageFile) -> Result<(FileHeader, Directory)> {
    let header = inspect_metadata(file)?;
    let block = header.block_size as u64;

    let expected = capacity_for(header.block_size);
    if header.bucket_capacity != expected {
        return Err(HashKvError::CorruptStructure(format!(
            "bucket capacity {} does not match block size {}",
            header.bucket_capacity, header.block_size
        )));
    }

    let region = header.directory;
    if region.is_none() || region.offset < block || region.end() > header.next_block {
        return Err(HashKvError::CorruptStructure(format!(
            "directory region {}+{} outside allocated space",
            region.offset, region.size
        )));
    }

    let bytes = read_region(file, region.offset, region.size as usize)?;
    let directory = Directory::decode(&bytes)?;
    directory.validate_pointers(block, header.next_block)?;
    Ok((header, directory))
}

fn verify_structure(file: &mut PageFile) -> Result<()> {
    let (header, directory) = verify_metadata(file)?;
    let block = header.block_size as u64;
    let bits = directory.bits();

    for (slot, offset) in directory.distinct_buckets() {
        if offset + block > header.next_block {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket at {} runs past end of allocation",
                offset
            )));
        }

        let bytes = read_region(file, offset, block as usize)?;
        let bucket = Bucket::decode(&bytes, header.bucket_capacity as usize)?;
        if bucket.depth > bits {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket at {} deeper ({}) than directory ({})",
                offset, bucket.depth, bits
            )));
        }

        let (start, len) = directory.range_of(slot, bucket.depth);
        if start != slot || directory.slots()[start..start + len].iter().any(|&o| o != offset) {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket at {} does not own an aligned directory range",
                offset
            )));
        }
        bucket.check_prefix((slot >> (bits - bucket.depth)) as u64)?;

        for entry in &bucket.entries {
            if entry.offset < block
                || entry.offset % ALIGN != 0
                || entry.offset + entry.alloc_len() > header.next_block
            {
                return Err(HashKvError::CorruptStructure(format!(
                    "bucket at {} points at record {} outside allocated space",
                    offset, entry.offset
                )));
            }
        }
    }
    Ok(())
}

// =============================================================================
// Salvage
// =============================================================================

/// Newest frame seen for one key
#[derive(Debug, Clone, Copy)]
struct Survivor {
    seq: u64,
    offset: u64,
    frame_len: u64,
}

/// Result of a salvage scan
#[derive(Debug, Default)]
pub struct Salvage {
    survivors: HashMap<Vec<u8>, Survivor>,
    discarded: u64,
    duplicates: u64,
    uncommitted: u64,
    /// Block size for the rebuilt image
    block_size: u32,
}

impl Salvage {
    /// Number of distinct keys found
    pub(crate) fn len(&self) -> usize {
        self.survivors.len()
    }

    pub fn discarded(&self) -> u64 {
        self.discarded
    }

    pub fn duplicates(&self) -> u64 {
        self.duplicates
    }

    pub fn uncommitted(&self) -> u64 {
        self.uncommitted
    }

    fn offer(&mut self, key: Vec<u8>, candidate: Survivor) {
        match self.survivors.get_mut(&key) {
            Some(current) => {
                self.duplicates += 1;
                if candidate.seq > current.seq {
                    *current = candidate;
                }
            }
            None => {
                self.survivors.insert(key, candidate);
            }
        }
    }

    /// Write every survivor into a fresh image in `target`
    pub fn rebuild(&self, source: &mut PageFile, target: File) -> Result<(File, u64)> {
        let mut survivors: Vec<&Survivor> = self.survivors.values().collect();
        survivors.sort_by_key(|s| s.offset);

        let mut builder = ImageBuilder::new(target, self.block_size)?;
        for survivor in survivors {
            let bytes = read_region(source, survivor.offset, survivor.frame_len as usize)?;
            let record = record::decode(&bytes, survivor.offset)?;
            builder.add(&record.key, &record.value)?;
        }
        let recovered = builder.len() as u64;
        Ok((builder.finish()?, recovered))
    }
}

/// A buffered view of the file for the linear scan
struct ScanWindow {
    start: u64,
    buf: Vec<u8>,
}

impl ScanWindow {
    fn new() -> Self {
        Self {
            start: 0,
            buf: Vec::new(),
        }
    }

    /// `len` bytes at `offset`; the range must lie within `file_len`
    fn bytes(&mut self, file: &mut PageFile, offset: u64, len: usize, file_len: u64) -> Result<&[u8]> {
        let end = offset + len as u64;
        if offset < self.start || end > self.start + self.buf.len() as u64 {
            let want = (len.max(SCAN_WINDOW) as u64).min(file_len - offset) as usize;
            self.buf.resize(want, 0);
            file.read_at(offset, &mut self.buf)?;
            self.start = offset;
        }
        let from = (offset - self.start) as usize;
        Ok(&self.buf[from..from + len])
    }
}

/// Scan `file` for live frames.
///
/// The block size and committed sequence come from the header when it is
/// still readable; otherwise `fallback_block_size` is used for the rebuilt
/// image and every verified frame is a candidate. Fails with
/// `Unrecoverable` when more than `max_failures` frames are rejected.
pub fn scan(file: &mut PageFile, fallback_block_size: u32, max_failures: Option<u64>) -> Result<Salvage> {
    let len = file.refresh_len()?;
    let (start, block_size, committed) = match read_header(file) {
        Ok(header) => (
            header.block_size as u64,
            header.block_size,
            Some(header.committed_seq),
        ),
        Err(e) => {
            tracing::warn!("Header unreadable, scanning whole file: {}", e);
            (MIN_BLOCK_SIZE as u64, fallback_block_size, None)
        }
    };

    let mut salvage = Salvage {
        block_size,
        ..Salvage::default()
    };
    let mut window = ScanWindow::new();
    let mut pos = align_up(start);

    while pos + FRAME_HEADER_SIZE <= len {
        let bytes = window.bytes(file, pos, FRAME_HEADER_SIZE as usize, len)?;
        let header = match RecordHeader::parse(bytes) {
            Some(header) if header.live => header,
            _ => {
                pos += ALIGN;
                continue;
            }
        };

        let frame_len = header.frame_len();
        if !header.is_plausible() || pos + frame_len > len {
            salvage.discarded += 1;
            pos += ALIGN;
            continue;
        }

        let frame = window.bytes(file, pos, frame_len as usize, len)?;
        match record::decode(frame, pos) {
            Ok(record) if committed.is_some_and(|c| record.seq > c) => {
                salvage.uncommitted += 1;
                pos += align_up(frame_len);
            }
            Ok(record) => {
                salvage.offer(
                    record.key,
                    Survivor {
                        seq: record.seq,
                        offset: pos,
                        frame_len,
                    },
                );
                pos += align_up(frame_len);
            }
            Err(_) => {
                salvage.discarded += 1;
                pos += ALIGN;
            }
        }

        if let Some(max) = max_failures {
            if salvage.discarded > max {
                return Err(HashKvError::Unrecoverable(format!(
                    "{} damaged frames exceed the limit of {}",
                    salvage.discarded, max
                )));
            }
        }
    }

    tracing::debug!(
        keys = salvage.len(),
        discarded = salvage.discarded,
        duplicates = salvage.duplicates,
        uncommitted = salvage.uncommitted,
        "Salvage scan finished"
    );
    Ok(salvage)
}

/// First free `<name>.~N~` beside `path`
pub fn backup_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let mut n = 1u32;
    loop {
        let candidate = path.with_file_name(format!("{}.~{}~", name, n));
        if !candidate.exists() {
            return candidate;
        }
        n += 1;
    }
}
