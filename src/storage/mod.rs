//! Storage Module
//!
//! The page store: a single file of fixed-size blocks and variable-size
//! regions.
//!
//! ## Responsibilities
//! - Positioned reads/writes, optional memory-mapped reads
//! - Advisory locking (shared readers / exclusive writer)
//! - Region allocation with a coalescing free-space list
//! - Header commit: the single write that publishes metadata changes
//!
//! ## File Format
//! ```text
//! ┌────────────────────────────────────────────────────────────┐
//! │ Header block (block_size bytes, sealed header at offset 0) │
//! ├────────────────────────────────────────────────────────────┤
//! │ Regions (16-byte aligned, in allocation order):            │
//! │   record frames | bucket blocks | directory | free lists   │
//! └────────────────────────────────────────────────────────────┘
//!
//! Sealed block:
//! ┌──────────────┬──────────────┬──────────────────────────────┐
//! │ BodyLen (4)  │ CRC32 (4)    │ bincode body                 │
//! └──────────────┴──────────────┴──────────────────────────────┘
//! ```
//!
//! ## Write ordering
//! Pending metadata (free list + header) is committed before any data write,
//! so a region is durable-allocated before it is used and only returned to
//! the free list after it has been unlinked.

mod avail;
mod file;
mod header;
mod page_store;
mod seal;

pub use avail::{AvailBlock, AvailList};
pub use file::{copy_file_metadata, PageFile};
pub use header::{check_magic, read_header, FileHeader, RegionPtr, FORMAT_VERSION, MAGIC};
pub use page_store::PageStore;
pub(crate) use page_store::inspect_metadata;
pub use seal::{seal, unseal, SEAL_OVERHEAD};

/// Allocation granule; every region starts and ends on this boundary
pub const ALIGN: u64 = 16;

/// Round `n` up to the allocation granule
pub fn align_up(n: u64) -> u64 {
    (n + ALIGN - 1) & !(ALIGN - 1)
}
