//! Bucket Module
//!
//! Fixed-capacity buckets and the manager that places records in them.
//!
//! ## Bucket Block
//! ```text
//! ┌──────────────┬──────────┬───────────┬──────────────────────────────┐
//! │ Seal (8)     │ Depth(4) │ Count (8) │ Entries (28 bytes each)      │
//! └──────────────┴──────────┴───────────┴──────────────────────────────┘
//! Entry: Hash (8) | RecordOffset (8) | KeySize (4) | DataSize (4) | KeyPrefix (4)
//! ```
//!
//! Iteration order follows the directory (bucket by bucket) and then slot
//! order within a bucket. It is neither insertion nor key order.

mod bucket;
mod manager;

pub use bucket::{capacity_for, Bucket, BucketEntry, BUCKET_OVERHEAD, ENTRY_SIZE, KEY_PREFIX_LEN};
pub use manager::{BucketManager, BucketStats, StoreMode, StoreOutcome};
