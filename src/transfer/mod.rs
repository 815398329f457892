//! Transfer Module
//!
//! Moving records in and out of a database through portable files:
//! - [`export`]: compact binary stream with a checksummed trailer
//! - [`dump`]: line-oriented ASCII backup (base64 data)
//!
//! Neither format depends on the block size or layout of the database.

pub mod dump;
pub mod export;

pub use dump::{DumpHeader, DumpReader, DumpWriter, DUMP_VERSION};
pub use export::{ExportReader, ExportWriter, EXPORT_MAGIC, EXPORT_VERSION};

/// How records read from a file treat keys already in the database
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ImportPolicy {
    /// Fail with `KeyExists` on the first key already present
    #[default]
    Insert,
    /// Overwrite existing values
    Replace,
}
