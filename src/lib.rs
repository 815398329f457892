//! # hashkv
//!
//! An embedded, single-file hashed key/value database with:
//! - Extendible hashing (directory doubling, bucket split and merge)
//! - Crash-consistent single-key mutations through ordered writes
//! - Shared-reader / exclusive-writer advisory file locking
//! - Salvage-based recovery, binary export and ASCII dump
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                   Database (engine.rs)                      │
//! │        open modes · health · last error · transfer          │
//! └─────────────────────┬───────────────────────────────────────┘
//!                       │
//! ┌─────────────────────▼───────────────────────────────────────┐
//! │                 Bucket Manager (bucket/)                    │
//! │     lookup · insert · replace · delete · split · merge      │
//! └──────────┬──────────────────────────────────┬───────────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────┐                ┌─────────────────┐
//!   │    Directory    │                │  Record Codec   │
//!   │ (hash → bucket) │                │ (framed k/v)    │
//!   └────────┬────────┘                └────────┬────────┘
//!            │                                  │
//!            ▼                                  ▼
//!   ┌─────────────────────────────────────────────────────┐
//!   │                 Page Store (storage/)               │
//!   │   file · lock · mmap · allocation · header commit   │
//!   └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example
//!
//! ```no_run
//! use hashkv::Database;
//!
//! let db = Database::open("data.db", "c")?;
//! db.insert(b"a", b"1")?;
//! db.replace(b"a", b"9")?;
//! assert_eq!(db.fetch(b"a")?, b"9");
//! db.close()?;
//! # Ok::<(), hashkv::HashKvError>(())
//! ```

// =============================================================================
// Module Declarations
// =============================================================================

pub mod error;
pub mod config;
pub mod mode;
pub mod capability;

pub mod hash;
pub mod storage;
pub mod record;
pub mod directory;
pub mod bucket;
pub mod rebuild;
pub mod recovery;
pub mod transfer;
pub mod engine;

// =============================================================================
// Public API Re-exports
// =============================================================================

pub use error::{ErrorKind, HashKvError, Result};
pub use config::{Config, ConfigBuilder, SyncStrategy};
pub use mode::{OpenFlags, OpenMode};
pub use capability::Capabilities;
pub use bucket::{BucketStats, StoreOutcome};
pub use recovery::{Health, RecoveryOptions, RecoveryReport};
pub use transfer::ImportPolicy;
pub use engine::{Database, Iter, Keys};

// =============================================================================
// Version Info
// =============================================================================

/// Current version of hashkv
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
