//! Configuration for hashkv
//!
//! Centralized configuration with sensible defaults.

use crate::error::{HashKvError, Result};

/// Smallest supported block size (bucket capacity 3)
pub const MIN_BLOCK_SIZE: u32 = 128;

/// Largest supported block size
pub const MAX_BLOCK_SIZE: u32 = 64 * 1024;

/// Main configuration for a database handle
#[derive(Debug, Clone)]
pub struct Config {
    // -------------------------------------------------------------------------
    // Layout Configuration (only used when a file is created)
    // -------------------------------------------------------------------------
    /// Size of one bucket block in bytes (power of two).
    /// Existing files keep the block size recorded in their header.
    pub block_size: u32,

    /// Permission bits for newly created files (unix only, umask applies)
    pub file_mode: u32,

    // -------------------------------------------------------------------------
    // Runtime Configuration
    // -------------------------------------------------------------------------
    /// Number of decoded buckets kept in memory
    pub cache_buckets: usize,

    /// Sync strategy: how often to fsync after mutations
    pub sync_strategy: SyncStrategy,

    /// Merge sparse buddy buckets after deletes
    pub merge_on_delete: bool,

    /// Wait for the file lock instead of failing with `LockUnavailable`
    pub blocking_lock: bool,
}

/// Sync strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStrategy {
    /// fsync only on `sync()` and `close()`
    OnDemand,

    /// fsync after every mutation (safest, slowest)
    EveryWrite,

    /// fsync after N mutations (balanced durability/performance)
    EveryNWrites { count: usize },
}

impl Default for Config {
    fn default() -> Self {
        Self {
            block_size: 4096,
            file_mode: 0o666,
            cache_buckets: 128,
            sync_strategy: SyncStrategy::OnDemand,
            merge_on_delete: true,
            blocking_lock: false,
        }
    }
}

impl Config {
    /// Create a new config builder
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::default()
    }

    /// Check that the configuration describes a usable layout
    pub fn validate(&self) -> Result<()> {
        validate_block_size(self.block_size)?;
        if self.cache_buckets == 0 {
            return Err(HashKvError::Config(
                "cache_buckets must be at least 1".to_string(),
            ));
        }
        if let SyncStrategy::EveryNWrites { count: 0 } = self.sync_strategy {
            return Err(HashKvError::Config(
                "EveryNWrites count must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

/// Validate a block size from configuration or from a file header
pub fn validate_block_size(block_size: u32) -> Result<()> {
    if !block_size.is_power_of_two() || !(MIN_BLOCK_SIZE..=MAX_BLOCK_SIZE).contains(&block_size) {
        return Err(HashKvError::Config(format!(
            "block size {} must be a power of two in {}..={}",
            block_size, MIN_BLOCK_SIZE, MAX_BLOCK_SIZE
        )));
    }
    Ok(())
}

/// Builder for Config
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the block size for newly created files
    pub fn block_size(mut self, size: u32) -> Self {
        self.config.block_size = size;
        self
    }

    /// Set the permission bits for newly created files
    pub fn file_mode(mut self, mode: u32) -> Self {
        self.config.file_mode = mode;
        self
    }

    /// Set the number of cached buckets
    pub fn cache_buckets(mut self, count: usize) -> Self {
        self.config.cache_buckets = count;
        self
    }

    /// Set the sync strategy
    pub fn sync_strategy(mut self, strategy: SyncStrategy) -> Self {
        self.config.sync_strategy = strategy;
        self
    }

    /// Enable or disable bucket merging after deletes
    pub fn merge_on_delete(mut self, enabled: bool) -> Self {
        self.config.merge_on_delete = enabled;
        self
    }

    /// Block on lock acquisition instead of failing
    pub fn blocking_lock(mut self, enabled: bool) -> Self {
        self.config.blocking_lock = enabled;
        self
    }

    pub fn build(self) -> Config {
        self.config
    }
}
