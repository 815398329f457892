//! Engine Module
//!
//! The public database handle that coordinates all components.
//!
//! ## Responsibilities
//! - Open/create/lock the file according to the open mode
//! - Route key operations to the bucket manager and commit after each one
//! - Track handle health and the last error diagnostic
//! - Reorganize and recover through write-then-rename image replacement
//! - Export/import and dump/load through the transfer formats

use std::fmt;
use std::fs::Metadata;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;

use crate::bucket::{capacity_for, BucketManager, BucketStats, StoreOutcome};
use crate::config::{Config, SyncStrategy};
use crate::error::{HashKvError, Result};
use crate::mode::{OpenFlags, OpenMode};
use crate::rebuild::{temp_image, ImageBuilder};
use crate::recovery::{self, Health, RecoveryOptions, RecoveryReport};
use crate::storage::{copy_file_metadata, check_magic, PageFile, PageStore};
use crate::transfer::{DumpReader, DumpWriter, ExportReader, ExportWriter, ImportPolicy};

/// What the handle currently holds
enum Backend {
    /// A structurally sound, open store
    Ready(BucketManager),
    /// A file whose metadata failed to load; only recovery can use it
    Damaged(PageFile),
}

struct Inner {
    path: PathBuf,
    flags: OpenFlags,
    config: Config,
    backend: Backend,
    health: Health,
    closed: bool,
}

/// An open database
///
/// ## Concurrency Model
///
/// - One handle serialises its own operations behind a mutex, so a
///   `Database` can be shared between threads.
/// - Across handles and processes, an advisory file lock admits either one
///   writer or any number of readers (unless opened with `L`).
/// - Each mutation is atomic with respect to crashes: new data is written
///   before anything points at it and the header write publishes it.
pub struct Database {
    inner: Mutex<Inner>,

    /// Diagnostic of the most recent failed operation on this handle
    last_error: Mutex<Option<String>>,
}

impl fmt::Debug for Database {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut out = f.debug_struct("Database");
        // Never block: the handle may be formatted while an operation runs
        match self.inner.try_lock() {
            Some(inner) => out
                .field("path", &inner.path)
                .field("mode", &inner.flags.mode)
                .field("health", &inner.health)
                .field("closed", &inner.closed)
                .finish(),
            None => out.finish_non_exhaustive(),
        }
    }
}

impl Database {
    /// Open `path` with a mode string (`"r"`, `"w"`, `"c"`, `"n"` plus the
    /// `L`, `M` and `S` modifiers) and default configuration.
    pub fn open(path: impl AsRef<Path>, mode: &str) -> Result<Self> {
        let flags = OpenFlags::parse(mode)?;
        Self::open_with(path, flags, Config::default())
    }

    /// Open `path` with explicit flags and configuration.
    ///
    /// A file whose metadata is damaged still opens; the handle then
    /// reports [`Health::NeedsRecovery`] and only accepts `recover`.
    pub fn open_with(path: impl AsRef<Path>, flags: OpenFlags, mut config: Config) -> Result<Self> {
        config.validate()?;
        if flags.sync {
            config.sync_strategy = SyncStrategy::EveryWrite;
        }

        let path = path.as_ref().to_path_buf();
        let mut file = PageFile::open(&path, &flags, &config)?;

        let (backend, health) = if file.is_empty() {
            if !flags.mode.creates() {
                return Err(HashKvError::EmptyDatabase);
            }
            let capacity = capacity_for(config.block_size);
            let store = PageStore::format(file, config.block_size, capacity, config.sync_strategy)?;
            let manager = BucketManager::format(store, config.cache_buckets, config.merge_on_delete)?;
            tracing::info!(
                "Created database {} (block size {}, bucket capacity {})",
                path.display(),
                config.block_size,
                capacity
            );
            (Backend::Ready(manager), Health::Healthy)
        } else {
            check_magic(&mut file)?;
            match recovery::check_metadata(&mut file)? {
                None => {
                    let store = PageStore::open(file, !flags.mode.is_writable(), config.sync_strategy)?;
                    let manager =
                        BucketManager::open(store, config.cache_buckets, config.merge_on_delete)?;
                    tracing::info!(
                        "Opened database {} ({:?}, {} directory slots)",
                        path.display(),
                        flags.mode,
                        manager.directory().bucket_count()
                    );
                    (Backend::Ready(manager), Health::Healthy)
                }
                Some(reason) => {
                    tracing::warn!("Database {} needs recovery: {}", path.display(), reason);
                    (Backend::Damaged(file), Health::NeedsRecovery)
                }
            }
        };

        Ok(Self {
            inner: Mutex::new(Inner {
                path,
                flags,
                config,
                backend,
                health,
                closed: false,
            }),
            last_error: Mutex::new(None),
        })
    }

    /// Flush and release the handle, reporting any error
    pub fn close(self) -> Result<()> {
        self.run(|inner| {
            inner.flush()?;
            inner.closed = true;
            Ok(())
        })
    }

    // =========================================================================
    // Key Operations
    // =========================================================================

    /// Value stored under `key`; `KeyNotFound` if absent
    pub fn fetch(&self, key: &[u8]) -> Result<Vec<u8>> {
        self.run(|inner| inner.manager()?.lookup(key)?.ok_or(HashKvError::KeyNotFound))
    }

    /// True if `key` is stored
    pub fn exists(&self, key: &[u8]) -> Result<bool> {
        self.run(|inner| inner.manager()?.contains(key))
    }

    /// Store a new key; `KeyExists` if it is already present
    pub fn insert(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.run(|inner| {
            let manager = inner.writable_manager()?;
            manager.insert(key, value)?;
            manager.store_mut().operation_done()
        })
    }

    /// Store `key`, overwriting any existing value
    pub fn replace(&self, key: &[u8], value: &[u8]) -> Result<StoreOutcome> {
        self.run(|inner| {
            let manager = inner.writable_manager()?;
            let outcome = manager.replace(key, value)?;
            manager.store_mut().operation_done()?;
            Ok(outcome)
        })
    }

    /// Remove `key`; `KeyNotFound` if absent
    pub fn delete(&self, key: &[u8]) -> Result<()> {
        self.run(|inner| {
            let manager = inner.writable_manager()?;
            manager.delete(key)?;
            manager.store_mut().operation_done()
        })
    }

    /// First key in traversal order, `None` for an empty database
    pub fn firstkey(&self) -> Result<Option<Vec<u8>>> {
        self.run(|inner| inner.manager()?.first_key())
    }

    /// Key after `key` in traversal order, `None` at the end.
    ///
    /// Fails with `KeyNotFound` if `key` is not stored.
    pub fn nextkey(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.run(|inner| inner.manager()?.next_after(key))
    }

    /// Iterate over all keys.
    ///
    /// Order is unspecified. Mutating the database while iterating may
    /// skip keys or end the iteration with `KeyNotFound`.
    pub fn keys(&self) -> Keys<'_> {
        Keys {
            db: self,
            current: None,
            started: false,
            done: false,
        }
    }

    /// Iterate over all `(key, value)` pairs, in the order of [`keys`](Self::keys)
    pub fn iter(&self) -> Iter<'_> {
        Iter { keys: self.keys() }
    }

    /// Number of stored records
    pub fn count(&self) -> Result<u64> {
        self.run(|inner| inner.manager()?.count())
    }

    // =========================================================================
    // Maintenance
    // =========================================================================

    /// Commit pending metadata and fsync
    pub fn sync(&self) -> Result<()> {
        self.run(|inner| inner.manager()?.store_mut().flush())
    }

    /// Rewrite the file compactly, dropping all free space
    pub fn reorganize(&self) -> Result<()> {
        self.run(|inner| {
            let block_size = inner.writable_manager()?.store().block_size();
            let temp = temp_image(&inner.path)?;
            let mut builder = ImageBuilder::new(temp.as_file().try_clone()?, block_size)?;

            let manager = inner.manager()?;
            manager.store_mut().flush()?;
            let before = manager.store().file().len();
            manager.for_each_record(|record| builder.add(&record.key, &record.value))?;
            let records = builder.len();
            let image = builder.finish()?;
            let metadata = manager.store().file().metadata()?;
            copy_file_metadata(&metadata, &image)?;
            drop(image);

            inner.install(temp)?;
            let after = inner.manager()?.store().file().len();
            tracing::info!(
                "Reorganized {}: {} records, {} -> {} bytes",
                inner.path.display(),
                records,
                before,
                after
            );
            Ok(())
        })
    }

    /// Check the file structure (header, free list, directory, every
    /// bucket). Also true once an operation on this handle has hit
    /// corruption.
    pub fn needs_recovery(&self) -> bool {
        let result = self.run(|inner| {
            if inner.health != Health::Healthy {
                return Ok(true);
            }
            match recovery::check_structure(inner.file_mut())? {
                None => Ok(false),
                Some(reason) => {
                    inner.mark_damaged(&reason);
                    Ok(true)
                }
            }
        });
        result.unwrap_or(true)
    }

    /// Rebuild the database from the record frames in the file.
    ///
    /// Without `force`, a database that checks out healthy is left alone
    /// and an empty report is returned.
    pub fn recover(&self, options: RecoveryOptions) -> Result<RecoveryReport> {
        self.run(|inner| {
            if !inner.flags.mode.is_writable() {
                return Err(HashKvError::ReadOnly);
            }
            if !options.force
                && inner.health == Health::Healthy
                && recovery::check_structure(inner.file_mut())?.is_none()
            {
                return Ok(RecoveryReport::default());
            }

            match inner.recover(&options) {
                Ok(report) => Ok(report),
                Err(e) => {
                    if matches!(e, HashKvError::Unrecoverable(_)) && inner.health != Health::Healthy {
                        inner.health = Health::Unrecoverable;
                    }
                    Err(e)
                }
            }
        })
    }

    /// Current handle health
    pub fn health(&self) -> Health {
        self.inner.lock().health
    }

    /// Directory and bucket statistics
    pub fn bucket_stats(&self) -> Result<BucketStats> {
        self.run(|inner| inner.manager()?.stats())
    }

    /// Copy permissions, timestamps and ownership of `source`'s file onto
    /// this database's file.
    pub fn copy_metadata(&self, source: &Database) -> Result<()> {
        if std::ptr::eq(self, source) {
            return Ok(());
        }
        let metadata = source.run(|inner| inner.file_mut().metadata())?;

        self.run(|inner| {
            if !inner.flags.mode.is_writable() {
                return Err(HashKvError::ReadOnly);
            }
            inner.file_mut().apply_metadata(&metadata)
        })
    }

    // =========================================================================
    // Transfer
    // =========================================================================

    /// Write every record to a binary export file; returns the count
    pub fn export(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.run(|inner| {
            let mut writer = ExportWriter::create(path)?;
            inner
                .manager()?
                .for_each_record(|record| writer.write_record(&record.key, &record.value))?;
            let count = writer.finish()?;
            tracing::info!("Exported {} records to {}", count, path.display());
            Ok(count)
        })
    }

    /// Read records from a binary export file; returns the count stored
    pub fn import(&self, path: impl AsRef<Path>, policy: ImportPolicy) -> Result<u64> {
        let path = path.as_ref();
        self.run(|inner| {
            inner.writable_manager()?;
            let count = inner.store_all(ExportReader::open(path)?, policy)?;
            tracing::info!("Imported {} records from {}", count, path.display());
            Ok(count)
        })
    }

    /// Write every record to an ASCII dump file; returns the count
    pub fn dump(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        self.run(|inner| {
            let source_name = inner
                .path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            let metadata = inner.manager()?.store().file().metadata()?;

            let mut writer = DumpWriter::create(path, &source_name, file_mode(&metadata))?;
            inner
                .manager()?
                .for_each_record(|record| writer.write_record(&record.key, &record.value))?;
            let count = writer.finish()?;
            tracing::info!("Dumped {} records to {}", count, path.display());
            Ok(count)
        })
    }

    /// Read records from an ASCII dump file; returns the count stored
    pub fn load(&self, path: impl AsRef<Path>, policy: ImportPolicy) -> Result<u64> {
        let path = path.as_ref();
        self.run(|inner| {
            inner.writable_manager()?;
            let count = inner.store_all(DumpReader::open(path)?, policy)?;
            tracing::info!("Loaded {} records from {}", count, path.display());
            Ok(count)
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Diagnostic of the most recent failed operation on this handle
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    pub fn path(&self) -> PathBuf {
        self.inner.lock().path.clone()
    }

    pub fn mode(&self) -> OpenMode {
        self.inner.lock().flags.mode
    }

    pub fn config(&self) -> Config {
        self.inner.lock().config.clone()
    }

    /// Run `op` under the handle lock, recording failures
    fn run<T>(&self, op: impl FnOnce(&mut Inner) -> Result<T>) -> Result<T> {
        let mut inner = self.inner.lock();
        let result = op(&mut inner);

        if let Err(e) = &result {
            if e.is_structural() && !matches!(e, HashKvError::NeedsRecovery) {
                inner.mark_damaged(&e.to_string());
            }
            *self.last_error.lock() = Some(e.diagnostic());
        }
        result
    }
}

impl Drop for Database {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        if inner.closed {
            return;
        }
        if let Err(e) = inner.flush() {
            tracing::warn!("Failed to flush {} on drop: {}", inner.path.display(), e);
        }
    }
}

impl Inner {
    /// The bucket manager of a healthy handle
    fn manager(&mut self) -> Result<&mut BucketManager> {
        match (&mut self.backend, self.health) {
            (Backend::Ready(manager), Health::Healthy) => Ok(manager),
            (_, Health::Unrecoverable) => Err(HashKvError::Unrecoverable(
                "an earlier recovery attempt failed".to_string(),
            )),
            _ => Err(HashKvError::NeedsRecovery),
        }
    }

    fn writable_manager(&mut self) -> Result<&mut BucketManager> {
        if !self.flags.mode.is_writable() {
            return Err(HashKvError::ReadOnly);
        }
        self.manager()
    }

    fn file_mut(&mut self) -> &mut PageFile {
        match &mut self.backend {
            Backend::Ready(manager) => manager.store_mut().file_mut(),
            Backend::Damaged(file) => file,
        }
    }

    fn mark_damaged(&mut self, reason: &str) {
        if self.health == Health::Healthy {
            tracing::warn!("Database {} needs recovery: {}", self.path.display(), reason);
            self.health = Health::NeedsRecovery;
        }
    }

    fn flush(&mut self) -> Result<()> {
        match (&mut self.backend, self.health) {
            (Backend::Ready(manager), Health::Healthy) => manager.store_mut().flush(),
            _ => Ok(()),
        }
    }

    /// Store every record from `records`, committing after each one
    fn store_all<I>(&mut self, records: I, policy: ImportPolicy) -> Result<u64>
    where
        I: Iterator<Item = Result<(Vec<u8>, Vec<u8>)>>,
    {
        let manager = self.writable_manager()?;
        let mut count = 0u64;
        for record in records {
            let (key, value) = record?;
            match policy {
                ImportPolicy::Insert => manager.insert(&key, &value)?,
                ImportPolicy::Replace => {
                    manager.replace(&key, &value)?;
                }
            }
            manager.store_mut().operation_done()?;
            count += 1;
        }
        Ok(count)
    }

    fn recover(&mut self, options: &RecoveryOptions) -> Result<RecoveryReport> {
        let block_size = self.config.block_size;
        let salvage = recovery::scan(self.file_mut(), block_size, options.max_failures)?;

        let temp = temp_image(&self.path)?;
        let (image, recovered) = salvage.rebuild(self.file_mut(), temp.as_file().try_clone()?)?;
        let metadata = self.file_mut().metadata()?;
        copy_file_metadata(&metadata, &image)?;
        drop(image);

        let backup_path = if options.backup {
            let backup = recovery::backup_path(&self.path);
            std::fs::rename(&self.path, &backup)?;
            Some(backup)
        } else {
            None
        };

        self.install(temp)?;

        let report = RecoveryReport {
            recovered,
            discarded: salvage.discarded(),
            duplicates: salvage.duplicates(),
            uncommitted: salvage.uncommitted(),
            backup_path,
        };
        tracing::info!(
            "Recovered {}: {} records, {} frames discarded, {} duplicates, {} uncommitted",
            self.path.display(),
            report.recovered,
            report.discarded,
            report.duplicates,
            report.uncommitted
        );
        Ok(report)
    }

    /// Replace the database file with a finished image.
    ///
    /// The image is locked before it is renamed into place, and the old
    /// handle is dropped only afterwards, so the path is never unlocked.
    fn install(&mut self, temp: NamedTempFile) -> Result<()> {
        let file = PageFile::adopt(temp.as_file().try_clone()?, &self.path, &self.flags, &self.config)?;
        temp.persist(&self.path).map_err(|e| HashKvError::Io(e.error))?;

        let store = PageStore::open(file, false, self.config.sync_strategy)?;
        let manager = BucketManager::open(store, self.config.cache_buckets, self.config.merge_on_delete)?;
        self.backend = Backend::Ready(manager);
        self.health = Health::Healthy;
        Ok(())
    }
}

#[cfg(unix)]
fn file_mode(metadata: &Metadata) -> Option<u32> {
    use std::os::unix::fs::PermissionsExt;
    Some(metadata.permissions().mode())
}

#[cfg(not(unix))]
fn file_mode(_metadata: &Metadata) -> Option<u32> {
    None
}

// =============================================================================
// Iterators
// =============================================================================

/// Iterator over the keys of a [`Database`]
pub struct Keys<'a> {
    db: &'a Database,
    current: Option<Vec<u8>>,
    started: bool,
    done: bool,
}

impl Iterator for Keys<'_> {
    type Item = Result<Vec<u8>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }

        let result = if self.started {
            match &self.current {
                Some(key) => self.db.nextkey(key),
                None => Ok(None),
            }
        } else {
            self.started = true;
            self.db.firstkey()
        };

        match result {
            Ok(Some(key)) => {
                self.current = Some(key.clone());
                Some(Ok(key))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

/// Iterator over the `(key, value)` pairs of a [`Database`]
pub struct Iter<'a> {
    keys: Keys<'a>,
}

impl Iterator for Iter<'_> {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = match self.keys.next()? {
            Ok(key) => key,
            Err(e) => return Some(Err(e)),
        };
        match self.keys.db.fetch(&key) {
            Ok(value) => Some(Ok((key, value))),
            Err(e) => {
                self.keys.done = true;
                Some(Err(e))
            }
        }
    }
}
