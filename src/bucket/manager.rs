//! Bucket Manager
//!
//! Routes keys through the directory to buckets and performs all record
//! placement: lookup, insert, replace, delete, split, merge and traversal.
//!
//! ## Write ordering
//! Every mutation writes new data before anything points at it:
//! - insert/replace: record frame → bucket (→ header commit → dead mark +
//!   free of the old frame)
//! - delete: bucket → dead mark → free
//! - split/merge: new bucket(s) → directory → free old bucket(s)
//!
//! An interrupted operation therefore leaves either the old or the new
//! structure reachable, at worst leaking the regions it had allocated.

use std::num::NonZeroUsize;

use lru::LruCache;

use crate::directory::{Directory, MAX_DIRECTORY_BITS};
use crate::error::{HashKvError, Result};
use crate::hash::key_hash;
use crate::record::{self, Record, DEAD_MAGIC};
use crate::storage::PageStore;

use super::bucket::{capacity_for, Bucket, BucketEntry};

/// How `store_record` treats an existing key
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    /// Fail with `KeyExists`
    Insert,
    /// Overwrite the value
    Replace,
}

/// What `store_record` did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Inserted,
    Replaced,
}

/// Structural statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BucketStats {
    pub directory_bits: u32,
    pub directory_slots: usize,
    pub buckets: usize,
    pub entries: u64,
    pub bucket_capacity: usize,
    pub block_size: u32,
    pub free_regions: usize,
    pub free_bytes: u64,
    pub allocated_bytes: u64,
    pub file_size: u64,
}

/// Owns the page store and directory of an open database
pub struct BucketManager {
    store: PageStore,
    directory: Directory,
    cache: LruCache<u64, Bucket>,
    capacity: usize,
    merge_on_delete: bool,
}

impl BucketManager {
    /// Lay out an empty table in a freshly formatted store: one empty
    /// bucket and a one-slot directory.
    pub fn format(mut store: PageStore, cache_buckets: usize, merge_on_delete: bool) -> Result<Self> {
        let block = store.block_size();
        let capacity = store.header().bucket_capacity as usize;

        let offset = store.allocate(block as u64)?;
        store.write(offset, &Bucket::new(0).encode(block)?)?;

        let mut directory = Directory::new(offset);
        directory.persist(&mut store)?;
        store.flush()?;

        Ok(Self {
            store,
            directory,
            cache: new_cache(cache_buckets),
            capacity,
            merge_on_delete,
        })
    }

    /// Load the directory of an existing store
    pub fn open(mut store: PageStore, cache_buckets: usize, merge_on_delete: bool) -> Result<Self> {
        let capacity = store.header().bucket_capacity as usize;
        let expected = capacity_for(store.block_size()) as usize;
        if capacity != expected {
            return Err(HashKvError::CorruptStructure(format!(
                "header bucket capacity {} does not match block size {} (expected {})",
                capacity,
                store.block_size(),
                expected
            )));
        }

        let directory = Directory::load(&mut store)?;
        Ok(Self {
            store,
            directory,
            cache: new_cache(cache_buckets),
            capacity,
            merge_on_delete,
        })
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    pub fn store(&self) -> &PageStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut PageStore {
        &mut self.store
    }

    pub fn directory(&self) -> &Directory {
        &self.directory
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    // =========================================================================
    // Queries
    // =========================================================================

    /// Value stored under `key`
    pub fn lookup(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = key_hash(key);
        let offset = self.directory.bucket_for(hash);
        self.lookup_in(offset, hash, key)
    }

    /// Value stored under `key` in the bucket at `bucket_offset`
    pub fn lookup_in(&mut self, bucket_offset: u64, hash: u64, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let bucket = self.load_bucket(bucket_offset)?;
        for entry in bucket.entries.iter().filter(|e| e.may_match(hash, key)) {
            let record = self.read_record(entry)?;
            if record.key == key {
                return Ok(Some(record.value));
            }
        }
        Ok(None)
    }

    /// True if `key` is stored
    pub fn contains(&mut self, key: &[u8]) -> Result<bool> {
        let hash = key_hash(key);
        let offset = self.directory.bucket_for(hash);
        let bucket = self.load_bucket(offset)?;
        Ok(self.find(&bucket, hash, key)?.is_some())
    }

    /// Read and verify the record an entry points at
    pub fn read_record(&mut self, entry: &BucketEntry) -> Result<Record> {
        let bytes = self.store.read(entry.offset, entry.frame_len() as usize)?;
        let record = record::decode(&bytes, entry.offset)?;
        if record.key.len() != entry.key_size as usize
            || record.value.len() != entry.data_size as usize
        {
            return Err(HashKvError::CorruptStructure(format!(
                "record at {} does not match its bucket entry",
                entry.offset
            )));
        }
        Ok(record)
    }

    /// Number of stored records
    pub fn count(&mut self) -> Result<u64> {
        let mut total = 0u64;
        for (_, offset) in self.directory.distinct_buckets() {
            total += self.load_bucket(offset)?.len() as u64;
        }
        Ok(total)
    }

    /// Every distinct bucket in directory order
    pub fn buckets(&mut self) -> Result<Vec<(u64, Bucket)>> {
        let mut out = Vec::new();
        for (_, offset) in self.directory.distinct_buckets() {
            out.push((offset, self.load_bucket(offset)?));
        }
        Ok(out)
    }

    /// Visit every record in traversal order
    pub fn for_each_record<F>(&mut self, mut f: F) -> Result<u64>
    where
        F: FnMut(Record) -> Result<()>,
    {
        let mut visited = 0u64;
        for (_, bucket) in self.buckets()? {
            for entry in &bucket.entries {
                f(self.read_record(entry)?)?;
                visited += 1;
            }
        }
        Ok(visited)
    }

    /// Structural statistics
    pub fn stats(&mut self) -> Result<BucketStats> {
        let buckets = self.directory.distinct_buckets();
        let mut entries = 0u64;
        for (_, offset) in &buckets {
            entries += self.load_bucket(*offset)?.len() as u64;
        }

        Ok(BucketStats {
            directory_bits: self.directory.bits(),
            directory_slots: self.directory.bucket_count(),
            buckets: buckets.len(),
            entries,
            bucket_capacity: self.capacity,
            block_size: self.store.block_size(),
            free_regions: self.store.avail().len(),
            free_bytes: self.store.avail().total_free(),
            allocated_bytes: self.store.header().next_block,
            file_size: self.store.file().len(),
        })
    }

    // =========================================================================
    // Traversal
    // =========================================================================

    /// First key in traversal order
    pub fn first_key(&mut self) -> Result<Option<Vec<u8>>> {
        self.first_key_from(0)
    }

    /// Key following `key` in traversal order; `KeyNotFound` if `key` is
    /// not stored.
    pub fn next_after(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let hash = key_hash(key);
        let slot = self.directory.slot_for(hash);
        let offset = self.directory.slots()[slot];
        let bucket = self.load_bucket(offset)?;
        let index = self
            .find(&bucket, hash, key)?
            .ok_or(HashKvError::KeyNotFound)?;

        if let Some(entry) = bucket.entries.get(index + 1) {
            return self.read_key(entry).map(Some);
        }

        let (start, len) = self.directory.range_of(slot, bucket.depth);
        self.first_key_from(start + len)
    }

    fn first_key_from(&mut self, mut slot: usize) -> Result<Option<Vec<u8>>> {
        while slot < self.directory.bucket_count() {
            let offset = self.directory.slots()[slot];
            let bucket = self.load_bucket(offset)?;
            if let Some(entry) = bucket.entries.first() {
                return self.read_key(entry).map(Some);
            }
            let (start, len) = self.directory.range_of(slot, bucket.depth);
            slot = start + len;
        }
        Ok(None)
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Insert `key` (failing with `KeyExists` if present)
    pub fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        self.store_record(key, value, StoreMode::Insert).map(|_| ())
    }

    /// Insert or overwrite `key`
    pub fn replace(&mut self, key: &[u8], value: &[u8]) -> Result<StoreOutcome> {
        self.store_record(key, value, StoreMode::Replace)
    }

    /// Store `key`/`value`, splitting buckets until one has room
    pub fn store_record(&mut self, key: &[u8], value: &[u8], mode: StoreMode) -> Result<StoreOutcome> {
        record::check_sizes(key, value)?;
        let hash = key_hash(key);

        loop {
            let offset = self.directory.bucket_for(hash);
            let mut bucket = self.load_bucket(offset)?;

            if let Some(index) = self.find(&bucket, hash, key)? {
                if mode == StoreMode::Insert {
                    return Err(HashKvError::KeyExists);
                }
                let old = bucket.entries[index];
                bucket.entries[index] = self.write_record(hash, key, value)?;
                self.write_bucket(offset, &bucket)?;
                // The new frame must count as committed before the old one dies
                self.store.commit_records()?;
                self.retire_record(&old)?;
                return Ok(StoreOutcome::Replaced);
            }

            if !bucket.is_full(self.capacity) {
                let entry = self.write_record(hash, key, value)?;
                bucket.entries.push(entry);
                self.write_bucket(offset, &bucket)?;
                return Ok(StoreOutcome::Inserted);
            }

            self.split(offset, hash)?;
        }
    }

    /// Remove `key`; `KeyNotFound` if absent
    pub fn delete(&mut self, key: &[u8]) -> Result<()> {
        let hash = key_hash(key);
        let offset = self.directory.bucket_for(hash);
        let mut bucket = self.load_bucket(offset)?;
        let index = self
            .find(&bucket, hash, key)?
            .ok_or(HashKvError::KeyNotFound)?;

        let old = bucket.entries.remove(index);
        self.write_bucket(offset, &bucket)?;
        self.retire_record(&old)?;

        if self.merge_on_delete {
            self.try_merge(offset, hash)?;
        }
        Ok(())
    }

    /// Split the bucket at `bucket_offset` (the one `key_hash` routes to)
    /// into two buckets one bit deeper, doubling the directory first when
    /// the bucket already uses every directory bit.
    pub fn split(&mut self, bucket_offset: u64, key_hash: u64) -> Result<()> {
        let bucket = self.load_bucket(bucket_offset)?;
        if bucket.depth >= MAX_DIRECTORY_BITS {
            return Err(HashKvError::DirectoryFull { bits: bucket.depth });
        }
        if bucket.depth == self.directory.bits() {
            self.directory.grow()?;
        }

        let (low, high) = bucket.split();
        let block = self.store.block_size() as u64;
        let low_offset = self.store.allocate(block)?;
        let high_offset = self.store.allocate(block)?;
        self.write_bucket(low_offset, &low)?;
        self.write_bucket(high_offset, &high)?;

        let slot = self.directory.slot_for(key_hash);
        let (start, len) = self.directory.range_of(slot, bucket.depth);
        let half = len / 2;
        self.directory.set_range(start, half, low_offset);
        self.directory.set_range(start + half, half, high_offset);
        self.directory.persist(&mut self.store)?;

        self.cache.pop(&bucket_offset);
        self.store.free(bucket_offset, block)?;
        self.store.commit()?;

        tracing::debug!(
            depth = bucket.depth + 1,
            low = low.len(),
            high = high.len(),
            "Bucket split"
        );
        Ok(())
    }

    /// Merge the bucket `key_hash` routes to with its buddy when both have
    /// the same depth and together fill at most half a bucket.
    fn try_merge(&mut self, bucket_offset: u64, key_hash: u64) -> Result<()> {
        let bucket = self.load_bucket(bucket_offset)?;
        if bucket.depth == 0 {
            return Ok(());
        }

        let slot = self.directory.slot_for(key_hash);
        let (start, len) = self.directory.range_of(slot, bucket.depth);
        let buddy_start = start ^ len;
        let buddy_offset = self.directory.slots()[buddy_start];
        if buddy_offset == bucket_offset {
            return Ok(());
        }

        let buddy = self.load_bucket(buddy_offset)?;
        if buddy.depth != bucket.depth || bucket.len() + buddy.len() > self.capacity / 2 {
            return Ok(());
        }

        let (merged, low_start) = if start < buddy_start {
            (Bucket::merge(&bucket, &buddy), start)
        } else {
            (Bucket::merge(&buddy, &bucket), buddy_start)
        };

        let block = self.store.block_size() as u64;
        let merged_offset = self.store.allocate(block)?;
        self.write_bucket(merged_offset, &merged)?;
        self.directory.set_range(low_start, len * 2, merged_offset);
        self.directory.persist(&mut self.store)?;

        self.cache.pop(&bucket_offset);
        self.cache.pop(&buddy_offset);
        self.store.free(bucket_offset, block)?;
        self.store.free(buddy_offset, block)?;
        self.store.commit()?;

        tracing::debug!(depth = merged.depth, entries = merged.len(), "Buckets merged");
        Ok(())
    }

    // =========================================================================
    // Private Helpers
    // =========================================================================

    fn load_bucket(&mut self, offset: u64) -> Result<Bucket> {
        if let Some(bucket) = self.cache.get(&offset) {
            return Ok(bucket.clone());
        }

        let bytes = self.store.read(offset, self.store.block_size() as usize)?;
        let bucket = Bucket::decode(&bytes, self.capacity)?;
        if bucket.depth > self.directory.bits() {
            return Err(HashKvError::CorruptStructure(format!(
                "bucket at {} has depth {} beyond directory bits {}",
                offset,
                bucket.depth,
                self.directory.bits()
            )));
        }

        self.cache.put(offset, bucket.clone());
        Ok(bucket)
    }

    fn write_bucket(&mut self, offset: u64, bucket: &Bucket) -> Result<()> {
        let bytes = bucket.encode(self.store.block_size())?;
        self.store.write(offset, &bytes)?;
        self.cache.put(offset, bucket.clone());
        Ok(())
    }

    /// Index of `key` in `bucket`, comparing stored key bytes for every
    /// entry whose hash, size and prefix match.
    fn find(&mut self, bucket: &Bucket, hash: u64, key: &[u8]) -> Result<Option<usize>> {
        for (index, entry) in bucket.entries.iter().enumerate() {
            if entry.may_match(hash, key) && self.read_key(entry)? == key {
                return Ok(Some(index));
            }
        }
        Ok(None)
    }

    fn read_key(&mut self, entry: &BucketEntry) -> Result<Vec<u8>> {
        self.store.read(entry.key_offset(), entry.key_size as usize)
    }

    fn write_record(&mut self, hash: u64, key: &[u8], value: &[u8]) -> Result<BucketEntry> {
        let offset = self.store.allocate(record::alloc_len(key.len(), value.len()))?;
        let seq = self.store.next_seq();
        let frame = record::encode(seq, offset, key, value)?;
        self.store.write(offset, &frame)?;
        Ok(BucketEntry::new(hash, offset, key, value.len()))
    }

    /// Mark a frame dead, then give its space back
    fn retire_record(&mut self, entry: &BucketEntry) -> Result<()> {
        self.store.write(entry.offset, &DEAD_MAGIC)?;
        self.store.free(entry.offset, entry.alloc_len())
    }
}

fn new_cache(cache_buckets: usize) -> LruCache<u64, Bucket> {
    LruCache::new(NonZeroUsize::new(cache_buckets).unwrap_or(NonZeroUsize::MIN))
}
