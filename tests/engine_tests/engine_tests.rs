//! Tests for Database
//!
//! These tests verify:
//! - Open modes (reader, writer, creator, new) and modifiers
//! - Key operations through the public handle
//! - Persistence across close/reopen
//! - Iteration, count and reorganize
//! - Locking between handles
//! - Last error diagnostics and metadata copy

use std::collections::HashMap;
use std::path::PathBuf;

use hashkv::{
    Config, Database, ErrorKind, HashKvError, Health, OpenFlags, OpenMode, StoreOutcome,
};
use proptest::prelude::*;
use tempfile::TempDir;

// =============================================================================
// Helper Functions
// =============================================================================

fn setup_temp_db() -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("test.db");
    (temp_dir, path)
}

fn small_blocks() -> Config {
    Config::builder().block_size(128).build()
}

fn contents(db: &Database) -> HashMap<Vec<u8>, Vec<u8>> {
    db.iter().map(|r| r.unwrap()).collect()
}

// =============================================================================
// Open Mode Tests
// =============================================================================

#[test]
fn test_create_new_database() {
    let (_temp, path) = setup_temp_db();

    let db = Database::open(&path, "c").unwrap();

    assert!(path.exists());
    assert_eq!(db.count().unwrap(), 0);
    assert_eq!(db.health(), Health::Healthy);
    assert_eq!(db.mode(), OpenMode::Creator);
}

#[test]
fn test_debug_describes_handle() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "c").unwrap();

    let text = format!("{:?}", db);

    assert!(text.starts_with("Database"));
    assert!(text.contains("test.db"), "{}", text);
    assert!(text.contains("Creator"), "{}", text);
    assert!(text.contains("Healthy"), "{}", text);
}

#[test]
fn test_writer_requires_existing_file() {
    let (_temp, path) = setup_temp_db();

    let err = Database::open(&path, "w").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::IoFailure);
}

#[test]
fn test_reader_on_empty_file() {
    let (_temp, path) = setup_temp_db();
    std::fs::File::create(&path).unwrap();

    let err = Database::open(&path, "r").unwrap_err();
    assert!(matches!(err, HashKvError::EmptyDatabase));
}

#[test]
fn test_foreign_file_rejected() {
    let (_temp, path) = setup_temp_db();
    std::fs::write(&path, vec![0x42u8; 4096]).unwrap();

    let err = Database::open(&path, "w").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidArgument);
}

#[test]
fn test_new_mode_truncates() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open(&path, "c").unwrap();
        db.insert(b"old", b"data").unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, "n").unwrap();
    assert_eq!(db.count().unwrap(), 0);
    assert!(matches!(db.fetch(b"old"), Err(HashKvError::KeyNotFound)));
}

#[test]
fn test_reader_refuses_mutation() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open(&path, "c").unwrap();
        db.insert(b"k", b"v").unwrap();
    }

    let db = Database::open(&path, "r").unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");

    let err = db.insert(b"x", b"y").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
    assert!(db.delete(b"k").is_err());
    assert!(db.reorganize().is_err());
}

#[test]
fn test_invalid_mode_string() {
    let (_temp, path) = setup_temp_db();
    let err = Database::open(&path, "cé").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
}

#[test]
fn test_sync_modifier_and_flags() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "cSM").unwrap();

    db.insert(b"k", b"v").unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
    assert_eq!(db.config().sync_strategy, hashkv::SyncStrategy::EveryWrite);
}

#[test]
fn test_existing_file_keeps_block_size() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open_with(&path, OpenFlags::new(OpenMode::Creator), small_blocks()).unwrap();
        db.insert(b"k", b"v").unwrap();
    }

    let db = Database::open(&path, "w").unwrap();
    assert_eq!(db.bucket_stats().unwrap().block_size, 128);
    assert_eq!(db.bucket_stats().unwrap().bucket_capacity, 3);
}

// =============================================================================
// Key Operation Tests
// =============================================================================

#[test]
fn test_basic_operations() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();

    db.insert(b"a", b"1").unwrap();
    db.insert(b"b", b"2").unwrap();
    assert_eq!(db.replace(b"a", b"9").unwrap(), StoreOutcome::Replaced);

    let expected: HashMap<Vec<u8>, Vec<u8>> = [
        (b"a".to_vec(), b"9".to_vec()),
        (b"b".to_vec(), b"2".to_vec()),
    ]
    .into_iter()
    .collect();
    assert_eq!(contents(&db), expected);

    db.delete(b"b").unwrap();
    assert_eq!(db.count().unwrap(), 1);
}

#[test]
fn test_insert_existing_key() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();
    db.insert(b"k", b"v1").unwrap();

    let err = db.insert(b"k", b"v2").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::AlreadyExists);
    assert_eq!(db.fetch(b"k").unwrap(), b"v1");
}

#[test]
fn test_missing_key_errors() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();

    assert_eq!(db.fetch(b"nope").unwrap_err().kind(), ErrorKind::NotFound);
    assert_eq!(db.delete(b"nope").unwrap_err().kind(), ErrorKind::NotFound);
    assert!(!db.exists(b"nope").unwrap());
    assert!(matches!(db.nextkey(b"nope"), Err(HashKvError::KeyNotFound)));
}

#[test]
fn test_replace_inserts_missing_key() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();

    assert_eq!(db.replace(b"k", b"v").unwrap(), StoreOutcome::Inserted);
    assert!(db.exists(b"k").unwrap());
}

#[test]
fn test_many_keys_with_small_blocks() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open_with(&path, OpenFlags::new(OpenMode::New), small_blocks()).unwrap();

    for i in 0..500u32 {
        db.insert(&i.to_be_bytes(), format!("v{}", i).as_bytes()).unwrap();
    }
    for i in (0..500u32).step_by(2) {
        db.delete(&i.to_be_bytes()).unwrap();
    }

    assert_eq!(db.count().unwrap(), 250);
    for i in 0..500u32 {
        let found = db.exists(&i.to_be_bytes()).unwrap();
        assert_eq!(found, i % 2 == 1, "key {}", i);
    }
}

#[test]
fn test_large_value() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();
    let big: Vec<u8> = (0..1_000_000u32).map(|i| (i % 251) as u8).collect();

    db.insert(b"big", &big).unwrap();
    assert_eq!(db.fetch(b"big").unwrap(), big);
}

// =============================================================================
// Persistence Tests
// =============================================================================

#[test]
fn test_persistence_across_reopen() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open(&path, "c").unwrap();
        for i in 0..200 {
            db.insert(format!("key{}", i).as_bytes(), format!("val{}", i).as_bytes())
                .unwrap();
        }
        db.replace(b"key5", b"changed").unwrap();
        db.delete(b"key6").unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, "r").unwrap();
    assert_eq!(db.count().unwrap(), 199);
    assert_eq!(db.fetch(b"key5").unwrap(), b"changed");
    assert!(!db.exists(b"key6").unwrap());
    assert_eq!(db.fetch(b"key199").unwrap(), b"val199");
}

#[test]
fn test_drop_flushes() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open(&path, "c").unwrap();
        db.insert(b"k", b"v").unwrap();
    }

    let db = Database::open(&path, "r").unwrap();
    assert_eq!(db.fetch(b"k").unwrap(), b"v");
}

// =============================================================================
// Iteration Tests
// =============================================================================

#[test]
fn test_firstkey_nextkey_walk() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open_with(&path, OpenFlags::new(OpenMode::New), small_blocks()).unwrap();
    for i in 0..50 {
        db.insert(format!("k{}", i).as_bytes(), b"v").unwrap();
    }

    let mut seen = Vec::new();
    let mut current = db.firstkey().unwrap();
    while let Some(key) = current {
        current = db.nextkey(&key).unwrap();
        seen.push(key);
    }

    assert_eq!(seen.len(), 50);
    let keys: Vec<Vec<u8>> = db.keys().map(|k| k.unwrap()).collect();
    assert_eq!(keys, seen);
}

#[test]
fn test_empty_database_iteration() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();

    assert_eq!(db.firstkey().unwrap(), None);
    assert_eq!(db.keys().count(), 0);
}

// =============================================================================
// Reorganize Tests
// =============================================================================

#[test]
fn test_reorganize_shrinks_file() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();
    for i in 0..400 {
        db.insert(format!("key{}", i).as_bytes(), &[i as u8; 300]).unwrap();
    }
    for i in 0..400 {
        if i % 4 != 0 {
            db.delete(format!("key{}", i).as_bytes()).unwrap();
        }
    }
    db.sync().unwrap();
    let before_stats = db.bucket_stats().unwrap();
    let before_len = std::fs::metadata(&path).unwrap().len();
    let before = contents(&db);

    db.reorganize().unwrap();

    let after_len = std::fs::metadata(&path).unwrap().len();
    assert!(after_len < before_len, "{} -> {}", before_len, after_len);
    assert_eq!(contents(&db), before);

    let after_stats = db.bucket_stats().unwrap();
    assert_eq!(after_stats.free_bytes, 0);
    assert!(after_stats.directory_slots <= before_stats.directory_slots);
}

#[test]
fn test_reorganize_then_reopen() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open_with(&path, OpenFlags::new(OpenMode::New), small_blocks()).unwrap();
        for i in 0..100 {
            db.insert(format!("key{}", i).as_bytes(), b"value").unwrap();
        }
        db.reorganize().unwrap();
        db.insert(b"after", b"reorganize").unwrap();
        db.close().unwrap();
    }

    let db = Database::open(&path, "w").unwrap();
    assert_eq!(db.count().unwrap(), 101);
    assert_eq!(db.fetch(b"after").unwrap(), b"reorganize");
    assert!(!db.needs_recovery());
}

#[test]
fn test_reorganize_keeps_lock() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();
    db.insert(b"k", b"v").unwrap();
    db.reorganize().unwrap();

    let err = Database::open(&path, "w").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockUnavailable);
}

// =============================================================================
// Locking Tests
// =============================================================================

#[test]
fn test_second_writer_rejected() {
    let (_temp, path) = setup_temp_db();
    let _db = Database::open(&path, "c").unwrap();

    let err = Database::open(&path, "w").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockUnavailable);
    let err = Database::open(&path, "r").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockUnavailable);
}

#[test]
fn test_many_readers() {
    let (_temp, path) = setup_temp_db();
    {
        let db = Database::open(&path, "c").unwrap();
        db.insert(b"k", b"v").unwrap();
    }

    let r1 = Database::open(&path, "r").unwrap();
    let r2 = Database::open(&path, "r").unwrap();
    assert_eq!(r1.fetch(b"k").unwrap(), r2.fetch(b"k").unwrap());

    let err = Database::open(&path, "w").unwrap_err();
    assert_eq!(err.kind(), ErrorKind::LockUnavailable);
}

#[test]
fn test_no_lock_modifier() {
    let (_temp, path) = setup_temp_db();
    let _db = Database::open(&path, "c").unwrap();

    assert!(Database::open(&path, "rL").is_ok());
}

#[test]
fn test_handle_is_shareable_between_threads() {
    let (_temp, path) = setup_temp_db();
    let db = std::sync::Arc::new(Database::open(&path, "n").unwrap());

    let handles: Vec<_> = (0..4)
        .map(|t| {
            let db = std::sync::Arc::clone(&db);
            std::thread::spawn(move || {
                for i in 0..50 {
                    db.insert(format!("t{}-{}", t, i).as_bytes(), b"v").unwrap();
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(db.count().unwrap(), 200);
}

// =============================================================================
// Diagnostics Tests
// =============================================================================

#[test]
fn test_last_error_recorded() {
    let (_temp, path) = setup_temp_db();
    let db = Database::open(&path, "n").unwrap();
    assert_eq!(db.last_error(), None);

    let _ = db.fetch(b"missing");

    let message = db.last_error().unwrap();
    assert!(message.contains("item not found"), "{}", message);
}

#[test]
fn test_copy_metadata() {
    let temp_dir = TempDir::new().unwrap();
    let src_path = temp_dir.path().join("src.db");
    let dst_path = temp_dir.path().join("dst.db");

    let src = Database::open(&src_path, "c").unwrap();
    let dst = Database::open(&dst_path, "c").unwrap();

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&src_path, std::fs::Permissions::from_mode(0o640)).unwrap();
    }

    dst.copy_metadata(&src).unwrap();
    dst.copy_metadata(&dst).unwrap();

    let src_meta = std::fs::metadata(&src_path).unwrap();
    let dst_meta = std::fs::metadata(&dst_path).unwrap();
    assert_eq!(src_meta.permissions(), dst_meta.permissions());
    assert_eq!(src_meta.modified().unwrap(), dst_meta.modified().unwrap());
}

#[test]
fn test_copy_metadata_needs_writer() {
    let temp_dir = TempDir::new().unwrap();
    let src_path = temp_dir.path().join("src.db");
    let dst_path = temp_dir.path().join("dst.db");
    let src = Database::open(&src_path, "c").unwrap();
    drop(Database::open(&dst_path, "c").unwrap());

    let dst = Database::open(&dst_path, "r").unwrap();
    let err = dst.copy_metadata(&src).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidMode);
}

// =============================================================================
// Property Tests
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_store_fetch_round_trip(
        records in prop::collection::hash_map(
            prop::collection::vec(any::<u8>(), 0..24),
            prop::collection::vec(any::<u8>(), 0..200),
            0..40,
        )
    ) {
        let (_temp, path) = setup_temp_db();
        let db = Database::open_with(&path, OpenFlags::new(OpenMode::New), small_blocks()).unwrap();

        for (key, value) in &records {
            db.insert(key, value).unwrap();
        }

        prop_assert_eq!(db.count().unwrap(), records.len() as u64);
        for (key, value) in &records {
            prop_assert_eq!(&db.fetch(key).unwrap(), value);
        }
        prop_assert_eq!(contents(&db), records);
    }
}
