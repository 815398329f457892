//! Tests for Bucket and BucketEntry
//!
//! These tests verify:
//! - Capacity per block size
//! - Block encoding, padding and checksum verification
//! - Split by the next hash bit and merge back
//! - Entry pre-matching on hash, size and key prefix

use hashkv::bucket::{capacity_for, Bucket, BucketEntry, BUCKET_OVERHEAD, ENTRY_SIZE};
use hashkv::ErrorKind;

// =============================================================================
// Helper Functions
// =============================================================================

fn entry(hash: u64, key: &[u8]) -> BucketEntry {
    BucketEntry::new(hash, 4096, key, 10)
}

fn bucket_with(depth: u32, hashes: &[u64]) -> Bucket {
    let mut bucket = Bucket::new(depth);
    for (i, &hash) in hashes.iter().enumerate() {
        bucket.entries.push(BucketEntry::new(hash, 4096 + 64 * i as u64, b"key", 1));
    }
    bucket
}

// =============================================================================
// Capacity Tests
// =============================================================================

#[test]
fn test_capacity_for_block_sizes() {
    assert_eq!(capacity_for(128), 3);
    assert_eq!(capacity_for(512), 17);
    assert_eq!(capacity_for(4096), 145);
}

#[test]
fn test_full_bucket_fits_block() {
    for block in [128u32, 512, 4096, 65536] {
        let capacity = capacity_for(block) as usize;
        let hashes: Vec<u64> = (0..capacity as u64).collect();
        let bucket = bucket_with(0, &hashes);

        let bytes = bucket.encode(block).unwrap();
        assert_eq!(bytes.len(), block as usize);
        assert!(BUCKET_OVERHEAD + capacity * ENTRY_SIZE <= block as usize);
    }
}

#[test]
fn test_overfull_bucket_rejected() {
    let hashes: Vec<u64> = (0..4).collect();
    let bucket = bucket_with(0, &hashes);
    assert!(bucket.encode(128).is_err());
}

// =============================================================================
// Encoding Tests
// =============================================================================

#[test]
fn test_encode_decode_block() {
    let bucket = bucket_with(3, &[0x1000, 0x2000]);
    let bytes = bucket.encode(512).unwrap();

    let decoded = Bucket::decode(&bytes, capacity_for(512) as usize).unwrap();
    assert_eq!(decoded, bucket);
}

#[test]
fn test_decode_detects_bit_flip() {
    let bucket = bucket_with(1, &[0x1000]);
    let mut bytes = bucket.encode(512).unwrap();
    bytes[12] ^= 0x01;

    let err = Bucket::decode(&bytes, capacity_for(512) as usize).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);
}

#[test]
fn test_decode_rejects_over_capacity() {
    let bucket = bucket_with(0, &[1, 2, 3, 4, 5]);
    let bytes = bucket.encode(512).unwrap();

    assert!(Bucket::decode(&bytes, 4).is_err());
}

// =============================================================================
// Split/Merge Tests
// =============================================================================

#[test]
fn test_split_by_next_bit() {
    // depth 1, all share top bit 1; bit 62 decides the split
    let bucket = bucket_with(
        1,
        &[
            0x8000_0000_0000_0000,
            0xC000_0000_0000_0000,
            0x9000_0000_0000_0000,
            0xF000_0000_0000_0000,
        ],
    );

    let (low, high) = bucket.split();

    assert_eq!(low.depth, 2);
    assert_eq!(high.depth, 2);
    let low_hashes: Vec<u64> = low.entries.iter().map(|e| e.hash).collect();
    let high_hashes: Vec<u64> = high.entries.iter().map(|e| e.hash).collect();
    assert_eq!(low_hashes, vec![0x8000_0000_0000_0000, 0x9000_0000_0000_0000]);
    assert_eq!(high_hashes, vec![0xC000_0000_0000_0000, 0xF000_0000_0000_0000]);

    assert!(low.check_prefix(0b10).is_ok());
    assert!(high.check_prefix(0b11).is_ok());
    assert!(low.check_prefix(0b11).is_err());
}

#[test]
fn test_merge_restores_bucket() {
    let bucket = bucket_with(0, &[0x1000, 0x8000_0000_0000_0000, 0x2000]);
    let (low, high) = bucket.split();

    let merged = Bucket::merge(&low, &high);

    assert_eq!(merged.depth, 0);
    assert_eq!(merged.len(), 3);
    assert!(merged.check_prefix(0).is_ok());
}

// =============================================================================
// Entry Tests
// =============================================================================

#[test]
fn test_entry_offsets() {
    let e = BucketEntry::new(1, 4096, b"abc", 5);

    assert_eq!(e.key_offset(), 4096 + 24);
    assert_eq!(e.data_offset(), 4096 + 24 + 3);
    assert_eq!(e.frame_len(), 32);
    assert_eq!(e.alloc_len(), 32);
}

#[test]
fn test_may_match() {
    let e = entry(42, b"apple");

    assert!(e.may_match(42, b"apple"));
    assert!(!e.may_match(43, b"apple"));
    assert!(!e.may_match(42, b"apples"));
    assert!(!e.may_match(42, b"bpple"));
}

#[test]
fn test_may_match_short_and_empty_keys() {
    let empty = entry(7, b"");
    assert!(empty.may_match(7, b""));
    assert!(!empty.may_match(7, b"\0"));

    let nul = entry(7, b"\0");
    assert!(nul.may_match(7, b"\0"));
    assert!(!nul.may_match(7, b""));
}
