//! Tests for AvailList
//!
//! These tests verify:
//! - Best-fit allocation and carving
//! - Coalescing on release
//! - Double-free detection
//! - Validation of lists loaded from disk

use hashkv::storage::{AvailBlock, AvailList};
use hashkv::{ErrorKind, HashKvError};

// =============================================================================
// Helper Functions
// =============================================================================

fn list_of(regions: &[(u64, u64)]) -> AvailList {
    let mut list = AvailList::new();
    for &(offset, size) in regions {
        list.release(offset, size).unwrap();
    }
    list
}

fn regions(list: &AvailList) -> Vec<(u64, u64)> {
    list.blocks().iter().map(|b| (b.offset, b.size)).collect()
}

// =============================================================================
// Take Tests
// =============================================================================

#[test]
fn test_take_from_empty() {
    let mut list = AvailList::new();
    assert_eq!(list.take(16), None);
}

#[test]
fn test_take_best_fit() {
    let mut list = list_of(&[(1024, 256), (4096, 64), (8192, 128)]);

    // 64 fits exactly in the smallest region
    assert_eq!(list.take(64), Some(4096));
    assert_eq!(regions(&list), vec![(1024, 256), (8192, 128)]);

    // 96 prefers the 128 region over the 256 one
    assert_eq!(list.take(96), Some(8192));
    assert_eq!(regions(&list), vec![(1024, 256), (8288, 32)]);
}

#[test]
fn test_take_too_large() {
    let mut list = list_of(&[(1024, 64)]);
    assert_eq!(list.take(128), None);
    assert_eq!(list.total_free(), 64);
}

// =============================================================================
// Release Tests
// =============================================================================

#[test]
fn test_release_coalesces_neighbours() {
    let mut list = list_of(&[(1000, 16), (1032, 16)]);
    assert_eq!(list.len(), 2);

    list.release(1016, 16).unwrap();

    assert_eq!(regions(&list), vec![(1000, 48)]);
}

#[test]
fn test_release_merges_with_previous_only() {
    let mut list = list_of(&[(512, 32)]);
    list.release(544, 16).unwrap();
    assert_eq!(regions(&list), vec![(512, 48)]);
}

#[test]
fn test_release_merges_with_next_only() {
    let mut list = list_of(&[(512, 32)]);
    list.release(480, 32).unwrap();
    assert_eq!(regions(&list), vec![(480, 64)]);
}

#[test]
fn test_double_free_detected() {
    let mut list = list_of(&[(512, 64)]);

    let err = list.release(528, 16).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::CorruptStructure);

    let err = list.release(496, 32).unwrap_err();
    assert!(matches!(err, HashKvError::CorruptStructure(_)));

    // List unchanged
    assert_eq!(regions(&list), vec![(512, 64)]);
}

#[test]
fn test_pop_tail() {
    let mut list = list_of(&[(512, 64), (1024, 128)]);

    assert_eq!(list.pop_tail(2048), None);
    assert_eq!(
        list.pop_tail(1152),
        Some(AvailBlock {
            offset: 1024,
            size: 128
        })
    );
    assert_eq!(regions(&list), vec![(512, 64)]);
}

// =============================================================================
// Validation Tests
// =============================================================================

#[test]
fn test_from_blocks_accepts_sorted() {
    let blocks = vec![
        AvailBlock { offset: 256, size: 32 },
        AvailBlock { offset: 512, size: 64 },
    ];
    let list = AvailList::from_blocks(blocks, 1024).unwrap();
    assert_eq!(list.total_free(), 96);
}

#[test]
fn test_from_blocks_rejects_overlap() {
    let blocks = vec![
        AvailBlock { offset: 256, size: 64 },
        AvailBlock { offset: 288, size: 64 },
    ];
    assert!(AvailList::from_blocks(blocks, 1024).is_err());
}

#[test]
fn test_from_blocks_rejects_out_of_range() {
    let blocks = vec![AvailBlock { offset: 1008, size: 32 }];
    assert!(AvailList::from_blocks(blocks, 1024).is_err());
}

#[test]
fn test_from_blocks_rejects_misaligned() {
    let blocks = vec![AvailBlock { offset: 260, size: 32 }];
    assert!(AvailList::from_blocks(blocks, 1024).is_err());
}
