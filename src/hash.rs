//! Key hashing
//!
//! Directory routing uses the top bits of a 64-bit xxh3 hash, so a bucket at
//! depth `d` holds exactly the keys whose hashes share one `d`-bit prefix.

use xxhash_rust::xxh3::xxh3_64;

/// Hash a key
pub fn key_hash(key: &[u8]) -> u64 {
    xxh3_64(key)
}

/// Top `bits` bits of `hash` (0 when `bits == 0`)
pub fn prefix(hash: u64, bits: u32) -> u64 {
    if bits == 0 {
        0
    } else {
        hash >> (64 - bits)
    }
}

/// The hash bit examined when splitting a bucket of depth `depth`
pub fn split_bit(hash: u64, depth: u32) -> bool {
    debug_assert!(depth < 64);
    (hash >> (63 - depth)) & 1 == 1
}
