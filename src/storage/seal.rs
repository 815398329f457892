//! Sealed blocks
//!
//! Structured on-disk blocks (header, directory, buckets, free lists) are
//! bincode bodies framed with their length and a CRC32.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{HashKvError, Result};

/// BodyLen (4) + CRC32 (4)
pub const SEAL_OVERHEAD: usize = 8;

/// Encode `value` as a sealed block
pub fn seal<T: Serialize>(value: &T) -> Result<Vec<u8>> {
    let body = bincode::serialize(value)?;
    let body_len = u32::try_from(body.len()).map_err(|_| {
        HashKvError::Serialization(format!("block body too large: {} bytes", body.len()))
    })?;

    let mut out = Vec::with_capacity(SEAL_OVERHEAD + body.len());
    out.extend_from_slice(&body_len.to_le_bytes());
    out.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

/// Decode a sealed block, verifying length and checksum.
///
/// `what` names the block in error messages.
pub fn unseal<T: DeserializeOwned>(bytes: &[u8], what: &str) -> Result<T> {
    if bytes.len() < SEAL_OVERHEAD {
        return Err(HashKvError::CorruptStructure(format!(
            "{}: block too short ({} bytes)",
            what,
            bytes.len()
        )));
    }

    let body_len = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize;
    let stored_crc = u32::from_le_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);

    if SEAL_OVERHEAD + body_len > bytes.len() {
        return Err(HashKvError::CorruptStructure(format!(
            "{}: body length {} exceeds block of {} bytes",
            what,
            body_len,
            bytes.len()
        )));
    }

    let body = &bytes[SEAL_OVERHEAD..SEAL_OVERHEAD + body_len];
    let computed_crc = crc32fast::hash(body);
    if computed_crc != stored_crc {
        return Err(HashKvError::CorruptStructure(format!(
            "{}: checksum mismatch (stored {:08x}, computed {:08x})",
            what, stored_crc, computed_crc
        )));
    }

    bincode::deserialize(body)
        .map_err(|e| HashKvError::CorruptStructure(format!("{}: {}", what, e)))
}
