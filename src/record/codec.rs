//! Record codec
//!
//! Encoding and decoding of record frames.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::{HashKvError, Result};
use crate::storage::align_up;

/// Frame header: Magic (4) + CRC (4) + Seq (8) + KeyLen (4) + DataLen (4)
pub const FRAME_HEADER_SIZE: u64 = 24;

/// Magic of a live frame
pub const LIVE_MAGIC: [u8; 4] = *b"RCD1";

/// Magic of a superseded or deleted frame
pub const DEAD_MAGIC: [u8; 4] = *b"DEAD";

/// Largest key or value accepted (1 GiB)
pub const MAX_DATUM_SIZE: usize = 1 << 30;

/// A decoded record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    pub seq: u64,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

/// Parsed frame header
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecordHeader {
    pub live: bool,
    pub crc: u32,
    pub seq: u64,
    pub key_len: u32,
    pub data_len: u32,
}

impl RecordHeader {
    /// Parse a frame header; `None` when `bytes` does not start with a
    /// frame magic or is too short.
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < FRAME_HEADER_SIZE as usize {
            return None;
        }

        let mut buf = &bytes[..FRAME_HEADER_SIZE as usize];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        let live = match magic {
            LIVE_MAGIC => true,
            DEAD_MAGIC => false,
            _ => return None,
        };

        Some(Self {
            live,
            crc: buf.get_u32_le(),
            seq: buf.get_u64_le(),
            key_len: buf.get_u32_le(),
            data_len: buf.get_u32_le(),
        })
    }

    /// Lengths within the accepted bounds
    pub fn is_plausible(&self) -> bool {
        self.key_len as usize <= MAX_DATUM_SIZE && self.data_len as usize <= MAX_DATUM_SIZE
    }

    /// Unpadded frame length
    pub fn frame_len(&self) -> u64 {
        frame_len(self.key_len as usize, self.data_len as usize)
    }
}

/// Unpadded frame length for the given sizes
pub fn frame_len(key_len: usize, data_len: usize) -> u64 {
    FRAME_HEADER_SIZE + key_len as u64 + data_len as u64
}

/// Bytes a frame occupies in the page store
pub fn alloc_len(key_len: usize, data_len: usize) -> u64 {
    align_up(frame_len(key_len, data_len))
}

/// Reject keys or values too large to frame
pub fn check_sizes(key: &[u8], value: &[u8]) -> Result<()> {
    if key.len() > MAX_DATUM_SIZE {
        return Err(HashKvError::InvalidArgument(format!(
            "key of {} bytes exceeds the {} byte limit",
            key.len(),
            MAX_DATUM_SIZE
        )));
    }
    if value.len() > MAX_DATUM_SIZE {
        return Err(HashKvError::InvalidArgument(format!(
            "value of {} bytes exceeds the {} byte limit",
            value.len(),
            MAX_DATUM_SIZE
        )));
    }
    Ok(())
}

/// Checksum of a frame body bound to the offset it is stored at, so a copy
/// of the frame anywhere else in the file does not verify.
fn frame_crc(offset: u64, body: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&offset.to_le_bytes());
    hasher.update(body);
    hasher.finalize()
}

/// Encode a live frame to be stored at `offset`, padded to the allocation
/// granule
pub fn encode(seq: u64, offset: u64, key: &[u8], value: &[u8]) -> Result<Bytes> {
    check_sizes(key, value)?;

    let padded = alloc_len(key.len(), value.len()) as usize;
    let mut buf = BytesMut::with_capacity(padded);
    buf.put_slice(&LIVE_MAGIC);
    buf.put_u32_le(0); // CRC placeholder
    buf.put_u64_le(seq);
    buf.put_u32_le(key.len() as u32);
    buf.put_u32_le(value.len() as u32);
    buf.put_slice(key);
    buf.put_slice(value);

    let crc = frame_crc(offset, &buf[8..]);
    buf[4..8].copy_from_slice(&crc.to_le_bytes());

    buf.resize(padded, 0);
    Ok(buf.freeze())
}

/// Decode the live frame stored at `offset`, verifying its checksum.
///
/// `bytes` may carry trailing padding.
pub fn decode(bytes: &[u8], offset: u64) -> Result<Record> {
    let header = RecordHeader::parse(bytes).ok_or_else(|| {
        HashKvError::CorruptStructure("record: missing frame magic".to_string())
    })?;
    if !header.live {
        return Err(HashKvError::CorruptStructure(
            "record: frame is marked dead".to_string(),
        ));
    }
    if !header.is_plausible() {
        return Err(HashKvError::CorruptStructure(format!(
            "record: implausible lengths (key {}, data {})",
            header.key_len, header.data_len
        )));
    }

    let frame_len = header.frame_len() as usize;
    if bytes.len() < frame_len {
        return Err(HashKvError::CorruptStructure(format!(
            "record: frame of {} bytes truncated to {}",
            frame_len,
            bytes.len()
        )));
    }

    let computed = frame_crc(offset, &bytes[8..frame_len]);
    if computed != header.crc {
        return Err(HashKvError::CorruptStructure(format!(
            "record: checksum mismatch (stored {:08x}, computed {:08x})",
            header.crc, computed
        )));
    }

    let key_start = FRAME_HEADER_SIZE as usize;
    let key_end = key_start + header.key_len as usize;
    Ok(Record {
        seq: header.seq,
        key: bytes[key_start..key_end].to_vec(),
        value: bytes[key_end..frame_len].to_vec(),
    })
}
