//! Record Module
//!
//! Framing of key/value pairs as stored in the page store.
//!
//! ## Frame Format
//! ```text
//! ┌──────────┬─────────┬─────────┬──────────┬──────────┬─────┬───────┐
//! │ Magic(4) │ CRC (4) │ Seq (8) │ KeyLen(4)│ DataLen 4│ Key │ Data  │
//! └──────────┴─────────┴─────────┴──────────┴──────────┴─────┴───────┘
//! ```
//! - Magic is `RCD1` for a live frame and `DEAD` once the frame was
//!   superseded or deleted
//! - CRC32 covers the frame's file offset followed by everything after
//!   the CRC field
//! - Frames are zero padded to the 16-byte allocation granule, which lets
//!   recovery find them with a linear scan

mod codec;

pub use codec::{
    alloc_len, check_sizes, decode, encode, frame_len, Record, RecordHeader, DEAD_MAGIC,
    FRAME_HEADER_SIZE, LIVE_MAGIC, MAX_DATUM_SIZE,
};
