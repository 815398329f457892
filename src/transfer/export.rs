//! Binary export stream
//!
//! ## Format
//! ```text
//! ┌────────────┬─────────────┬──────────────┐
//! │ "HKVX" (4) │ Version (2) │ Reserved (2) │
//! └────────────┴─────────────┴──────────────┘
//! Repeated: KeyLen (4) | Key | DataLen (4) | Data
//! Trailer:  0xFFFFFFFF (4) | Count (8) | CRC32 of all record bytes (4)
//! ```
//! All integers big-endian. The stream does not depend on the block size
//! of the database it came from.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use bytes::{Buf, BufMut, BytesMut};

use crate::error::{HashKvError, Result};
use crate::record::{check_sizes, MAX_DATUM_SIZE};

/// Magic bytes of an export stream
pub const EXPORT_MAGIC: [u8; 4] = *b"HKVX";

/// Current export format version
pub const EXPORT_VERSION: u16 = 1;

/// Length value that introduces the trailer
const TRAILER_MARKER: u32 = 0xFFFF_FFFF;

/// Writes an export stream
pub struct ExportWriter {
    writer: BufWriter<File>,
    hasher: crc32fast::Hasher,
    count: u64,
}

impl ExportWriter {
    /// Create (or truncate) `path` and write the stream header
    pub fn create(path: &Path) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);

        let mut header = BytesMut::with_capacity(8);
        header.put_slice(&EXPORT_MAGIC);
        header.put_u16(EXPORT_VERSION);
        header.put_u16(0);
        writer.write_all(&header)?;

        Ok(Self {
            writer,
            hasher: crc32fast::Hasher::new(),
            count: 0,
        })
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_sizes(key, value)?;

        let mut buf = BytesMut::with_capacity(8 + key.len() + value.len());
        buf.put_u32(key.len() as u32);
        buf.put_slice(key);
        buf.put_u32(value.len() as u32);
        buf.put_slice(value);

        self.hasher.update(&buf);
        self.writer.write_all(&buf)?;
        self.count += 1;
        Ok(())
    }

    /// Write the trailer and sync; returns the number of records
    pub fn finish(mut self) -> Result<u64> {
        let mut trailer = BytesMut::with_capacity(16);
        trailer.put_u32(TRAILER_MARKER);
        trailer.put_u64(self.count);
        trailer.put_u32(self.hasher.finalize());
        self.writer.write_all(&trailer)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.count)
    }
}

/// Reads an export stream, yielding `(key, value)` pairs.
///
/// The trailer is verified when the last record has been read; a stream
/// with a bad trailer yields an error as its final item.
pub struct ExportReader {
    reader: BufReader<File>,
    hasher: crc32fast::Hasher,
    count: u64,
    done: bool,
}

impl ExportReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = BufReader::new(File::open(path)?);

        let mut header = [0u8; 8];
        read_exact(&mut reader, &mut header, "stream header")?;
        let mut buf = &header[..];
        let mut magic = [0u8; 4];
        buf.copy_to_slice(&mut magic);
        if magic != EXPORT_MAGIC {
            return Err(HashKvError::BadInput(format!(
                "{} is not an export file",
                path.display()
            )));
        }
        let version = buf.get_u16();
        if version != EXPORT_VERSION {
            return Err(HashKvError::BadInput(format!(
                "unsupported export version {}",
                version
            )));
        }

        Ok(Self {
            reader,
            hasher: crc32fast::Hasher::new(),
            count: 0,
            done: false,
        })
    }

    /// Next record, or `None` after a verified trailer
    pub fn read_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let key_len = self.read_u32("key length")?;
        if key_len == TRAILER_MARKER {
            self.verify_trailer()?;
            return Ok(None);
        }

        let key = self.read_datum(key_len, "key")?;
        let data_len = self.read_u32("data length")?;
        let value = self.read_datum(data_len, "data")?;

        self.count += 1;
        Ok(Some((key, value)))
    }

    fn verify_trailer(&mut self) -> Result<()> {
        let mut trailer = [0u8; 12];
        read_exact(&mut self.reader, &mut trailer, "trailer")?;
        let mut buf = &trailer[..];
        let count = buf.get_u64();
        let crc = buf.get_u32();

        if count != self.count {
            return Err(HashKvError::BadInput(format!(
                "trailer counts {} records, stream holds {}",
                count, self.count
            )));
        }
        let computed = self.hasher.clone().finalize();
        if crc != computed {
            return Err(HashKvError::BadInput(format!(
                "export checksum mismatch (stored {:08x}, computed {:08x})",
                crc, computed
            )));
        }

        let mut extra = [0u8; 1];
        if self.reader.read(&mut extra)? != 0 {
            return Err(HashKvError::BadInput(
                "trailing bytes after export trailer".to_string(),
            ));
        }
        Ok(())
    }

    fn read_u32(&mut self, what: &str) -> Result<u32> {
        let mut bytes = [0u8; 4];
        read_exact(&mut self.reader, &mut bytes, what)?;
        let value = u32::from_be_bytes(bytes);
        if value != TRAILER_MARKER {
            self.hasher.update(&bytes);
        }
        Ok(value)
    }

    fn read_datum(&mut self, len: u32, what: &str) -> Result<Vec<u8>> {
        if len as usize > MAX_DATUM_SIZE {
            return Err(HashKvError::BadInput(format!(
                "{} length {} exceeds the {} byte limit",
                what, len, MAX_DATUM_SIZE
            )));
        }
        let mut datum = vec![0u8; len as usize];
        read_exact(&mut self.reader, &mut datum, what)?;
        self.hasher.update(&datum);
        Ok(datum)
    }
}

impl Iterator for ExportReader {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_record() {
            Ok(Some(record)) => Some(Ok(record)),
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

fn read_exact<R: Read>(reader: &mut R, buf: &mut [u8], what: &str) -> Result<()> {
    reader.read_exact(buf).map_err(|e| {
        if e.kind() == std::io::ErrorKind::UnexpectedEof {
            HashKvError::BadInput(format!("export stream truncated in {}", what))
        } else {
            HashKvError::Io(e)
        }
    })
}
