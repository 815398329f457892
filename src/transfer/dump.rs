//! ASCII dump format
//!
//! A line-oriented text backup that survives format changes:
//!
//! ```text
//! # hashkv dump file created by hashkv 0.1.0 on 2024-01-01T00:00:00+00:00
//! #:version=1.0
//! #:file=data.db
//! #:mode=0644
//! #:format=standard
//! # End of header
//! #:len=3
//! a2V5
//! #:len=5
//! dmFsdWU=
//! # End of data
//! #:count=1
//! # End of file
//! ```
//!
//! Each datum is a `#:len=N` line followed by its base64 encoding wrapped
//! at 76 columns. A zero-length datum has no encoded lines.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use crate::error::{HashKvError, Result};
use crate::record::{check_sizes, MAX_DATUM_SIZE};

/// Dump format version written and accepted
pub const DUMP_VERSION: &str = "1.0";

const LINE_WIDTH: usize = 76;
const END_OF_HEADER: &str = "# End of header";
const END_OF_DATA: &str = "# End of data";
const END_OF_FILE: &str = "# End of file";

/// Header fields of a dump file
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DumpHeader {
    pub version: String,
    /// Name of the database the dump was taken from
    pub file: Option<String>,
    /// Permission bits of that database
    pub mode: Option<u32>,
    pub format: String,
}

/// Writes a dump file
pub struct DumpWriter {
    writer: BufWriter<File>,
    count: u64,
}

impl DumpWriter {
    /// Create (or truncate) `path` and write the header
    pub fn create(path: &Path, source_name: &str, mode: Option<u32>) -> Result<Self> {
        let mut writer = BufWriter::new(File::create(path)?);

        writeln!(
            writer,
            "# hashkv dump file created by hashkv {} on {}",
            crate::VERSION,
            chrono::Utc::now().to_rfc3339()
        )?;
        writeln!(writer, "#:version={}", DUMP_VERSION)?;
        writeln!(writer, "#:file={}", source_name)?;
        if let Some(mode) = mode {
            writeln!(writer, "#:mode={:04o}", mode & 0o7777)?;
        }
        writeln!(writer, "#:format=standard")?;
        writeln!(writer, "{}", END_OF_HEADER)?;

        Ok(Self { writer, count: 0 })
    }

    pub fn write_record(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        check_sizes(key, value)?;
        self.write_datum(key)?;
        self.write_datum(value)?;
        self.count += 1;
        Ok(())
    }

    fn write_datum(&mut self, datum: &[u8]) -> Result<()> {
        writeln!(self.writer, "#:len={}", datum.len())?;
        let encoded = STANDARD.encode(datum);
        for line in encoded.as_bytes().chunks(LINE_WIDTH) {
            self.writer.write_all(line)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    /// Write the footer and sync; returns the number of records
    pub fn finish(mut self) -> Result<u64> {
        writeln!(self.writer, "{}", END_OF_DATA)?;
        writeln!(self.writer, "#:count={}", self.count)?;
        writeln!(self.writer, "{}", END_OF_FILE)?;

        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        Ok(self.count)
    }
}

/// Reads a dump file, yielding `(key, value)` pairs
pub struct DumpReader {
    reader: BufReader<File>,
    header: DumpHeader,
    line_no: u64,
    count: u64,
    done: bool,
}

impl DumpReader {
    pub fn open(path: &Path) -> Result<Self> {
        let mut reader = Self {
            reader: BufReader::new(File::open(path)?),
            header: DumpHeader::default(),
            line_no: 0,
            count: 0,
            done: false,
        };
        reader.read_header()?;
        Ok(reader)
    }

    pub fn header(&self) -> &DumpHeader {
        &self.header
    }

    fn read_header(&mut self) -> Result<()> {
        loop {
            let line = self.expect_line()?;
            if line == END_OF_HEADER {
                break;
            }
            if let Some((name, value)) = line.strip_prefix("#:").and_then(|l| l.split_once('=')) {
                match name {
                    "version" => self.header.version = value.to_string(),
                    "file" => self.header.file = Some(value.to_string()),
                    "mode" => {
                        let mode = u32::from_str_radix(value, 8)
                            .map_err(|_| self.bad(format!("invalid mode {:?}", value)))?;
                        self.header.mode = Some(mode);
                    }
                    "format" => self.header.format = value.to_string(),
                    _ => {}
                }
            } else if !line.starts_with('#') {
                return Err(self.bad(format!("unexpected line in header: {:?}", line)));
            }
        }

        if self.header.version != DUMP_VERSION {
            return Err(self.bad(format!(
                "unsupported dump version {:?}",
                self.header.version
            )));
        }
        if self.header.format != "standard" {
            return Err(self.bad(format!(
                "unsupported dump format {:?}",
                self.header.format
            )));
        }
        Ok(())
    }

    /// Next record, or `None` after a verified footer
    pub fn read_record(&mut self) -> Result<Option<(Vec<u8>, Vec<u8>)>> {
        let line = self.expect_line()?;
        if line == END_OF_DATA {
            self.read_footer()?;
            return Ok(None);
        }

        let key = self.read_datum(&line)?;
        let line = self.expect_line()?;
        let value = self.read_datum(&line)?;
        self.count += 1;
        Ok(Some((key, value)))
    }

    fn read_footer(&mut self) -> Result<()> {
        let line = self.expect_line()?;
        let count: u64 = line
            .strip_prefix("#:count=")
            .and_then(|c| c.parse().ok())
            .ok_or_else(|| self.bad(format!("expected record count, found {:?}", line)))?;
        if count != self.count {
            return Err(self.bad(format!(
                "footer counts {} records, dump holds {}",
                count, self.count
            )));
        }

        let line = self.expect_line()?;
        if line != END_OF_FILE {
            return Err(self.bad(format!("expected end of file, found {:?}", line)));
        }
        if !self.reader.fill_buf()?.is_empty() {
            self.line_no += 1;
            return Err(self.bad("trailing content after end of file".to_string()));
        }
        Ok(())
    }

    fn read_datum(&mut self, len_line: &str) -> Result<Vec<u8>> {
        let len: usize = len_line
            .strip_prefix("#:len=")
            .and_then(|l| l.parse().ok())
            .ok_or_else(|| self.bad(format!("expected datum length, found {:?}", len_line)))?;
        if len > MAX_DATUM_SIZE {
            return Err(self.bad(format!("datum of {} bytes exceeds the limit", len)));
        }

        let expected_chars = len.div_ceil(3) * 4;
        let mut encoded = String::with_capacity(expected_chars);
        while encoded.len() < expected_chars {
            let line = self.expect_line()?;
            encoded.push_str(&line);
        }
        if encoded.len() != expected_chars {
            return Err(self.bad(format!(
                "encoded datum has {} characters, expected {}",
                encoded.len(),
                expected_chars
            )));
        }

        let datum = STANDARD
            .decode(encoded.as_bytes())
            .map_err(|e| self.bad(format!("invalid base64: {}", e)))?;
        if datum.len() != len {
            return Err(self.bad(format!(
                "datum decodes to {} bytes, expected {}",
                datum.len(),
                len
            )));
        }
        Ok(datum)
    }

    fn expect_line(&mut self) -> Result<String> {
        let mut line = String::new();
        let n = self.reader.read_line(&mut line).map_err(|e| {
            if e.kind() == std::io::ErrorKind::InvalidData {
                self.bad("line is not valid UTF-8".to_string())
            } else {
                HashKvError::Io(e)
            }
        })?;
        if n == 0 {
            return Err(self.bad("unexpected end of dump file".to_string()));
        }
        self.line_no += 1;

        let trimmed = line.trim_end_matches(['\n', '\r']).len();
        line.truncate(trimmed);
        Ok(line)
    }

    fn bad(&self, message: String) -> HashKvError {
        HashKvError::BadInput(format!("dump line {}: {}", self.line_no, message))
    }
}

impl Iterator for DumpReader {
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
