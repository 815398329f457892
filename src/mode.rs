//! Open modes
//!
//! A mode string selects how a database file is opened. The first character
//! picks the access mode, modifier letters anywhere in the string adjust it:
//!
//! | Char | Meaning                                         |
//! |------|-------------------------------------------------|
//! | `r`  | reader: read-only, shared lock (default)        |
//! | `w`  | writer: read-write, exclusive lock, must exist  |
//! | `c`  | creator: writer, create the file if missing     |
//! | `n`  | new: writer, always start from an empty file    |
//! | `L`  | do not lock the file                            |
//! | `M`  | do not memory-map the file                      |
//! | `S`  | fsync after every mutation                      |

use std::fmt;
use std::str::FromStr;

use crate::error::HashKvError;

/// Access mode of a handle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    Reader,
    Writer,
    Creator,
    New,
}

impl OpenMode {
    /// True for every mode that may mutate the file
    pub fn is_writable(self) -> bool {
        !matches!(self, OpenMode::Reader)
    }

    /// True when a missing file is created
    pub fn creates(self) -> bool {
        matches!(self, OpenMode::Creator | OpenMode::New)
    }
}

/// Parsed mode string
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpenFlags {
    pub mode: OpenMode,
    pub no_lock: bool,
    pub no_mmap: bool,
    pub sync: bool,
}

impl OpenFlags {
    pub fn new(mode: OpenMode) -> Self {
        Self {
            mode,
            no_lock: false,
            no_mmap: false,
            sync: false,
        }
    }

    pub fn no_lock(mut self) -> Self {
        self.no_lock = true;
        self
    }

    pub fn no_mmap(mut self) -> Self {
        self.no_mmap = true;
        self
    }

    pub fn sync(mut self) -> Self {
        self.sync = true;
        self
    }

    /// Parse a mode string such as `"r"`, `"cS"` or `"nLM"`.
    ///
    /// An unrecognised leading character falls back to reader, so `""` and
    /// `"x"` both open read-only. Characters other than the modifiers are
    /// ignored after the first position, except that non-ASCII input is
    /// rejected.
    pub fn parse(mode: &str) -> Result<Self, HashKvError> {
        if !mode.is_ascii() {
            return Err(HashKvError::InvalidMode(format!("{:?}", mode)));
        }

        let access = match mode.chars().next() {
            Some('w') => OpenMode::Writer,
            Some('c') => OpenMode::Creator,
            Some('n') => OpenMode::New,
            _ => OpenMode::Reader,
        };

        let mut flags = Self::new(access);
        for c in mode.chars() {
            match c {
                'L' => flags.no_lock = true,
                'M' => flags.no_mmap = true,
                'S' => flags.sync = true,
                _ => {}
            }
        }
        Ok(flags)
    }
}

impl FromStr for OpenFlags {
    type Err = HashKvError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for OpenFlags {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let access = match self.mode {
            OpenMode::Reader => 'r',
            OpenMode::Writer => 'w',
            OpenMode::Creator => 'c',
            OpenMode::New => 'n',
        };
        write!(f, "{}", access)?;
        if self.no_lock {
            write!(f, "L")?;
        }
        if self.no_mmap {
            write!(f, "M")?;
        }
        if self.sync {
            write!(f, "S")?;
        }
        Ok(())
    }
}
