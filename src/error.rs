//! Error types for hashkv
//!
//! Provides a unified error type for all operations, plus a coarse
//! [`ErrorKind`] classification callers can match on.

use thiserror::Error;

/// Result type alias using HashKvError
pub type Result<T> = std::result::Result<T, HashKvError>;

/// Unified error type for hashkv operations
#[derive(Debug, Error)]
pub enum HashKvError {
    // -------------------------------------------------------------------------
    // I/O Errors
    // -------------------------------------------------------------------------
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // -------------------------------------------------------------------------
    // Key Errors
    // -------------------------------------------------------------------------
    #[error("Key not found")]
    KeyNotFound,

    #[error("Key already exists")]
    KeyExists,

    // -------------------------------------------------------------------------
    // Structural Errors
    // -------------------------------------------------------------------------
    #[error("Corrupt database structure: {0}")]
    CorruptStructure(String),

    #[error("Database needs recovery")]
    NeedsRecovery,

    #[error("Database file is empty")]
    EmptyDatabase,

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Directory cannot grow beyond {bits} bits")]
    DirectoryFull { bits: u32 },

    #[error("Database is unrecoverable: {0}")]
    Unrecoverable(String),

    // -------------------------------------------------------------------------
    // Access Errors
    // -------------------------------------------------------------------------
    #[error("Lock unavailable: {0}")]
    LockUnavailable(String),

    #[error("Invalid open mode: {0}")]
    InvalidMode(String),

    #[error("Database is opened read-only")]
    ReadOnly,

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Malformed input file: {0}")]
    BadInput(String),

    // -------------------------------------------------------------------------
    // Configuration Errors
    // -------------------------------------------------------------------------
    #[error("Configuration error: {0}")]
    Config(String),
}

/// Coarse classification of [`HashKvError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    IoFailure,
    NotFound,
    AlreadyExists,
    CorruptStructure,
    LockUnavailable,
    InvalidMode,
    InvalidArgument,
    CapacityExceeded,
    Unrecoverable,
}

impl ErrorKind {
    /// Engine-side description of the failure class
    pub fn description(self) -> &'static str {
        match self {
            ErrorKind::IoFailure => "I/O failure",
            ErrorKind::NotFound => "item not found",
            ErrorKind::AlreadyExists => "cannot replace existing item",
            ErrorKind::CorruptStructure => "malformed database structure",
            ErrorKind::LockUnavailable => "database is locked",
            ErrorKind::InvalidMode => "operation not permitted in this mode",
            ErrorKind::InvalidArgument => "invalid argument",
            ErrorKind::CapacityExceeded => "capacity exceeded",
            ErrorKind::Unrecoverable => "recovery failed",
        }
    }
}

impl HashKvError {
    /// Classify this error
    pub fn kind(&self) -> ErrorKind {
        match self {
            HashKvError::Io(_) => ErrorKind::IoFailure,
            HashKvError::KeyNotFound => ErrorKind::NotFound,
            HashKvError::KeyExists => ErrorKind::AlreadyExists,
            HashKvError::CorruptStructure(_)
            | HashKvError::NeedsRecovery
            | HashKvError::EmptyDatabase
            | HashKvError::Serialization(_) => ErrorKind::CorruptStructure,
            HashKvError::DirectoryFull { .. } => ErrorKind::CapacityExceeded,
            HashKvError::Unrecoverable(_) => ErrorKind::Unrecoverable,
            HashKvError::LockUnavailable(_) => ErrorKind::LockUnavailable,
            HashKvError::InvalidMode(_) | HashKvError::ReadOnly => ErrorKind::InvalidMode,
            HashKvError::InvalidArgument(_)
            | HashKvError::BadInput(_)
            | HashKvError::Config(_) => ErrorKind::InvalidArgument,
        }
    }

    /// Human-readable diagnostic combining the engine's description of the
    /// failure with the underlying system error, if any.
    pub fn diagnostic(&self) -> String {
        match self {
            HashKvError::Io(e) => match e.raw_os_error() {
                Some(code) => format!("{}: {} (errno {})", self.kind().description(), e, code),
                None => format!("{}: {}", self.kind().description(), e),
            },
            other => format!("{}: {}", other.kind().description(), other),
        }
    }

    /// True when the handle must be recovered before further use
    pub fn is_structural(&self) -> bool {
        self.kind() == ErrorKind::CorruptStructure
            && !matches!(self, HashKvError::EmptyDatabase)
    }
}

impl From<bincode::Error> for HashKvError {
    fn from(e: bincode::Error) -> Self {
        HashKvError::Serialization(e.to_string())
    }
}
