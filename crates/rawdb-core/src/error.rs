//! Error types for RawDb operations
//!
//! All RawDb errors are represented by the [`RawDbError`] enum, which carries
//! enough context (paths, offsets, indices) to diagnose a failure after the fact.
//!
//! One variant is not an error at all: [`RawDbError::ClearCacheRequested`] is the
//! control-flow signal an operation raises to abort its transaction and force a
//! full cache invalidation followed by log-based recovery.

use std::path::PathBuf;

/// RawDb error types with detailed context
#[derive(Debug, Clone, thiserror::Error)]
pub enum RawDbError {
    /// I/O operation failed
    #[error("I/O error{}: {message} ({kind})", display_path(.path))]
    Io {
        /// The file path where the error occurred
        path: Option<PathBuf>,
        /// The underlying I/O error kind
        kind: std::io::ErrorKind,
        /// Human-readable description
        message: String,
    },

    /// On-disk data is corrupted (short read, malformed log record, bad page image)
    #[error("data corrupted in {} at offset {offset}: {reason}", .path.display())]
    Corrupted {
        /// File where the corruption was detected
        path: PathBuf,
        /// Byte offset of the corrupted data
        offset: u64,
        /// Description of the corruption
        reason: String,
    },

    /// Checksum verification of a log record failed
    #[error("checksum mismatch in {} at offset {offset}: expected 0x{expected:08x}, got 0x{actual:08x}", .path.display())]
    ChecksumMismatch {
        /// File where checksum failed
        path: PathBuf,
        /// Expected checksum value
        expected: u32,
        /// Actual checksum computed
        actual: u32,
        /// Byte offset of the corrupted record
        offset: u64,
    },

    /// The batch header page does not start with the expected magic
    #[error("bad batch header magic: found 0x{found:04x}")]
    BadMagic {
        /// Magic actually found
        found: u16,
    },

    /// The batch header page has an unknown format version
    #[error("unsupported batch header version {found}")]
    UnsupportedVersion {
        /// Version actually found
        found: u8,
    },

    /// A write was attempted through a read-only transaction, file or page
    #[error("read-only violation: {what}")]
    ReadOnly {
        /// What rejected the write
        what: String,
    },

    /// No data file is bound to the given index
    #[error("file {file_index} is not bound")]
    FileNotFound {
        /// The requested file index
        file_index: u32,
    },

    /// The page does not exist in the file
    #[error("page {page_index} not found in file {file_index}")]
    PageNotFound {
        /// File index
        file_index: u32,
        /// Page index
        page_index: u64,
    },

    /// A page or proxy was used after its backing cache was invalidated
    #[error("page {page_index} of file {file_index} is stale")]
    StalePage {
        /// File index
        file_index: u32,
        /// Page index
        page_index: u64,
    },

    /// Growing a file past its configured maximum size
    #[error("file {file_index} would grow to {requested} bytes, maximum is {max}")]
    FileTooLarge {
        /// File index
        file_index: u32,
        /// Size the write would need
        requested: u64,
        /// Configured maximum size
        max: u64,
    },

    /// A page manager operation was issued outside an active transaction
    #[error("no active transaction")]
    TransactionMissing,

    /// Control-flow signal: abort the transaction and clear all caches
    #[error("cache clear requested")]
    ClearCacheRequested,

    /// The transaction manager was closed before the transaction completed
    #[error("transaction manager closed")]
    TransactionManagerClosed,

    /// The execution context went away while a caller waited for completion
    #[error("operation interrupted: {reason}")]
    Interrupted {
        /// Why the wait was abandoned
        reason: String,
    },

    /// A persisted batch operation names a type no factory is registered for
    #[error("no batch operation factory registered for '{type_name}'")]
    BatchOperationUnknown {
        /// Persisted operation type name
        type_name: String,
    },

    /// Serialized batch state does not fit the header page
    #[error("batch state of {size} bytes does not fit a {page_size} byte header page")]
    BatchStateTooLarge {
        /// Encoded state size
        size: usize,
        /// Header page size
        page_size: usize,
    },

    /// Invalid configuration
    #[error("invalid configuration: {reason}")]
    Config {
        /// Which constraint was violated
        reason: String,
    },
}

fn display_path(path: &Option<PathBuf>) -> String {
    match path {
        Some(path) => format!(" in {}", path.display()),
        None => String::new(),
    }
}

impl RawDbError {
    /// Build an [`RawDbError::Io`] with path context.
    pub fn io(path: impl Into<PathBuf>, err: std::io::Error, what: &str) -> Self {
        RawDbError::Io {
            path: Some(path.into()),
            kind: err.kind(),
            message: format!("{}: {}", what, err),
        }
    }

    /// True for the clear-cache control signal.
    pub fn is_clear_cache(&self) -> bool {
        matches!(self, RawDbError::ClearCacheRequested)
    }

    /// True for errors that mean on-disk state cannot be trusted.
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            RawDbError::Corrupted { .. }
                | RawDbError::ChecksumMismatch { .. }
                | RawDbError::BadMagic { .. }
                | RawDbError::UnsupportedVersion { .. }
        )
    }
}

/// Convert std::io::Error to RawDbError::Io
impl From<std::io::Error> for RawDbError {
    fn from(err: std::io::Error) -> Self {
        RawDbError::Io {
            path: None,
            kind: err.kind(),
            message: err.to_string(),
        }
    }
}

/// Result type alias for RawDb operations
pub type RawResult<T> = Result<T, RawDbError>;
