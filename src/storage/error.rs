//! Storage error types
//!
//! Every layer (paged file, resizable file, append log, enumerator, value log,
//! container store) reports failures through [`StorageError`]. Callers at the
//! index boundary usually react to any error by discarding and rebuilding the
//! affected index; [`StorageError::is_corruption`] and
//! [`StorageError::is_version_update`] tell the two rebuild reasons apart.

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur in the storage layer
#[derive(Error, Debug)]
pub enum StorageError {
    /// I/O operation failed
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compression or decompression failed
    #[error("Compression error: {0}")]
    Compression(String),

    /// On-disk structural invariant violated (bad magic, broken chunk chain, ...)
    #[error("Storage corrupted: {path:?}: {reason}")]
    Corrupted { path: PathBuf, reason: String },

    /// Stored format version differs from the one requested at open
    #[error("Storage format changed: {path:?}: expected version {expected}, found {found}")]
    VersionUpdated {
        path: PathBuf,
        expected: u32,
        found: u32,
    },

    /// Access outside the mapped or logical file range
    #[error("Out of bounds access: offset {offset}, len {len}, limit {limit}")]
    OutOfBounds { offset: u64, len: usize, limit: u64 },

    /// Caller passed an id that names no enumerated record
    #[error("Invalid id {0}: not an enumerated record")]
    InvalidId(u32),

    /// Mutation attempted on a read-only storage
    #[error("Unsupported operation on read-only storage: {0}")]
    ReadOnly(&'static str),

    /// Operation not permitted in the storage's current mode
    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    /// Storage used after close
    #[error("Storage is closed: {0:?}")]
    Closed(PathBuf),

    /// A long operation was interrupted by the cancellation hook
    #[error("Operation cancelled")]
    Cancelled,

    /// An id or address no longer fits its on-disk representation
    #[error("Capacity exceeded: {0}")]
    CapacityExceeded(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl StorageError {
    pub fn corrupted(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        StorageError::Corrupted {
            path: path.into(),
            reason: reason.into(),
        }
    }

    /// True for structural corruption, including the version-changed case
    pub fn is_corruption(&self) -> bool {
        matches!(
            self,
            StorageError::Corrupted { .. } | StorageError::VersionUpdated { .. }
        )
    }

    /// True when the data is intact but was written in another format version
    pub fn is_version_update(&self) -> bool {
        matches!(self, StorageError::VersionUpdated { .. })
    }

    /// Errors that say nothing about the health of the on-disk data
    pub(crate) fn leaves_storage_intact(&self) -> bool {
        matches!(
            self,
            StorageError::ReadOnly(_)
                | StorageError::InvalidId(_)
                | StorageError::Unsupported(_)
                | StorageError::Cancelled
                | StorageError::Closed(_)
        )
    }
}

impl From<bincode::Error> for StorageError {
    fn from(err: bincode::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result type alias for storage operations
pub type StorageResult<T> = Result<T, StorageError>;
