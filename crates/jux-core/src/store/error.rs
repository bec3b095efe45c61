//! Error types for local report storage.

use std::path::{Path, PathBuf};

use jux_evidence::ContentHash;
use thiserror::Error;

/// Result type for store operations.
pub type StorageResult<T> = Result<T, StorageError>;

/// Errors that can occur during report storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// No artifact stored under this hash.
    #[error("report not found: {hash}")]
    NotFound { hash: ContentHash },

    /// Different bytes already stored under this hash.
    #[error("hash collision: different bytes already stored under {hash}")]
    HashCollision { hash: ContentHash },

    /// Refused to remove a report still waiting for delivery.
    #[error("report {hash} is pending delivery")]
    Pending { hash: ContentHash },

    /// A record file exists but cannot be read.
    #[error("corrupt record {path}: {message}", path = path.display())]
    CorruptRecord { path: PathBuf, message: String },

    /// Could not determine a default storage location.
    #[error("no default storage directory: {message}")]
    NoDefaultRoot { message: String },

    /// File system error.
    #[error("I/O error at {path}: {message}", path = path.display())]
    Io { path: PathBuf, message: String },
}

impl StorageError {
    pub(crate) fn io(path: &Path, err: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            message: err.to_string(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::NotFound { .. } => "not_found",
            Self::HashCollision { .. } => "hash_collision",
            Self::Pending { .. } => "pending",
            Self::CorruptRecord { .. } => "corrupt_record",
            Self::NoDefaultRoot { .. } => "no_default_root",
            Self::Io { .. } => "io",
        }
    }

    /// Returns true if this error indicates the report was not found.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Suggested exit code for CLI.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::NotFound { .. } => 2,
            Self::Pending { .. } => 3,
            Self::HashCollision { .. } => 4,
            _ => 1,
        }
    }
}
