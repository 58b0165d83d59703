//! Error types for cache store operations.
//!
//! These never reach a request caller: the store logs them and treats the
//! affected entry as a miss.

use std::path::PathBuf;

use thiserror::Error;

/// Errors raised inside the disk cache.
#[derive(Debug, Error)]
pub enum CacheError {
    /// File system failure while reading or writing an entry.
    #[error("cache IO error at {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// An entry file failed validation; isolated to that one entry.
    #[error("corrupt cache entry: {reason}")]
    Corrupt {
        /// What failed to validate.
        reason: String,
    },

    /// The entry header could not be serialized.
    #[error("failed to serialize cache entry header: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl CacheError {
    /// Creates an IO error.
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Creates a corruption error.
    pub fn corrupt(reason: impl Into<String>) -> Self {
        Self::Corrupt {
            reason: reason.into(),
        }
    }
}
