//! Error types for local storage tiers

use std::path::PathBuf;

/// Errors from a storage tier
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Tier cannot be used at all (probe failed, disabled, closed)
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Value would push the tier over its byte quota
    #[error("quota exceeded: {size} bytes requested, limit {limit} bytes")]
    QuotaExceeded { size: usize, limit: usize },

    /// Filesystem error
    #[error("io error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// SQLite error
    #[error("database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Stored value is not a valid envelope
    #[error("corrupt record under {key}: {message}")]
    Corrupt { key: String, message: String },

    /// Tier has no synchronous write path
    #[error("blocking writes not supported by {0}")]
    Unsupported(&'static str),

    /// Blocking worker panicked or was cancelled
    #[error("storage worker failed: {0}")]
    Worker(String),
}

impl StoreError {
    /// Create IO error for path
    pub fn io_error(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the failure is a capacity problem the caller can fix by
    /// writing less
    #[inline]
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::QuotaExceeded { .. })
    }
}
