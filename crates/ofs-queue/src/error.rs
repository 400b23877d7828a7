//! Internal errors of queue persistence
//!
//! These never escape the public queue API: persistence failures are logged
//! and the in-memory queue stays authoritative.

use ofs_store::StoreError;

/// Failures while persisting or restoring the queue
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("storage: {0}")]
    Store(#[from] StoreError),

    #[error("serialization: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether the secondary tier ran out of room
    #[inline]
    #[must_use]
    pub fn is_quota(&self) -> bool {
        matches!(self, Self::Store(e) if e.is_quota())
    }
}
