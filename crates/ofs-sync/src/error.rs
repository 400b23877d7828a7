//! Sync errors

use ofs_model::{ConfigError, EntityId, RemoteError, ScopeId, StateError};
use ofs_optimistic::OptimisticError;
use ofs_store::StoreError;
use thiserror::Error;

/// Failure of a sync or engine operation
#[derive(Debug, Error)]
pub enum SyncError {
    /// Scope was deleted or unshared; terminal, never retried
    #[error("scope {0} is not accessible")]
    NotAccessible(ScopeId),

    #[error(transparent)]
    Remote(#[from] RemoteError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("offline cache encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error(transparent)]
    Optimistic(#[from] OptimisticError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Hard cap reached; the local edit was rolled back
    #[error("mutation queue is full, {0} was not queued")]
    QueueFull(EntityId),
}

/// Result type for sync operations
pub type Result<T> = std::result::Result<T, SyncError>;
