//! Optimistic action errors

use ofs_model::{RemoteError, StateError};
use thiserror::Error;

/// What went wrong inside an optimistic action
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ActionError {
    /// The local edit itself could not be applied; nothing changed
    #[error("local apply failed: {0}")]
    Apply(#[from] StateError),

    /// The remote refused or could not be reached
    #[error("remote call failed: {0}")]
    Remote(#[from] RemoteError),
}

/// Failed optimistic action, for callers that prefer `?`
#[derive(Debug, Clone, PartialEq, Error)]
#[error("optimistic action failed (rolled back: {rolled_back}): {source}")]
pub struct OptimisticError {
    #[source]
    pub source: ActionError,
    pub rolled_back: bool,
}
