//! Ledger errors

use ofs_store::StoreError;
use thiserror::Error;

/// Persistence failure of the local plane
///
/// Logged by the ledger; never returned from its public operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("ledger encoding failed: {0}")]
    Serialize(#[from] serde_json::Error),
}
