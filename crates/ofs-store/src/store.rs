//! Storage tier abstraction

use crate::error::StoreError;
use async_trait::async_trait;

/// Which tier served or accepted a request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    /// Larger, transactional store
    Primary,
    /// Small, synchronous fallback store
    Secondary,
}

/// A keyed string store.
///
/// Callers depend only on this trait; which concrete tier is active is
/// decided once at startup by [`crate::TieredStore::probe`].
#[async_trait]
pub trait DurableStore: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    /// Byte quota across all keys, if the tier has one
    fn quota_bytes(&self) -> Option<usize> {
        None
    }

    /// Read a value
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError>;

    /// Write a value, replacing any previous one
    async fn put(&self, key: &str, value: String) -> Result<(), StoreError>;

    /// Remove a value; missing keys are not an error
    async fn delete(&self, key: &str) -> Result<(), StoreError>;

    /// Synchronous write for process teardown
    fn put_blocking(&self, key: &str, value: &str) -> Result<(), StoreError> {
        let _ = (key, value);
        Err(StoreError::Unsupported(self.name()))
    }
}
