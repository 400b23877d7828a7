//! In-process store with quota and fault injection

use crate::error::StoreError;
use crate::store::DurableStore;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// HashMap-backed store
///
/// Used as the secondary tier when no directory is configured, and as a
/// controllable tier in tests (`set_fail_writes`, quotas, write counters).
#[derive(Debug)]
pub struct MemoryStore {
    name: &'static str,
    entries: Mutex<HashMap<String, String>>,
    quota: Option<usize>,
    fail_writes: AtomicBool,
    fail_reads: AtomicBool,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Unbounded store
    #[must_use]
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            entries: Mutex::new(HashMap::new()),
            quota: None,
            fail_writes: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            writes: AtomicUsize::new(0),
        }
    }

    /// Store with a byte quota across all keys
    #[must_use]
    pub fn with_quota(name: &'static str, quota: usize) -> Self {
        Self {
            quota: Some(quota),
            ..Self::new(name)
        }
    }

    /// Make every subsequent write fail with `Unavailable`
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent read fail with `Unavailable`
    pub fn set_fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    /// Successful writes so far
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw value, bypassing fault injection
    #[must_use]
    pub fn raw(&self, key: &str) -> Option<String> {
        self.entries.lock().get(key).cloned()
    }

    fn write(&self, key: &str, value: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} writes disabled", self.name)));
        }
        let mut entries = self.entries.lock();
        if let Some(limit) = self.quota {
            let others: usize = entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(_, v)| v.len())
                .sum();
            let size = others + value.len();
            if size > limit {
                return Err(StoreError::QuotaExceeded { size, limit });
            }
        }
        entries.insert(key.to_string(), value.to_string());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    fn name(&self) -> &'static str {
        self.name
    }

    fn quota_bytes(&self) -> Option<usize> {
        self.quota
    }

    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} reads disabled", self.name)));
        }
        Ok(self.entries.lock().get(key).cloned())
    }

    async fn put(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.write(key, &value)
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable(format!("{} writes disabled", self.name)));
        }
        self.entries.lock().remove(key);
        Ok(())
    }

    fn put_blocking(&self, key: &str, value: &str) -> Result<(), StoreError> {
        self.write(key, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn fault_injection_toggles() {
        let store = MemoryStore::new("mem");
        store.set_fail_writes(true);
        assert!(store.put("k", "v".into()).await.is_err());

        store.set_fail_writes(false);
        store.put("k", "v".into()).await.unwrap();
        assert_eq!(store.write_count(), 1);

        store.set_fail_reads(true);
        assert!(store.get("k").await.is_err());
        assert_eq!(store.raw("k").as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn quota_enforced() {
        let store = MemoryStore::with_quota("small", 4);
        store.put("a", "1234".into()).await.unwrap();
        assert!(store.put("b", "5".into()).await.unwrap_err().is_quota());
    }
}
