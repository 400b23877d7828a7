//! Per-domain watermark persistence
//!
//! `observed` is the highest `updated_at` seen in a successful response.
//! `cursor` is what the next "changed since" query uses: `observed` minus
//! the safety lookback. Both only move forward.

use chrono::{DateTime, Utc};
use ofs_model::{SyncDomain, Watermark};
use ofs_store::TieredStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error};

/// Stored watermark pair for one domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatermarkRecord {
    /// Highest `updated_at` seen
    pub observed: Watermark,
    /// Next "changed since" bound
    pub cursor: Watermark,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedWatermarks {
    version: u32,
    // domains are not string keys, so a list of pairs
    records: Vec<(SyncDomain, WatermarkRecord)>,
}

/// Monotonic watermark store
pub struct WatermarkStore {
    key: String,
    lookback: chrono::Duration,
    store: Arc<TieredStore>,
    records: RwLock<BTreeMap<SyncDomain, WatermarkRecord>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for WatermarkStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WatermarkStore")
            .field("key", &self.key)
            .field("domains", &self.records.read().len())
            .finish_non_exhaustive()
    }
}

impl WatermarkStore {
    /// Empty store persisting under `key`; call `load` to restore
    #[must_use]
    pub fn new(key: impl Into<String>, lookback: chrono::Duration, store: Arc<TieredStore>) -> Self {
        Self {
            key: key.into(),
            lookback,
            store,
            records: RwLock::new(BTreeMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn get(&self, domain: &SyncDomain) -> Option<WatermarkRecord> {
        self.records.read().get(domain).copied()
    }

    /// Cursor for the next "changed since" query; the origin when unknown
    #[must_use]
    pub fn cursor(&self, domain: &SyncDomain) -> Watermark {
        self.get(domain).map_or_else(Watermark::origin, |r| r.cursor)
    }

    /// Whether a remote watermark is beyond what has been observed
    #[must_use]
    pub fn is_behind(&self, domain: &SyncDomain, remote: Watermark) -> bool {
        self.get(domain).map_or(true, |r| remote > r.observed)
    }

    /// Record an observed `updated_at`; returns whether anything moved
    pub async fn advance(&self, domain: &SyncDomain, observed: DateTime<Utc>) -> bool {
        let observed = Watermark::at(observed);
        let moved = {
            let mut records = self.records.write();
            let next_cursor = observed.minus(self.lookback);
            match records.get_mut(domain) {
                Some(record) if record.observed >= observed => false,
                Some(record) => {
                    record.observed = observed;
                    record.cursor = record.cursor.max(next_cursor);
                    true
                }
                None => {
                    records.insert(
                        domain.clone(),
                        WatermarkRecord {
                            observed,
                            cursor: next_cursor,
                        },
                    );
                    true
                }
            }
        };
        if moved {
            debug!(%domain, %observed, "watermark advanced");
            self.persist().await;
        }
        moved
    }

    /// Forget a domain (scope became inaccessible)
    pub async fn reset(&self, domain: &SyncDomain) {
        if self.records.write().remove(domain).is_some() {
            self.persist().await;
        }
    }

    /// Forget every domain
    pub async fn clear(&self) {
        self.records.write().clear();
        self.persist().await;
    }

    /// Restore persisted watermarks; returns the number of domains
    pub async fn load(&self) -> usize {
        let raw = match self.store.read(&self.key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                error!(error = %e, "failed to read watermarks");
                return 0;
            }
        };
        match serde_json::from_str::<PersistedWatermarks>(&raw) {
            Ok(persisted) => {
                let mut records = self.records.write();
                records.extend(persisted.records);
                records.len()
            }
            Err(e) => {
                error!(error = %e, "persisted watermarks are corrupt, starting from origin");
                0
            }
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let persisted = PersistedWatermarks {
            version: 1,
            records: self
                .records
                .read()
                .iter()
                .map(|(d, r)| (d.clone(), *r))
                .collect(),
        };
        let payload = match serde_json::to_string(&persisted) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to encode watermarks");
                return;
            }
        };
        if let Err(e) = self.store.write(&self.key, &payload).await {
            error!(error = %e, "failed to persist watermarks");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_model::ScopeId;
    use ofs_store::MemoryStore;
    use ofs_test_utils::at;

    fn store() -> Arc<TieredStore> {
        Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))))
    }

    fn domain() -> SyncDomain {
        SyncDomain::Scope(ScopeId::new("p1"))
    }

    #[tokio::test]
    async fn cursor_trails_observed_by_lookback() {
        let wm = WatermarkStore::new("wm", chrono::Duration::seconds(30), store());
        assert_eq!(wm.cursor(&domain()), Watermark::origin());

        assert!(wm.advance(&domain(), at(100)).await);
        let record = wm.get(&domain()).unwrap();
        assert_eq!(record.observed, Watermark::at(at(100)));
        assert_eq!(record.cursor, Watermark::at(at(70)));
    }

    #[tokio::test]
    async fn never_moves_backwards() {
        let wm = WatermarkStore::new("wm", chrono::Duration::seconds(30), store());
        wm.advance(&domain(), at(100)).await;

        assert!(!wm.advance(&domain(), at(50)).await);
        assert_eq!(wm.get(&domain()).unwrap().observed, Watermark::at(at(100)));
        assert!(!wm.is_behind(&domain(), Watermark::at(at(100))));
        assert!(wm.is_behind(&domain(), Watermark::at(at(101))));
    }

    #[tokio::test]
    async fn survives_restart_and_reset() {
        let store = store();
        let wm = WatermarkStore::new("wm", chrono::Duration::zero(), Arc::clone(&store));
        wm.advance(&domain(), at(10)).await;
        wm.advance(&SyncDomain::ScopeList, at(20)).await;

        let reopened = WatermarkStore::new("wm", chrono::Duration::zero(), store);
        assert_eq!(reopened.load().await, 2);
        reopened.reset(&domain()).await;
        assert!(reopened.get(&domain()).is_none());
        assert_eq!(reopened.cursor(&SyncDomain::ScopeList), Watermark::at(at(20)));
    }
}
