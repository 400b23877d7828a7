//! Two-tier durable storage
//!
//! Writes go to the primary tier while it is healthy and fall back to the
//! secondary tier on failure. Every value is wrapped in an envelope carrying
//! its write time so a read can pick the newest copy when both tiers hold
//! one (a fallback write leaves a stale copy behind in the primary).
//!
//! Keys marked evictable hold data that can be rebuilt (the offline
//! snapshot). When the secondary tier is out of quota for any other key,
//! evictable records are dropped from it and the write is retried once.
//!
//! A failed primary write parks the primary for a recheck interval; the
//! first write after the interval tries it again and restores it on success.
//!
//! Synchronous teardown writes always target the secondary tier, the only
//! one with a blocking path.

use crate::error::StoreError;
use crate::store::{DurableStore, Tier};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const PROBE_KEY: &str = "__ofs_probe__";
const DEFAULT_RECHECK: Duration = Duration::from_secs(30);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    written_at_ms: i64,
    payload: String,
}

/// Primary + secondary store behind one interface
pub struct TieredStore {
    primary: Option<Arc<dyn DurableStore>>,
    secondary: Arc<dyn DurableStore>,
    primary_healthy: AtomicBool,
    recheck_interval: Duration,
    /// When a parked primary may be tried again
    retry_primary_at: Mutex<Option<Instant>>,
    evictable: Mutex<BTreeSet<String>>,
    last_stamp: AtomicI64,
}

impl std::fmt::Debug for TieredStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TieredStore")
            .field("primary", &self.primary.as_ref().map(|p| p.name()))
            .field("secondary", &self.secondary.name())
            .field("primary_healthy", &self.primary_healthy.load(Ordering::Relaxed))
            .finish()
    }
}

impl TieredStore {
    /// Both tiers, primary assumed healthy
    #[must_use]
    pub fn new(primary: Arc<dyn DurableStore>, secondary: Arc<dyn DurableStore>) -> Self {
        Self {
            primary: Some(primary),
            secondary,
            primary_healthy: AtomicBool::new(true),
            recheck_interval: DEFAULT_RECHECK,
            retry_primary_at: Mutex::new(None),
            evictable: Mutex::new(BTreeSet::new()),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Secondary tier only
    #[must_use]
    pub fn secondary_only(secondary: Arc<dyn DurableStore>) -> Self {
        Self {
            primary: None,
            secondary,
            primary_healthy: AtomicBool::new(false),
            recheck_interval: DEFAULT_RECHECK,
            retry_primary_at: Mutex::new(None),
            evictable: Mutex::new(BTreeSet::new()),
            last_stamp: AtomicI64::new(0),
        }
    }

    /// Decide at startup whether the primary tier is usable
    ///
    /// The probe writes, reads back and deletes a marker key. Any failure
    /// leaves the primary attached but marked unhealthy.
    pub async fn probe(
        primary: Option<Arc<dyn DurableStore>>,
        secondary: Arc<dyn DurableStore>,
    ) -> Self {
        let Some(primary) = primary else {
            info!(secondary = secondary.name(), "no primary tier configured");
            return Self::secondary_only(secondary);
        };

        let store = Self::new(Arc::clone(&primary), secondary);
        if let Err(e) = Self::probe_tier(primary.as_ref()).await {
            warn!(primary = primary.name(), error = %e, "primary tier probe failed, using secondary");
            store.park_primary();
        } else {
            info!(primary = primary.name(), "primary tier healthy");
        }
        store
    }

    async fn probe_tier(tier: &dyn DurableStore) -> Result<(), StoreError> {
        let marker = chrono::Utc::now().timestamp_millis().to_string();
        tier.put(PROBE_KEY, marker.clone()).await?;
        let read = tier.get(PROBE_KEY).await?;
        tier.delete(PROBE_KEY).await?;
        if read.as_deref() == Some(marker.as_str()) {
            Ok(())
        } else {
            Err(StoreError::Unavailable(format!(
                "{} probe read back a different value",
                tier.name()
            )))
        }
    }

    /// Wait between a primary failure and the next write that tries it
    #[must_use]
    pub fn with_recheck_interval(mut self, interval: Duration) -> Self {
        self.recheck_interval = interval;
        let retry_at = self.retry_primary_at.get_mut();
        if retry_at.is_some() {
            *retry_at = Some(Instant::now() + interval);
        }
        self
    }

    /// Re-run the probe against the primary now and restore it if it passes
    pub async fn recheck_primary(&self) -> bool {
        let Some(primary) = &self.primary else {
            return false;
        };
        let healthy = Self::probe_tier(primary.as_ref()).await.is_ok();
        if healthy {
            self.restore_primary();
        } else {
            self.park_primary();
        }
        healthy
    }

    fn park_primary(&self) {
        self.primary_healthy.store(false, Ordering::SeqCst);
        *self.retry_primary_at.lock() = Some(Instant::now() + self.recheck_interval);
    }

    fn restore_primary(&self) {
        *self.retry_primary_at.lock() = None;
        if !self.primary_healthy.swap(true, Ordering::SeqCst) {
            info!("primary tier recovered");
        }
    }

    /// Primary to try for the next write: healthy, or parked past its
    /// recheck time
    fn writable_primary(&self) -> Option<&Arc<dyn DurableStore>> {
        let primary = self.primary.as_ref()?;
        if self.primary_healthy.load(Ordering::SeqCst) {
            return Some(primary);
        }
        let due = self
            .retry_primary_at
            .lock()
            .is_some_and(|at| Instant::now() >= at);
        due.then_some(primary)
    }

    /// Tier that will receive the next async write
    #[must_use]
    pub fn active_tier(&self) -> Tier {
        if self.primary.is_some() && self.primary_healthy.load(Ordering::SeqCst) {
            Tier::Primary
        } else {
            Tier::Secondary
        }
    }

    /// Quota of the secondary tier
    #[must_use]
    pub fn secondary_quota(&self) -> Option<usize> {
        self.secondary.quota_bytes()
    }

    /// Let `key` be dropped from the secondary tier when another write
    /// needs the room
    pub fn mark_evictable(&self, key: &str) {
        self.evictable.lock().insert(key.to_string());
    }

    /// Bytes `payload` takes once stored, envelope included
    #[must_use]
    pub fn stored_len(&self, payload: &str) -> usize {
        let envelope = Envelope {
            written_at_ms: i64::MAX,
            payload: payload.to_string(),
        };
        serde_json::to_string(&envelope).map_or(usize::MAX, |raw| raw.len())
    }

    /// Strictly increasing millisecond stamp so two writes in the same
    /// millisecond still order correctly
    fn next_stamp(&self) -> i64 {
        let now = chrono::Utc::now().timestamp_millis();
        let mut prev = self.last_stamp.load(Ordering::SeqCst);
        loop {
            let next = now.max(prev + 1);
            match self
                .last_stamp
                .compare_exchange(prev, next, Ordering::SeqCst, Ordering::SeqCst)
            {
                Ok(_) => return next,
                Err(actual) => prev = actual,
            }
        }
    }

    fn wrap(&self, key: &str, payload: &str) -> Result<String, StoreError> {
        let envelope = Envelope {
            written_at_ms: self.next_stamp(),
            payload: payload.to_string(),
        };
        serde_json::to_string(&envelope).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    fn unwrap_envelope(key: &str, raw: &str) -> Result<Envelope, StoreError> {
        serde_json::from_str(raw).map_err(|e| StoreError::Corrupt {
            key: key.to_string(),
            message: e.to_string(),
        })
    }

    /// Write a value to the active tier, falling back to the secondary
    ///
    /// # Errors
    /// Returns the secondary tier's error when both tiers reject the write.
    pub async fn write(&self, key: &str, payload: &str) -> Result<Tier, StoreError> {
        let value = self.wrap(key, payload)?;

        if let Some(primary) = self.writable_primary() {
            match primary.put(key, value.clone()).await {
                Ok(()) => {
                    self.restore_primary();
                    return Ok(Tier::Primary);
                }
                Err(e) => {
                    warn!(key, primary = primary.name(), error = %e, "primary write failed, falling back");
                    metrics::counter!("ofs_store_fallback_total").increment(1);
                    self.park_primary();
                }
            }
        }

        match self.secondary.put(key, value.clone()).await {
            Err(e) if e.is_quota() && self.make_room(key).await => {
                self.secondary.put(key, value).await?;
            }
            other => other?,
        }
        Ok(Tier::Secondary)
    }

    /// Drop evictable records other than `key` from the secondary tier;
    /// returns whether any was dropped
    async fn make_room(&self, key: &str) -> bool {
        let victims: Vec<String> = self
            .evictable
            .lock()
            .iter()
            .filter(|k| k.as_str() != key)
            .cloned()
            .collect();
        let mut dropped = false;
        for victim in victims {
            if !matches!(self.secondary.get(&victim).await, Ok(Some(_))) {
                continue;
            }
            match self.secondary.delete(&victim).await {
                Ok(()) => {
                    warn!(key, dropped = %victim, "secondary tier full, dropped rebuildable record");
                    metrics::counter!("ofs_store_evictable_dropped_total").increment(1);
                    dropped = true;
                }
                Err(e) => warn!(key = %victim, error = %e, "failed to drop rebuildable record"),
            }
        }
        dropped
    }

    /// Synchronous write to the secondary tier for process teardown
    pub fn write_blocking(&self, key: &str, payload: &str) -> Result<(), StoreError> {
        let value = self.wrap(key, payload)?;
        self.secondary.put_blocking(key, &value)
    }

    /// Read the newest copy of a value across both tiers
    ///
    /// A tier that errors or holds a corrupt envelope is skipped; the call
    /// only fails when no tier could be read at all.
    pub async fn read(&self, key: &str) -> Result<Option<String>, StoreError> {
        let mut newest: Option<Envelope> = None;
        let mut last_error = None;
        let mut any_ok = false;

        let tiers = self.primary.iter().chain(std::iter::once(&self.secondary));
        for tier in tiers {
            match tier.get(key).await {
                Ok(Some(raw)) => {
                    any_ok = true;
                    match Self::unwrap_envelope(key, &raw) {
                        Ok(env) => {
                            if newest
                                .as_ref()
                                .map_or(true, |cur| env.written_at_ms > cur.written_at_ms)
                            {
                                newest = Some(env);
                            }
                        }
                        Err(e) => error!(key, tier = tier.name(), error = %e, "discarding corrupt record"),
                    }
                }
                Ok(None) => any_ok = true,
                Err(e) => {
                    debug!(key, tier = tier.name(), error = %e, "tier read failed");
                    last_error = Some(e);
                }
            }
        }

        match (newest, any_ok, last_error) {
            (Some(env), _, _) => Ok(Some(env.payload)),
            (None, false, Some(e)) => Err(e),
            _ => Ok(None),
        }
    }

    /// Remove a value from both tiers; failures are logged, not returned
    pub async fn remove(&self, key: &str) {
        let tiers = self.primary.iter().chain(std::iter::once(&self.secondary));
        for tier in tiers {
            if let Err(e) = tier.delete(key).await {
                warn!(key, tier = tier.name(), error = %e, "delete failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryStore;

    fn dyn_store(store: &Arc<MemoryStore>) -> Arc<dyn DurableStore> {
        Arc::clone(store) as Arc<dyn DurableStore>
    }

    fn tiers() -> (Arc<MemoryStore>, Arc<MemoryStore>) {
        (
            Arc::new(MemoryStore::new("primary")),
            Arc::new(MemoryStore::new("secondary")),
        )
    }

    #[tokio::test]
    async fn healthy_primary_takes_writes() {
        let (primary, secondary) = tiers();
        let store = TieredStore::probe(Some(dyn_store(&primary)), secondary.clone()).await;

        assert_eq!(store.write("k", "v").await.unwrap(), Tier::Primary);
        assert!(secondary.raw("k").is_none());
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn failed_probe_selects_secondary() {
        let (primary, secondary) = tiers();
        primary.set_fail_writes(true);
        let store = TieredStore::probe(Some(dyn_store(&primary)), secondary).await;
        assert_eq!(store.active_tier(), Tier::Secondary);
    }

    #[tokio::test]
    async fn fallback_write_wins_over_stale_primary_copy() {
        let (primary, secondary) = tiers();
        let store = TieredStore::new(primary.clone(), secondary.clone());

        store.write("queue", "old").await.unwrap();
        primary.set_fail_writes(true);
        assert_eq!(store.write("queue", "new").await.unwrap(), Tier::Secondary);

        // primary still holds "old"
        assert!(primary.raw("queue").unwrap().contains("old"));
        assert_eq!(store.read("queue").await.unwrap().as_deref(), Some("new"));
    }

    #[tokio::test]
    async fn both_tiers_failing_returns_error() {
        let (primary, secondary) = tiers();
        primary.set_fail_writes(true);
        secondary.set_fail_writes(true);
        let store = TieredStore::new(primary, secondary);
        assert!(store.write("k", "v").await.is_err());
    }

    #[tokio::test]
    async fn corrupt_copy_is_skipped() {
        let (primary, secondary) = tiers();
        let store = TieredStore::new(primary.clone(), secondary);
        store.write("k", "good").await.unwrap();
        primary.put("k", "not json".into()).await.unwrap();
        assert_eq!(store.read("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn blocking_write_lands_in_secondary() {
        let (primary, secondary) = tiers();
        let store = TieredStore::new(primary, secondary.clone());
        store.write_blocking("k", "flushed").unwrap();
        assert!(secondary.raw("k").unwrap().contains("flushed"));
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("flushed"));
    }

    #[tokio::test(start_paused = true)]
    async fn parked_primary_takes_writes_again_after_interval() {
        let (primary, secondary) = tiers();
        let store = TieredStore::new(primary.clone(), secondary.clone())
            .with_recheck_interval(Duration::from_secs(10));

        primary.set_fail_writes(true);
        assert_eq!(store.write("k", "a").await.unwrap(), Tier::Secondary);
        primary.set_fail_writes(false);
        // still parked
        assert_eq!(store.write("k", "b").await.unwrap(), Tier::Secondary);

        tokio::time::advance(Duration::from_secs(11)).await;
        assert_eq!(store.write("k", "c").await.unwrap(), Tier::Primary);
        assert_eq!(store.active_tier(), Tier::Primary);
        assert_eq!(store.read("k").await.unwrap().as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn failed_retry_parks_primary_again() {
        let (primary, secondary) = tiers();
        primary.set_fail_writes(true);
        let store = TieredStore::probe(Some(dyn_store(&primary)), secondary)
            .await
            .with_recheck_interval(Duration::from_secs(5));

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.write("k", "a").await.unwrap(), Tier::Secondary);
        primary.set_fail_writes(false);
        assert_eq!(store.write("k", "b").await.unwrap(), Tier::Secondary);

        tokio::time::advance(Duration::from_secs(6)).await;
        assert_eq!(store.write("k", "c").await.unwrap(), Tier::Primary);
    }

    #[tokio::test]
    async fn full_secondary_drops_evictable_records_first() {
        let secondary = Arc::new(MemoryStore::with_quota("kv", 400));
        let store = TieredStore::secondary_only(secondary.clone());
        store.mark_evictable("snapshot");
        store.write("snapshot", &"s".repeat(250)).await.unwrap();

        store.write("queue", &"q".repeat(200)).await.unwrap();
        assert!(secondary.raw("snapshot").is_none());
        assert_eq!(store.read("queue").await.unwrap(), Some("q".repeat(200)));
    }

    #[tokio::test]
    async fn evictable_record_does_not_evict_itself() {
        let secondary = Arc::new(MemoryStore::with_quota("kv", 100));
        let store = TieredStore::secondary_only(secondary);
        store.mark_evictable("snapshot");
        assert!(store.write("snapshot", &"s".repeat(200)).await.unwrap_err().is_quota());
    }

    #[tokio::test]
    async fn recheck_restores_primary() {
        let (primary, secondary) = tiers();
        primary.set_fail_writes(true);
        let store = TieredStore::probe(Some(dyn_store(&primary)), secondary).await;
        assert_eq!(store.active_tier(), Tier::Secondary);

        primary.set_fail_writes(false);
        assert!(store.recheck_primary().await);
        assert_eq!(store.active_tier(), Tier::Primary);
    }
}
