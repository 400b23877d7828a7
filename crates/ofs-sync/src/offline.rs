//! Offline snapshot of the live state
//!
//! The whole state is written as one record through the tiered store, after
//! soft-deleted entities are scrubbed. Writes near the primary store's
//! practical ceiling raise a monitoring signal.
//!
//! The record is evictable: the queue and ledger may push it out of a full
//! secondary tier, since a reload rebuilds it.

use crate::error::Result;
use ofs_model::{LocalState, OrchestratorConfig, StateHandle};
use ofs_store::TieredStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

/// Durable copy of the live state for cold starts without network
#[derive(Debug)]
pub struct OfflineCache {
    key: String,
    ceiling_bytes: usize,
    warn_ratio: f64,
    store: Arc<TieredStore>,
}

impl OfflineCache {
    /// Cache under `config.offline_cache_key`
    #[must_use]
    pub fn new(config: &OrchestratorConfig, store: Arc<TieredStore>) -> Self {
        store.mark_evictable(&config.offline_cache_key);
        Self {
            key: config.offline_cache_key.clone(),
            ceiling_bytes: config.offline_cache_ceiling_bytes,
            warn_ratio: config.offline_cache_warn_ratio,
            store,
        }
    }

    /// Write a scrubbed copy; returns the encoded size in bytes
    ///
    /// # Errors
    /// Encoding failures and store failures on every tier.
    pub async fn save(&self, state: &LocalState) -> Result<usize> {
        let payload = serde_json::to_string(&state.scrubbed())?;
        let bytes = payload.len();
        metrics::gauge!("ofs_offline_cache_bytes").set(bytes as f64);

        if self.near_ceiling(bytes) {
            warn!(bytes, ceiling = self.ceiling_bytes, "offline cache near storage ceiling");
            metrics::counter!("ofs_offline_cache_near_limit_total").increment(1);
        }

        let tier = self.store.write(&self.key, &payload).await?;
        debug!(bytes, ?tier, "offline cache saved");
        Ok(bytes)
    }

    #[allow(clippy::cast_precision_loss)]
    fn near_ceiling(&self, bytes: usize) -> bool {
        bytes as f64 >= self.ceiling_bytes as f64 * self.warn_ratio
    }

    /// Last saved state, if any and readable
    pub async fn load(&self) -> Option<LocalState> {
        match self.store.read(&self.key).await {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(state) => Some(state),
                Err(e) => {
                    error!(error = %e, "offline cache is corrupt, ignoring it");
                    None
                }
            },
            Ok(None) => None,
            Err(e) => {
                error!(error = %e, "failed to read offline cache");
                None
            }
        }
    }

    /// Remove the record from both tiers
    pub async fn clear(&self) {
        self.store.remove(&self.key).await;
    }

    /// Save after changes have settled for `debounce`
    ///
    /// Stops, after a final save of unsaved changes, once every handle to
    /// the state is dropped.
    pub fn spawn_autosave(self: &Arc<Self>, state: &StateHandle, debounce: Duration) -> JoinHandle<()> {
        let cache = Arc::clone(self);
        let mut rx = state.subscribe();
        tokio::spawn(async move {
            loop {
                if rx.changed().await.is_err() {
                    break;
                }
                // wait for a quiet period
                let mut closed = false;
                loop {
                    tokio::select! {
                        changed = rx.changed() => {
                            if changed.is_err() {
                                closed = true;
                                break;
                            }
                        }
                        () = tokio::time::sleep(debounce) => break,
                    }
                }
                let snapshot = rx.borrow_and_update().clone();
                if let Err(e) = cache.save(&snapshot).await {
                    error!(error = %e, "autosave of offline cache failed");
                }
                if closed {
                    break;
                }
            }
            debug!("offline cache autosave stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_model::{EntityId, EntitySnapshot};
    use ofs_store::{DurableStore, MemoryStore};
    use ofs_test_utils::{at, scope, state_handle_with_project, state_with_project, task};
    use pretty_assertions::assert_eq;

    fn cache(memory: &Arc<MemoryStore>) -> Arc<OfflineCache> {
        let tier: Arc<dyn DurableStore> = memory.clone();
        let store = Arc::new(TieredStore::secondary_only(tier));
        Arc::new(OfflineCache::new(&OrchestratorConfig::default(), store))
    }

    #[tokio::test]
    async fn saved_copy_is_scrubbed() {
        let memory = Arc::new(MemoryStore::new("mem"));
        let cache = cache(&memory);
        let mut state = state_with_project("p1", 2);
        state
            .upsert(&scope("p1"), EntitySnapshot::Task(task("t9")).mark_deleted(at(1)))
            .unwrap();

        cache.save(&state).await.unwrap();
        let loaded = cache.load().await.unwrap();

        assert_eq!(loaded, state.scrubbed());
        assert!(loaded.task(&scope("p1"), &EntityId::new("t9")).is_none());
    }

    #[tokio::test]
    async fn corrupt_cache_is_ignored() {
        let memory = Arc::new(MemoryStore::new("mem"));
        let cache = cache(&memory);
        let tier: Arc<dyn DurableStore> = memory.clone();
        let store = TieredStore::secondary_only(tier);
        store.write("offline-snapshot", "{not json").await.unwrap();

        assert!(cache.load().await.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn autosave_debounces_bursts() {
        let memory = Arc::new(MemoryStore::new("mem"));
        let cache = cache(&memory);
        let state = state_handle_with_project("p1", 1);
        let task_handle = cache.spawn_autosave(&state, Duration::from_millis(100));

        for i in 0..5 {
            state.update(|s| s.upsert(&scope("p1"), task(&format!("n{i}")).into())).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        tokio::time::sleep(Duration::from_millis(300)).await;
        let writes_after_burst = memory.write_count();
        assert_eq!(writes_after_burst, 1);
        assert_eq!(cache.load().await.unwrap().entity_count(), 7);

        drop(state);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(task_handle.is_finished());
    }
}
