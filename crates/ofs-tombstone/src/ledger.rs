//! Tombstone ledger
//!
//! Two planes per scope:
//! - local: ids this client deleted, written durably before `add_local`
//!   returns and kept until the remote confirms the deletion
//! - remote: the remote's deletion set, cached for a TTL
//!
//! The effective set is the union. Any entity in it is never materialized as
//! live, whatever its own `deleted_at` says.
//!
//! The TTL and [`TombstoneLedger::invalidate`] only decide when the remote
//! set is fetched again. Until a fetch succeeds, the last set received keeps
//! applying, so a failed refetch never lets deleted rows back in.

use crate::error::LedgerError;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use ofs_model::{EntityId, RemoteError, ScopeId, TombstoneConfig};
use ofs_resilience::{Priority, ResilientClient};
use ofs_store::TieredStore;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

type LocalPlane = HashMap<ScopeId, BTreeMap<EntityId, DateTime<Utc>>>;

#[derive(Debug, Default, Serialize, Deserialize)]
struct PersistedLedger {
    version: u32,
    scopes: BTreeMap<ScopeId, BTreeMap<EntityId, DateTime<Utc>>>,
}

/// Per-scope record of deleted entity ids
pub struct TombstoneLedger {
    config: TombstoneConfig,
    store: Arc<TieredStore>,
    client: ResilientClient,
    local: RwLock<LocalPlane>,
    remote: Cache<ScopeId, Arc<BTreeSet<EntityId>>>,
    last_known: RwLock<HashMap<ScopeId, Arc<BTreeSet<EntityId>>>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for TombstoneLedger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TombstoneLedger")
            .field("local_scopes", &self.local.read().len())
            .field("cached_scopes", &self.remote.entry_count())
            .finish_non_exhaustive()
    }
}

impl TombstoneLedger {
    /// Empty ledger; call `load` to restore the local plane
    #[must_use]
    pub fn new(config: TombstoneConfig, store: Arc<TieredStore>, client: ResilientClient) -> Self {
        let remote = Cache::builder()
            .max_capacity(config.max_cached_scopes)
            .time_to_live(config.cache_ttl())
            .build();
        Self {
            config,
            store,
            client,
            local: RwLock::new(HashMap::new()),
            remote,
            last_known: RwLock::new(HashMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &TombstoneConfig {
        &self.config
    }

    /// Record local deletions; durable before this returns
    pub async fn add_local(&self, scope: &ScopeId, ids: impl IntoIterator<Item = EntityId>) {
        let now = Utc::now();
        let added = {
            let mut local = self.local.write();
            let entries = local.entry(scope.clone()).or_default();
            let before = entries.len();
            for id in ids {
                entries.entry(id).or_insert(now);
            }
            entries.len() - before
        };
        debug!(%scope, added, "local tombstones recorded");
        self.persist().await;
    }

    /// Drop local entries the remote has confirmed
    pub async fn clear_local(&self, scope: &ScopeId, ids: &[EntityId]) {
        let removed = {
            let mut local = self.local.write();
            let Some(entries) = local.get_mut(scope) else {
                return;
            };
            let before = entries.len();
            for id in ids {
                entries.remove(id);
            }
            let removed = before - entries.len();
            if entries.is_empty() {
                local.remove(scope);
            }
            removed
        };
        if removed > 0 {
            debug!(%scope, removed, "local tombstones confirmed");
            self.persist().await;
        }
    }

    /// Local-plane ids for a scope
    #[must_use]
    pub fn local(&self, scope: &ScopeId) -> BTreeSet<EntityId> {
        self.local
            .read()
            .get(scope)
            .map(|entries| entries.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Union of the local plane and the last remote set received
    pub fn get_effective(&self, scope: &ScopeId) -> BTreeSet<EntityId> {
        let mut effective = self.local(scope);
        if let Some(remote) = self.last_known.read().get(scope) {
            effective.extend(remote.iter().cloned());
        }
        effective
    }

    /// Whether an id is in the effective set
    pub fn is_tombstoned(&self, scope: &ScopeId, id: &EntityId) -> bool {
        if self.local.read().get(scope).is_some_and(|e| e.contains_key(id)) {
            return true;
        }
        self.last_known
            .read()
            .get(scope)
            .is_some_and(|remote| remote.contains(id))
    }

    /// Remote deletion set, from cache or one deduplicated outbound call
    ///
    /// # Errors
    /// The remote's error when the fetch fails. The previously received set,
    /// if any, stays in the effective set.
    pub async fn fetch_remote_with_cache(
        &self,
        scope: &ScopeId,
    ) -> Result<Arc<BTreeSet<EntityId>>, RemoteError> {
        let client = self.client.clone();
        let key = scope.clone();
        let fetched = self
            .remote
            .try_get_with(scope.clone(), async move {
                let ids = client
                    .call("scope-tombstones", Priority::BestEffort, move |remote| {
                        let key = key.clone();
                        async move { remote.list_scope_tombstones(&key).await }
                    })
                    .await?;
                Ok::<_, RemoteError>(Arc::new(ids.into_iter().collect()))
            })
            .await
            .map_err(|e| (*e).clone());
        match &fetched {
            Ok(set) => {
                self.last_known.write().insert(scope.clone(), Arc::clone(set));
            }
            Err(e) if self.last_known.read().contains_key(scope) => {
                warn!(%scope, error = %e, "tombstone refetch failed, keeping last known set");
            }
            Err(_) => {}
        }
        fetched
    }

    /// Cache a deletion set that arrived with a batched load
    pub async fn seed_remote(&self, scope: &ScopeId, ids: impl IntoIterator<Item = EntityId>) {
        let set = Arc::new(ids.into_iter().collect::<BTreeSet<EntityId>>());
        self.last_known.write().insert(scope.clone(), Arc::clone(&set));
        self.remote.insert(scope.clone(), set).await;
    }

    /// Force the next fetch for `scope` to hit the remote
    pub async fn invalidate(&self, scope: &ScopeId) {
        self.remote.invalidate(scope).await;
    }

    /// Forget the remote set of a scope that is gone for this user
    pub async fn forget_remote(&self, scope: &ScopeId) {
        self.remote.invalidate(scope).await;
        self.last_known.write().remove(scope);
    }

    /// Forget everything (account switch, logout)
    pub async fn clear_all(&self) {
        self.remote.invalidate_all();
        self.last_known.write().clear();
        self.local.write().clear();
        info!("tombstone ledger cleared");
        self.persist().await;
    }

    /// Restore the local plane; returns the number of scopes loaded
    pub async fn load(&self) -> usize {
        match self.read().await {
            Ok(persisted) => {
                let mut local = self.local.write();
                for (scope, entries) in persisted.scopes {
                    local.entry(scope).or_default().extend(entries);
                }
                local.len()
            }
            Err(e) => {
                error!(error = %e, "failed to restore tombstone ledger");
                0
            }
        }
    }

    async fn read(&self) -> Result<PersistedLedger, LedgerError> {
        match self.store.read(&self.config.storage_key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(PersistedLedger::default()),
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let snapshot = PersistedLedger {
            version: 1,
            scopes: self
                .local
                .read()
                .iter()
                .map(|(scope, entries)| (scope.clone(), entries.clone()))
                .collect(),
        };
        if let Err(e) = self.write(&snapshot).await {
            error!(error = %e, "failed to persist tombstone ledger");
        }
    }

    async fn write(&self, snapshot: &PersistedLedger) -> Result<(), LedgerError> {
        let payload = serde_json::to_string(snapshot)?;
        self.store.write(&self.config.storage_key, &payload).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_store::MemoryStore;
    use ofs_test_utils::{fast_config, remote_with_project, scope, MemoryRemote};
    use pretty_assertions::assert_eq;

    fn ids(raw: &[&str]) -> Vec<EntityId> {
        raw.iter().map(|s| EntityId::new(*s)).collect()
    }

    fn ledger_with(remote: Arc<MemoryRemote>, store: Arc<TieredStore>) -> TombstoneLedger {
        let config = fast_config();
        let client = ResilientClient::new(remote, config.breaker, config.throttle, config.retry);
        TombstoneLedger::new(config.tombstones, store, client)
    }

    fn memory_store() -> Arc<TieredStore> {
        Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))))
    }

    #[tokio::test]
    async fn effective_is_union_of_planes() {
        let remote = Arc::new(remote_with_project("p1", 3));
        let ledger = ledger_with(remote, memory_store());
        let p1 = scope("p1");

        ledger.add_local(&p1, ids(&["t1"])).await;
        ledger.seed_remote(&p1, ids(&["t2"])).await;

        let effective: Vec<_> = ledger.get_effective(&p1).into_iter().collect();
        assert_eq!(effective, ids(&["t1", "t2"]));
        assert!(ledger.is_tombstoned(&p1, &EntityId::new("t2")));
        assert!(!ledger.is_tombstoned(&p1, &EntityId::new("t3")));
    }

    #[tokio::test]
    async fn local_plane_survives_restart() {
        let store = memory_store();
        let remote = Arc::new(MemoryRemote::new());
        let ledger = ledger_with(Arc::clone(&remote), Arc::clone(&store));
        ledger.add_local(&scope("p1"), ids(&["t1", "t2"])).await;

        let reopened = ledger_with(remote, store);
        assert_eq!(reopened.load().await, 1);
        assert_eq!(reopened.local(&scope("p1")).len(), 2);
    }

    #[tokio::test]
    async fn clear_local_only_touches_named_ids() {
        let ledger = ledger_with(Arc::new(MemoryRemote::new()), memory_store());
        let p1 = scope("p1");
        ledger.add_local(&p1, ids(&["t1", "t2"])).await;

        ledger.clear_local(&p1, &ids(&["t1"])).await;
        assert_eq!(ledger.local(&p1).into_iter().collect::<Vec<_>>(), ids(&["t2"]));

        ledger.clear_local(&p1, &ids(&["t2"])).await;
        assert!(ledger.local(&p1).is_empty());
    }

    #[tokio::test]
    async fn remote_fetch_is_cached() {
        let remote = Arc::new(remote_with_project("p1", 2));
        remote.seed_tombstone(&scope("p1"), EntityId::new("old"));
        let ledger = ledger_with(Arc::clone(&remote), memory_store());
        let p1 = scope("p1");

        let first = ledger.fetch_remote_with_cache(&p1).await.unwrap();
        let second = ledger.fetch_remote_with_cache(&p1).await.unwrap();
        assert!(first.contains(&EntityId::new("old")));
        assert_eq!(first, second);
        assert_eq!(remote.call_count("list_scope_tombstones"), 1);

        ledger.invalidate(&p1).await;
        ledger.fetch_remote_with_cache(&p1).await.unwrap();
        assert_eq!(remote.call_count("list_scope_tombstones"), 2);
    }

    #[tokio::test]
    async fn failed_fetch_leaves_local_plane_authoritative() {
        let remote = Arc::new(remote_with_project("p1", 2));
        remote.set_offline(true);
        let ledger = ledger_with(Arc::clone(&remote), memory_store());
        let p1 = scope("p1");
        ledger.add_local(&p1, ids(&["t1"])).await;

        assert!(ledger.fetch_remote_with_cache(&p1).await.is_err());
        assert_eq!(ledger.get_effective(&p1).len(), 1);
    }

    #[tokio::test]
    async fn failed_refetch_keeps_last_known_remote_set() {
        let remote = Arc::new(remote_with_project("p1", 2));
        remote.seed_tombstone(&scope("p1"), EntityId::new("t1"));
        let ledger = ledger_with(Arc::clone(&remote), memory_store());
        let p1 = scope("p1");
        ledger.fetch_remote_with_cache(&p1).await.unwrap();

        ledger.invalidate(&p1).await;
        remote.set_offline(true);
        assert!(ledger.fetch_remote_with_cache(&p1).await.is_err());
        assert!(ledger.is_tombstoned(&p1, &EntityId::new("t1")));
        assert_eq!(ledger.get_effective(&p1).len(), 1);
    }

    #[tokio::test]
    async fn forget_remote_drops_one_scope() {
        let ledger = ledger_with(Arc::new(MemoryRemote::new()), memory_store());
        ledger.seed_remote(&scope("p1"), ids(&["t1"])).await;
        ledger.seed_remote(&scope("p2"), ids(&["t2"])).await;

        ledger.forget_remote(&scope("p1")).await;
        assert!(ledger.get_effective(&scope("p1")).is_empty());
        assert_eq!(ledger.get_effective(&scope("p2")).len(), 1);
    }

    #[tokio::test]
    async fn clear_all_forgets_both_planes() {
        let ledger = ledger_with(Arc::new(MemoryRemote::new()), memory_store());
        let p1 = scope("p1");
        ledger.add_local(&p1, ids(&["t1"])).await;
        ledger.seed_remote(&p1, ids(&["t2"])).await;

        ledger.clear_all().await;
        assert!(ledger.get_effective(&p1).is_empty());
    }
}
