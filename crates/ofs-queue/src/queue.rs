//! Durable mutation queue
//!
//! In-memory [`IndexMap`] keyed by `(entity type, entity id)`, rewritten in
//! full to the tiered store after every mutating operation.
//!
//! - Enqueue deduplicates in place: last operation and payload win, the
//!   retry count of the first enqueue is kept
//! - At soft capacity the oldest item is evicted; at the hard cap new items
//!   are rejected
//! - Items handed out by [`MutationQueue::take_all`] stay persisted as
//!   in-flight until they are completed or put back, so a crash mid-drain
//!   never loses them
//! - No method returns a storage error; persistence failures are logged

use crate::error::QueueError;
use crate::item::{MutationQueueItem, QueueKey};
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ofs_model::{EntityId, EntitySnapshot, Operation, QueueConfig, ScopeId};
use ofs_store::TieredStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Serialize, Deserialize)]
struct PersistedQueue {
    version: u32,
    items: Vec<MutationQueueItem>,
}

/// Result of an enqueue
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// New item appended
    Inserted,
    /// Existing item for the same entity overwritten in place
    Replaced,
    /// Appended after evicting the oldest item at soft capacity
    InsertedWithEviction { evicted: EntityId },
    /// Hard cap reached; the mutation was not queued
    Rejected,
}

impl EnqueueOutcome {
    /// Whether the mutation is now in the queue
    #[inline]
    #[must_use]
    pub fn is_queued(&self) -> bool {
        !matches!(self, Self::Rejected)
    }
}

/// Fill level reported by [`MutationQueue::check_capacity_warning`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CapacityLevel {
    /// Below the warning threshold
    Normal,
    /// At or above the warning threshold
    Warning { percent: u8 },
    /// Near full; callers should drain now
    ForceProcess { percent: u8 },
}

#[derive(Debug, Default)]
struct QueueState {
    items: IndexMap<QueueKey, MutationQueueItem>,
    in_flight: IndexMap<QueueKey, MutationQueueItem>,
    last_warning: Option<Instant>,
}

impl QueueState {
    fn snapshot(&self) -> Vec<MutationQueueItem> {
        self.in_flight
            .values()
            .chain(self.items.values())
            .cloned()
            .collect()
    }

    /// Index of the item with the smallest `created_at`; ties go to the
    /// earliest position
    fn oldest_index(&self) -> Option<usize> {
        self.items
            .values()
            .enumerate()
            .min_by_key(|(i, item)| (item.created_at, *i))
            .map(|(i, _)| i)
    }

    fn evict_oldest(&mut self) -> Option<MutationQueueItem> {
        let idx = self.oldest_index()?;
        self.items.shift_remove_index(idx).map(|(_, item)| item)
    }
}

/// Ordered, deduplicated, capacity-bounded queue of pending remote writes
pub struct MutationQueue {
    config: QueueConfig,
    store: Arc<TieredStore>,
    state: Mutex<QueueState>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for MutationQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("MutationQueue")
            .field("queued", &state.items.len())
            .field("in_flight", &state.in_flight.len())
            .field("max_size", &self.config.max_size)
            .finish()
    }
}

impl MutationQueue {
    /// Empty queue persisting under `config.storage_key`; call `load` to restore
    #[must_use]
    pub fn new(config: QueueConfig, store: Arc<TieredStore>) -> Self {
        Self {
            config,
            store,
            state: Mutex::new(QueueState::default()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    /// Queued items, excluding in-flight ones
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    /// Items handed out by `take_all` and not yet completed or put back
    #[must_use]
    pub fn in_flight_len(&self) -> usize {
        self.state.lock().in_flight.len()
    }

    /// Copy of the queued items in queue order
    #[must_use]
    pub fn items(&self) -> Vec<MutationQueueItem> {
        self.state.lock().items.values().cloned().collect()
    }

    /// Latest pending operation per entity of a scope, in-flight included
    #[must_use]
    pub fn pending_for_scope(&self, scope: &ScopeId) -> HashMap<EntityId, Operation> {
        let state = self.state.lock();
        state
            .in_flight
            .values()
            .chain(state.items.values())
            .filter(|item| &item.scope() == scope)
            .map(|item| (item.entity_id().clone(), item.operation))
            .collect()
    }

    /// Queue a mutation stamped now
    pub async fn enqueue(
        &self,
        operation: Operation,
        payload: EntitySnapshot,
        parent: Option<ScopeId>,
    ) -> EnqueueOutcome {
        self.enqueue_item(MutationQueueItem::new(operation, payload, parent, Utc::now()))
            .await
    }

    /// Queue a prepared item
    pub async fn enqueue_item(&self, item: MutationQueueItem) -> EnqueueOutcome {
        let outcome = self.insert(item);
        if outcome.is_queued() {
            self.persist().await;
        }
        outcome
    }

    fn insert(&self, item: MutationQueueItem) -> EnqueueOutcome {
        let mut state = self.state.lock();
        let key = item.key();

        if let Some(existing) = state.items.get_mut(&key) {
            existing.operation = item.operation;
            existing.payload = item.payload;
            existing.parent_id = item.parent_id;
            existing.created_at = item.created_at;
            debug!(entity_id = %key.1, kind = %key.0, "replaced queued mutation");
            return EnqueueOutcome::Replaced;
        }

        let len = state.items.len();
        if len >= self.config.hard_max_size {
            error!(
                entity_id = %key.1,
                len,
                hard_max = self.config.hard_max_size,
                "mutation queue at hard cap, rejecting mutation"
            );
            metrics::counter!("ofs_queue_rejected_total").increment(1);
            return EnqueueOutcome::Rejected;
        }

        let mut outcome = EnqueueOutcome::Inserted;
        if len >= self.config.max_size {
            if let Some(evicted) = state.evict_oldest() {
                warn!(
                    evicted = %evicted.entity_id(),
                    kind = %evicted.entity_type,
                    created_at = %evicted.created_at,
                    "mutation queue full, evicted oldest mutation"
                );
                metrics::counter!("ofs_queue_evictions_total").increment(1);
                outcome = EnqueueOutcome::InsertedWithEviction {
                    evicted: evicted.entity_id().clone(),
                };
            }
        }

        state.items.insert(key, item);
        metrics::gauge!("ofs_queue_depth").set(state.items.len() as f64);
        outcome
    }

    /// Drain every queued item in topological order (projects, tasks,
    /// connections). The items stay persisted as in-flight.
    pub fn take_all(&self) -> Vec<MutationQueueItem> {
        let mut taken: Vec<MutationQueueItem> = {
            let mut state = self.state.lock();
            let drained: Vec<(QueueKey, MutationQueueItem)> = state.items.drain(..).collect();
            for (key, item) in &drained {
                state.in_flight.insert(key.clone(), item.clone());
            }
            metrics::gauge!("ofs_queue_depth").set(0.0);
            drained.into_iter().map(|(_, item)| item).collect()
        };
        // stable: queue order is kept within a kind
        taken.sort_by_key(|item| item.entity_type.topo_rank());
        taken
    }

    /// Mark a taken item as settled (sent, dropped or moved elsewhere)
    pub async fn complete(&self, item: &MutationQueueItem) {
        let removed = {
            let mut state = self.state.lock();
            let key = item.key();
            match state.in_flight.get(&key) {
                Some(current) if current.id == item.id => state.in_flight.shift_remove(&key).is_some(),
                _ => false,
            }
        };
        if removed {
            self.persist().await;
        }
    }

    /// Re-insert failed items, skipping any entity queued again meanwhile
    ///
    /// Returns how many were re-inserted. Put-back items may exceed the soft
    /// capacity; the hard cap is kept by evicting the oldest.
    pub async fn put_back(&self, items: Vec<MutationQueueItem>) -> usize {
        let restored = {
            let mut state = self.state.lock();
            let mut restored = 0;
            for item in items {
                let key = item.key();
                if state.in_flight.get(&key).is_some_and(|f| f.id == item.id) {
                    state.in_flight.shift_remove(&key);
                }
                if state.items.contains_key(&key) {
                    debug!(entity_id = %key.1, "newer mutation queued, dropping put-back item");
                    continue;
                }
                if state.items.len() >= self.config.hard_max_size {
                    if let Some(evicted) = state.evict_oldest() {
                        error!(
                            evicted = %evicted.entity_id(),
                            "mutation queue at hard cap during put-back, evicted oldest"
                        );
                        metrics::counter!("ofs_queue_evictions_total").increment(1);
                    }
                }
                state.items.insert(key, item);
                restored += 1;
            }
            metrics::gauge!("ofs_queue_depth").set(state.items.len() as f64);
            restored
        };
        self.persist().await;
        restored
    }

    /// Purge items older than the max age or retried too often
    pub async fn clean_expired(&self) -> usize {
        self.clean_expired_at(Utc::now()).await
    }

    /// [`clean_expired`](Self::clean_expired) against an explicit clock
    pub async fn clean_expired_at(&self, now: DateTime<Utc>) -> usize {
        let max_age = self.config.max_item_age();
        let max_retries = self.config.max_retries;
        let removed = {
            let mut state = self.state.lock();
            let before = state.items.len();
            state.items.retain(|_, item| {
                let expired = item.is_expired(now, max_age, max_retries);
                if expired {
                    warn!(
                        entity_id = %item.entity_id(),
                        retry_count = item.retry_count,
                        created_at = %item.created_at,
                        "dropping expired mutation"
                    );
                }
                !expired
            });
            metrics::gauge!("ofs_queue_depth").set(state.items.len() as f64);
            before - state.items.len()
        };
        if removed > 0 {
            self.persist().await;
        }
        removed
    }

    /// Report fill level and invoke the matching callback
    ///
    /// `on_warning(percent)` fires above the warning threshold at most once
    /// per cooldown; `on_force_process(percent)` fires every time the
    /// near-full threshold is crossed.
    pub fn check_capacity_warning(
        &self,
        on_warning: impl FnOnce(u8),
        on_force_process: impl FnOnce(u8),
    ) -> CapacityLevel {
        let mut state = self.state.lock();
        let capacity = self.config.max_size.max(1);
        let percent = u8::try_from((state.items.len() * 100 / capacity).min(100)).unwrap_or(100);

        if percent >= self.config.force_process_threshold_pct {
            drop(state);
            info!(percent, "mutation queue near full, forcing drain");
            on_force_process(percent);
            return CapacityLevel::ForceProcess { percent };
        }
        if percent >= self.config.warning_threshold_pct {
            let now = Instant::now();
            let cooled = state
                .last_warning
                .map_or(true, |at| now.duration_since(at) >= self.config.warning_cooldown());
            if cooled {
                state.last_warning = Some(now);
                drop(state);
                warn!(percent, "mutation queue filling up");
                on_warning(percent);
            }
            return CapacityLevel::Warning { percent };
        }
        CapacityLevel::Normal
    }

    /// Restore the persisted queue; in-flight items of a previous run are
    /// queued again. Returns the number of restored items.
    pub async fn load(&self) -> usize {
        let raw = match self.store.read(&self.config.storage_key).await {
            Ok(Some(raw)) => raw,
            Ok(None) => return 0,
            Err(e) => {
                error!(error = %e, "failed to read persisted mutation queue");
                return 0;
            }
        };
        let persisted: PersistedQueue = match serde_json::from_str(&raw) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "persisted mutation queue is corrupt, starting empty");
                return 0;
            }
        };

        let count = {
            let mut state = self.state.lock();
            for item in persisted.items {
                state.items.insert(item.key(), item);
            }
            metrics::gauge!("ofs_queue_depth").set(state.items.len() as f64);
            state.items.len()
        };
        info!(count, version = persisted.version, "restored mutation queue");
        count
    }

    /// Drop everything (logout, account switch)
    pub async fn clear(&self) {
        {
            let mut state = self.state.lock();
            state.items.clear();
            state.in_flight.clear();
        }
        metrics::gauge!("ofs_queue_depth").set(0.0);
        self.persist().await;
    }

    /// Synchronous flush to the secondary tier for process teardown
    pub fn flush_on_teardown(&self) -> bool {
        let snapshot = self.state.lock().snapshot();
        let payload = match encode(snapshot) {
            Ok(p) => p,
            Err(e) => {
                error!(error = %e, "failed to encode queue for teardown flush");
                return false;
            }
        };
        match self.store.write_blocking(&self.config.storage_key, &payload) {
            Ok(()) => true,
            Err(e) => {
                error!(error = %e, "teardown flush of mutation queue failed");
                false
            }
        }
    }

    /// Rewrite the full queue. Persistence is serialized; each writer takes
    /// a fresh snapshot so the last write always reflects the latest state.
    ///
    /// Items are shed (oldest half) only when the queue alone is larger than
    /// the secondary tier's quota. A tier filled by other records keeps the
    /// queue in memory until a later write fits.
    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let Err(e) = self.write_snapshot().await else {
            return;
        };
        if !e.is_quota() {
            error!(error = %e, "failed to persist mutation queue");
            return;
        }
        if !self.exceeds_secondary_quota() {
            error!(
                error = %e,
                pending = self.len(),
                "secondary tier full of other records, mutation queue kept in memory"
            );
            return;
        }
        let evicted = self.evict_oldest_half();
        warn!(evicted, "queue exceeds storage quota, evicted oldest half");
        if let Err(e) = self.write_snapshot().await {
            error!(error = %e, "failed to persist mutation queue after eviction");
        }
    }

    async fn write_snapshot(&self) -> Result<(), QueueError> {
        let snapshot = self.state.lock().snapshot();
        let payload = encode(snapshot)?;
        let tier = self.store.write(&self.config.storage_key, &payload).await?;
        debug!(?tier, bytes = payload.len(), "persisted mutation queue");
        Ok(())
    }

    fn exceeds_secondary_quota(&self) -> bool {
        let Some(quota) = self.store.secondary_quota() else {
            return false;
        };
        let snapshot = self.state.lock().snapshot();
        encode(snapshot).is_ok_and(|payload| self.store.stored_len(&payload) > quota)
    }

    fn evict_oldest_half(&self) -> usize {
        let mut state = self.state.lock();
        let count = state.items.len().div_ceil(2);
        let mut order: Vec<(DateTime<Utc>, usize)> = state
            .items
            .values()
            .enumerate()
            .map(|(i, item)| (item.created_at, i))
            .collect();
        order.sort();
        let mut doomed: Vec<usize> = order.into_iter().take(count).map(|(_, i)| i).collect();
        // remove from the back so earlier indices stay valid
        doomed.sort_unstable_by(|a, b| b.cmp(a));
        for idx in doomed {
            state.items.shift_remove_index(idx);
        }
        metrics::counter!("ofs_queue_evictions_total").increment(count as u64);
        metrics::gauge!("ofs_queue_depth").set(state.items.len() as f64);
        count
    }
}

fn encode(items: Vec<MutationQueueItem>) -> Result<String, QueueError> {
    Ok(serde_json::to_string(&PersistedQueue {
        version: FORMAT_VERSION,
        items,
    })?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_model::{EntityType, Task};
    use ofs_store::{DurableStore, MemoryStore};
    use pretty_assertions::assert_eq;

    fn store() -> Arc<TieredStore> {
        Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))))
    }

    fn queue_with(config: QueueConfig) -> MutationQueue {
        MutationQueue::new(config, store())
    }

    fn task(id: &str) -> EntitySnapshot {
        Task::new(id, id, Utc::now()).into()
    }

    fn p1() -> Option<ScopeId> {
        Some(ScopeId::new("p1"))
    }

    #[tokio::test]
    async fn upsert_then_delete_collapses_to_delete() {
        let q = queue_with(QueueConfig::default());
        assert_eq!(q.enqueue(Operation::Upsert, task("t1"), p1()).await, EnqueueOutcome::Inserted);
        assert_eq!(q.enqueue(Operation::Delete, task("t1"), p1()).await, EnqueueOutcome::Replaced);

        let items = q.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].operation, Operation::Delete);
    }

    #[tokio::test]
    async fn replace_keeps_retry_count_and_takes_later_timestamp() {
        let q = queue_with(QueueConfig::default());
        let early = Utc::now() - chrono::Duration::minutes(5);
        let mut first = MutationQueueItem::new(Operation::Upsert, task("t1"), p1(), early);
        first.retry_count = 4;
        q.enqueue_item(first).await;

        q.enqueue(Operation::Upsert, task("t1"), p1()).await;
        let item = &q.items()[0];
        assert_eq!(item.retry_count, 4);
        assert!(item.created_at > early);
    }

    #[tokio::test]
    async fn soft_capacity_evicts_oldest() {
        let q = queue_with(QueueConfig {
            max_size: 2,
            hard_max_size: 3,
            ..QueueConfig::default()
        });
        let base = Utc::now();
        for (i, id) in ["a", "b"].iter().enumerate() {
            let at = base + chrono::Duration::seconds(i64::try_from(i).unwrap());
            q.enqueue_item(MutationQueueItem::new(Operation::Upsert, task(id), p1(), at))
                .await;
        }
        let outcome = q.enqueue(Operation::Upsert, task("c"), p1()).await;
        assert_eq!(outcome, EnqueueOutcome::InsertedWithEviction { evicted: EntityId::new("a") });
        let ids: Vec<_> = q.items().iter().map(|i| i.entity_id().to_string()).collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn hard_cap_rejects_after_put_back_overflow() {
        let q = queue_with(QueueConfig {
            max_size: 1,
            hard_max_size: 2,
            ..QueueConfig::default()
        });
        q.enqueue(Operation::Upsert, task("a"), p1()).await;
        let taken = q.take_all();
        q.enqueue(Operation::Upsert, task("b"), p1()).await;
        q.put_back(taken).await;
        assert_eq!(q.len(), 2);

        assert_eq!(q.enqueue(Operation::Upsert, task("c"), p1()).await, EnqueueOutcome::Rejected);
        assert_eq!(q.len(), 2);
    }

    #[tokio::test]
    async fn take_all_orders_topologically() {
        let q = queue_with(QueueConfig::default());
        let now = Utc::now();
        q.enqueue(Operation::Upsert, ofs_model::Connection::new("c1", "t1", "t2", now).into(), p1())
            .await;
        q.enqueue(Operation::Upsert, task("t1"), p1()).await;
        q.enqueue(Operation::Upsert, ofs_model::ProjectMeta::new("p1", "P", now).into(), None)
            .await;
        q.enqueue(Operation::Upsert, task("t2"), p1()).await;

        let kinds: Vec<EntityType> = q.take_all().iter().map(|i| i.entity_type).collect();
        assert_eq!(
            kinds,
            vec![EntityType::Project, EntityType::Task, EntityType::Task, EntityType::Connection]
        );
        assert!(q.is_empty());
        assert_eq!(q.in_flight_len(), 4);
    }

    #[tokio::test]
    async fn put_back_skips_entities_queued_meanwhile() {
        let q = queue_with(QueueConfig::default());
        q.enqueue(Operation::Upsert, task("t1"), p1()).await;
        let taken = q.take_all();

        q.enqueue(Operation::Delete, task("t1"), p1()).await;
        assert_eq!(q.put_back(taken).await, 0);
        assert_eq!(q.items()[0].operation, Operation::Delete);
        assert_eq!(q.in_flight_len(), 0);
    }

    #[tokio::test]
    async fn clean_expired_counts_removed() {
        let q = queue_with(QueueConfig::default());
        let now = Utc::now();
        q.enqueue_item(MutationQueueItem::new(
            Operation::Upsert,
            task("old"),
            p1(),
            now - chrono::Duration::days(30),
        ))
        .await;
        let mut retried = MutationQueueItem::new(Operation::Upsert, task("flaky"), p1(), now);
        retried.retry_count = 11;
        q.enqueue_item(retried).await;
        q.enqueue(Operation::Upsert, task("fresh"), p1()).await;

        assert_eq!(q.clean_expired_at(now).await, 2);
        assert_eq!(q.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn capacity_warning_respects_cooldown() {
        let q = queue_with(QueueConfig {
            max_size: 10,
            hard_max_size: 12,
            ..QueueConfig::default()
        });
        for i in 0..8 {
            q.enqueue(Operation::Upsert, task(&format!("t{i}")), p1()).await;
        }

        let mut warned = 0;
        let level = q.check_capacity_warning(|_| warned += 1, |_| panic!("not near full"));
        assert_eq!(level, CapacityLevel::Warning { percent: 80 });
        q.check_capacity_warning(|_| warned += 1, |_| {});
        assert_eq!(warned, 1);

        tokio::time::advance(std::time::Duration::from_secs(61)).await;
        q.check_capacity_warning(|_| warned += 1, |_| {});
        assert_eq!(warned, 2);

        q.enqueue(Operation::Upsert, task("t8"), p1()).await;
        let mut forced = None;
        q.check_capacity_warning(|_| {}, |p| forced = Some(p));
        assert_eq!(forced, Some(90));
    }

    #[tokio::test]
    async fn survives_restart_including_in_flight() {
        let store = store();
        let q = MutationQueue::new(QueueConfig::default(), Arc::clone(&store));
        q.enqueue(Operation::Upsert, task("t1"), p1()).await;
        q.enqueue(Operation::Upsert, task("t2"), p1()).await;
        let taken = q.take_all();
        q.complete(&taken[0]).await;

        let restarted = MutationQueue::new(QueueConfig::default(), store);
        assert_eq!(restarted.load().await, 1);
        assert_eq!(restarted.items()[0].entity_id(), &EntityId::new("t2"));
    }

    #[tokio::test]
    async fn quota_overflow_evicts_oldest_half() {
        let tiny = Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::with_quota(
            "tiny", 1_200,
        ))));
        let q = MutationQueue::new(QueueConfig::default(), tiny);
        for i in 0..8 {
            q.enqueue(Operation::Upsert, task(&format!("t{i}")), p1()).await;
        }
        assert!(q.len() < 8, "queue should have shed items to fit the quota");
    }

    #[tokio::test]
    async fn quota_taken_by_other_records_never_sheds_items() {
        let kv = Arc::new(MemoryStore::with_quota("kv", 6_000));
        kv.put("other", "x".repeat(5_900)).await.unwrap();
        let q = MutationQueue::new(
            QueueConfig::default(),
            Arc::new(TieredStore::secondary_only(kv.clone())),
        );
        for i in 0..8 {
            q.enqueue(Operation::Upsert, task(&format!("t{i}")), p1()).await;
        }
        assert_eq!(q.len(), 8);
        assert!(kv.raw("mutation-queue").is_none());

        // room again: the next write persists everything
        kv.delete("other").await.unwrap();
        q.enqueue(Operation::Upsert, task("t8"), p1()).await;
        assert!(kv.raw("mutation-queue").unwrap().contains("t0"));
    }

    #[test]
    fn teardown_flush_writes_blocking() {
        let secondary = Arc::new(MemoryStore::new("kv"));
        let store = Arc::new(TieredStore::secondary_only(secondary.clone()));
        let q = MutationQueue::new(QueueConfig::default(), store);
        q.insert(MutationQueueItem::new(Operation::Upsert, task("t1"), p1(), Utc::now()));
        assert!(q.flush_on_teardown());
        assert!(secondary.raw("mutation-queue").unwrap().contains("t1"));
    }
}
