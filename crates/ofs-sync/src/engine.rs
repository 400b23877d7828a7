//! Sync engine
//!
//! Owns every component of the offline sync core and wires them together:
//! - Tiered local storage, probed at startup
//! - Resilient client shared by reads and dispatch
//! - Mutation queue, holding area and tombstone ledger
//! - Optimistic snapshots over the live state
//! - Orchestrator, dispatcher, watermarks and the offline cache

use crate::dispatch::{DispatchOutcome, DrainReport, MutationDispatcher};
use crate::error::{Result, SyncError};
use crate::offline::OfflineCache;
use crate::orchestrator::{LoadReport, ResumeReport, SyncOrchestrator};
use crate::watermark::WatermarkStore;
use ofs_model::{
    Entity, EntitySnapshot, EntityType, MutationId, Notifier, Operation, RemoteApi, ScopeId,
    StateHandle, SyncConfig,
};
use ofs_optimistic::OptimisticStateManager;
use ofs_queue::{EnqueueOutcome, HeldMutation, HoldingArea, MutationQueue};
use ofs_resilience::ResilientClient;
use ofs_store::{DurableStore, FileKvStore, MemoryStore, SqliteStore, TieredStore};
use ofs_tombstone::TombstoneLedger;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

/// One local edit
#[derive(Debug, Clone, PartialEq)]
pub struct Mutation {
    /// Scope the entity belongs to
    pub scope: ScopeId,
    pub operation: Operation,
    /// Full entity after the edit (the id alone for deletes)
    pub payload: EntitySnapshot,
    /// Short description shown in notices
    pub label: String,
}

impl Mutation {
    /// Create or update `payload` inside `scope`
    #[must_use]
    pub fn upsert(scope: ScopeId, payload: impl Into<EntitySnapshot>) -> Self {
        let payload = payload.into();
        let label = format!("save {}", payload.entity_type());
        Self {
            scope,
            operation: Operation::Upsert,
            payload,
            label,
        }
    }

    /// Delete `payload` from `scope`
    #[must_use]
    pub fn delete(scope: ScopeId, payload: impl Into<EntitySnapshot>) -> Self {
        let payload = payload.into();
        let label = format!("delete {}", payload.entity_type());
        Self {
            scope,
            operation: Operation::Delete,
            payload,
            label,
        }
    }

    /// Label shown in rollback notices
    #[inline]
    #[must_use]
    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }
}

/// What happened to a mutation submitted through [`SyncEngine::mutate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MutateOutcome {
    pub enqueue: EnqueueOutcome,
    /// Dispatch result, when the follow-up drain ran
    pub dispatch: Option<DispatchOutcome>,
    /// Local state was restored to its pre-edit snapshot
    pub rolled_back: bool,
}

/// Facade over the offline sync core
pub struct SyncEngine {
    config: SyncConfig,
    state: StateHandle,
    store: Arc<TieredStore>,
    client: ResilientClient,
    queue: Arc<MutationQueue>,
    holding: Arc<HoldingArea>,
    ledger: Arc<TombstoneLedger>,
    optimistic: Arc<OptimisticStateManager>,
    offline: Arc<OfflineCache>,
    orchestrator: SyncOrchestrator,
    dispatcher: MutationDispatcher,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("store", &self.store)
            .field("queued", &self.queue.len())
            .field("held", &self.holding.len())
            .field("client", &self.client)
            .finish_non_exhaustive()
    }
}

impl SyncEngine {
    /// Wire every component and restore persisted state
    ///
    /// # Workflow
    /// 1. Validate the configuration
    /// 2. Probe the primary storage tier
    /// 3. Restore queue, holding area, ledger, watermarks and offline cache
    /// 4. Start snapshot eviction and offline-cache autosave
    ///
    /// # Errors
    /// [`SyncError::Config`] for an invalid configuration.
    pub async fn open(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        primary: Option<Arc<dyn DurableStore>>,
        secondary: Arc<dyn DurableStore>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(
            TieredStore::probe(primary, secondary)
                .await
                .with_recheck_interval(config.storage.primary_recheck()),
        );
        let client = ResilientClient::new(
            remote,
            config.breaker.clone(),
            config.throttle.clone(),
            config.retry.clone(),
        );

        let queue = Arc::new(MutationQueue::new(config.queue.clone(), Arc::clone(&store)));
        let holding = Arc::new(HoldingArea::new(
            config.queue.holding_storage_key.clone(),
            Arc::clone(&store),
        ));
        let ledger = Arc::new(TombstoneLedger::new(
            config.tombstones.clone(),
            Arc::clone(&store),
            client.clone(),
        ));
        let watermarks = Arc::new(WatermarkStore::new(
            config.orchestrator.watermark_storage_key.clone(),
            config.orchestrator.watermark_lookback(),
            Arc::clone(&store),
        ));
        let offline = Arc::new(OfflineCache::new(&config.orchestrator, Arc::clone(&store)));

        let queued = queue.load().await;
        let held = holding.load().await;
        let scopes = ledger.load().await;
        watermarks.load().await;
        let state = StateHandle::new(offline.load().await.unwrap_or_default());
        info!(queued, held, tombstone_scopes = scopes, tier = ?store.active_tier(), "sync engine opened");

        let optimistic = Arc::new(OptimisticStateManager::new(
            config.optimistic.clone(),
            state.clone(),
            Arc::clone(&notifier),
        ));
        let orchestrator = SyncOrchestrator::new(
            client.clone(),
            Arc::clone(&ledger),
            Arc::clone(&queue),
            watermarks,
            state.clone(),
            Arc::clone(&notifier),
        );
        let dispatcher = MutationDispatcher::new(
            client.clone(),
            Arc::clone(&queue),
            Arc::clone(&holding),
            Arc::clone(&ledger),
            config.conflict.clone(),
            notifier,
        );

        let tasks = vec![
            optimistic.spawn_eviction_task(),
            offline.spawn_autosave(&state, config.orchestrator.autosave_debounce()),
        ];

        Ok(Self {
            config,
            state,
            store,
            client,
            queue,
            holding,
            ledger,
            optimistic,
            offline,
            orchestrator,
            dispatcher,
            tasks: Mutex::new(tasks),
        })
    }

    /// [`open`](Self::open) with tiers built from `config.storage`
    ///
    /// An unset database path uses an in-memory SQLite database; an unset
    /// key-value directory uses an in-memory store with the same quota.
    ///
    /// # Errors
    /// Storage that cannot be opened, or an invalid configuration.
    pub async fn open_with_storage(
        config: SyncConfig,
        remote: Arc<dyn RemoteApi>,
        notifier: Arc<dyn Notifier>,
    ) -> Result<Self> {
        let storage = &config.storage;
        let primary: Arc<dyn DurableStore> = match &storage.sqlite_path {
            Some(path) => Arc::new(SqliteStore::open(path)?),
            None => Arc::new(SqliteStore::open_in_memory()?),
        };
        let secondary: Arc<dyn DurableStore> = match &storage.kv_dir {
            Some(dir) => Arc::new(FileKvStore::open(dir.clone(), storage.kv_quota_bytes)?),
            None => Arc::new(MemoryStore::with_quota("kv", storage.kv_quota_bytes)),
        };
        Self::open(config, remote, Some(primary), secondary, notifier).await
    }

    #[must_use]
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Live state handle
    #[must_use]
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Durable mutation queue
    #[must_use]
    pub fn queue(&self) -> &MutationQueue {
        &self.queue
    }

    /// Tombstone ledger shared with the orchestrator
    #[must_use]
    pub fn ledger(&self) -> &TombstoneLedger {
        &self.ledger
    }

    /// Breaker and throttle wrapped remote client
    #[must_use]
    pub fn client(&self) -> &ResilientClient {
        &self.client
    }

    #[must_use]
    pub fn orchestrator(&self) -> &SyncOrchestrator {
        &self.orchestrator
    }

    #[must_use]
    pub fn optimistic(&self) -> &OptimisticStateManager {
        &self.optimistic
    }

    /// Apply a local edit and push it
    ///
    /// # Workflow
    /// 1. Snapshot the live state
    /// 2. Apply the edit locally (a delete is also recorded in the ledger)
    /// 3. Enqueue it durably and check the queue fill level
    /// 4. Drain the queue
    /// 5. Roll back only if the remote refused the edit for good; transient
    ///    failures keep the edit and leave it queued
    ///
    /// # Errors
    /// [`SyncError::State`] when the edit does not apply locally,
    /// [`SyncError::QueueFull`] when the queue is at its hard cap.
    pub async fn mutate(&self, mutation: Mutation) -> Result<MutateOutcome> {
        let Mutation {
            scope,
            operation,
            payload,
            label,
        } = mutation;
        let kind = payload.entity_type();
        let id = payload.id().clone();

        let snapshot = self.optimistic.create_snapshot(kind, label);
        let applied = self.state.try_update(|state| match operation {
            Operation::Upsert => state.upsert(&scope, payload.clone()),
            Operation::Delete => state.delete(&scope, kind, &id),
        });
        if let Err(e) = applied {
            self.optimistic.commit_snapshot(snapshot);
            return Err(e.into());
        }
        if operation == Operation::Delete {
            self.ledger.add_local(&scope, [id.clone()]).await;
            self.ledger.invalidate(&scope).await;
        }

        let parent = (kind != EntityType::Project).then(|| scope.clone());
        let enqueue = self.queue.enqueue(operation, payload, parent).await;
        if enqueue == EnqueueOutcome::Rejected {
            self.optimistic.rollback_snapshot(snapshot, true);
            if operation == Operation::Delete {
                self.ledger.clear_local(&scope, std::slice::from_ref(&id)).await;
            }
            return Err(SyncError::QueueFull(id));
        }
        self.dispatcher.check_capacity();

        let report = self.drain().await;
        let dispatch = report.outcome_for(kind, &id);
        let rolled_back = if dispatch.is_some_and(DispatchOutcome::is_rejection) {
            let rolled_back = self.optimistic.rollback_snapshot(snapshot, true);
            if operation == Operation::Delete {
                self.ledger.clear_local(&scope, std::slice::from_ref(&id)).await;
            }
            rolled_back
        } else {
            self.optimistic.commit_snapshot(snapshot);
            false
        };
        Ok(MutateOutcome {
            enqueue,
            dispatch,
            rolled_back,
        })
    }

    /// Drain the queue, then reload scopes the drain found to be stale
    ///
    /// A drain that got through to the remote but left the queue near full
    /// is followed by one more pass.
    pub async fn drain(&self) -> DrainReport {
        let mut report = self.dispatcher.drain().await;
        if report.force_requested && report.succeeded > 0 {
            info!(queued = self.queue.len(), "queue still near full, draining again");
            let next = self.dispatcher.drain().await;
            report.absorb(next);
        }
        for scope in self.dispatcher.take_stale_scopes() {
            if let Err(e) = self.orchestrator.load_full(&scope).await {
                warn!(%scope, error = %e, "refresh after drain failed");
            }
        }
        report
    }

    /// Load a scope and make it the active one
    ///
    /// # Errors
    /// See [`SyncOrchestrator::load_full`].
    pub async fn load_scope(&self, scope: &ScopeId) -> Result<LoadReport> {
        let report = self.orchestrator.load_full(scope).await?;
        self.state.update(|state| {
            state.active_project_id = Some(ofs_model::EntityId::new(scope.as_str()));
        });
        Ok(report)
    }

    /// Reload every scope changed since the last incremental sync
    ///
    /// # Errors
    /// Failure of the change-feed call.
    pub async fn sync_incremental(&self) -> Result<Vec<ScopeId>> {
        self.orchestrator.sync_incremental().await
    }

    /// Foreground/network-back hook: flush pending edits, then probe
    ///
    /// # Errors
    /// Failure of the resume probe.
    pub async fn on_resume(&self) -> Result<ResumeReport> {
        self.drain().await;
        self.orchestrator.on_resume().await
    }

    /// Mutations the remote refused, awaiting a user decision
    #[must_use]
    pub fn held(&self) -> Vec<HeldMutation> {
        self.holding.list()
    }

    /// Re-queue a held mutation (after the user refreshed or re-authenticated)
    pub async fn release_held(&self, id: MutationId) -> Option<EnqueueOutcome> {
        let item = self.holding.release(id).await?;
        Some(self.queue.enqueue_item(item).await)
    }

    /// Give up on a held mutation
    pub async fn discard_held(&self, id: MutationId) -> bool {
        self.holding.discard(id).await
    }

    /// Forget all local sync state (logout, account switch)
    pub async fn reset(&self) {
        self.queue.clear().await;
        self.holding.clear().await;
        self.ledger.clear_all().await;
        self.orchestrator.watermarks().clear().await;
        self.offline.clear().await;
        self.client.breaker().reset();
        self.state.replace(ofs_model::LocalState::new());
        info!("sync state reset");
    }

    /// Stop background work and flush the queue to the secondary tier
    ///
    /// Returns whether the teardown flush succeeded.
    pub async fn shutdown(&self) -> bool {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        // queue first: the snapshot is the record that gives way in a full tier
        let flushed = self.queue.flush_on_teardown();
        if let Err(e) = self.offline.save(&self.state.current()).await {
            warn!(error = %e, "final offline cache save failed");
        }
        info!(flushed, pending = self.queue.len(), "sync engine shut down");
        flushed
    }
}
