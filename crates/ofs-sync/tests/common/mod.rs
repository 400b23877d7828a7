//! Shared wiring for the sync integration tests

#![allow(dead_code)]

use ofs_model::{CollectingNotifier, Notifier, StateHandle, SyncConfig};
use ofs_queue::{HoldingArea, MutationQueue};
use ofs_resilience::ResilientClient;
use ofs_store::{DurableStore, MemoryStore, TieredStore};
use ofs_sync::{MutationDispatcher, SyncOrchestrator, WatermarkStore};
use ofs_test_utils::MemoryRemote;
use ofs_tombstone::TombstoneLedger;
use std::sync::Arc;

/// Components wired the way the engine wires them, with handles kept for
/// inspection
pub struct Harness {
    pub remote: Arc<MemoryRemote>,
    pub notices: CollectingNotifier,
    pub store: Arc<TieredStore>,
    pub client: ResilientClient,
    pub queue: Arc<MutationQueue>,
    pub holding: Arc<HoldingArea>,
    pub ledger: Arc<TombstoneLedger>,
    pub state: StateHandle,
    pub orchestrator: SyncOrchestrator,
    pub dispatcher: MutationDispatcher,
}

impl Harness {
    pub fn new(remote: MemoryRemote, config: SyncConfig) -> Self {
        Self::with_state(remote, config, StateHandle::default())
    }

    pub fn with_state(remote: MemoryRemote, config: SyncConfig, state: StateHandle) -> Self {
        let remote = Arc::new(remote);
        let notices = CollectingNotifier::new();
        let notifier: Arc<dyn Notifier> = Arc::new(notices.clone());
        let tier: Arc<dyn DurableStore> = Arc::new(MemoryStore::new("mem"));
        let store = Arc::new(TieredStore::secondary_only(tier));

        let client = ResilientClient::new(
            remote.clone(),
            config.breaker.clone(),
            config.throttle.clone(),
            config.retry.clone(),
        );
        let queue = Arc::new(MutationQueue::new(config.queue.clone(), Arc::clone(&store)));
        let holding = Arc::new(HoldingArea::new("holding", Arc::clone(&store)));
        let ledger = Arc::new(TombstoneLedger::new(
            config.tombstones.clone(),
            Arc::clone(&store),
            client.clone(),
        ));
        let watermarks = Arc::new(WatermarkStore::new(
            "watermarks",
            config.orchestrator.watermark_lookback(),
            Arc::clone(&store),
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

        Self {
            remote,
            notices,
            store,
            client,
            queue,
            holding,
            ledger,
            state,
            orchestrator,
            dispatcher,
        }
    }
}
