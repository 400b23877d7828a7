use ofs_model::EntityId;
use ofs_resilience::ResilientClient;
use ofs_store::{MemoryStore, TieredStore};
use ofs_test_utils::{fast_config, scope, MemoryRemote};
use ofs_tombstone::TombstoneLedger;
use proptest::prelude::*;
use std::collections::BTreeSet;
use std::sync::Arc;

fn ids(raw: &BTreeSet<u8>) -> Vec<EntityId> {
    raw.iter().map(|i| EntityId::new(format!("t{i}"))).collect()
}

proptest! {
    /// The local plane holds exactly what was added and not yet cleared, and
    /// survives a reload from storage.
    #[test]
    fn local_plane_tracks_adds_and_clears(
        added in prop::collection::btree_set(0u8..30, 0..15),
        cleared in prop::collection::btree_set(0u8..30, 0..15),
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let (now, reloaded) = rt.block_on(async {
            let config = fast_config();
            let remote = Arc::new(MemoryRemote::new());
            let client = ResilientClient::new(
                remote,
                config.breaker.clone(),
                config.throttle.clone(),
                config.retry.clone(),
            );
            let store = Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))));
            let p1 = scope("p1");

            let ledger = TombstoneLedger::new(config.tombstones.clone(), Arc::clone(&store), client.clone());
            ledger.add_local(&p1, ids(&added)).await;
            ledger.clear_local(&p1, &ids(&cleared)).await;

            let fresh = TombstoneLedger::new(config.tombstones, store, client);
            fresh.load().await;
            (ledger.local(&p1), fresh.local(&p1))
        });

        let expected: BTreeSet<EntityId> = ids(&added.difference(&cleared).copied().collect()).into_iter().collect();
        prop_assert_eq!(&now, &expected);
        prop_assert_eq!(&reloaded, &expected);
    }
}
