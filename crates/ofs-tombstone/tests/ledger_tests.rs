use ofs_model::EntityId;
use ofs_resilience::ResilientClient;
use ofs_store::{MemoryStore, TieredStore};
use ofs_test_utils::{fast_config, remote_with_project, scope};
use ofs_tombstone::TombstoneLedger;
use std::sync::Arc;
use std::time::Duration;

#[tokio::test]
async fn concurrent_fetches_share_one_call() {
    let remote = Arc::new(remote_with_project("p1", 1));
    remote.seed_tombstone(&scope("p1"), "gone");
    remote.set_latency(Some(Duration::from_millis(30)));

    let config = fast_config();
    let client = ResilientClient::new(
        remote.clone(),
        config.breaker,
        config.throttle,
        config.retry,
    );
    let store = Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))));
    let ledger = TombstoneLedger::new(config.tombstones, store, client);
    let p1 = scope("p1");

    let (a, b) = tokio::join!(
        ledger.fetch_remote_with_cache(&p1),
        ledger.fetch_remote_with_cache(&p1)
    );
    assert_eq!(a.unwrap(), b.unwrap());
    assert_eq!(remote.call_count("list_scope_tombstones"), 1);
    assert!(ledger.is_tombstoned(&p1, &EntityId::new("gone")));
}

#[tokio::test]
async fn remote_plane_expires_after_ttl() {
    let remote = Arc::new(remote_with_project("p1", 1));
    let mut config = fast_config();
    config.tombstones.cache_ttl_secs = 1;
    let client = ResilientClient::new(
        remote.clone(),
        config.breaker,
        config.throttle,
        config.retry,
    );
    let store = Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))));
    let ledger = TombstoneLedger::new(config.tombstones, store, client);
    let p1 = scope("p1");

    ledger.fetch_remote_with_cache(&p1).await.unwrap();
    tokio::time::sleep(Duration::from_millis(1_200)).await;
    ledger.fetch_remote_with_cache(&p1).await.unwrap();
    assert_eq!(remote.call_count("list_scope_tombstones"), 2);
}
