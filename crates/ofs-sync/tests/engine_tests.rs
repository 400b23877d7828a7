use ofs_model::{
    CollectingNotifier, Entity, EntityId, Notice, Notifier, RemoteApi, SyncConfig,
};
use ofs_store::{DurableStore, MemoryStore};
use ofs_sync::{DispatchOutcome, Mutation, SyncEngine, SyncError};
use ofs_test_utils::{fast_config, remote_with_project, scope, task, task_at, MemoryRemote};
use pretty_assertions::assert_eq;
use std::sync::Arc;

struct Setup {
    engine: SyncEngine,
    remote: Arc<MemoryRemote>,
    notices: CollectingNotifier,
    secondary: Arc<MemoryStore>,
}

async fn open(remote: Arc<MemoryRemote>, config: SyncConfig, secondary: Arc<MemoryStore>) -> Setup {
    let notices = CollectingNotifier::new();
    let notifier: Arc<dyn Notifier> = Arc::new(notices.clone());
    let api: Arc<dyn RemoteApi> = remote.clone();
    let tier: Arc<dyn DurableStore> = secondary.clone();
    let engine = SyncEngine::open(config, api, None, tier, notifier).await.unwrap();
    Setup {
        engine,
        remote,
        notices,
        secondary,
    }
}

async fn loaded(tasks: usize, config: SyncConfig) -> Setup {
    let setup = open(
        Arc::new(remote_with_project("p1", tasks)),
        config,
        Arc::new(MemoryStore::new("kv")),
    )
    .await;
    setup.engine.load_scope(&scope("p1")).await.unwrap();
    setup
}

fn local_task_ids(engine: &SyncEngine) -> Vec<String> {
    engine
        .state()
        .current()
        .project(&EntityId::new("p1"))
        .map(|p| p.tasks.keys().map(|id| id.as_str().to_string()).collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn online_edit_is_applied_and_confirmed() {
    let s = loaded(1, fast_config()).await;

    let outcome = s
        .engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();

    assert_eq!(outcome.dispatch, Some(DispatchOutcome::Succeeded));
    assert!(!outcome.rolled_back);
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t2"]);
    assert!(s.remote.entity(&scope("p1"), &EntityId::new("t2")).is_some());
    assert!(s.engine.queue().is_empty());
    assert_eq!(s.engine.optimistic().pending(), 0);
}

#[tokio::test]
async fn offline_edit_stays_local_and_flushes_on_resume() {
    let s = loaded(1, fast_config()).await;
    s.remote.set_offline(true);

    let outcome = s
        .engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();

    assert_eq!(outcome.dispatch, Some(DispatchOutcome::Retrying));
    assert!(!outcome.rolled_back);
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t2"]);
    assert_eq!(s.engine.queue().len(), 1);

    s.remote.set_offline(false);
    let report = s.engine.on_resume().await.unwrap();

    assert_eq!(report.active_accessible, Some(true));
    assert!(s.engine.queue().is_empty());
    assert!(s.remote.entity(&scope("p1"), &EntityId::new("t2")).is_some());
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t2"]);
}

#[tokio::test]
async fn refused_edit_is_rolled_back_and_held() {
    let s = loaded(1, fast_config()).await;
    s.remote.deny_writes("t2");

    let outcome = s
        .engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)).with_label("add step"))
        .await
        .unwrap();

    assert!(outcome.rolled_back);
    assert_eq!(local_task_ids(&s.engine), vec!["t1"]);
    let notices = s.notices.notices();
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::PermissionDenied { .. })));
    assert!(notices
        .iter()
        .any(|n| matches!(n, Notice::RolledBack { label, .. } if label == "add step")));

    let held = s.engine.held();
    assert_eq!(held.len(), 1);
    assert!(s.engine.discard_held(held[0].item.id).await);
    assert!(s.engine.held().is_empty());
}

#[tokio::test]
async fn released_mutation_is_queued_again() {
    let s = loaded(1, fast_config()).await;
    s.remote.reject_as_invalid("t2");
    s.engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();
    let id = s.engine.held()[0].item.id;

    let outcome = s.engine.release_held(id).await;

    assert!(outcome.is_some_and(|o| o.is_queued()));
    assert_eq!(s.engine.queue().len(), 1);
    assert_eq!(s.engine.queue().items()[0].retry_count, 0);
    assert!(s.engine.held().is_empty());
}

#[tokio::test]
async fn pending_delete_is_not_resurrected_by_a_reload() {
    let s = loaded(3, fast_config()).await;
    let p1 = scope("p1");
    s.remote.set_offline(true);

    let outcome = s
        .engine
        .mutate(Mutation::delete(p1.clone(), task("t2")))
        .await
        .unwrap();
    assert_eq!(outcome.dispatch, Some(DispatchOutcome::Retrying));
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t3"]);

    // back online, but the delete has not been sent yet
    s.remote.set_offline(false);
    s.engine.orchestrator().load_full(&p1).await.unwrap();
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t3"]);

    s.engine.drain().await;
    assert!(s.remote.tombstones(&p1).contains(&EntityId::new("t2")));
    assert!(s.engine.ledger().local(&p1).is_empty());

    s.engine.load_scope(&p1).await.unwrap();
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t3"]);
}

#[tokio::test]
async fn local_delete_forces_a_fresh_tombstone_fetch() {
    let s = loaded(2, fast_config()).await;
    let p1 = scope("p1");
    s.remote.set_offline(true);
    s.engine.mutate(Mutation::delete(p1.clone(), task("t1"))).await.unwrap();
    s.remote.set_offline(false);
    s.remote.reset_calls();

    s.engine.ledger().fetch_remote_with_cache(&p1).await.unwrap();
    assert_eq!(s.remote.call_count("list_scope_tombstones"), 1);
}

#[tokio::test]
async fn near_full_queue_requests_a_forced_drain() {
    let s = loaded(1, fast_config().with_queue_capacity(10, 20)).await;
    s.remote.set_offline(true);
    for i in 0..9 {
        s.engine
            .mutate(Mutation::upsert(scope("p1"), task(&format!("n{i}"))))
            .await
            .unwrap();
    }
    assert!(s
        .notices
        .notices()
        .iter()
        .any(|n| matches!(n, Notice::QueueCapacity { percent: 90, .. })));
    assert!(s.secondary.raw("mutation-queue").unwrap().contains("n8"));

    let report = s.engine.drain().await;
    assert!(report.force_requested);
    assert_eq!(s.engine.queue().len(), 9);

    s.remote.set_offline(false);
    s.engine.client().breaker().reset();
    let report = s.engine.drain().await;
    assert!(!report.force_requested);
    assert!(s.engine.queue().is_empty());
}

#[tokio::test]
async fn full_queue_rejects_and_rolls_back() {
    let s = loaded(1, fast_config().with_queue_capacity(1, 1)).await;
    s.remote.set_offline(true);

    s.engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();
    let err = s
        .engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t3", 10)))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::QueueFull(ref id) if id.as_str() == "t3"));
    assert_eq!(local_task_ids(&s.engine), vec!["t1", "t2"]);
    assert_eq!(s.engine.queue().len(), 1);
}

#[tokio::test]
async fn edit_to_an_unknown_scope_fails_locally() {
    let s = loaded(1, fast_config()).await;

    let err = s
        .engine
        .mutate(Mutation::upsert(scope("nope"), task_at("t2", 10)))
        .await
        .unwrap_err();

    assert!(matches!(err, SyncError::State(_)));
    assert!(s.engine.queue().is_empty());
    assert_eq!(s.remote.call_count("upsert_entity"), 0);
    assert_eq!(s.engine.optimistic().pending(), 0);
}

#[tokio::test]
async fn shutdown_persists_queue_and_state_for_the_next_start() {
    let s = loaded(1, fast_config()).await;
    s.remote.set_offline(true);
    s.engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();

    assert!(s.engine.shutdown().await);
    let remote = Arc::clone(&s.remote);
    let secondary = Arc::clone(&s.secondary);
    drop(s);

    let restarted = open(remote, fast_config(), secondary).await;
    assert_eq!(restarted.engine.queue().len(), 1);
    assert_eq!(local_task_ids(&restarted.engine), vec!["t1", "t2"]);

    restarted.remote.set_offline(false);
    let report = restarted.engine.drain().await;
    assert_eq!(report.succeeded, 1);
    let sent = restarted
        .remote
        .entity(&scope("p1"), &EntityId::new("t2"))
        .unwrap();
    assert_eq!(sent.id().as_str(), "t2");
}

#[tokio::test]
async fn file_backed_storage_survives_a_restart() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.storage.sqlite_path = Some(dir.path().join("sync.db"));
    config.storage.kv_dir = Some(dir.path().join("kv"));
    let remote = Arc::new(remote_with_project("p1", 1));
    remote.set_offline(true);

    let notifier: Arc<dyn Notifier> = Arc::new(CollectingNotifier::new());
    let engine = SyncEngine::open_with_storage(config.clone(), remote.clone(), Arc::clone(&notifier))
        .await
        .unwrap();
    engine.state().update(|state| {
        state.put_project(ofs_test_utils::project_with_tasks("p1", 1));
    });
    engine
        .mutate(Mutation::upsert(scope("p1"), task_at("t2", 10)))
        .await
        .unwrap();
    engine.shutdown().await;
    drop(engine);

    let engine = SyncEngine::open_with_storage(config, remote, notifier)
        .await
        .unwrap();
    assert_eq!(engine.queue().len(), 1);
}

#[tokio::test]
async fn reset_forgets_all_sync_state() {
    let s = loaded(1, fast_config()).await;
    s.remote.set_offline(true);
    s.engine
        .mutate(Mutation::delete(scope("p1"), task("t1")))
        .await
        .unwrap();

    s.engine.reset().await;

    assert!(s.engine.queue().is_empty());
    assert!(s.engine.ledger().local(&scope("p1")).is_empty());
    assert_eq!(s.engine.state().current().entity_count(), 0);
}

#[test]
fn invalid_config_is_refused() {
    let config = SyncConfig::default().with_queue_capacity(10, 5);
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .unwrap();
    let result = runtime.block_on(SyncEngine::open(
        config,
        Arc::new(MemoryRemote::new()),
        None,
        Arc::new(MemoryStore::new("kv")),
        Arc::new(CollectingNotifier::new()),
    ));
    assert!(matches!(result, Err(SyncError::Config(_))));
}
