use ofs_model::{
    CollectingNotifier, EntityId, EntityType, LocalState, OptimisticConfig, RemoteError,
    StateError, TransientKind,
};
use ofs_optimistic::{ActionMeta, ActionOutcome, OptimisticStateManager};
use ofs_test_utils::{scope, state_handle_with_project, task_at};
use proptest::prelude::*;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Edit {
    Upsert(u8, i64),
    Delete(u8),
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        (0u8..8, 0i64..1_000).prop_map(|(id, secs)| Edit::Upsert(id, secs)),
        (0u8..8).prop_map(Edit::Delete),
    ]
}

fn apply(edits: &[Edit], state: &mut LocalState) -> Result<(), StateError> {
    let p1 = scope("p1");
    for e in edits {
        match e {
            Edit::Upsert(id, secs) => state.upsert(&p1, task_at(&format!("t{id}"), *secs).into())?,
            Edit::Delete(id) => {
                // deleting an absent task is not an error worth aborting on
                let _ = state.delete(&p1, EntityType::Task, &EntityId::new(format!("t{id}")));
            }
        }
    }
    Ok(())
}

proptest! {
    #[test]
    fn prop_failed_remote_restores_deep_equal_state(
        edits in prop::collection::vec(edit(), 1..20)
    ) {
        let rt = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let manager = OptimisticStateManager::new(
            OptimisticConfig::default(),
            state_handle_with_project("p1", 4),
            Arc::new(CollectingNotifier::new()),
        );
        let before = manager.state().current();

        let outcome: ActionOutcome<()> = rt.block_on(manager.run_optimistic_action(
            ActionMeta::new(EntityType::Task, "batch edit").with_notice(false),
            |state| apply(&edits, state),
            || async { Err(RemoteError::transient(TransientKind::Gateway, "502")) },
        ));

        prop_assert!(outcome.rolled_back());
        prop_assert_eq!(manager.state().current(), before);
        prop_assert_eq!(manager.pending(), 0);
    }
}
