use ofs_model::{EntityId, EntitySnapshot, Operation};
use ofs_sync::{overlay_pending, reconcile};
use ofs_test_utils::{at, connection, project_meta, task_at};
use proptest::prelude::*;
use std::collections::{BTreeSet, HashMap};

/// Rows `t0..tN` plus a chain of connections between consecutive tasks,
/// some of them soft-deleted
fn rows(n: usize, soft_deleted: &BTreeSet<usize>) -> Vec<EntitySnapshot> {
    let tasks = (0..n).map(|i| {
        let snap = EntitySnapshot::from(task_at(&format!("t{i}"), i64::try_from(i).unwrap()));
        if soft_deleted.contains(&i) {
            snap.mark_deleted(at(1_000))
        } else {
            snap
        }
    });
    let edges = (1..n).map(|i| {
        EntitySnapshot::from(connection(
            &format!("c{i}"),
            &format!("t{}", i - 1),
            &format!("t{i}"),
        ))
    });
    tasks.chain(edges).collect()
}

proptest! {
    #[test]
    fn tombstoned_rows_never_come_back(
        n in 1usize..20,
        tombstoned in prop::collection::btree_set(0usize..20, 0..10),
        soft_deleted in prop::collection::btree_set(0usize..20, 0..5),
    ) {
        let tombstones: BTreeSet<EntityId> =
            tombstoned.iter().map(|i| EntityId::new(format!("t{i}"))).collect();

        let project = reconcile(project_meta("p1"), rows(n, &soft_deleted), &tombstones);

        for id in &tombstones {
            prop_assert!(!project.tasks.contains_key(id));
        }
        for i in &soft_deleted {
            let id = EntityId::new(format!("t{i}"));
            prop_assert!(!project.tasks.contains_key(&id));
        }
        // no edge survives without both endpoints
        for conn in project.connections.values() {
            prop_assert!(project.tasks.contains_key(&conn.source));
            prop_assert!(project.tasks.contains_key(&conn.target));
        }
    }

    #[test]
    fn pending_deletes_stay_deleted_after_overlay(
        n in 1usize..20,
        deleted in prop::collection::btree_set(0usize..20, 0..10),
    ) {
        let server = reconcile(project_meta("p1"), rows(n, &BTreeSet::new()), &BTreeSet::new());
        let pending: HashMap<EntityId, Operation> = deleted
            .iter()
            .map(|i| (EntityId::new(format!("t{i}")), Operation::Delete))
            .collect();

        let merged = overlay_pending(server.clone(), Some(&server), &pending);

        for id in pending.keys() {
            prop_assert!(!merged.tasks.contains_key(id));
        }
        prop_assert_eq!(
            merged.tasks.len(),
            n - deleted.iter().filter(|i| **i < n).count()
        );
    }
}
