use chrono::{TimeZone, Utc};
use ofs_model::{
    Connection, EntityId, EntitySnapshot, EntityType, LocalState, Project, ProjectMeta, ScopeId,
    Task,
};
use proptest::prelude::*;
use std::collections::BTreeSet;

fn stamp() -> chrono::DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
}

/// Project with tasks `t0..tN` and the given edges between them
fn project(n: usize, edges: &[(usize, usize)]) -> Project {
    let tasks = (0..n).map(|i| EntitySnapshot::from(Task::new(format!("t{i}"), "task", stamp())));
    let conns = edges
        .iter()
        .enumerate()
        .filter(|(_, (a, b))| *a < n && *b < n)
        .map(|(i, (a, b))| {
            EntitySnapshot::from(Connection::new(
                format!("c{i}"),
                format!("t{a}"),
                format!("t{b}"),
                stamp(),
            ))
        });
    Project::from_children(ProjectMeta::new("p1", "project", stamp()), tasks.chain(conns))
}

proptest! {
    #[test]
    fn deleting_tasks_never_leaves_dangling_connections(
        n in 1usize..12,
        edges in prop::collection::vec((0usize..12, 0usize..12), 0..20),
        doomed in prop::collection::btree_set(0usize..12, 0..6),
    ) {
        let scope = ScopeId::new("p1");
        let mut state = LocalState::new();
        state.put_project(project(n, &edges));

        for i in &doomed {
            let id = EntityId::new(format!("t{i}"));
            let result = state.delete(&scope, EntityType::Task, &id);
            prop_assert_eq!(result.is_ok(), *i < n);
        }

        let p = state.project(&EntityId::new("p1")).unwrap();
        let live: BTreeSet<&EntityId> = p.tasks.keys().collect();
        for conn in p.connections.values() {
            prop_assert!(live.contains(&conn.source) && live.contains(&conn.target));
        }
        prop_assert_eq!(p.tasks.len(), n - doomed.iter().filter(|i| **i < n).count());
    }

    #[test]
    fn scrubbing_is_idempotent(
        n in 1usize..12,
        soft in prop::collection::btree_set(0usize..12, 0..6),
    ) {
        let scope = ScopeId::new("p1");
        let mut state = LocalState::new();
        state.put_project(project(n, &[]));
        for i in soft.iter().filter(|i| **i < n) {
            let task = Task::new(format!("t{i}"), "task", stamp());
            let deleted = EntitySnapshot::from(task).mark_deleted(stamp());
            state.upsert(&scope, deleted).unwrap();
        }

        let once = state.scrubbed();
        prop_assert_eq!(once.scrubbed(), once.clone());
        prop_assert_eq!(once.entity_count(), 1 + n - soft.iter().filter(|i| **i < n).count());
    }
}
