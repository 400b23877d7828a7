//! Testing utilities for the offline sync workspace
//!
//! Shared fixtures and an in-memory remote with fault injection.

#![allow(missing_docs)]

pub mod remote;

pub use remote::MemoryRemote;

use chrono::{DateTime, Duration, TimeZone, Utc};
use ofs_model::{
    Connection, EntityId, EntitySnapshot, LocalState, Project, ProjectMeta, ScopeId, StateHandle,
    SyncConfig, Task,
};

/// Fixed reference instant so fixtures are reproducible
pub fn t0() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
}

/// `t0` plus some seconds
pub fn at(secs: i64) -> DateTime<Utc> {
    t0() + Duration::seconds(secs)
}

pub fn scope(id: &str) -> ScopeId {
    ScopeId::new(id)
}

pub fn project_meta(id: &str) -> ProjectMeta {
    ProjectMeta::new(id, format!("project {id}"), t0())
}

pub fn task(id: &str) -> Task {
    Task::new(id, format!("task {id}"), t0())
}

pub fn task_at(id: &str, secs: i64) -> Task {
    Task::new(id, format!("task {id}"), at(secs))
}

pub fn connection(id: &str, source: &str, target: &str) -> Connection {
    Connection::new(id, source, target, t0())
}

pub fn task_snapshot(id: &str) -> EntitySnapshot {
    EntitySnapshot::Task(task(id))
}

/// Project with tasks `t1..=tN` and no connections
pub fn project_with_tasks(id: &str, n: usize) -> Project {
    Project::from_children(
        project_meta(id),
        (1..=n).map(|i| task_snapshot(&format!("t{i}"))),
    )
}

/// Local state holding one project with `n` tasks, active
pub fn state_with_project(id: &str, n: usize) -> LocalState {
    let mut state = LocalState::new();
    state.put_project(project_with_tasks(id, n));
    state.active_project_id = Some(EntityId::new(id));
    state
}

pub fn state_handle_with_project(id: &str, n: usize) -> StateHandle {
    StateHandle::new(state_with_project(id, n))
}

/// Remote seeded with one project and tasks `t1..=tN`
pub fn remote_with_project(id: &str, n: usize) -> MemoryRemote {
    let remote = MemoryRemote::new();
    remote.seed_scope(
        project_meta(id),
        (1..=n).map(|i| task_snapshot(&format!("t{i}"))),
    );
    remote
}

/// Config with retries disabled and short timeouts, for fast tests
pub fn fast_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry.max_retries = 0;
    config.retry.jitter = false;
    config.throttle.call_timeout_ms = 2_000;
    config.breaker.recovery_ms = 1_000;
    config.orchestrator.autosave_debounce_ms = 50;
    config
}
