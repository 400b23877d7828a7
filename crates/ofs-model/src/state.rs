//! Local editor state
//!
//! The whole addressable state is built from `im` persistent maps, so a
//! clone is a constant-time structural share. Optimistic snapshots and
//! rollbacks rely on that: taking a snapshot is a clone, restoring one is a
//! pointer swap.

use crate::entity::{Connection, Entity, EntitySnapshot, EntityType, ProjectMeta, Task};
use crate::ids::{EntityId, ScopeId};
use chrono::{DateTime, Utc};
use im::OrdMap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// A project together with its children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub meta: ProjectMeta,
    #[serde(default)]
    pub tasks: OrdMap<EntityId, Task>,
    #[serde(default)]
    pub connections: OrdMap<EntityId, Connection>,
}

impl Project {
    /// Project with no children
    #[must_use]
    pub fn new(meta: ProjectMeta) -> Self {
        Self {
            meta,
            tasks: OrdMap::new(),
            connections: OrdMap::new(),
        }
    }

    /// Project id
    #[inline]
    #[must_use]
    pub fn id(&self) -> &EntityId {
        &self.meta.id
    }

    /// Build from a flat list of child snapshots; project snapshots are ignored
    #[must_use]
    pub fn from_children(meta: ProjectMeta, children: impl IntoIterator<Item = EntitySnapshot>) -> Self {
        let mut project = Self::new(meta);
        for child in children {
            project.put_child(child);
        }
        project
    }

    /// Insert or replace a child entity
    pub fn put_child(&mut self, child: EntitySnapshot) {
        match child {
            EntitySnapshot::Task(task) => {
                self.tasks.insert(task.id.clone(), task);
            }
            EntitySnapshot::Connection(conn) => {
                self.connections.insert(conn.id.clone(), conn);
            }
            EntitySnapshot::Project(meta) => {
                if meta.id == self.meta.id {
                    self.meta = meta;
                }
            }
        }
    }

    /// Remove a child by kind and id, returning whether it existed
    pub fn remove_child(&mut self, kind: EntityType, id: &EntityId) -> bool {
        match kind {
            EntityType::Task => {
                let removed = self.tasks.remove(id).is_some();
                if removed {
                    // dangling edges go with the task
                    let dangling: Vec<EntityId> = self
                        .connections
                        .iter()
                        .filter(|(_, c)| &c.source == id || &c.target == id)
                        .map(|(k, _)| k.clone())
                        .collect();
                    for key in dangling {
                        self.connections.remove(&key);
                    }
                }
                removed
            }
            EntityType::Connection => self.connections.remove(id).is_some(),
            EntityType::Project => false,
        }
    }

    /// Children flattened back into snapshots
    #[must_use]
    pub fn children(&self) -> Vec<EntitySnapshot> {
        self.tasks
            .values()
            .cloned()
            .map(EntitySnapshot::Task)
            .chain(self.connections.values().cloned().map(EntitySnapshot::Connection))
            .collect()
    }

    /// Whether the project contains a child with this id
    #[must_use]
    pub fn contains(&self, id: &EntityId) -> bool {
        self.tasks.contains_key(id) || self.connections.contains_key(id)
    }

    /// Copy with soft-deleted children (and connections to them) removed
    #[must_use]
    pub fn scrubbed(&self) -> Self {
        let tasks: OrdMap<EntityId, Task> = self
            .tasks
            .iter()
            .filter(|(_, t)| !t.is_soft_deleted())
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        let connections = self
            .connections
            .iter()
            .filter(|(_, c)| {
                !c.is_soft_deleted() && tasks.contains_key(&c.source) && tasks.contains_key(&c.target)
            })
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        Self {
            meta: self.meta.clone(),
            tasks,
            connections,
        }
    }

    /// Highest `updated_at` among the project and its children
    #[must_use]
    pub fn max_updated_at(&self) -> DateTime<Utc> {
        self.tasks
            .values()
            .map(Task::updated_at)
            .chain(self.connections.values().map(Connection::updated_at))
            .fold(self.meta.updated_at, DateTime::max)
    }
}

/// Everything the editor shows
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LocalState {
    #[serde(default)]
    pub projects: OrdMap<EntityId, Project>,
    #[serde(default)]
    pub active_project_id: Option<EntityId>,
}

impl LocalState {
    /// Empty state
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a project
    #[inline]
    #[must_use]
    pub fn project(&self, id: &EntityId) -> Option<&Project> {
        self.projects.get(id)
    }

    /// Look up a task within a scope
    #[must_use]
    pub fn task(&self, scope: &ScopeId, id: &EntityId) -> Option<&Task> {
        self.projects
            .get(&EntityId::new(scope.as_str()))
            .and_then(|p| p.tasks.get(id))
    }

    /// Insert or replace a whole project
    pub fn put_project(&mut self, project: Project) {
        self.projects.insert(project.id().clone(), project);
    }

    /// Remove a project; clears the active selection when it pointed there
    pub fn remove_project(&mut self, id: &EntityId) -> Option<Project> {
        if self.active_project_id.as_ref() == Some(id) {
            self.active_project_id = None;
        }
        self.projects.remove(id)
    }

    /// Apply an upsert of any entity. Children of unknown projects are rejected.
    pub fn upsert(&mut self, scope: &ScopeId, snapshot: EntitySnapshot) -> Result<(), StateError> {
        match snapshot {
            EntitySnapshot::Project(meta) => {
                match self.projects.get_mut(&meta.id) {
                    Some(existing) => existing.meta = meta,
                    None => self.put_project(Project::new(meta)),
                }
                Ok(())
            }
            child => {
                let project = self
                    .projects
                    .get_mut(&EntityId::new(scope.as_str()))
                    .ok_or_else(|| StateError::UnknownScope(scope.clone()))?;
                project.put_child(child);
                Ok(())
            }
        }
    }

    /// Remove any entity from live state
    pub fn delete(&mut self, scope: &ScopeId, kind: EntityType, id: &EntityId) -> Result<(), StateError> {
        let removed = match kind {
            EntityType::Project => self.remove_project(id).is_some(),
            other => self
                .projects
                .get_mut(&EntityId::new(scope.as_str()))
                .is_some_and(|p| p.remove_child(other, id)),
        };
        if removed {
            Ok(())
        } else {
            Err(StateError::UnknownEntity(id.clone()))
        }
    }

    /// Copy with soft-deleted entities removed at every level
    #[must_use]
    pub fn scrubbed(&self) -> Self {
        let projects = self
            .projects
            .iter()
            .filter(|(_, p)| !p.meta.is_soft_deleted())
            .map(|(k, p)| (k.clone(), p.scrubbed()))
            .collect();
        Self {
            projects,
            active_project_id: self.active_project_id.clone(),
        }
    }

    /// Total number of entities (projects plus children)
    #[must_use]
    pub fn entity_count(&self) -> usize {
        self.projects
            .values()
            .map(|p| 1 + p.tasks.len() + p.connections.len())
            .sum()
    }
}

/// Errors from direct state edits
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StateError {
    /// Scope is not loaded locally
    #[error("unknown scope: {0}")]
    UnknownScope(ScopeId),

    /// Entity is not present
    #[error("unknown entity: {0}")]
    UnknownEntity(EntityId),
}

/// Shared, observable holder of the live [`LocalState`]
///
/// All writers go through the handle; readers either take a cheap clone or
/// subscribe to change notifications.
#[derive(Debug, Clone)]
pub struct StateHandle {
    tx: Arc<watch::Sender<LocalState>>,
}

impl StateHandle {
    /// Wrap an initial state
    #[must_use]
    pub fn new(initial: LocalState) -> Self {
        let (tx, _rx) = watch::channel(initial);
        Self { tx: Arc::new(tx) }
    }

    /// Current state (structural share, O(1))
    #[must_use]
    pub fn current(&self) -> LocalState {
        self.tx.borrow().clone()
    }

    /// Swap in a whole new state, returning the previous one
    pub fn replace(&self, next: LocalState) -> LocalState {
        self.tx.send_replace(next)
    }

    /// Mutate in place and notify subscribers
    pub fn update<R>(&self, f: impl FnOnce(&mut LocalState) -> R) -> R {
        let mut out = None;
        self.tx.send_modify(|state| out = Some(f(state)));
        match out {
            Some(value) => value,
            None => unreachable!("send_modify runs its closure exactly once"),
        }
    }

    /// Mutate a draft; the live state only changes when `f` succeeds
    pub fn try_update<T, E>(&self, f: impl FnOnce(&mut LocalState) -> Result<T, E>) -> Result<T, E> {
        let mut out = None;
        self.tx.send_if_modified(|state| {
            let mut draft = state.clone();
            let result = f(&mut draft);
            let changed = result.is_ok();
            if changed {
                *state = draft;
            }
            out = Some(result);
            changed
        });
        match out {
            Some(result) => result,
            None => unreachable!("send_if_modified runs its closure exactly once"),
        }
    }

    /// Change notifications
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<LocalState> {
        self.tx.subscribe()
    }
}

impl Default for StateHandle {
    fn default() -> Self {
        Self::new(LocalState::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn state_with_project() -> (LocalState, ScopeId) {
        let now = Utc::now();
        let mut state = LocalState::new();
        state.put_project(Project::new(ProjectMeta::new("p1", "Roadmap", now)));
        (state, ScopeId::new("p1"))
    }

    #[test]
    fn upsert_child_requires_known_scope() {
        let mut state = LocalState::new();
        let err = state
            .upsert(&ScopeId::new("missing"), Task::new("t1", "x", Utc::now()).into())
            .unwrap_err();
        assert_eq!(err, StateError::UnknownScope(ScopeId::new("missing")));
    }

    #[test]
    fn deleting_task_drops_its_connections() {
        let (mut state, scope) = state_with_project();
        let now = Utc::now();
        state.upsert(&scope, Task::new("t1", "a", now).into()).unwrap();
        state.upsert(&scope, Task::new("t2", "b", now).into()).unwrap();
        state
            .upsert(&scope, Connection::new("c1", "t1", "t2", now).into())
            .unwrap();

        state.delete(&scope, EntityType::Task, &EntityId::new("t1")).unwrap();

        let project = state.project(&EntityId::new("p1")).unwrap();
        assert!(project.connections.is_empty());
        assert_eq!(project.tasks.len(), 1);
    }

    #[test]
    fn scrubbed_removes_soft_deleted() {
        let (mut state, scope) = state_with_project();
        let now = Utc::now();
        let mut gone = Task::new("t1", "gone", now);
        gone.deleted_at = Some(now);
        state.upsert(&scope, gone.into()).unwrap();
        state.upsert(&scope, Task::new("t2", "kept", now).into()).unwrap();

        let scrubbed = state.scrubbed();
        let project = scrubbed.project(&EntityId::new("p1")).unwrap();
        assert_eq!(project.tasks.keys().cloned().collect::<Vec<_>>(), vec![EntityId::new("t2")]);
    }

    #[test]
    fn try_update_leaves_state_untouched_on_error() {
        let (state, scope) = state_with_project();
        let handle = StateHandle::new(state.clone());

        let result: Result<(), StateError> = handle.try_update(|s| {
            s.upsert(&scope, Task::new("t1", "a", Utc::now()).into())?;
            s.delete(&scope, EntityType::Task, &EntityId::new("nope"))
        });

        assert!(result.is_err());
        assert_eq!(handle.current(), state);
    }

    #[tokio::test]
    async fn subscribers_see_updates() {
        let handle = StateHandle::default();
        let mut rx = handle.subscribe();
        handle.update(|s| s.active_project_id = Some(EntityId::new("p9")));
        rx.changed().await.unwrap();
        assert_eq!(rx.borrow().active_project_id, Some(EntityId::new("p9")));
    }
}
