//! Entity records
//!
//! The editor works on three entity kinds arranged in a strict hierarchy:
//! a project owns tasks, and connections link two tasks of the same project.

use crate::ids::EntityId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of entity a mutation targets
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    /// Top-level scope
    Project,
    /// Node inside a project
    Task,
    /// Edge between two tasks
    Connection,
}

impl EntityType {
    /// Position in the parent-before-child dispatch order
    #[inline]
    #[must_use]
    pub const fn topo_rank(self) -> u8 {
        match self {
            Self::Project => 0,
            Self::Task => 1,
            Self::Connection => 2,
        }
    }

    /// Stable lowercase name
    #[inline]
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Project => "project",
            Self::Task => "task",
            Self::Connection => "connection",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutation operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    /// Create or update
    Upsert,
    /// Soft delete
    Delete,
}

/// Common accessors used by tombstone filtering and merge
pub trait Entity {
    /// Entity id
    fn id(&self) -> &EntityId;
    /// Last modification time as recorded by whoever wrote it
    fn updated_at(&self) -> DateTime<Utc>;
    /// Soft-delete marker
    fn deleted_at(&self) -> Option<DateTime<Utc>>;

    /// Whether the record itself carries a soft-delete marker
    fn is_soft_deleted(&self) -> bool {
        self.deleted_at().is_some()
    }
}

/// Project metadata without children
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectMeta {
    pub id: EntityId,
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Server-side row version
    #[serde(default)]
    pub version: u64,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl ProjectMeta {
    /// New live project
    #[must_use]
    pub fn new(id: impl Into<EntityId>, name: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            version: 0,
            updated_at,
            deleted_at: None,
        }
    }
}

/// Task lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    #[default]
    Active,
    Completed,
    Archived,
}

/// A node of the task graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: EntityId,
    pub title: String,
    #[serde(default)]
    pub content: String,
    /// Parent task for nested tasks
    #[serde(default)]
    pub parent_id: Option<EntityId>,
    /// Column/stage index in the flow view
    #[serde(default)]
    pub stage: Option<u32>,
    /// Sort key among siblings
    #[serde(default)]
    pub rank: i64,
    #[serde(default)]
    pub status: TaskStatus,
    /// Diagram position, if placed
    #[serde(default)]
    pub position: Option<(f64, f64)>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Task {
    /// New live task
    #[must_use]
    pub fn new(id: impl Into<EntityId>, title: impl Into<String>, updated_at: DateTime<Utc>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            content: String::new(),
            parent_id: None,
            stage: None,
            rank: 0,
            status: TaskStatus::Active,
            position: None,
            updated_at,
            deleted_at: None,
        }
    }

    /// With parent task
    #[inline]
    #[must_use]
    pub fn with_parent(mut self, parent: impl Into<EntityId>) -> Self {
        self.parent_id = Some(parent.into());
        self
    }
}

/// An edge between two tasks
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Connection {
    pub id: EntityId,
    pub source: EntityId,
    pub target: EntityId,
    #[serde(default)]
    pub description: String,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub deleted_at: Option<DateTime<Utc>>,
}

impl Connection {
    /// New live connection
    #[must_use]
    pub fn new(
        id: impl Into<EntityId>,
        source: impl Into<EntityId>,
        target: impl Into<EntityId>,
        updated_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            source: source.into(),
            target: target.into(),
            description: String::new(),
            updated_at,
            deleted_at: None,
        }
    }
}

macro_rules! impl_entity {
    ($($ty:ty),+) => {
        $(
            impl Entity for $ty {
                fn id(&self) -> &EntityId {
                    &self.id
                }

                fn updated_at(&self) -> DateTime<Utc> {
                    self.updated_at
                }

                fn deleted_at(&self) -> Option<DateTime<Utc>> {
                    self.deleted_at
                }
            }
        )+
    };
}

impl_entity!(ProjectMeta, Task, Connection);

/// Full copy of one entity as carried by a mutation or a remote row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum EntitySnapshot {
    Project(ProjectMeta),
    Task(Task),
    Connection(Connection),
}

impl EntitySnapshot {
    /// Entity kind
    #[inline]
    #[must_use]
    pub fn entity_type(&self) -> EntityType {
        match self {
            Self::Project(_) => EntityType::Project,
            Self::Task(_) => EntityType::Task,
            Self::Connection(_) => EntityType::Connection,
        }
    }

    /// Set the soft-delete marker
    #[must_use]
    pub fn mark_deleted(mut self, at: DateTime<Utc>) -> Self {
        match &mut self {
            Self::Project(p) => p.deleted_at = Some(at),
            Self::Task(t) => t.deleted_at = Some(at),
            Self::Connection(c) => c.deleted_at = Some(at),
        }
        self
    }

    /// Ids this entity depends on being present remotely first
    #[must_use]
    pub fn dependencies(&self) -> Vec<&EntityId> {
        match self {
            Self::Project(_) => Vec::new(),
            Self::Task(t) => t.parent_id.iter().collect(),
            Self::Connection(c) => vec![&c.source, &c.target],
        }
    }
}

impl Entity for EntitySnapshot {
    fn id(&self) -> &EntityId {
        match self {
            Self::Project(p) => &p.id,
            Self::Task(t) => &t.id,
            Self::Connection(c) => &c.id,
        }
    }

    fn updated_at(&self) -> DateTime<Utc> {
        match self {
            Self::Project(p) => p.updated_at,
            Self::Task(t) => t.updated_at,
            Self::Connection(c) => c.updated_at,
        }
    }

    fn deleted_at(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Project(p) => p.deleted_at,
            Self::Task(t) => t.deleted_at,
            Self::Connection(c) => c.deleted_at,
        }
    }
}

impl From<ProjectMeta> for EntitySnapshot {
    fn from(value: ProjectMeta) -> Self {
        Self::Project(value)
    }
}

impl From<Task> for EntitySnapshot {
    fn from(value: Task) -> Self {
        Self::Task(value)
    }
}

impl From<Connection> for EntitySnapshot {
    fn from(value: Connection) -> Self {
        Self::Connection(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topo_rank_orders_parents_first() {
        let mut kinds = vec![EntityType::Connection, EntityType::Project, EntityType::Task];
        kinds.sort_by_key(|k| k.topo_rank());
        assert_eq!(
            kinds,
            vec![EntityType::Project, EntityType::Task, EntityType::Connection]
        );
    }

    #[test]
    fn snapshot_tagged_serialization() {
        let snapshot = EntitySnapshot::from(Task::new("t1", "write tests", Utc::now()));
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["kind"], "task");
        assert_eq!(json["data"]["id"], "t1");

        let back: EntitySnapshot = serde_json::from_value(json).unwrap();
        assert_eq!(back, snapshot);
    }

    #[test]
    fn mark_deleted_sets_marker() {
        let now = Utc::now();
        let snapshot = EntitySnapshot::from(Connection::new("c1", "t1", "t2", now)).mark_deleted(now);
        assert!(snapshot.is_soft_deleted());
        assert_eq!(snapshot.entity_type(), EntityType::Connection);
    }

    #[test]
    fn connection_depends_on_both_ends() {
        let snapshot = EntitySnapshot::from(Connection::new("c1", "t1", "t2", Utc::now()));
        let deps: Vec<&str> = snapshot.dependencies().into_iter().map(EntityId::as_str).collect();
        assert_eq!(deps, vec!["t1", "t2"]);
    }
}
