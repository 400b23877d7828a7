//! Queue item

use chrono::{DateTime, Utc};
use ofs_model::{Entity, EntityId, EntitySnapshot, EntityType, MutationId, Operation, ScopeId};
use serde::{Deserialize, Serialize};

/// Dedup key: at most one queued item per entity
pub type QueueKey = (EntityType, EntityId);

/// One pending remote write
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationQueueItem {
    pub id: MutationId,
    pub entity_type: EntityType,
    pub operation: Operation,
    pub payload: EntitySnapshot,
    /// Scope the entity lives in; `None` for scope entities themselves
    #[serde(default)]
    pub parent_id: Option<ScopeId>,
    #[serde(default)]
    pub retry_count: u32,
    pub created_at: DateTime<Utc>,
}

impl MutationQueueItem {
    #[must_use]
    pub fn new(
        operation: Operation,
        payload: EntitySnapshot,
        parent_id: Option<ScopeId>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: MutationId::new(),
            entity_type: payload.entity_type(),
            operation,
            payload,
            parent_id,
            retry_count: 0,
            created_at,
        }
    }

    #[inline]
    #[must_use]
    pub fn entity_id(&self) -> &EntityId {
        self.payload.id()
    }

    #[inline]
    #[must_use]
    pub fn key(&self) -> QueueKey {
        (self.entity_type, self.payload.id().clone())
    }

    /// Scope the remote call targets
    #[must_use]
    pub fn scope(&self) -> ScopeId {
        self.parent_id
            .clone()
            .unwrap_or_else(|| ScopeId::from(self.payload.id()))
    }

    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration, max_retries: u32) -> bool {
        now.signed_duration_since(self.created_at) > max_age || self.retry_count > max_retries
    }
}
