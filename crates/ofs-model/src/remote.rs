//! Contract of the authoritative remote store
//!
//! The remote is an opaque RPC service. Only the operations below are used,
//! and every one of them reports failure as a typed [`RemoteError`].

use crate::entity::{EntitySnapshot, EntityType, ProjectMeta};
use crate::error::RemoteError;
use crate::ids::{EntityId, ScopeId};
use crate::watermark::Watermark;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One-round-trip payload for a whole scope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeData {
    /// The scope entity itself
    pub entity: ProjectMeta,
    /// Tasks and connections, possibly including soft-deleted rows
    pub children: Vec<EntitySnapshot>,
    /// Ids recorded in the remote deletion ledger for this scope
    pub tombstones: Vec<EntityId>,
}

/// Head of a scope as listed by the change feed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeHead {
    pub id: ScopeId,
    pub updated_at: DateTime<Utc>,
    pub version: u64,
}

/// Accessibility probe for a single scope
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScopeProbe {
    pub accessible: bool,
    pub watermark: Option<Watermark>,
}

/// Combined answer for app resume: is the active scope still there, and did
/// anything change anywhere
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeProbe {
    pub active: ScopeProbe,
    pub domain_watermark: Option<Watermark>,
}

/// How an upsert treats the remote row version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    /// Fail with `VersionConflict` when the remote row is newer
    #[default]
    Checked,
    /// Last writer wins
    Overwrite,
}

/// Acknowledgement of a durable remote write
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteAck {
    pub version: u64,
    pub updated_at: DateTime<Utc>,
}

/// Remote RPC surface consumed by the orchestrator, ledger and dispatcher
#[async_trait]
pub trait RemoteApi: Send + Sync {
    /// Entity, children and tombstones of a scope in one call
    async fn get_full_scope_data(&self, scope: &ScopeId) -> Result<ScopeData, RemoteError>;

    /// Scope metadata only
    async fn get_scope_meta(&self, scope: &ScopeId) -> Result<ProjectMeta, RemoteError>;

    /// Children of a scope
    async fn list_scope_children(&self, scope: &ScopeId) -> Result<Vec<EntitySnapshot>, RemoteError>;

    /// Remote deletion ledger for a scope
    async fn list_scope_tombstones(&self, scope: &ScopeId) -> Result<Vec<EntityId>, RemoteError>;

    /// Current watermark of a scope, `None` if the scope has never been written
    async fn get_scope_watermark(&self, scope: &ScopeId) -> Result<Option<Watermark>, RemoteError>;

    /// Cross-scope aggregate watermark
    async fn get_domain_watermark(&self) -> Result<Option<Watermark>, RemoteError>;

    /// Scopes whose head moved after `since`
    async fn list_scope_heads_since(&self, since: Watermark) -> Result<Vec<ScopeHead>, RemoteError>;

    /// Whether the scope is still accessible, and its watermark
    async fn get_accessible_scope_probe(&self, scope: &ScopeId) -> Result<ScopeProbe, RemoteError>;

    /// Composite resume probe.
    ///
    /// The default issues two calls; remotes with a combined endpoint should
    /// override it to keep resume at one round trip.
    async fn resume_probe(&self, active: &ScopeId) -> Result<ResumeProbe, RemoteError> {
        let active = self.get_accessible_scope_probe(active).await?;
        let domain_watermark = self.get_domain_watermark().await?;
        Ok(ResumeProbe {
            active,
            domain_watermark,
        })
    }

    /// Create or update an entity inside `scope`
    async fn upsert_entity(
        &self,
        scope: &ScopeId,
        payload: &EntitySnapshot,
        mode: WriteMode,
    ) -> Result<WriteAck, RemoteError>;

    /// Soft delete an entity and record it in the deletion ledger
    async fn delete_entity(
        &self,
        scope: &ScopeId,
        kind: EntityType,
        id: &EntityId,
    ) -> Result<WriteAck, RemoteError>;
}
