//! User-facing notices
//!
//! The core never renders UI. Anything the user must see is handed to a
//! [`Notifier`], which the host application wires to its toast/modal layer.

use crate::entity::EntityType;
use crate::ids::{EntityId, MutationId, ScopeId};
use parking_lot::Mutex;
use std::sync::Arc;

/// Something the user should be told about
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    /// An optimistic edit was undone because the remote rejected it
    RolledBack { label: String, reason: String },
    /// Mutation queue is filling up while offline
    QueueCapacity { percent: u8, len: usize, capacity: usize },
    /// Remote refused a mutation; it was moved to the holding area
    PermissionDenied {
        mutation: MutationId,
        entity_type: EntityType,
        entity_id: EntityId,
        message: String,
    },
    /// Strict conflict mode rejected a stale edit; refresh and reapply
    ConflictRejected {
        mutation: MutationId,
        entity_type: EntityType,
        entity_id: EntityId,
    },
    /// Last-writer-wins overwrote a newer remote row
    ConflictOverwritten {
        entity_type: EntityType,
        entity_id: EntityId,
    },
    /// Remote rejected a payload as invalid
    ValidationFailed {
        entity_type: EntityType,
        entity_id: EntityId,
        message: String,
    },
    /// Scope disappeared or was unshared
    ScopeInaccessible { scope: ScopeId },
    /// Remote has been failing long enough for the breaker to open
    CircuitOpen { retry_after_ms: u64 },
}

/// Sink for user-facing notices
pub trait Notifier: Send + Sync {
    /// Deliver a notice; must not block
    fn notify(&self, notice: Notice);
}

/// Logs notices through `tracing`
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        match &notice {
            Notice::QueueCapacity { .. } | Notice::CircuitOpen { .. } => {
                tracing::warn!(?notice, "user notice");
            }
            Notice::PermissionDenied { .. } | Notice::ConflictRejected { .. } => {
                tracing::error!(?notice, "user notice");
            }
            _ => tracing::info!(?notice, "user notice"),
        }
    }
}

/// Records notices in memory
#[derive(Debug, Clone, Default)]
pub struct CollectingNotifier {
    inner: Arc<Mutex<Vec<Notice>>>,
}

impl CollectingNotifier {
    /// Empty collector
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Notices received so far
    #[must_use]
    pub fn notices(&self) -> Vec<Notice> {
        self.inner.lock().clone()
    }

    /// Drain received notices
    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.inner.lock())
    }
}

impl Notifier for CollectingNotifier {
    fn notify(&self, notice: Notice) {
        self.inner.lock().push(notice);
    }
}
