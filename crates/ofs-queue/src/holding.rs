//! Holding area for mutations the remote refused
//!
//! A mutation rejected for permission, strict-mode conflict or validation
//! reasons is never silently dropped: it is moved here, persisted under its
//! own key, and kept until the user releases (re-queues) or discards it.

use crate::error::QueueError;
use crate::item::MutationQueueItem;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use ofs_model::MutationId;
use ofs_store::TieredStore;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Why a mutation was held
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HoldReason {
    PermissionDenied,
    ConflictRejected,
    Validation,
}

impl fmt::Display for HoldReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::PermissionDenied => "permission-denied",
            Self::ConflictRejected => "conflict-rejected",
            Self::Validation => "validation",
        };
        f.write_str(s)
    }
}

/// A refused mutation awaiting a user decision
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HeldMutation {
    pub item: MutationQueueItem,
    pub reason: HoldReason,
    /// Error text from the failed attempt
    pub message: String,
    pub held_at: DateTime<Utc>,
}

/// Durable list of held mutations
pub struct HoldingArea {
    key: String,
    store: Arc<TieredStore>,
    held: Mutex<IndexMap<MutationId, HeldMutation>>,
    persist_lock: tokio::sync::Mutex<()>,
}

impl fmt::Debug for HoldingArea {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HoldingArea")
            .field("key", &self.key)
            .field("held", &self.held.lock().len())
            .finish()
    }
}

impl HoldingArea {
    #[must_use]
    pub fn new(key: impl Into<String>, store: Arc<TieredStore>) -> Self {
        Self {
            key: key.into(),
            store,
            held: Mutex::new(IndexMap::new()),
            persist_lock: tokio::sync::Mutex::new(()),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.held.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.held.lock().is_empty()
    }

    /// Held mutations, oldest first
    #[must_use]
    pub fn list(&self) -> Vec<HeldMutation> {
        self.held.lock().values().cloned().collect()
    }

    /// Move a mutation into the holding area
    pub async fn hold(&self, item: MutationQueueItem, reason: HoldReason, message: impl Into<String>) {
        let message = message.into();
        warn!(
            mutation = %item.id,
            entity_id = %item.entity_id(),
            %reason,
            %message,
            "mutation moved to holding area"
        );
        let held = HeldMutation {
            item,
            reason,
            message,
            held_at: Utc::now(),
        };
        self.held.lock().insert(held.item.id, held);
        self.persist().await;
    }

    /// Take a mutation back out for re-queueing, with its retry count reset
    pub async fn release(&self, id: MutationId) -> Option<MutationQueueItem> {
        let released = self.held.lock().shift_remove(&id);
        let mut item = released?.item;
        item.retry_count = 0;
        info!(mutation = %id, entity_id = %item.entity_id(), "released held mutation");
        self.persist().await;
        Some(item)
    }

    /// Drop a held mutation for good
    pub async fn discard(&self, id: MutationId) -> bool {
        let removed = self.held.lock().shift_remove(&id).is_some();
        if removed {
            info!(mutation = %id, "discarded held mutation");
            self.persist().await;
        }
        removed
    }

    pub async fn clear(&self) {
        self.held.lock().clear();
        self.persist().await;
    }

    /// Restore persisted held mutations; returns how many were loaded
    pub async fn load(&self) -> usize {
        match self.read().await {
            Ok(entries) => {
                let mut held = self.held.lock();
                for entry in entries {
                    held.insert(entry.item.id, entry);
                }
                held.len()
            }
            Err(e) => {
                error!(error = %e, "failed to restore holding area");
                0
            }
        }
    }

    async fn read(&self) -> Result<Vec<HeldMutation>, QueueError> {
        match self.store.read(&self.key).await? {
            Some(raw) => Ok(serde_json::from_str(&raw)?),
            None => Ok(Vec::new()),
        }
    }

    async fn persist(&self) {
        let _guard = self.persist_lock.lock().await;
        let entries = self.list();
        let result = match serde_json::to_string(&entries) {
            Ok(payload) => self.store.write(&self.key, &payload).await.map(|_| ()).map_err(QueueError::from),
            Err(e) => Err(QueueError::from(e)),
        };
        if let Err(e) = result {
            error!(error = %e, "failed to persist holding area");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_model::{Operation, ScopeId, Task};
    use ofs_store::MemoryStore;

    fn store() -> Arc<TieredStore> {
        Arc::new(TieredStore::secondary_only(Arc::new(MemoryStore::new("mem"))))
    }

    fn item(id: &str) -> MutationQueueItem {
        let mut item = MutationQueueItem::new(
            Operation::Upsert,
            Task::new(id, id, Utc::now()).into(),
            Some(ScopeId::new("p1")),
            Utc::now(),
        );
        item.retry_count = 3;
        item
    }

    #[tokio::test]
    async fn hold_release_discard() {
        let area = HoldingArea::new("holding", store());
        let a = item("a");
        let b = item("b");
        let (a_id, b_id) = (a.id, b.id);

        area.hold(a, HoldReason::PermissionDenied, "403").await;
        area.hold(b, HoldReason::Validation, "title too long").await;
        assert_eq!(area.len(), 2);

        let released = area.release(a_id).await.unwrap();
        assert_eq!(released.retry_count, 0);
        assert!(area.release(a_id).await.is_none());

        assert!(area.discard(b_id).await);
        assert!(area.is_empty());
    }

    #[tokio::test]
    async fn persisted_across_restart() {
        let store = store();
        let area = HoldingArea::new("holding", Arc::clone(&store));
        area.hold(item("a"), HoldReason::ConflictRejected, "remote newer").await;

        let reopened = HoldingArea::new("holding", store);
        assert_eq!(reopened.load().await, 1);
        assert_eq!(reopened.list()[0].reason, HoldReason::ConflictRejected);
    }
}
