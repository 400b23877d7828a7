//! Optimistic state manager
//!
//! Each snapshot is a value copy of the live state taken before a tentative
//! edit. Copies are O(1) because the state is built on persistent maps.
//!
//! ```text
//! Created --commit--> (discarded)
//! Created --rollback--> (state restored, discarded)
//! Created --evicted--> (discarded, state untouched)
//! ```
//!
//! A snapshot leaves the manager on its first transition, so a second commit
//! or rollback of the same id is a no-op.

use crate::error::{ActionError, OptimisticError};
use indexmap::IndexMap;
use ofs_model::{
    EntityId, EntityType, LocalState, Notice, Notifier, OptimisticConfig, RemoteError,
    SnapshotId, StateError, StateHandle,
};
use parking_lot::Mutex;
use std::future::Future;
use std::sync::{Arc, Weak};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Pre-edit copy of the live state
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub id: SnapshotId,
    pub kind: EntityType,
    pub label: String,
    pub state: LocalState,
    pub active_project_id: Option<EntityId>,
    pub created_at: Instant,
}

/// Describes an optimistic action for logs and notices
#[derive(Debug, Clone)]
pub struct ActionMeta {
    pub kind: EntityType,
    pub label: String,
    pub show_notice: bool,
}

impl ActionMeta {
    #[must_use]
    pub fn new(kind: EntityType, label: impl Into<String>) -> Self {
        Self {
            kind,
            label: label.into(),
            show_notice: true,
        }
    }

    #[inline]
    #[must_use]
    pub fn with_notice(mut self, show_notice: bool) -> Self {
        self.show_notice = show_notice;
        self
    }
}

/// Result of [`OptimisticStateManager::run_optimistic_action`]
#[derive(Debug, Clone, PartialEq)]
pub enum ActionOutcome<T> {
    Committed(T),
    Failed { error: ActionError, rolled_back: bool },
}

impl<T> ActionOutcome<T> {
    #[must_use]
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Committed(_))
    }

    #[must_use]
    pub fn rolled_back(&self) -> bool {
        matches!(self, Self::Failed { rolled_back: true, .. })
    }

    /// Convert into a `Result`
    ///
    /// # Errors
    /// [`OptimisticError`] carrying the failure and whether it was rolled back.
    pub fn into_result(self) -> Result<T, OptimisticError> {
        match self {
            Self::Committed(value) => Ok(value),
            Self::Failed { error, rolled_back } => Err(OptimisticError {
                source: error,
                rolled_back,
            }),
        }
    }
}

/// Owns snapshots of the live state and applies commit or rollback
pub struct OptimisticStateManager {
    config: OptimisticConfig,
    state: StateHandle,
    notifier: Arc<dyn Notifier>,
    snapshots: Mutex<IndexMap<SnapshotId, Snapshot>>,
}

impl std::fmt::Debug for OptimisticStateManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OptimisticStateManager")
            .field("config", &self.config)
            .field("snapshots", &self.snapshots.lock().len())
            .finish_non_exhaustive()
    }
}

impl OptimisticStateManager {
    #[must_use]
    pub fn new(config: OptimisticConfig, state: StateHandle, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            state,
            notifier,
            snapshots: Mutex::new(IndexMap::new()),
        }
    }

    #[must_use]
    pub fn state(&self) -> &StateHandle {
        &self.state
    }

    /// Snapshots not yet committed, rolled back or evicted
    #[must_use]
    pub fn pending(&self) -> usize {
        self.snapshots.lock().len()
    }

    #[must_use]
    pub fn contains(&self, id: SnapshotId) -> bool {
        self.snapshots.lock().contains_key(&id)
    }

    /// Copy the live state before an edit
    pub fn create_snapshot(&self, kind: EntityType, label: impl Into<String>) -> SnapshotId {
        let current = self.state.current();
        let snapshot = Snapshot {
            id: SnapshotId::new(),
            kind,
            label: label.into(),
            active_project_id: current.active_project_id.clone(),
            state: current,
            created_at: Instant::now(),
        };
        let id = snapshot.id;
        let mut snapshots = self.snapshots.lock();
        debug!(snapshot = %id, %kind, label = %snapshot.label, "snapshot created");
        snapshots.insert(id, snapshot);
        let max = self.config.max_snapshots.max(1);
        while snapshots.len() > max {
            if let Some((old, dropped)) = snapshots.shift_remove_index(0) {
                warn!(snapshot = %old, label = %dropped.label, "snapshot bound exceeded, evicted oldest");
            }
        }
        id
    }

    /// Discard a snapshot after success; unknown ids are ignored
    pub fn commit_snapshot(&self, id: SnapshotId) {
        if let Some(snapshot) = self.snapshots.lock().shift_remove(&id) {
            debug!(snapshot = %id, label = %snapshot.label, "snapshot committed");
        }
    }

    /// Restore the live state from a snapshot
    ///
    /// Returns whether a rollback happened.
    pub fn rollback_snapshot(&self, id: SnapshotId, show_notice: bool) -> bool {
        self.rollback_with_reason(id, show_notice, "change could not be saved")
    }

    fn rollback_with_reason(&self, id: SnapshotId, show_notice: bool, reason: &str) -> bool {
        let Some(snapshot) = self.snapshots.lock().shift_remove(&id) else {
            return false;
        };
        let Snapshot {
            label,
            state,
            active_project_id,
            ..
        } = snapshot;
        self.state.update(|live| {
            *live = state;
            live.active_project_id = active_project_id;
        });
        info!(snapshot = %id, %label, reason, "optimistic change rolled back");
        if show_notice {
            self.notifier.notify(Notice::RolledBack {
                label,
                reason: reason.to_string(),
            });
        }
        true
    }

    /// Snapshot, apply locally, await the remote, then commit or roll back
    ///
    /// - `apply` fails: the snapshot is discarded and the state is unchanged
    /// - `remote` fails: the snapshot is restored
    /// - both succeed: the snapshot is committed
    pub async fn run_optimistic_action<T, A, R, Fut>(
        &self,
        meta: ActionMeta,
        apply: A,
        remote: R,
    ) -> ActionOutcome<T>
    where
        A: FnOnce(&mut LocalState) -> Result<(), StateError>,
        R: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, RemoteError>>,
    {
        let id = self.create_snapshot(meta.kind, meta.label.clone());

        if let Err(e) = self.state.try_update(apply) {
            self.commit_snapshot(id);
            debug!(label = %meta.label, error = %e, "optimistic apply failed");
            return ActionOutcome::Failed {
                error: ActionError::Apply(e),
                rolled_back: false,
            };
        }

        match remote().await {
            Ok(value) => {
                self.commit_snapshot(id);
                ActionOutcome::Committed(value)
            }
            Err(e) => {
                let rolled_back = self.rollback_with_reason(id, meta.show_notice, &e.to_string());
                ActionOutcome::Failed {
                    error: ActionError::Remote(e),
                    rolled_back,
                }
            }
        }
    }

    /// Drop snapshots past their max age, without rollback
    pub fn evict_stale(&self) -> usize {
        let max_age = self.config.max_age();
        let now = Instant::now();
        let mut snapshots = self.snapshots.lock();
        let before = snapshots.len();
        snapshots.retain(|id, snap| {
            let keep = now.saturating_duration_since(snap.created_at) < max_age;
            if !keep {
                debug!(snapshot = %id, label = %snap.label, "stale snapshot evicted");
            }
            keep
        });
        before - snapshots.len()
    }

    /// Periodic [`evict_stale`](Self::evict_stale); stops once the manager
    /// is dropped
    pub fn spawn_eviction_task(self: &Arc<Self>) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        let period = self.config.eviction_interval();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await;
            loop {
                interval.tick().await;
                let Some(manager) = weak.upgrade() else {
                    break;
                };
                let evicted = manager.evict_stale();
                if evicted > 0 {
                    debug!(evicted, "snapshot eviction pass");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ofs_model::{CollectingNotifier, EntitySnapshot, ScopeId, TransientKind};
    use ofs_test_utils::{scope, state_handle_with_project, task_snapshot};
    use pretty_assertions::assert_eq;
    use std::time::Duration;

    fn manager(notifier: &CollectingNotifier) -> OptimisticStateManager {
        OptimisticStateManager::new(
            OptimisticConfig::default(),
            state_handle_with_project("p1", 2),
            Arc::new(notifier.clone()),
        )
    }

    fn add_task(id: &'static str) -> impl FnOnce(&mut LocalState) -> Result<(), StateError> {
        move |s| s.upsert(&scope("p1"), task_snapshot(id))
    }

    #[tokio::test]
    async fn remote_failure_restores_previous_state() {
        let notifier = CollectingNotifier::new();
        let m = manager(&notifier);
        let before = m.state().current();

        let outcome: ActionOutcome<()> = m
            .run_optimistic_action(ActionMeta::new(EntityType::Task, "add task"), add_task("t9"), || async {
                Err(RemoteError::transient(TransientKind::Network, "offline"))
            })
            .await;

        assert!(!outcome.is_success());
        assert!(outcome.rolled_back());
        assert_eq!(m.state().current(), before);
        assert_eq!(m.pending(), 0);
        assert!(matches!(notifier.take().as_slice(), [Notice::RolledBack { .. }]));
    }

    #[tokio::test]
    async fn success_commits_and_keeps_edit() {
        let notifier = CollectingNotifier::new();
        let m = manager(&notifier);

        let outcome = m
            .run_optimistic_action(ActionMeta::new(EntityType::Task, "add task"), add_task("t9"), || async {
                Ok::<_, RemoteError>(7)
            })
            .await;

        assert_eq!(outcome, ActionOutcome::Committed(7));
        assert!(m.state().current().task(&scope("p1"), &EntityId::new("t9")).is_some());
        assert_eq!(m.pending(), 0);
        assert!(notifier.notices().is_empty());
    }

    #[tokio::test]
    async fn apply_failure_discards_snapshot_without_rollback() {
        let notifier = CollectingNotifier::new();
        let m = manager(&notifier);
        let before = m.state().current();

        let outcome: ActionOutcome<()> = m
            .run_optimistic_action(
                ActionMeta::new(EntityType::Task, "edit"),
                |s| s.upsert(&ScopeId::new("missing"), task_snapshot("t1")),
                || async { Ok(()) },
            )
            .await;

        assert!(matches!(
            outcome,
            ActionOutcome::Failed { error: ActionError::Apply(_), rolled_back: false }
        ));
        assert_eq!(m.state().current(), before);
        assert_eq!(m.pending(), 0);
    }

    #[test]
    fn second_rollback_is_a_no_op() {
        let notifier = CollectingNotifier::new();
        let m = manager(&notifier);
        let id = m.create_snapshot(EntityType::Task, "edit");
        m.state()
            .update(|s| s.upsert(&scope("p1"), EntitySnapshot::Task(ofs_test_utils::task("t5"))))
            .unwrap();

        assert!(m.rollback_snapshot(id, false));
        assert!(!m.rollback_snapshot(id, false));
        m.commit_snapshot(id);
        assert!(notifier.notices().is_empty());
    }

    #[test]
    fn count_bound_evicts_oldest() {
        let notifier = CollectingNotifier::new();
        let m = OptimisticStateManager::new(
            OptimisticConfig {
                max_snapshots: 2,
                ..OptimisticConfig::default()
            },
            state_handle_with_project("p1", 1),
            Arc::new(notifier),
        );
        let first = m.create_snapshot(EntityType::Task, "a");
        let second = m.create_snapshot(EntityType::Task, "b");
        let third = m.create_snapshot(EntityType::Task, "c");

        assert!(!m.contains(first));
        assert!(m.contains(second) && m.contains(third));
    }

    #[tokio::test(start_paused = true)]
    async fn stale_snapshots_are_evicted_in_background() {
        let notifier = CollectingNotifier::new();
        let m = Arc::new(manager(&notifier));
        let id = m.create_snapshot(EntityType::Task, "slow edit");
        m.state()
            .update(|s| s.upsert(&scope("p1"), task_snapshot("t7")))
            .unwrap();
        let edited = m.state().current();

        let task = m.spawn_eviction_task();
        tokio::time::sleep(Duration::from_secs(75)).await;

        assert!(!m.contains(id));
        // eviction never rolls back
        assert_eq!(m.state().current(), edited);

        drop(m);
        tokio::time::sleep(Duration::from_secs(20)).await;
        assert!(task.is_finished());
    }
}
