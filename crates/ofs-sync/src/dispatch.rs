//! Mutation dispatcher
//!
//! Drains the durable queue against the remote, one item at a time in
//! topological order. Every item walks a small state machine:
//!
//! ```text
//! Idle -> Dispatching -> Succeeded
//!                     -> Retrying -> Dispatching   (conflict re-send)
//!                     -> Failed
//! Idle -> Retrying                                 (deferred behind a failed parent)
//! ```
//!
//! Only one drain runs at a time; a concurrent call returns a skipped
//! report.

use chrono::Utc;
use ofs_model::{
    ConflictConfig, ConflictStrategy, Entity, EntityId, EntityType, Notice, Notifier, Operation,
    RemoteError, ScopeId, WriteAck, WriteMode,
};
use ofs_queue::{CapacityLevel, HoldReason, HoldingArea, MutationQueue, MutationQueueItem};
use ofs_resilience::{CircuitStatus, Priority, ResilientClient};
use ofs_tombstone::TombstoneLedger;
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// Per-item dispatch state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DispatchState {
    Idle,
    Dispatching,
    Succeeded,
    Retrying,
    Failed,
}

impl fmt::Display for DispatchState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Dispatching => "dispatching",
            Self::Succeeded => "succeeded",
            Self::Retrying => "retrying",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// Rejected state change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("illegal dispatch transition {from} -> {to}")]
pub struct IllegalTransition {
    pub from: DispatchState,
    pub to: DispatchState,
}

/// Validates a state transition
///
/// # Errors
/// [`IllegalTransition`] when `to` is not reachable from `from`.
pub fn validate_transition(from: DispatchState, to: DispatchState) -> Result<(), IllegalTransition> {
    if allowed_transitions(from).contains(&to) {
        Ok(())
    } else {
        Err(IllegalTransition { from, to })
    }
}

/// States reachable from `from`
#[must_use]
pub fn allowed_transitions(from: DispatchState) -> Vec<DispatchState> {
    use DispatchState::{Dispatching, Failed, Idle, Retrying, Succeeded};
    match from {
        Idle => vec![Dispatching, Retrying],
        Dispatching => vec![Succeeded, Retrying, Failed],
        Retrying => vec![Dispatching],
        Succeeded | Failed => vec![],
    }
}

#[derive(Debug)]
struct Tracker {
    state: DispatchState,
}

impl Tracker {
    fn new() -> Self {
        Self {
            state: DispatchState::Idle,
        }
    }

    fn go(&mut self, to: DispatchState) {
        match validate_transition(self.state, to) {
            Ok(()) => self.state = to,
            Err(e) => error!(error = %e, "ignoring illegal dispatch transition"),
        }
    }
}

/// How one queued mutation ended this drain
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    Succeeded,
    /// Sent with last-writer-wins after a version conflict
    Overwritten,
    /// Remote copy was newer; the local mutation was dropped
    Superseded,
    /// Transient failure or open circuit; back in the queue
    Retrying,
    /// Parent failed earlier in this drain; back in the queue untried
    Deferred,
    /// Moved to the holding area
    Held(HoldReason),
    /// Scope is gone; dropped
    Dropped,
}

impl DispatchOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Succeeded => "succeeded",
            Self::Overwritten => "overwritten",
            Self::Superseded => "superseded",
            Self::Retrying => "retrying",
            Self::Deferred => "deferred",
            Self::Held(HoldReason::PermissionDenied) => "held_permission",
            Self::Held(HoldReason::ConflictRejected) => "held_conflict",
            Self::Held(HoldReason::Validation) => "held_validation",
            Self::Dropped => "dropped",
        }
    }

    /// Whether the mutation left the queue for a reason the user must act on
    #[must_use]
    pub fn is_rejection(self) -> bool {
        matches!(self, Self::Held(_) | Self::Dropped)
    }
}

/// Summary of one drain
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrainReport {
    /// Another drain was already running
    pub skipped: bool,
    /// Items removed for age or retry count before dispatch
    pub expired: usize,
    pub attempted: usize,
    pub succeeded: usize,
    /// Succeeded while the remote held a newer edit (last write wins)
    pub overwritten: usize,
    /// Skipped because a newer local edit replaced the item
    pub superseded: usize,
    pub retrying: usize,
    /// Left queued because the breaker was open
    pub deferred: usize,
    /// Moved to the holding area
    pub held: usize,
    pub dropped: usize,
    /// Queue crossed the near-full threshold after the drain
    pub force_requested: bool,
    /// Per-item result in dispatch order
    pub outcomes: Vec<((EntityType, EntityId), DispatchOutcome)>,
}

impl DrainReport {
    /// Report for a drain that did not run
    #[must_use]
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Outcome of the mutation for one entity, if it was part of this drain
    #[must_use]
    pub fn outcome_for(&self, kind: EntityType, id: &EntityId) -> Option<DispatchOutcome> {
        self.outcomes
            .iter()
            .rev()
            .find(|((k, i), _)| *k == kind && i == id)
            .map(|(_, outcome)| *outcome)
    }

    /// Fold a follow-up drain into this report
    pub fn absorb(&mut self, next: Self) {
        self.expired += next.expired;
        self.attempted += next.attempted;
        self.succeeded += next.succeeded;
        self.overwritten += next.overwritten;
        self.superseded += next.superseded;
        self.retrying += next.retrying;
        self.deferred += next.deferred;
        self.held += next.held;
        self.dropped += next.dropped;
        self.force_requested = next.force_requested;
        self.outcomes.extend(next.outcomes);
    }

    fn record(&mut self, item: &MutationQueueItem, outcome: DispatchOutcome) {
        match outcome {
            DispatchOutcome::Succeeded => self.succeeded += 1,
            DispatchOutcome::Overwritten => self.overwritten += 1,
            DispatchOutcome::Superseded => self.superseded += 1,
            DispatchOutcome::Retrying => self.retrying += 1,
            DispatchOutcome::Deferred => self.deferred += 1,
            DispatchOutcome::Held(_) => self.held += 1,
            DispatchOutcome::Dropped => self.dropped += 1,
        }
        metrics::counter!("ofs_dispatch_outcomes_total", "outcome" => outcome.label()).increment(1);
        self.outcomes.push((item.key(), outcome));
    }
}

struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Sends queued mutations and settles each one
pub struct MutationDispatcher {
    client: ResilientClient,
    queue: Arc<MutationQueue>,
    holding: Arc<HoldingArea>,
    ledger: Arc<TombstoneLedger>,
    conflict: ConflictConfig,
    notifier: Arc<dyn Notifier>,
    draining: AtomicBool,
    stale_scopes: Mutex<BTreeSet<ScopeId>>,
}

impl fmt::Debug for MutationDispatcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationDispatcher")
            .field("conflict", &self.conflict)
            .field("draining", &self.draining.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl MutationDispatcher {
    #[must_use]
    pub fn new(
        client: ResilientClient,
        queue: Arc<MutationQueue>,
        holding: Arc<HoldingArea>,
        ledger: Arc<TombstoneLedger>,
        conflict: ConflictConfig,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            client,
            queue,
            holding,
            ledger,
            conflict,
            notifier,
            draining: AtomicBool::new(false),
            stale_scopes: Mutex::new(BTreeSet::new()),
        }
    }

    #[must_use]
    pub fn is_draining(&self) -> bool {
        self.draining.load(Ordering::Acquire)
    }

    /// Scopes whose local copy is known to be behind the remote after a
    /// drain; cleared by this call
    pub fn take_stale_scopes(&self) -> Vec<ScopeId> {
        std::mem::take(&mut *self.stale_scopes.lock()).into_iter().collect()
    }

    /// Send everything queued
    pub async fn drain(&self) -> DrainReport {
        if self.draining.swap(true, Ordering::AcqRel) {
            debug!("drain already running, skipping");
            return DrainReport::skipped();
        }
        let _guard = DrainGuard(&self.draining);

        let mut report = DrainReport {
            expired: self.queue.clean_expired().await,
            ..DrainReport::default()
        };
        let items = self.queue.take_all();
        if !items.is_empty() {
            info!(count = items.len(), "draining mutation queue");
        }

        let mut failed: HashSet<EntityId> = HashSet::new();
        let mut put_back = Vec::new();
        for mut item in items {
            let mut tracker = Tracker::new();
            if self.blocked_by(&item, &failed) {
                tracker.go(DispatchState::Retrying);
                debug!(entity_id = %item.entity_id(), "parent failed in this drain, deferring");
                failed.insert(item.entity_id().clone());
                report.record(&item, DispatchOutcome::Deferred);
                put_back.push(item);
                continue;
            }

            report.attempted += 1;
            tracker.go(DispatchState::Dispatching);
            let result = self.send(&item, WriteMode::Checked).await;
            let outcome = match result {
                Ok(_) => {
                    tracker.go(DispatchState::Succeeded);
                    self.on_success(&item).await;
                    DispatchOutcome::Succeeded
                }
                Err(RemoteError::VersionConflict { remote_updated_at, .. }) => {
                    self.resolve_conflict(&mut item, remote_updated_at, &mut tracker)
                        .await
                }
                Err(e) => self.settle_failure(&mut item, e, &mut tracker).await,
            };

            match outcome {
                DispatchOutcome::Retrying => {
                    failed.insert(item.entity_id().clone());
                    report.record(&item, outcome);
                    put_back.push(item);
                }
                DispatchOutcome::Held(_) | DispatchOutcome::Dropped => {
                    failed.insert(item.entity_id().clone());
                    report.record(&item, outcome);
                }
                _ => report.record(&item, outcome),
            }
        }

        if !put_back.is_empty() {
            self.queue.put_back(put_back).await;
        }
        if report.retrying > 0 {
            self.notify_if_circuit_open();
        }
        report.force_requested = matches!(self.check_capacity(), CapacityLevel::ForceProcess { .. });
        if report.attempted > 0 {
            info!(
                succeeded = report.succeeded,
                retrying = report.retrying,
                deferred = report.deferred,
                held = report.held,
                "drain finished"
            );
        }
        report
    }

    fn blocked_by(&self, item: &MutationQueueItem, failed: &HashSet<EntityId>) -> bool {
        if failed.is_empty() {
            return false;
        }
        let scope_root = item
            .parent_id
            .as_ref()
            .map(|scope| EntityId::new(scope.as_str()));
        item.payload
            .dependencies()
            .into_iter()
            .chain(scope_root.as_ref())
            .any(|dep| failed.contains(dep))
    }

    async fn send(&self, item: &MutationQueueItem, mode: WriteMode) -> Result<WriteAck, RemoteError> {
        let scope = item.scope();
        match item.operation {
            Operation::Upsert => {
                let payload = item.payload.clone();
                self.client
                    .call_once(Priority::Express, move |remote| async move {
                        remote.upsert_entity(&scope, &payload, mode).await
                    })
                    .await
            }
            Operation::Delete => {
                let kind = item.entity_type;
                let id = item.entity_id().clone();
                self.client
                    .call_once(Priority::Express, move |remote| async move {
                        remote.delete_entity(&scope, kind, &id).await
                    })
                    .await
            }
        }
    }

    async fn on_success(&self, item: &MutationQueueItem) {
        self.queue.complete(item).await;
        if item.operation == Operation::Delete {
            let scope = item.scope();
            self.ledger
                .clear_local(&scope, std::slice::from_ref(item.entity_id()))
                .await;
            self.ledger.invalidate(&scope).await;
        }
        debug!(entity_id = %item.entity_id(), op = ?item.operation, "mutation confirmed");
    }

    async fn resolve_conflict(
        &self,
        item: &mut MutationQueueItem,
        remote_updated_at: chrono::DateTime<Utc>,
        tracker: &mut Tracker,
    ) -> DispatchOutcome {
        let strategy = self.conflict.strategy;
        if strategy == ConflictStrategy::Reject {
            tracker.go(DispatchState::Failed);
            self.hold(item, HoldReason::ConflictRejected, "remote copy is newer").await;
            self.notifier.notify(Notice::ConflictRejected {
                mutation: item.id,
                entity_type: item.entity_type,
                entity_id: item.entity_id().clone(),
            });
            return DispatchOutcome::Held(HoldReason::ConflictRejected);
        }

        let local_updated_at = item.payload.updated_at();
        let untrusted = remote_updated_at > Utc::now() + self.conflict.version_tolerance();
        if local_updated_at < remote_updated_at && !untrusted {
            tracker.go(DispatchState::Failed);
            info!(
                entity_id = %item.entity_id(),
                %local_updated_at,
                %remote_updated_at,
                "remote copy is newer, dropping local mutation"
            );
            self.queue.complete(item).await;
            self.stale_scopes.lock().insert(item.scope());
            return DispatchOutcome::Superseded;
        }

        tracker.go(DispatchState::Retrying);
        tracker.go(DispatchState::Dispatching);
        match self.send(item, WriteMode::Overwrite).await {
            Ok(_) => {
                tracker.go(DispatchState::Succeeded);
                self.on_success(item).await;
                if strategy == ConflictStrategy::WarnAndOverwrite {
                    warn!(entity_id = %item.entity_id(), untrusted, "overwrote remote copy");
                    self.notifier.notify(Notice::ConflictOverwritten {
                        entity_type: item.entity_type,
                        entity_id: item.entity_id().clone(),
                    });
                }
                DispatchOutcome::Overwritten
            }
            Err(e) => self.settle_failure(item, e, tracker).await,
        }
    }

    async fn settle_failure(
        &self,
        item: &mut MutationQueueItem,
        err: RemoteError,
        tracker: &mut Tracker,
    ) -> DispatchOutcome {
        match err {
            RemoteError::Transient { .. }
            | RemoteError::CircuitOpen { .. }
            | RemoteError::Overloaded(_) => {
                tracker.go(DispatchState::Retrying);
                // only failures that reached the remote use up a retry
                if err.reached_network() {
                    item.retry_count += 1;
                }
                debug!(
                    entity_id = %item.entity_id(),
                    retry_count = item.retry_count,
                    error = %err,
                    "mutation stays queued"
                );
                DispatchOutcome::Retrying
            }
            RemoteError::Permission(message) => {
                tracker.go(DispatchState::Failed);
                error!(entity_id = %item.entity_id(), %message, "remote refused mutation");
                self.hold(item, HoldReason::PermissionDenied, &message).await;
                self.notifier.notify(Notice::PermissionDenied {
                    mutation: item.id,
                    entity_type: item.entity_type,
                    entity_id: item.entity_id().clone(),
                    message,
                });
                DispatchOutcome::Held(HoldReason::PermissionDenied)
            }
            RemoteError::Validation(message) => {
                tracker.go(DispatchState::Failed);
                self.hold(item, HoldReason::Validation, &message).await;
                self.notifier.notify(Notice::ValidationFailed {
                    entity_type: item.entity_type,
                    entity_id: item.entity_id().clone(),
                    message,
                });
                DispatchOutcome::Held(HoldReason::Validation)
            }
            RemoteError::AccessDenied(_) => {
                tracker.go(DispatchState::Failed);
                let scope = item.scope();
                warn!(%scope, entity_id = %item.entity_id(), "scope gone, dropping mutation");
                self.queue.complete(item).await;
                self.stale_scopes.lock().insert(scope);
                DispatchOutcome::Dropped
            }
            RemoteError::VersionConflict { .. } => {
                // only a checked write can conflict; treat a repeat as a rejection
                tracker.go(DispatchState::Failed);
                self.hold(item, HoldReason::ConflictRejected, &err.to_string()).await;
                DispatchOutcome::Held(HoldReason::ConflictRejected)
            }
        }
    }

    async fn hold(&self, item: &MutationQueueItem, reason: HoldReason, message: &str) {
        self.holding.hold(item.clone(), reason, message).await;
        self.queue.complete(item).await;
    }

    fn notify_if_circuit_open(&self) {
        let state = self.client.breaker().state();
        if state.status != CircuitStatus::Open {
            return;
        }
        let remaining = state
            .opened_at
            .map_or(state.recovery, |at| state.recovery.saturating_sub(at.elapsed()));
        self.notifier.notify(Notice::CircuitOpen {
            retry_after_ms: u64::try_from(remaining.as_millis()).unwrap_or(u64::MAX),
        });
    }

    /// Report the queue fill level
    ///
    /// Above the warning threshold a [`Notice::QueueCapacity`] goes out (with
    /// cooldown). Near full the queue is also written synchronously to the
    /// secondary tier, and the notice is sent every time.
    pub fn check_capacity(&self) -> CapacityLevel {
        let len = self.queue.len();
        let capacity = self.queue.config().max_size;
        let notify = |percent| {
            self.notifier.notify(Notice::QueueCapacity {
                percent,
                len,
                capacity,
            });
        };
        self.queue.check_capacity_warning(&notify, |percent| {
            let flushed = self.queue.flush_on_teardown();
            warn!(percent, flushed, "mutation queue near full, flushed to secondary tier");
            notify(percent);
        })
    }
}
