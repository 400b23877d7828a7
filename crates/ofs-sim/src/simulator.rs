//! Offline sync simulator
//!
//! Drives a [`SyncEngine`] with seeded random edits while the in-memory
//! remote drops calls and goes offline. At the end the remote is healed, the
//! queue drained and every scope reloaded. Then two invariants are checked:
//!
//! - No lost mutation: every edit the engine accepted reached the remote and
//!   is visible locally
//! - No resurrection: nothing deleted locally shows up again, neither after
//!   an intermediate reload nor at the end

use chrono::Duration;
use ofs_model::{
    CollectingNotifier, Entity, EntityId, EntitySnapshot, Notifier, ProjectMeta, RemoteApi,
    ScopeId, SyncConfig, Task,
};
use ofs_store::{DurableStore, MemoryStore};
use ofs_sync::{Mutation, SyncEngine, SyncError};
use ofs_test_utils::{t0, MemoryRemote};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Tasks each scope starts with
const SEED_TASKS: usize = 3;
/// Drain rounds allowed after healing before the queue counts as stuck
const HEAL_ROUNDS: usize = 10;

/// Simulator configuration
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SimulatorConfig {
    /// Random seed for reproducibility
    pub seed: u64,
    /// Random operations to run
    pub steps: u64,
    /// Fraction of remote calls failing with a transient error
    pub failure_rate: f64,
    /// Scopes seeded on the remote
    pub scopes: usize,
    pub stop_on_first_violation: bool,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            seed: 42,
            steps: 200,
            failure_rate: 0.2,
            scopes: 3,
            stop_on_first_violation: false,
        }
    }
}

/// Engine settings suited to a fast simulation: no in-call retries, short
/// breaker window, and a retry budget the run cannot exhaust
#[must_use]
pub fn simulation_sync_config() -> SyncConfig {
    let mut config = SyncConfig::default();
    config.retry.max_retries = 0;
    config.retry.jitter = false;
    config.breaker.recovery_ms = 20;
    config.queue.max_retries = 10_000;
    config.orchestrator.autosave_debounce_ms = 20;
    config
}

/// One simulated step
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum SimulatedOperation {
    Edit { scope: ScopeId, id: EntityId },
    Create { scope: ScopeId, id: EntityId },
    Delete { scope: ScopeId, id: EntityId },
    Reload { scope: ScopeId },
    Drain,
    Resume,
    GoOffline,
    GoOnline,
}

/// An invariant broken during the run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Violation {
    /// An accepted edit never reached the remote, or is missing locally
    LostMutation {
        scope: ScopeId,
        id: EntityId,
        detail: String,
    },
    /// A deleted entity is visible again
    Resurrected {
        scope: ScopeId,
        id: EntityId,
        step: u64,
    },
    /// Mutations were still queued after healing
    QueueNotDrained { remaining: usize },
    /// Mutations ended up in the holding area although the remote only
    /// failed transiently
    UnexpectedHold { count: usize },
    /// The engine failed in a way the faults cannot explain
    Engine {
        step: u64,
        operation: SimulatedOperation,
        error: String,
    },
}

/// Statistics for one run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SimulatorStats {
    pub operations: u64,
    pub edits: u64,
    pub creates: u64,
    pub deletes: u64,
    pub rejected: u64,
    pub reloads: u64,
    pub reload_failures: u64,
    pub drains: u64,
    pub outages: u64,
    pub peak_queue_len: usize,
    pub heal_rounds: usize,
    pub notices: usize,
}

/// Final report from the simulator
#[derive(Debug, Clone, Serialize)]
pub struct SimulatorReport {
    pub config: SimulatorConfig,
    pub stats: SimulatorStats,
    pub violations: Vec<Violation>,
}

impl SimulatorReport {
    /// Whether every invariant held
    #[must_use]
    pub fn passed(&self) -> bool {
        self.violations.is_empty()
    }

    /// Human-readable report
    #[must_use]
    pub fn generate_text(&self) -> String {
        let s = &self.stats;
        let mut out = String::new();
        let _ = writeln!(out, "=== Offline Sync Simulator Report ===\n");
        let _ = writeln!(out, "Seed: {}", self.config.seed);
        let _ = writeln!(out, "Steps: {}", self.config.steps);
        let _ = writeln!(out, "Failure Rate: {:.2}", self.config.failure_rate);
        let _ = writeln!(out, "Operations: {}", s.operations);
        let _ = writeln!(out, "Edits / Creates / Deletes: {} / {} / {}", s.edits, s.creates, s.deletes);
        let _ = writeln!(out, "Rejected By Full Queue: {}", s.rejected);
        let _ = writeln!(out, "Reloads: {} ({} failed)", s.reloads, s.reload_failures);
        let _ = writeln!(out, "Drains: {}", s.drains);
        let _ = writeln!(out, "Outages: {}", s.outages);
        let _ = writeln!(out, "Peak Queue Length: {}", s.peak_queue_len);
        let _ = writeln!(out, "Heal Rounds: {}", s.heal_rounds);
        let _ = writeln!(out, "Notices: {}", s.notices);
        let _ = writeln!(out, "Violations: {}", self.violations.len());

        if !self.violations.is_empty() {
            let _ = writeln!(out, "\n=== Violations ===");
            for (i, v) in self.violations.iter().enumerate() {
                let _ = writeln!(out, "{}. {v:?}", i + 1);
            }
        }
        let _ = writeln!(
            out,
            "\n=== Result: {} ===",
            if self.passed() { "PASS" } else { "FAIL" }
        );
        out
    }
}

/// What the user last did to an entity, as far as the engine accepted it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Expected {
    Live { stamp: chrono::DateTime<chrono::Utc> },
    Deleted,
}

struct Run {
    config: SimulatorConfig,
    rng: StdRng,
    remote: Arc<MemoryRemote>,
    engine: SyncEngine,
    notices: CollectingNotifier,
    scopes: Vec<ScopeId>,
    expected: BTreeMap<(ScopeId, EntityId), Expected>,
    offline: bool,
    created: u64,
    stats: SimulatorStats,
    violations: Vec<Violation>,
}

/// Run the simulator
///
/// # Errors
/// The engine could not be opened with `sync`.
pub async fn run_simulator(
    config: SimulatorConfig,
    sync: SyncConfig,
) -> Result<SimulatorReport, SyncError> {
    let remote = Arc::new(MemoryRemote::new());
    let scopes: Vec<ScopeId> = (0..config.scopes.max(1))
        .map(|i| ScopeId::new(format!("p{i}")))
        .collect();
    for scope in &scopes {
        let meta = ProjectMeta::new(scope.as_str(), format!("project {scope}"), t0());
        remote.seed_scope(
            meta,
            (0..SEED_TASKS).map(|i| {
                EntitySnapshot::from(Task::new(format!("{scope}-t{i}"), "seeded", t0()))
            }),
        );
    }

    let notices = CollectingNotifier::new();
    let notifier: Arc<dyn Notifier> = Arc::new(notices.clone());
    let api: Arc<dyn RemoteApi> = remote.clone();
    let tier: Arc<dyn DurableStore> = Arc::new(MemoryStore::new("sim"));
    let engine = SyncEngine::open(sync, api, None, tier, notifier).await?;
    for scope in &scopes {
        engine.load_scope(scope).await?;
    }
    remote.set_failure_rate(config.failure_rate, config.seed);

    let mut run = Run {
        rng: StdRng::seed_from_u64(config.seed),
        config,
        remote,
        engine,
        notices,
        scopes,
        expected: BTreeMap::new(),
        offline: false,
        created: 0,
        stats: SimulatorStats::default(),
        violations: Vec::new(),
    };
    info!(seed = run.config.seed, steps = run.config.steps, "simulation started");

    for step in 0..run.config.steps {
        let operation = run.next_operation();
        debug!(step, ?operation, "simulating");
        run.apply(step, operation).await;
        run.stats.operations += 1;
        run.stats.peak_queue_len = run.stats.peak_queue_len.max(run.engine.queue().len());
        if run.config.stop_on_first_violation && !run.violations.is_empty() {
            break;
        }
    }

    run.heal().await;
    run.verify();
    run.stats.notices = run.notices.notices().len();
    run.engine.shutdown().await;

    info!(violations = run.violations.len(), "simulation finished");
    Ok(SimulatorReport {
        config: run.config,
        stats: run.stats,
        violations: run.violations,
    })
}

impl Run {
    fn live_local(&self, scope: &ScopeId) -> Vec<EntityId> {
        self.engine
            .state()
            .current()
            .project(&EntityId::new(scope.as_str()))
            .map(|p| p.tasks.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn next_operation(&mut self) -> SimulatedOperation {
        let scope = self.scopes[self.rng.gen_range(0..self.scopes.len())].clone();
        let live = self.live_local(&scope);
        let roll = self.rng.gen_range(0..100);
        match roll {
            0..=34 if !live.is_empty() => {
                let id = live[self.rng.gen_range(0..live.len())].clone();
                SimulatedOperation::Edit { scope, id }
            }
            35..=54 if !live.is_empty() => {
                let id = live[self.rng.gen_range(0..live.len())].clone();
                SimulatedOperation::Delete { scope, id }
            }
            55..=66 => SimulatedOperation::Reload { scope },
            67..=76 => SimulatedOperation::Drain,
            77..=81 => SimulatedOperation::Resume,
            82..=87 if self.offline => SimulatedOperation::GoOnline,
            82..=87 => SimulatedOperation::GoOffline,
            _ => {
                self.created += 1;
                let id = EntityId::new(format!("{scope}-n{}", self.created));
                SimulatedOperation::Create { scope, id }
            }
        }
    }

    async fn apply(&mut self, step: u64, operation: SimulatedOperation) {
        // strictly increasing stamps keep the remote from seeing conflicts
        let stamp = t0() + Duration::seconds(i64::try_from(step + 1).unwrap_or(i64::MAX));
        match &operation {
            SimulatedOperation::Edit { scope, id } | SimulatedOperation::Create { scope, id } => {
                let task = Task::new(id.clone(), format!("rev {step}"), stamp);
                let result = self.engine.mutate(Mutation::upsert(scope.clone(), task)).await;
                if matches!(operation, SimulatedOperation::Edit { .. }) {
                    self.stats.edits += 1;
                } else {
                    self.stats.creates += 1;
                }
                self.settle(step, &operation, result.map(|o| o.rolled_back), Expected::Live { stamp });
            }
            SimulatedOperation::Delete { scope, id } => {
                let task = Task::new(id.clone(), "deleted", stamp);
                let result = self.engine.mutate(Mutation::delete(scope.clone(), task)).await;
                self.stats.deletes += 1;
                self.settle(step, &operation, result.map(|o| o.rolled_back), Expected::Deleted);
            }
            SimulatedOperation::Reload { scope } => {
                self.stats.reloads += 1;
                if let Err(e) = self.engine.load_scope(scope).await {
                    debug!(%scope, error = %e, "reload failed");
                    self.stats.reload_failures += 1;
                }
                self.check_no_resurrection(step, scope);
            }
            SimulatedOperation::Drain => {
                self.stats.drains += 1;
                self.engine.drain().await;
            }
            SimulatedOperation::Resume => {
                if let Err(e) = self.engine.on_resume().await {
                    debug!(error = %e, "resume probe failed");
                }
                for scope in self.scopes.clone() {
                    self.check_no_resurrection(step, &scope);
                }
            }
            SimulatedOperation::GoOffline => {
                self.stats.outages += 1;
                self.offline = true;
                self.remote.set_offline(true);
            }
            SimulatedOperation::GoOnline => {
                self.offline = false;
                self.remote.set_offline(false);
            }
        }
    }

    fn settle(
        &mut self,
        step: u64,
        operation: &SimulatedOperation,
        result: Result<bool, SyncError>,
        expected: Expected,
    ) {
        let (SimulatedOperation::Edit { scope, id }
        | SimulatedOperation::Create { scope, id }
        | SimulatedOperation::Delete { scope, id }) = operation
        else {
            return;
        };
        match result {
            Ok(false) => {
                self.expected.insert((scope.clone(), id.clone()), expected);
            }
            // the remote only fails transiently, so nothing may be rolled back
            Ok(true) => self.violations.push(Violation::Engine {
                step,
                operation: operation.clone(),
                error: "edit rolled back".to_string(),
            }),
            Err(SyncError::QueueFull(_)) => self.stats.rejected += 1,
            Err(e) => self.violations.push(Violation::Engine {
                step,
                operation: operation.clone(),
                error: e.to_string(),
            }),
        }
    }

    fn check_no_resurrection(&mut self, step: u64, scope: &ScopeId) {
        let live = self.live_local(scope);
        for ((s, id), expected) in &self.expected {
            if s == scope && *expected == Expected::Deleted && live.contains(id) {
                warn!(%scope, %id, step, "deleted entity visible again");
                self.violations.push(Violation::Resurrected {
                    scope: scope.clone(),
                    id: id.clone(),
                    step,
                });
            }
        }
    }

    async fn heal(&mut self) {
        self.remote.set_offline(false);
        self.remote.set_failure_rate(0.0, self.config.seed);
        self.engine.client().breaker().reset();

        while self.stats.heal_rounds < HEAL_ROUNDS {
            self.stats.heal_rounds += 1;
            self.engine.drain().await;
            if self.engine.queue().is_empty() && self.engine.queue().in_flight_len() == 0 {
                break;
            }
        }
        let remaining = self.engine.queue().len() + self.engine.queue().in_flight_len();
        if remaining > 0 {
            self.violations.push(Violation::QueueNotDrained { remaining });
        }
        let held = self.engine.held().len();
        if held > 0 {
            self.violations.push(Violation::UnexpectedHold { count: held });
        }

        for scope in self.scopes.clone() {
            if let Err(e) = self.engine.load_scope(&scope).await {
                warn!(%scope, error = %e, "final reload failed");
            }
        }
    }

    fn verify(&mut self) {
        let final_step = self.config.steps;
        for ((scope, id), expected) in &self.expected {
            let local = self.live_local(scope).contains(id);
            match expected {
                Expected::Live { stamp } => {
                    let remote = self.remote.entity(scope, id);
                    let detail = match remote {
                        None => Some("missing on remote".to_string()),
                        Some(row) if row.is_soft_deleted() => Some("deleted on remote".to_string()),
                        Some(row) if row.updated_at() != *stamp => Some(format!(
                            "remote has {} instead of {stamp}",
                            row.updated_at()
                        )),
                        Some(_) if !local => Some("missing locally".to_string()),
                        Some(_) => None,
                    };
                    if let Some(detail) = detail {
                        self.violations.push(Violation::LostMutation {
                            scope: scope.clone(),
                            id: id.clone(),
                            detail,
                        });
                    }
                }
                Expected::Deleted => {
                    if local {
                        self.violations.push(Violation::Resurrected {
                            scope: scope.clone(),
                            id: id.clone(),
                            step: final_step,
                        });
                    } else if !self.remote.tombstones(scope).contains(id) {
                        self.violations.push(Violation::LostMutation {
                            scope: scope.clone(),
                            id: id.clone(),
                            detail: "delete never reached the remote".to_string(),
                        });
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn reliable_remote_passes() {
        let config = SimulatorConfig {
            steps: 60,
            failure_rate: 0.0,
            ..SimulatorConfig::default()
        };
        let report = run_simulator(config, simulation_sync_config()).await.unwrap();
        assert!(report.passed(), "{}", report.generate_text());
        assert_eq!(report.stats.operations, 60);
        assert_eq!(report.stats.heal_rounds, 1);
    }

    #[tokio::test]
    async fn report_text_names_the_result() {
        let report = SimulatorReport {
            config: SimulatorConfig::default(),
            stats: SimulatorStats::default(),
            violations: vec![Violation::QueueNotDrained { remaining: 2 }],
        };
        let text = report.generate_text();
        assert!(text.contains("Violations: 1"));
        assert!(text.contains("QueueNotDrained"));
        assert!(text.contains("Result: FAIL"));
    }
}
