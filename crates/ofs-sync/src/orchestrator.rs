//! Sync orchestrator
//!
//! Loads scopes from the remote and publishes them into the live state:
//!
//! 1. One batched call for entity, children and tombstones
//! 2. On any failure other than `AccessDenied`, three throttled per-resource
//!    calls instead, awaited in order
//! 3. Rows filtered through the effective tombstone set
//! 4. Unsent local edits overlaid
//! 5. The scope watermark advanced to the highest `updated_at` received
//!
//! Incremental sync asks "which scopes changed since the cursor" and reloads
//! only those.

use crate::error::{Result, SyncError};
use crate::merge;
use crate::watermark::WatermarkStore;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use ofs_model::{
    EntityId, Notice, Notifier, RemoteError, ScopeData, ScopeHead, ScopeId, StateHandle, SyncDomain,
};
use ofs_queue::MutationQueue;
use ofs_resilience::{Priority, ResilientClient};
use ofs_tombstone::TombstoneLedger;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// How a scope was fetched
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    /// One combined request
    Batched,
    /// Per-resource fallback after the combined request failed
    Sequential,
}

/// Result of loading one scope
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadReport {
    /// Scope that was loaded
    pub scope: ScopeId,
    /// Which fetch path produced the rows
    pub source: LoadSource,
    /// Live children published
    pub live: usize,
    /// Rows received but withheld (tombstoned or soft-deleted)
    pub excluded: usize,
}

/// Result of a resume check
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeReport {
    /// Accessibility of the active scope, when there is one
    pub active_accessible: Option<bool>,
    /// Scopes reloaded because their remote watermark moved
    pub refreshed: Vec<ScopeId>,
}

/// Drives loads and incremental syncs into the live state
pub struct SyncOrchestrator {
    client: ResilientClient,
    ledger: Arc<TombstoneLedger>,
    queue: Arc<MutationQueue>,
    watermarks: Arc<WatermarkStore>,
    state: StateHandle,
    notifier: Arc<dyn Notifier>,
}

impl std::fmt::Debug for SyncOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncOrchestrator")
            .field("client", &self.client)
            .field("watermarks", &self.watermarks)
            .finish_non_exhaustive()
    }
}

impl SyncOrchestrator {
    /// Orchestrator publishing into `state`; shares the ledger, queue and
    /// watermarks with the engine
    #[must_use]
    pub fn new(
        client: ResilientClient,
        ledger: Arc<TombstoneLedger>,
        queue: Arc<MutationQueue>,
        watermarks: Arc<WatermarkStore>,
        state: StateHandle,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            client,
            ledger,
            queue,
            watermarks,
            state,
            notifier,
        }
    }

    /// Watermarks advanced by successful loads
    #[must_use]
    pub fn watermarks(&self) -> &WatermarkStore {
        &self.watermarks
    }

    /// Load a whole scope and publish it
    ///
    /// # Errors
    /// [`SyncError::NotAccessible`] when the scope is gone (the local copy is
    /// removed), otherwise the remote error of the fallback path.
    pub async fn load_full(&self, scope: &ScopeId) -> Result<LoadReport> {
        let (data, source) = match self.fetch_batched(scope).await {
            Ok(data) => {
                self.ledger
                    .seed_remote(scope, data.tombstones.iter().cloned())
                    .await;
                (data, LoadSource::Batched)
            }
            Err(RemoteError::AccessDenied(_)) => return Err(self.mark_inaccessible(scope).await),
            Err(e) => {
                warn!(%scope, error = %e, "batched load failed, falling back to per-resource fetch");
                match self.fetch_sequential(scope).await {
                    Ok(data) => (data, LoadSource::Sequential),
                    Err(RemoteError::AccessDenied(_)) => {
                        return Err(self.mark_inaccessible(scope).await)
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        };
        Ok(self.publish(scope, data, source).await)
    }

    async fn fetch_batched(&self, scope: &ScopeId) -> std::result::Result<ScopeData, RemoteError> {
        let key = scope.clone();
        self.client
            .call_dedup(&format!("full:{scope}"), Priority::BestEffort, move |remote| {
                let key = key.clone();
                async move { remote.get_full_scope_data(&key).await }
            })
            .await
    }

    /// Metadata, children and tombstones as three throttled calls, one after
    /// another, so a struggling remote sees one request per scope at a time
    async fn fetch_sequential(&self, scope: &ScopeId) -> std::result::Result<ScopeData, RemoteError> {
        let key = scope.clone();
        let entity = self
            .client
            .call("scope-meta", Priority::BestEffort, move |remote| {
                let key = key.clone();
                async move { remote.get_scope_meta(&key).await }
            })
            .await?;
        let key = scope.clone();
        let children = self
            .client
            .call("scope-children", Priority::BestEffort, move |remote| {
                let key = key.clone();
                async move { remote.list_scope_children(&key).await }
            })
            .await?;
        // the ledger keeps its last known set when this fails; `publish`
        // filters through it either way
        let tombstones = match self.ledger.fetch_remote_with_cache(scope).await {
            Ok(set) => set.iter().cloned().collect(),
            Err(e) => {
                warn!(%scope, error = %e, "remote tombstones unavailable");
                Vec::new()
            }
        };
        Ok(ScopeData {
            entity,
            children,
            tombstones,
        })
    }

    async fn publish(&self, scope: &ScopeId, data: ScopeData, source: LoadSource) -> LoadReport {
        let observed = merge::max_observed(&data.entity, &data.children);
        let received = data.children.len();
        let effective = self.ledger.get_effective(scope);
        let server = merge::reconcile(data.entity, data.children, &effective);
        let live = server.tasks.len() + server.connections.len();

        let pending = self.queue.pending_for_scope(scope);
        self.state.update(|state| {
            let merged = merge::overlay_pending(server, state.project(&project_id(scope)), &pending);
            state.put_project(merged);
        });
        self.watermarks
            .advance(&SyncDomain::Scope(scope.clone()), observed)
            .await;

        info!(%scope, ?source, live, excluded = received.saturating_sub(live), "scope loaded");
        LoadReport {
            scope: scope.clone(),
            source,
            live,
            excluded: received.saturating_sub(live),
        }
    }

    async fn mark_inaccessible(&self, scope: &ScopeId) -> SyncError {
        warn!(%scope, "scope no longer accessible, dropping local copy");
        self.state.update(|state| state.remove_project(&project_id(scope)));
        self.watermarks.reset(&SyncDomain::Scope(scope.clone())).await;
        self.ledger.forget_remote(scope).await;
        self.notifier.notify(Notice::ScopeInaccessible {
            scope: scope.clone(),
        });
        SyncError::NotAccessible(scope.clone())
    }

    /// Load several scopes concurrently; failures are logged, never abort
    /// the batch
    pub async fn load_all(&self, scopes: &[ScopeId]) -> Vec<(ScopeId, Result<LoadReport>)> {
        let results = join_all(scopes.iter().map(|scope| self.load_full(scope))).await;
        let outcome: Vec<_> = scopes.iter().cloned().zip(results).collect();
        for (scope, result) in &outcome {
            if let Err(e) = result {
                warn!(%scope, error = %e, "scope load failed");
            }
        }
        outcome
    }

    /// Reload a scope only when its remote watermark moved
    ///
    /// Returns whether a reload happened.
    ///
    /// # Errors
    /// Remote failures of the watermark probe or the reload.
    pub async fn sync_scope(&self, scope: &ScopeId) -> Result<bool> {
        let key = scope.clone();
        let remote_wm = self
            .client
            .call("scope-watermark", Priority::BestEffort, move |remote| {
                let key = key.clone();
                async move { remote.get_scope_watermark(&key).await }
            })
            .await?;
        let domain = SyncDomain::Scope(scope.clone());
        match remote_wm {
            Some(wm) if self.watermarks.is_behind(&domain, wm) => {
                self.load_full(scope).await?;
                Ok(true)
            }
            Some(_) => {
                debug!(%scope, "scope unchanged");
                Ok(false)
            }
            None => Ok(false),
        }
    }

    /// Reload every scope whose head moved past the scope-list cursor
    ///
    /// The cursor only advances over heads that loaded; a failed head keeps
    /// it below its own `updated_at` so the next pass sees it again.
    ///
    /// # Errors
    /// Failure of the change-feed call itself.
    pub async fn sync_incremental(&self) -> Result<Vec<ScopeId>> {
        let cursor = self.watermarks.cursor(&SyncDomain::ScopeList);
        let heads: Vec<ScopeHead> = self
            .client
            .call("scope-heads", Priority::BestEffort, move |remote| async move {
                remote.list_scope_heads_since(cursor).await
            })
            .await?;
        if heads.is_empty() {
            return Ok(Vec::new());
        }

        let scopes: Vec<ScopeId> = heads.iter().map(|h| h.id.clone()).collect();
        let results = self.load_all(&scopes).await;

        let mut refreshed = Vec::new();
        let mut failed_floor: Option<DateTime<Utc>> = None;
        for (head, (scope, result)) in heads.iter().zip(results) {
            match result {
                Ok(_) => refreshed.push(scope),
                // a vanished scope has nothing left to fetch
                Err(SyncError::NotAccessible(_)) => {}
                Err(_) => {
                    failed_floor = Some(failed_floor.map_or(head.updated_at, |f| f.min(head.updated_at)));
                }
            }
        }
        let observed = heads
            .iter()
            .map(|h| h.updated_at)
            .filter(|at| failed_floor.map_or(true, |floor| *at < floor))
            .max();
        if let Some(observed) = observed {
            self.watermarks.advance(&SyncDomain::ScopeList, observed).await;
        }
        Ok(refreshed)
    }

    /// App came back to the foreground or the network returned
    ///
    /// One composite probe decides whether the active scope is still there
    /// and whether anything changed anywhere.
    ///
    /// # Errors
    /// Failure of the probe itself.
    pub async fn on_resume(&self) -> Result<ResumeReport> {
        let Some(active) = self.state.current().active_project_id.map(ScopeId::from) else {
            let refreshed = self.sync_incremental().await?;
            return Ok(ResumeReport {
                active_accessible: None,
                refreshed,
            });
        };

        let key = active.clone();
        let probe = self
            .client
            .call("resume-probe", Priority::BestEffort, move |remote| {
                let key = key.clone();
                async move { remote.resume_probe(&key).await }
            })
            .await?;

        let mut report = ResumeReport {
            active_accessible: Some(probe.active.accessible),
            refreshed: Vec::new(),
        };
        if !probe.active.accessible {
            let _ = self.mark_inaccessible(&active).await;
        } else if probe
            .active
            .watermark
            .is_some_and(|wm| self.watermarks.is_behind(&SyncDomain::Scope(active.clone()), wm))
        {
            self.load_full(&active).await?;
            report.refreshed.push(active.clone());
        }

        if probe
            .domain_watermark
            .is_some_and(|wm| self.watermarks.is_behind(&SyncDomain::ScopeList, wm))
        {
            for scope in self.sync_incremental().await? {
                if !report.refreshed.contains(&scope) {
                    report.refreshed.push(scope);
                }
            }
        }
        Ok(report)
    }
}

fn project_id(scope: &ScopeId) -> EntityId {
    EntityId::new(scope.as_str())
}
