//! In-memory remote with fault injection

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ofs_model::{
    Entity, EntityId, EntitySnapshot, EntityType, ProjectMeta, RemoteApi, RemoteError, ScopeData,
    ScopeHead, ScopeId, ScopeProbe, TransientKind, Watermark, WriteAck, WriteMode,
};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet, VecDeque};
use std::time::Duration;

#[derive(Debug, Clone)]
struct RemoteScope {
    meta: ProjectMeta,
    children: BTreeMap<EntityId, EntitySnapshot>,
    tombstones: BTreeSet<EntityId>,
    versions: HashMap<EntityId, u64>,
    accessible: bool,
}

impl RemoteScope {
    fn new(meta: ProjectMeta) -> Self {
        Self {
            meta,
            children: BTreeMap::new(),
            tombstones: BTreeSet::new(),
            versions: HashMap::new(),
            accessible: true,
        }
    }

    fn watermark(&self) -> Watermark {
        let newest = self
            .children
            .values()
            .flat_map(|c| [Some(c.updated_at()), c.deleted_at()])
            .flatten()
            .chain([Some(self.meta.updated_at), self.meta.deleted_at].into_iter().flatten())
            .max()
            .unwrap_or(self.meta.updated_at);
        Watermark::at(newest)
    }

    fn bump(&mut self, id: &EntityId) -> u64 {
        let v = self.versions.entry(id.clone()).or_insert(0);
        *v += 1;
        *v
    }
}

#[derive(Debug, Default)]
struct Faults {
    offline: bool,
    batch_unavailable: bool,
    unavailable_ops: HashSet<&'static str>,
    scripted: VecDeque<RemoteError>,
    denied_entities: HashSet<EntityId>,
    invalid_entities: HashSet<EntityId>,
    failure_rate: f64,
    rng: Option<StdRng>,
    latency: Option<Duration>,
}

/// Scriptable in-memory implementation of [`RemoteApi`]
///
/// Holds scopes the way the authoritative service would and lets tests
/// inject faults: full outages, scripted one-shot errors, random transient
/// failures, per-entity permission or validation refusals, inaccessible
/// scopes and a broken batched endpoint.
#[derive(Debug, Default)]
pub struct MemoryRemote {
    scopes: Mutex<BTreeMap<ScopeId, RemoteScope>>,
    faults: Mutex<Faults>,
    calls: Mutex<HashMap<&'static str, usize>>,
}

impl MemoryRemote {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add (or replace) a scope with its children
    pub fn seed_scope(&self, meta: ProjectMeta, children: impl IntoIterator<Item = EntitySnapshot>) {
        let scope = ScopeId::from(&meta.id);
        let mut remote = RemoteScope::new(meta);
        for child in children {
            remote.bump(child.id());
            remote.children.insert(child.id().clone(), child);
        }
        self.scopes.lock().insert(scope, remote);
    }

    /// Add an id to a scope's remote deletion ledger
    pub fn seed_tombstone(&self, scope: &ScopeId, id: impl Into<EntityId>) {
        if let Some(s) = self.scopes.lock().get_mut(scope) {
            s.tombstones.insert(id.into());
        }
    }

    /// Simulate a full outage
    pub fn set_offline(&self, offline: bool) {
        self.faults.lock().offline = offline;
    }

    /// Make the batched scope endpoint fail with a server error
    pub fn set_batch_unavailable(&self, unavailable: bool) {
        self.faults.lock().batch_unavailable = unavailable;
    }

    /// Make one operation fail with a server error
    pub fn set_operation_unavailable(&self, op: &'static str, unavailable: bool) {
        let mut faults = self.faults.lock();
        if unavailable {
            faults.unavailable_ops.insert(op);
        } else {
            faults.unavailable_ops.remove(op);
        }
    }

    /// Queue an error returned by the next call (any operation)
    pub fn fail_next(&self, err: RemoteError) {
        self.faults.lock().scripted.push_back(err);
    }

    /// Queue `n` transient failures
    pub fn fail_next_n(&self, n: usize, kind: TransientKind) {
        let mut faults = self.faults.lock();
        for _ in 0..n {
            faults
                .scripted
                .push_back(RemoteError::transient(kind, "injected failure"));
        }
    }

    /// Fail a random fraction of calls with a transient error
    pub fn set_failure_rate(&self, rate: f64, seed: u64) {
        let mut faults = self.faults.lock();
        faults.failure_rate = rate.clamp(0.0, 1.0);
        faults.rng = Some(StdRng::seed_from_u64(seed));
    }

    /// Refuse writes to this entity with `Permission`
    pub fn deny_writes(&self, id: impl Into<EntityId>) {
        self.faults.lock().denied_entities.insert(id.into());
    }

    /// Refuse writes to this entity with `Validation`
    pub fn reject_as_invalid(&self, id: impl Into<EntityId>) {
        self.faults.lock().invalid_entities.insert(id.into());
    }

    /// Make a scope inaccessible (unshared or deleted)
    pub fn revoke_scope(&self, scope: &ScopeId) {
        if let Some(s) = self.scopes.lock().get_mut(scope) {
            s.accessible = false;
        }
    }

    /// Delay every call
    pub fn set_latency(&self, latency: Option<Duration>) {
        self.faults.lock().latency = latency;
    }

    /// Calls made to one operation
    #[must_use]
    pub fn call_count(&self, op: &str) -> usize {
        self.calls.lock().get(op).copied().unwrap_or(0)
    }

    /// Calls made to every operation
    #[must_use]
    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }

    pub fn reset_calls(&self) {
        self.calls.lock().clear();
    }

    /// Remote copy of an entity, if any
    #[must_use]
    pub fn entity(&self, scope: &ScopeId, id: &EntityId) -> Option<EntitySnapshot> {
        let scopes = self.scopes.lock();
        let s = scopes.get(scope)?;
        if &s.meta.id == id {
            return Some(EntitySnapshot::Project(s.meta.clone()));
        }
        s.children.get(id).cloned()
    }

    /// Live (not soft-deleted, not tombstoned) child ids of a scope
    #[must_use]
    pub fn live_ids(&self, scope: &ScopeId) -> BTreeSet<EntityId> {
        self.scopes.lock().get(scope).map_or_else(BTreeSet::new, |s| {
            s.children
                .values()
                .filter(|c| !c.is_soft_deleted() && !s.tombstones.contains(c.id()))
                .map(|c| c.id().clone())
                .collect()
        })
    }

    /// Ids in a scope's remote deletion ledger
    #[must_use]
    pub fn tombstones(&self, scope: &ScopeId) -> BTreeSet<EntityId> {
        self.scopes
            .lock()
            .get(scope)
            .map(|s| s.tombstones.clone())
            .unwrap_or_default()
    }

    /// Overwrite a child directly, as another client would
    pub fn write_as_other_client(&self, scope: &ScopeId, child: EntitySnapshot) {
        if let Some(s) = self.scopes.lock().get_mut(scope) {
            s.bump(child.id());
            s.children.insert(child.id().clone(), child);
        }
    }

    async fn enter(&self, op: &'static str) -> Result<(), RemoteError> {
        *self.calls.lock().entry(op).or_insert(0) += 1;
        let latency = self.faults.lock().latency;
        if let Some(delay) = latency {
            tokio::time::sleep(delay).await;
        }

        let mut faults = self.faults.lock();
        if faults.offline {
            return Err(RemoteError::transient(TransientKind::Network, "offline"));
        }
        if faults.unavailable_ops.contains(op) {
            return Err(RemoteError::transient(TransientKind::Server, format!("{op} unavailable")));
        }
        if let Some(err) = faults.scripted.pop_front() {
            return Err(err);
        }
        let rate = faults.failure_rate;
        if rate > 0.0 {
            if let Some(rng) = faults.rng.as_mut() {
                if rng.gen_bool(rate) {
                    return Err(RemoteError::transient(TransientKind::ServiceUnavailable, "injected 503"));
                }
            }
        }
        Ok(())
    }

    fn with_scope<T>(
        &self,
        scope: &ScopeId,
        f: impl FnOnce(&RemoteScope) -> T,
    ) -> Result<T, RemoteError> {
        let scopes = self.scopes.lock();
        match scopes.get(scope) {
            Some(s) if s.accessible => Ok(f(s)),
            _ => Err(RemoteError::AccessDenied(scope.to_string())),
        }
    }

    fn check_write(&self, id: &EntityId) -> Result<(), RemoteError> {
        let faults = self.faults.lock();
        if faults.denied_entities.contains(id) {
            return Err(RemoteError::Permission(format!("write to {id} refused")));
        }
        if faults.invalid_entities.contains(id) {
            return Err(RemoteError::Validation(format!("{id} failed validation")));
        }
        Ok(())
    }
}

#[async_trait]
impl RemoteApi for MemoryRemote {
    async fn get_full_scope_data(&self, scope: &ScopeId) -> Result<ScopeData, RemoteError> {
        self.enter("get_full_scope_data").await?;
        if self.faults.lock().batch_unavailable {
            return Err(RemoteError::transient(TransientKind::Server, "batched endpoint unavailable"));
        }
        self.with_scope(scope, |s| ScopeData {
            entity: s.meta.clone(),
            children: s.children.values().cloned().collect(),
            tombstones: s.tombstones.iter().cloned().collect(),
        })
    }

    async fn get_scope_meta(&self, scope: &ScopeId) -> Result<ProjectMeta, RemoteError> {
        self.enter("get_scope_meta").await?;
        self.with_scope(scope, |s| s.meta.clone())
    }

    async fn list_scope_children(&self, scope: &ScopeId) -> Result<Vec<EntitySnapshot>, RemoteError> {
        self.enter("list_scope_children").await?;
        self.with_scope(scope, |s| s.children.values().cloned().collect())
    }

    async fn list_scope_tombstones(&self, scope: &ScopeId) -> Result<Vec<EntityId>, RemoteError> {
        self.enter("list_scope_tombstones").await?;
        self.with_scope(scope, |s| s.tombstones.iter().cloned().collect())
    }

    async fn get_scope_watermark(&self, scope: &ScopeId) -> Result<Option<Watermark>, RemoteError> {
        self.enter("get_scope_watermark").await?;
        Ok(self
            .scopes
            .lock()
            .get(scope)
            .filter(|s| s.accessible)
            .map(RemoteScope::watermark))
    }

    async fn get_domain_watermark(&self) -> Result<Option<Watermark>, RemoteError> {
        self.enter("get_domain_watermark").await?;
        Ok(self
            .scopes
            .lock()
            .values()
            .filter(|s| s.accessible)
            .map(RemoteScope::watermark)
            .max())
    }

    async fn list_scope_heads_since(&self, since: Watermark) -> Result<Vec<ScopeHead>, RemoteError> {
        self.enter("list_scope_heads_since").await?;
        Ok(self
            .scopes
            .lock()
            .iter()
            .filter(|(_, s)| s.accessible)
            .filter_map(|(id, s)| {
                let wm = s.watermark();
                (wm > since).then(|| ScopeHead {
                    id: id.clone(),
                    updated_at: wm.instant(),
                    version: s.meta.version,
                })
            })
            .collect())
    }

    async fn get_accessible_scope_probe(&self, scope: &ScopeId) -> Result<ScopeProbe, RemoteError> {
        self.enter("get_accessible_scope_probe").await?;
        let scopes = self.scopes.lock();
        Ok(match scopes.get(scope) {
            Some(s) if s.accessible => ScopeProbe {
                accessible: true,
                watermark: Some(s.watermark()),
            },
            _ => ScopeProbe {
                accessible: false,
                watermark: None,
            },
        })
    }

    async fn upsert_entity(
        &self,
        scope: &ScopeId,
        payload: &EntitySnapshot,
        mode: WriteMode,
    ) -> Result<WriteAck, RemoteError> {
        self.enter("upsert_entity").await?;
        self.check_write(payload.id())?;

        let mut scopes = self.scopes.lock();
        if let EntitySnapshot::Project(meta) = payload {
            let s = scopes
                .entry(scope.clone())
                .or_insert_with(|| RemoteScope::new(meta.clone()));
            if !s.accessible {
                return Err(RemoteError::AccessDenied(scope.to_string()));
            }
            s.meta = meta.clone();
            let version = s.bump(&meta.id);
            s.meta.version = version;
            return Ok(WriteAck {
                version,
                updated_at: meta.updated_at,
            });
        }

        let s = match scopes.get_mut(scope) {
            Some(s) if s.accessible => s,
            _ => return Err(RemoteError::AccessDenied(scope.to_string())),
        };
        let id = payload.id().clone();
        if mode == WriteMode::Checked {
            if let Some(existing) = s.children.get(&id) {
                if existing.updated_at() > payload.updated_at() {
                    return Err(RemoteError::VersionConflict {
                        remote_version: s.versions.get(&id).copied().unwrap_or(0),
                        remote_updated_at: existing.updated_at(),
                    });
                }
            }
        }
        s.children.insert(id.clone(), payload.clone());
        let version = s.bump(&id);
        Ok(WriteAck {
            version,
            updated_at: payload.updated_at(),
        })
    }

    async fn delete_entity(
        &self,
        scope: &ScopeId,
        kind: EntityType,
        id: &EntityId,
    ) -> Result<WriteAck, RemoteError> {
        self.enter("delete_entity").await?;
        self.check_write(id)?;

        let now: DateTime<Utc> = Utc::now();
        let mut scopes = self.scopes.lock();
        let s = match scopes.get_mut(scope) {
            Some(s) if s.accessible => s,
            _ => return Err(RemoteError::AccessDenied(scope.to_string())),
        };
        if kind == EntityType::Project {
            s.meta.deleted_at = Some(now);
        } else if let Some(child) = s.children.remove(id) {
            s.children.insert(id.clone(), child.mark_deleted(now));
        }
        s.tombstones.insert(id.clone());
        let version = s.bump(id);
        Ok(WriteAck {
            version,
            updated_at: now,
        })
    }
}
