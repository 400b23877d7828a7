//! Reconciling remote rows with tombstones and unsent local edits
//!
//! Pure functions; the orchestrator does the I/O.

use ofs_model::{Entity, EntityId, EntitySnapshot, EntityType, Operation, Project, ProjectMeta};
use std::collections::{BTreeSet, HashMap};

/// Build the live view of a scope from remote rows
///
/// Rows whose id is in `tombstones` are excluded whatever their own
/// `deleted_at` says, and so are soft-deleted rows. Connections that lose an
/// endpoint go with it.
#[must_use]
pub fn reconcile(
    meta: ProjectMeta,
    rows: impl IntoIterator<Item = EntitySnapshot>,
    tombstones: &BTreeSet<EntityId>,
) -> Project {
    let live = rows
        .into_iter()
        .filter(|row| !tombstones.contains(row.id()) && !row.is_soft_deleted());
    Project::from_children(meta, live).scrubbed()
}

/// Keep unsent local edits on top of a freshly loaded scope
///
/// A pending upsert keeps the local copy (the server has not seen it yet);
/// a pending delete keeps the entity absent.
#[must_use]
pub fn overlay_pending(
    mut server: Project,
    local: Option<&Project>,
    pending: &HashMap<EntityId, Operation>,
) -> Project {
    for (id, op) in pending {
        match op {
            Operation::Delete => {
                if !server.remove_child(EntityType::Task, id) {
                    server.remove_child(EntityType::Connection, id);
                }
            }
            Operation::Upsert => {
                let Some(local) = local else { continue };
                if local.id() == id {
                    server.meta = local.meta.clone();
                } else if let Some(task) = local.tasks.get(id) {
                    server.put_child(EntitySnapshot::Task(task.clone()));
                } else if let Some(conn) = local.connections.get(id) {
                    server.put_child(EntitySnapshot::Connection(conn.clone()));
                }
            }
        }
    }
    server
}

/// Highest `updated_at` or `deleted_at` among the rows actually received
#[must_use]
pub fn max_observed<'a>(
    meta: &ProjectMeta,
    rows: impl IntoIterator<Item = &'a EntitySnapshot>,
) -> chrono::DateTime<chrono::Utc> {
    rows.into_iter()
        .flat_map(|row| [Some(row.updated_at()), row.deleted_at()])
        .flatten()
        .chain(meta.deleted_at)
        .fold(meta.updated_at, std::cmp::max)
}
