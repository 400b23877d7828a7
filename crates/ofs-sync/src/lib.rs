//! OFS Sync - orchestration and dispatch for the offline sync core
//!
//! Provides:
//! - [`SyncEngine`]: facade wiring storage, queue, ledger and optimistic state
//! - [`SyncOrchestrator`]: full and incremental scope loads into the live state
//! - [`MutationDispatcher`]: drains the durable queue through the resilient client
//! - [`WatermarkStore`]: persisted per-domain high-water marks
//! - [`OfflineCache`]: scrubbed, debounced snapshot of the live state
//! - [`merge`]: tombstone-aware reconciliation of remote rows
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_sync::prelude::*;
//!
//! let engine = SyncEngine::open_with_storage(config, remote, notifier).await?;
//! engine.load_scope(&scope).await?;
//! engine.mutate(Mutation::upsert(scope.clone(), task)).await?;
//! engine.on_resume().await?;
//! engine.shutdown().await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod dispatch;
pub mod engine;
pub mod error;
pub mod merge;
pub mod offline;
pub mod orchestrator;
pub mod watermark;

pub use dispatch::{
    allowed_transitions, validate_transition, DispatchOutcome, DispatchState, DrainReport,
    IllegalTransition, MutationDispatcher,
};
pub use engine::{MutateOutcome, Mutation, SyncEngine};
pub use error::{Result, SyncError};
pub use merge::{max_observed, overlay_pending, reconcile};
pub use offline::OfflineCache;
pub use orchestrator::{LoadReport, LoadSource, ResumeReport, SyncOrchestrator};
pub use watermark::{WatermarkRecord, WatermarkStore};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for driving the sync engine
    pub use crate::{
        DispatchOutcome, DrainReport, LoadReport, MutateOutcome, Mutation, SyncEngine, SyncError,
    };
    pub use ofs_model::{EntitySnapshot, Notifier, RemoteApi, ScopeId, SyncConfig};
}

/// Version of the sync crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
