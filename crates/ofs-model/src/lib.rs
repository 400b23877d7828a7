//! OFS Model - shared vocabulary of the offline sync core
//!
//! Defines:
//! - Entity records (projects, tasks, connections) and their snapshots
//! - The persistent-structure local state and its observable handle
//! - Watermarks and sync domains
//! - The remote RPC contract and its typed error outcomes
//! - User notices and configuration
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_model::prelude::*;
//!
//! let config = SyncConfig::from_toml_str("[queue]\nmax_size = 500\nhard_max_size = 600")?;
//! let state = StateHandle::new(LocalState::new());
//! state.update(|s| s.put_project(Project::new(ProjectMeta::new("p1", "Roadmap", Utc::now()))));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod config;
pub mod entity;
pub mod error;
pub mod ids;
pub mod notice;
pub mod remote;
pub mod state;
pub mod watermark;

// Re-exports for convenience
pub use config::{
    BreakerConfig, ConflictConfig, ConflictStrategy, OptimisticConfig, OrchestratorConfig,
    QueueConfig, RetryConfig, StorageConfig, SyncConfig, ThrottleConfig, TombstoneConfig,
};
pub use entity::{
    Connection, Entity, EntitySnapshot, EntityType, Operation, ProjectMeta, Task, TaskStatus,
};
pub use error::{ConfigError, ErrorKind, RemoteError, TransientKind};
pub use ids::{EntityId, MutationId, ScopeId, SnapshotId};
pub use notice::{CollectingNotifier, Notice, Notifier, TracingNotifier};
pub use remote::{RemoteApi, ResumeProbe, ScopeData, ScopeHead, ScopeProbe, WriteAck, WriteMode};
pub use state::{LocalState, Project, StateError, StateHandle};
pub use watermark::{SyncDomain, Watermark};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the sync core model
    pub use crate::{
        Entity, EntityId, EntitySnapshot, EntityType, LocalState, Operation, Project,
        ProjectMeta, RemoteApi, RemoteError, ScopeId, StateHandle, SyncConfig, Task, Watermark,
    };
    pub use chrono::Utc;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
