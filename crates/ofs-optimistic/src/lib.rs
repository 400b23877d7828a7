//! OFS Optimistic - tentative local edits with commit or rollback
//!
//! Provides:
//! - [`OptimisticStateManager`]: snapshot store over the live [`ofs_model::StateHandle`]
//! - [`ActionOutcome`]: typed result of an optimistic action
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_optimistic::prelude::*;
//!
//! let outcome = manager
//!     .run_optimistic_action(
//!         ActionMeta::new(EntityType::Task, "rename task"),
//!         |state| state.upsert(&scope, renamed.clone().into()),
//!         || async { remote.upsert_entity(&scope, &renamed.into(), WriteMode::Checked).await },
//!     )
//!     .await;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod manager;

pub use error::{ActionError, OptimisticError};
pub use manager::{ActionMeta, ActionOutcome, OptimisticStateManager, Snapshot};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for optimistic edits
    pub use crate::{ActionError, ActionMeta, ActionOutcome, OptimisticStateManager};
    pub use ofs_model::EntityType;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
