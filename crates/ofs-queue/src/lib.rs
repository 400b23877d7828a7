//! OFS Queue - durable mutation queue of the offline sync core
//!
//! Provides:
//! - [`MutationQueue`]: deduplicated, capacity-bounded, persisted queue
//! - [`MutationQueueItem`]: one pending upsert or delete
//! - [`HoldingArea`]: mutations the remote refused, kept for the user
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_queue::prelude::*;
//!
//! let queue = MutationQueue::new(config.queue.clone(), store.clone());
//! queue.load().await;
//! queue.enqueue(Operation::Upsert, task.into(), Some(scope)).await;
//! for item in queue.take_all() {
//!     // dispatch, then `complete` or `put_back`
//! }
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod holding;
pub mod item;
pub mod queue;

pub use error::QueueError;
pub use holding::{HeldMutation, HoldReason, HoldingArea};
pub use item::{MutationQueueItem, QueueKey};
pub use queue::{CapacityLevel, EnqueueOutcome, MutationQueue};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with the mutation queue
    pub use crate::{EnqueueOutcome, HoldReason, HoldingArea, MutationQueue, MutationQueueItem};
    pub use ofs_model::Operation;
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
