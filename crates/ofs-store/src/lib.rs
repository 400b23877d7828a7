//! OFS Store - durable local storage for the sync core
//!
//! Provides:
//! - [`DurableStore`]: the keyed string store every tier implements
//! - [`SqliteStore`]: tier A, larger and transactional
//! - [`FileKvStore`]: tier B, small, quota-bound, with a blocking write path
//! - [`MemoryStore`]: in-process tier with fault injection
//! - [`TieredStore`]: probe-selected primary with automatic fallback
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_store::prelude::*;
//! use std::sync::Arc;
//!
//! let primary: Arc<dyn DurableStore> = Arc::new(SqliteStore::open("sync.db")?);
//! let secondary: Arc<dyn DurableStore> = Arc::new(FileKvStore::open("kv", DEFAULT_QUOTA_BYTES)?);
//! let store = TieredStore::probe(Some(primary), secondary).await;
//! store.write("mutation-queue", "[]").await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod file_kv;
pub mod memory;
pub mod sqlite;
pub mod store;
pub mod tiered;

pub use error::StoreError;
pub use file_kv::{FileKvStore, DEFAULT_QUOTA_BYTES};
pub use memory::MemoryStore;
pub use sqlite::SqliteStore;
pub use store::{DurableStore, Tier};
pub use tiered::TieredStore;

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for working with storage tiers
    pub use crate::{
        DurableStore, FileKvStore, MemoryStore, SqliteStore, StoreError, Tier, TieredStore,
        DEFAULT_QUOTA_BYTES,
    };
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
