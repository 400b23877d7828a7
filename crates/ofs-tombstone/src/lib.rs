//! OFS Tombstone - deletion ledger of the offline sync core
//!
//! Provides:
//! - [`TombstoneLedger`]: durable local plane plus a TTL-cached remote plane
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_tombstone::TombstoneLedger;
//!
//! let ledger = TombstoneLedger::new(config.tombstones.clone(), store, client);
//! ledger.load().await;
//! ledger.add_local(&scope, [task_id.clone()]).await;
//! assert!(ledger.is_tombstoned(&scope, &task_id));
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod error;
pub mod ledger;

pub use error::LedgerError;
pub use ledger::TombstoneLedger;

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
