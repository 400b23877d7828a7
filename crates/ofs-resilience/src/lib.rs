//! OFS Resilience - governs every outbound call of the sync core
//!
//! Provides:
//! - [`CircuitBreaker`]: closed / open / half-open with probe budget
//! - [`RequestThrottle`]: bounded concurrency, express lane, timeout
//! - [`InflightDedup`]: shared execution of identical in-flight calls
//! - [`RetryPolicy`]: exponential backoff with jitter
//! - [`ResilientClient`]: all of the above around a [`ofs_model::RemoteApi`]
//!
//! # Example
//!
//! ```rust,ignore
//! use ofs_resilience::prelude::*;
//!
//! let client = ResilientClient::new(remote, config.breaker, config.throttle, config.retry);
//! let scope = ScopeId::new("p1");
//! let wm = client
//!     .call("scope-watermark", Priority::BestEffort, |r| {
//!         let scope = scope.clone();
//!         async move { r.get_scope_watermark(&scope).await }
//!     })
//!     .await?;
//! ```

#![warn(unreachable_pub)]
#![allow(missing_docs)]

pub mod breaker;
pub mod client;
pub mod error;
pub mod retry;
pub mod throttle;

pub use breaker::{CircuitBreaker, CircuitBreakerState, CircuitStatus};
pub use client::ResilientClient;
pub use error::ThrottleError;
pub use retry::RetryPolicy;
pub use throttle::{InflightDedup, Priority, RequestThrottle, ThrottlePermit};

/// Prelude module for common imports
pub mod prelude {
    //! Common imports for resilient outbound calls
    pub use crate::{CircuitBreaker, CircuitStatus, Priority, ResilientClient, RetryPolicy};
}

/// Version of this crate
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
