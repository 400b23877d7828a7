//! Error types shared across the sync core
//!
//! [`RemoteError`] is the typed outcome of every outbound call. Callers never
//! get a panic or an opaque error from the network side; they get one of the
//! kinds below and apply their own fallback policy.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Flavour of a transient failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransientKind {
    /// Connection refused/reset, DNS, offline
    Network,
    /// Call exceeded its budget (including time spent queued)
    Timeout,
    /// 502/504 class
    Gateway,
    /// 503 class
    ServiceUnavailable,
    /// Other 5xx
    Server,
}

impl fmt::Display for TransientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Network => "network",
            Self::Timeout => "timeout",
            Self::Gateway => "gateway",
            Self::ServiceUnavailable => "service-unavailable",
            Self::Server => "server",
        };
        f.write_str(s)
    }
}

/// Coarse classification used for retry and breaker decisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transient,
    Permission,
    VersionConflict,
    AccessDenied,
    Validation,
    CircuitOpen,
    Overloaded,
}

/// Outcome of a failed outbound call
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum RemoteError {
    /// Network, timeout or server-side failure
    #[error("transient {kind} failure: {message}")]
    Transient { kind: TransientKind, message: String },

    /// 401/403 for a single mutation
    #[error("permission denied: {0}")]
    Permission(String),

    /// Remote row is newer than the one the mutation was based on
    #[error("version conflict: remote at v{remote_version} ({remote_updated_at})")]
    VersionConflict {
        remote_version: u64,
        remote_updated_at: DateTime<Utc>,
    },

    /// Whole scope is gone or no longer shared with the user
    #[error("scope not accessible: {0}")]
    AccessDenied(String),

    /// Payload rejected by the remote
    #[error("validation failed: {0}")]
    Validation(String),

    /// Fail-fast rejection by the circuit breaker; no network attempt made
    #[error("circuit open, retry in {retry_after_ms}ms")]
    CircuitOpen { retry_after_ms: u64 },

    /// Best-effort request queue is full
    #[error("request queue full ({0} waiting)")]
    Overloaded(usize),
}

impl RemoteError {
    /// Create transient error
    #[inline]
    pub fn transient(kind: TransientKind, message: impl Into<String>) -> Self {
        Self::Transient {
            kind,
            message: message.into(),
        }
    }

    /// Create timeout error
    #[inline]
    pub fn timeout(after_ms: u64) -> Self {
        Self::transient(TransientKind::Timeout, format!("no response after {after_ms}ms"))
    }

    /// Classification
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Transient { .. } => ErrorKind::Transient,
            Self::Permission(_) => ErrorKind::Permission,
            Self::VersionConflict { .. } => ErrorKind::VersionConflict,
            Self::AccessDenied(_) => ErrorKind::AccessDenied,
            Self::Validation(_) => ErrorKind::Validation,
            Self::CircuitOpen { .. } => ErrorKind::CircuitOpen,
            Self::Overloaded(_) => ErrorKind::Overloaded,
        }
    }

    /// Whether the same request may succeed later unchanged
    #[inline]
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Transient { .. } | Self::CircuitOpen { .. } | Self::Overloaded(_)
        )
    }

    /// Whether the failure says something about remote health.
    ///
    /// Only transient failures count toward opening a circuit breaker; the
    /// breaker narrows this further by its configured kinds.
    #[inline]
    #[must_use]
    pub fn trips_breaker(&self) -> bool {
        matches!(self, Self::Transient { .. })
    }

    /// Transient kind, if any
    #[inline]
    #[must_use]
    pub fn transient_kind(&self) -> Option<TransientKind> {
        match self {
            Self::Transient { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Whether a network attempt actually happened
    #[inline]
    #[must_use]
    pub fn reached_network(&self) -> bool {
        !matches!(self, Self::CircuitOpen { .. } | Self::Overloaded(_))
    }
}

/// Configuration loading errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Config file unreadable
    #[error("io error reading {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// TOML syntax or type error
    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// Values parse but make no sense together
    #[error("invalid configuration: {0}")]
    Invalid(String),
}
