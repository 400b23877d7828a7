//! Sync watermarks
//!
//! A watermark is the server's "everything up to here has been observed"
//! cursor. Locally it only ever moves forward, and only as far as the
//! highest `updated_at` actually seen in a successful response.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Opaque, totally ordered server cursor
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Watermark(pub DateTime<Utc>);

impl Watermark {
    /// Cursor at a point in time
    #[inline]
    #[must_use]
    pub const fn at(instant: DateTime<Utc>) -> Self {
        Self(instant)
    }

    /// Earliest possible cursor ("fetch everything")
    #[inline]
    #[must_use]
    pub fn origin() -> Self {
        Self(DateTime::<Utc>::UNIX_EPOCH)
    }

    /// Step back by the safety lookback, saturating at the origin
    #[must_use]
    pub fn minus(self, lookback: Duration) -> Self {
        let origin = Self::origin();
        self.0
            .checked_sub_signed(lookback)
            .map_or(origin, |t| Self(t).max(origin))
    }

    /// Underlying instant
    #[inline]
    #[must_use]
    pub const fn instant(self) -> DateTime<Utc> {
        self.0
    }
}

impl fmt::Display for Watermark {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.to_rfc3339())
    }
}

/// Sync domain a watermark belongs to
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(tag = "domain", content = "id", rename_all = "snake_case")]
pub enum SyncDomain {
    /// A single project
    Scope(crate::ids::ScopeId),
    /// The list of projects visible to the user
    ScopeList,
    /// Background capture inbox
    Capture,
}

impl fmt::Display for SyncDomain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Scope(scope) => write!(f, "scope:{scope}"),
            Self::ScopeList => f.write_str("scope-list"),
            Self::Capture => f.write_str("capture"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn minus_saturates_at_origin() {
        let early = Watermark::at(Utc.timestamp_opt(10, 0).unwrap());
        assert_eq!(early.minus(Duration::seconds(60)), Watermark::origin());
    }

    #[test]
    fn minus_steps_back() {
        let t = Utc.timestamp_opt(1_000, 0).unwrap();
        assert_eq!(
            Watermark::at(t).minus(Duration::seconds(30)),
            Watermark::at(Utc.timestamp_opt(970, 0).unwrap())
        );
    }

    #[test]
    fn watermarks_order_by_time() {
        let a = Watermark::at(Utc.timestamp_opt(1, 0).unwrap());
        let b = Watermark::at(Utc.timestamp_opt(2, 0).unwrap());
        assert!(a < b);
    }
}
