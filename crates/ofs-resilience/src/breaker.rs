//! Circuit breaker
//!
//! ```text
//! Closed --(threshold counted failures)--> Open
//! Open --(recovery window elapsed)--> HalfOpen
//! HalfOpen --(probe success)--> Closed
//! HalfOpen --(probe failure)--> Open (window restarts, optionally longer)
//! ```
//!
//! Only transient failures of the configured kinds are counted. Failures that
//! never reached the network (the breaker's own rejection, a full throttle
//! queue) are neutral. Any other remote answer proves the remote is up and
//! counts as success for health purposes.

use ofs_model::{BreakerConfig, RemoteError};
use parking_lot::Mutex;
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Breaker status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CircuitStatus {
    /// Calls flow, failures are counted
    Closed,
    /// Calls fail fast
    Open,
    /// A limited number of probe calls are let through
    HalfOpen,
}

impl fmt::Display for CircuitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half-open",
        };
        f.write_str(s)
    }
}

/// Point-in-time view of the breaker
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub status: CircuitStatus,
    pub consecutive_failures: u32,
    pub opened_at: Option<Instant>,
    /// Current recovery window (grows with backoff after failed probes)
    pub recovery: Duration,
}

#[derive(Debug)]
struct Inner {
    status: CircuitStatus,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    recovery: Duration,
    probes_in_flight: u32,
}

/// Three-state circuit breaker shared by every outbound call
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    inner: Mutex<Inner>,
}

impl CircuitBreaker {
    #[must_use]
    pub fn new(config: BreakerConfig) -> Self {
        let recovery = config.recovery();
        Self {
            config,
            inner: Mutex::new(Inner {
                status: CircuitStatus::Closed,
                consecutive_failures: 0,
                opened_at: None,
                recovery,
                probes_in_flight: 0,
            }),
        }
    }

    /// Ask permission for one call.
    ///
    /// # Errors
    /// [`RemoteError::CircuitOpen`] while open, or while half-open with the
    /// probe budget used up. No network attempt must be made in that case.
    pub fn try_acquire(&self) -> Result<(), RemoteError> {
        let mut inner = self.inner.lock();
        let now = Instant::now();

        if inner.status == CircuitStatus::Open {
            let opened_at = inner.opened_at.unwrap_or(now);
            let elapsed = now.saturating_duration_since(opened_at);
            if elapsed < inner.recovery {
                return Err(RemoteError::CircuitOpen {
                    retry_after_ms: millis(inner.recovery - elapsed),
                });
            }
            info!("circuit half-open, probing remote");
            inner.status = CircuitStatus::HalfOpen;
            inner.probes_in_flight = 0;
        }

        if inner.status == CircuitStatus::HalfOpen {
            if inner.probes_in_flight >= self.config.half_open_probes.max(1) {
                return Err(RemoteError::CircuitOpen { retry_after_ms: 0 });
            }
            inner.probes_in_flight += 1;
        }
        Ok(())
    }

    /// Whether a retry may be scheduled now
    #[must_use]
    pub fn allows_retry(&self) -> bool {
        self.inner.lock().status != CircuitStatus::Open
    }

    /// Whether this failure is counted toward opening
    #[must_use]
    pub fn counts(&self, err: &RemoteError) -> bool {
        err.trips_breaker()
            && err
                .transient_kind()
                .is_some_and(|kind| self.config.tripping_kinds.contains(&kind))
    }

    /// Record a successful call
    pub fn record_success(&self) {
        let mut inner = self.inner.lock();
        match inner.status {
            CircuitStatus::Closed => inner.consecutive_failures = 0,
            CircuitStatus::HalfOpen => {
                info!("probe succeeded, circuit closed");
                inner.status = CircuitStatus::Closed;
                inner.consecutive_failures = 0;
                inner.opened_at = None;
                inner.probes_in_flight = 0;
                inner.recovery = self.config.recovery();
            }
            // late answer from a call admitted before the circuit opened
            CircuitStatus::Open => {}
        }
    }

    /// Record a failed call
    pub fn record_failure(&self, err: &RemoteError) {
        if !err.reached_network() {
            let mut inner = self.inner.lock();
            if inner.status == CircuitStatus::HalfOpen {
                inner.probes_in_flight = inner.probes_in_flight.saturating_sub(1);
            }
            return;
        }
        if !self.counts(err) {
            self.record_success();
            return;
        }

        let mut inner = self.inner.lock();
        match inner.status {
            CircuitStatus::Closed => {
                inner.consecutive_failures += 1;
                debug!(failures = inner.consecutive_failures, error = %err, "counted failure");
                if inner.consecutive_failures >= self.config.failure_threshold {
                    self.open(&mut inner);
                }
            }
            CircuitStatus::HalfOpen => {
                let grown = inner.recovery.mul_f64(self.config.recovery_backoff.max(1.0));
                inner.recovery = grown.min(self.config.max_recovery());
                self.open(&mut inner);
            }
            CircuitStatus::Open => {}
        }
    }

    /// Record either outcome of a call
    pub fn record<T>(&self, result: &Result<T, RemoteError>) {
        match result {
            Ok(_) => self.record_success(),
            Err(e) => self.record_failure(e),
        }
    }

    fn open(&self, inner: &mut Inner) {
        inner.status = CircuitStatus::Open;
        inner.opened_at = Some(Instant::now());
        inner.probes_in_flight = 0;
        metrics::counter!("ofs_breaker_opened_total").increment(1);
        warn!(
            failures = inner.consecutive_failures,
            recovery_ms = millis(inner.recovery),
            "circuit opened"
        );
    }

    /// Current status
    #[must_use]
    pub fn status(&self) -> CircuitStatus {
        self.inner.lock().status
    }

    /// Snapshot of the breaker
    #[must_use]
    pub fn state(&self) -> CircuitBreakerState {
        let inner = self.inner.lock();
        CircuitBreakerState {
            status: inner.status,
            consecutive_failures: inner.consecutive_failures,
            opened_at: inner.opened_at,
            recovery: inner.recovery,
        }
    }

    /// Force back to closed (account switch, manual retry)
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.status = CircuitStatus::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probes_in_flight = 0;
        inner.recovery = self.config.recovery();
    }
}

fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}
