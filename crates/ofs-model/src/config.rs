//! Configuration for the sync core
//!
//! One [`SyncConfig`] is loaded at startup (TOML or defaults) and each
//! component receives its own section in its constructor. Nothing reads
//! configuration from globals.

use crate::error::{ConfigError, TransientKind};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level configuration
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    pub queue: QueueConfig,
    pub tombstones: TombstoneConfig,
    pub breaker: BreakerConfig,
    pub throttle: ThrottleConfig,
    pub retry: RetryConfig,
    pub optimistic: OptimisticConfig,
    pub orchestrator: OrchestratorConfig,
    pub conflict: ConflictConfig,
    pub storage: StorageConfig,
}

impl SyncConfig {
    /// Create default configuration
    #[inline]
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse from TOML; missing keys take defaults
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Read and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    /// Render as TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Invalid(e.to_string()))
    }

    /// With queue soft and hard capacity
    #[inline]
    #[must_use]
    pub fn with_queue_capacity(mut self, max_size: usize, hard_max_size: usize) -> Self {
        self.queue.max_size = max_size;
        self.queue.hard_max_size = hard_max_size;
        self
    }

    /// With conflict strategy
    #[inline]
    #[must_use]
    pub fn with_conflict_strategy(mut self, strategy: ConflictStrategy) -> Self {
        self.conflict.strategy = strategy;
        self
    }

    /// With throttle concurrency
    #[inline]
    #[must_use]
    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.throttle.max_concurrent = max;
        self
    }

    /// With retry policy
    #[inline]
    #[must_use]
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Reject combinations that cannot work
    pub fn validate(&self) -> Result<(), ConfigError> {
        let q = &self.queue;
        if q.max_size == 0 {
            return Err(ConfigError::Invalid("queue.max_size must be > 0".into()));
        }
        if q.hard_max_size < q.max_size {
            return Err(ConfigError::Invalid(format!(
                "queue.hard_max_size ({}) below queue.max_size ({})",
                q.hard_max_size, q.max_size
            )));
        }
        if q.warning_threshold_pct > q.force_process_threshold_pct {
            return Err(ConfigError::Invalid(
                "queue.warning_threshold_pct above queue.force_process_threshold_pct".into(),
            ));
        }
        if self.throttle.max_concurrent == 0 {
            return Err(ConfigError::Invalid("throttle.max_concurrent must be > 0".into()));
        }
        if self.breaker.failure_threshold == 0 || self.breaker.half_open_probes == 0 {
            return Err(ConfigError::Invalid(
                "breaker.failure_threshold and breaker.half_open_probes must be > 0".into(),
            ));
        }
        if self.retry.base_delay_ms > self.retry.max_delay_ms {
            return Err(ConfigError::Invalid("retry.base_delay_ms above retry.max_delay_ms".into()));
        }
        if !(0.0..=1.0).contains(&self.orchestrator.offline_cache_warn_ratio) {
            return Err(ConfigError::Invalid(
                "orchestrator.offline_cache_warn_ratio must be within 0..=1".into(),
            ));
        }
        Ok(())
    }
}

/// Durable mutation queue
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Soft capacity; beyond it the oldest item is evicted
    pub max_size: usize,
    /// Absolute capacity; beyond it new items are rejected
    pub hard_max_size: usize,
    /// Items older than this are purged by `clean_expired`
    pub max_item_age_secs: u64,
    /// Items retried more than this are purged by `clean_expired`
    pub max_retries: u32,
    pub warning_threshold_pct: u8,
    pub force_process_threshold_pct: u8,
    pub warning_cooldown_secs: u64,
    pub storage_key: String,
    pub holding_storage_key: String,
}

impl QueueConfig {
    /// Max item age as a duration
    #[must_use]
    pub fn max_item_age(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.max_item_age_secs).unwrap_or(i64::MAX / 1000))
    }

    /// Warning cooldown
    #[must_use]
    pub fn warning_cooldown(&self) -> Duration {
        Duration::from_secs(self.warning_cooldown_secs)
    }
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            max_size: 1_000,
            hard_max_size: 1_200,
            max_item_age_secs: 7 * 24 * 60 * 60,
            max_retries: 10,
            warning_threshold_pct: 80,
            force_process_threshold_pct: 90,
            warning_cooldown_secs: 60,
            storage_key: "mutation-queue".to_string(),
            holding_storage_key: "mutation-holding".to_string(),
        }
    }
}

/// Tombstone ledger
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TombstoneConfig {
    /// Remote-plane cache lifetime
    pub cache_ttl_secs: u64,
    pub max_cached_scopes: u64,
    pub storage_key: String,
}

impl TombstoneConfig {
    /// Cache TTL as a duration
    #[must_use]
    pub fn cache_ttl(&self) -> Duration {
        Duration::from_secs(self.cache_ttl_secs)
    }
}

impl Default for TombstoneConfig {
    fn default() -> Self {
        Self {
            cache_ttl_secs: 5 * 60,
            max_cached_scopes: 512,
            storage_key: "tombstones".to_string(),
        }
    }
}

/// Circuit breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive counted failures that open the circuit
    pub failure_threshold: u32,
    /// Time spent open before probing
    pub recovery_ms: u64,
    /// Calls let through while half-open
    pub half_open_probes: u32,
    /// Growth of the recovery window after a failed probe (1.0 = none)
    pub recovery_backoff: f64,
    pub max_recovery_ms: u64,
    /// Transient kinds that count toward opening
    pub tripping_kinds: Vec<TransientKind>,
}

impl BreakerConfig {
    /// Recovery window
    #[must_use]
    pub fn recovery(&self) -> Duration {
        Duration::from_millis(self.recovery_ms)
    }

    /// Upper bound of the recovery window
    #[must_use]
    pub fn max_recovery(&self) -> Duration {
        Duration::from_millis(self.max_recovery_ms.max(self.recovery_ms))
    }
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 3,
            recovery_ms: 30_000,
            half_open_probes: 1,
            recovery_backoff: 1.0,
            max_recovery_ms: 5 * 60_000,
            tripping_kinds: vec![
                TransientKind::Network,
                TransientKind::Timeout,
                TransientKind::Gateway,
                TransientKind::ServiceUnavailable,
                TransientKind::Server,
            ],
        }
    }
}

/// Request throttle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottleConfig {
    pub max_concurrent: usize,
    /// Waiting best-effort calls allowed; express calls are not bounded
    pub max_queue_len: usize,
    /// Budget per call including queue wait
    pub call_timeout_ms: u64,
}

impl ThrottleConfig {
    /// Per-call timeout
    #[must_use]
    pub fn call_timeout(&self) -> Duration {
        Duration::from_millis(self.call_timeout_ms)
    }
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            max_queue_len: 64,
            call_timeout_ms: 15_000,
        }
    }
}

/// Backoff retry for dispatched mutations
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts after the first one
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
    /// Randomize each delay within [delay/2, delay]
    pub jitter: bool,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
            multiplier: 2.0,
            jitter: true,
        }
    }
}

/// Optimistic snapshot manager
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OptimisticConfig {
    pub max_snapshots: usize,
    pub max_age_secs: u64,
    pub eviction_interval_secs: u64,
}

impl OptimisticConfig {
    /// Snapshot max age
    #[must_use]
    pub fn max_age(&self) -> Duration {
        Duration::from_secs(self.max_age_secs)
    }

    /// Background eviction period
    #[must_use]
    pub fn eviction_interval(&self) -> Duration {
        Duration::from_secs(self.eviction_interval_secs.max(1))
    }
}

impl Default for OptimisticConfig {
    fn default() -> Self {
        Self {
            max_snapshots: 50,
            max_age_secs: 60,
            eviction_interval_secs: 10,
        }
    }
}

/// Sync orchestrator and offline cache
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Subtracted from the observed maximum before it is used as a cursor
    pub watermark_lookback_secs: u64,
    pub watermark_storage_key: String,
    pub offline_cache_key: String,
    /// Practical ceiling of the primary store for one record
    pub offline_cache_ceiling_bytes: usize,
    /// Fraction of the ceiling at which a monitoring signal fires
    pub offline_cache_warn_ratio: f64,
    pub autosave_debounce_ms: u64,
}

impl OrchestratorConfig {
    /// Lookback as a duration
    #[must_use]
    pub fn watermark_lookback(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.watermark_lookback_secs).unwrap_or(0))
    }

    /// Autosave debounce
    #[must_use]
    pub fn autosave_debounce(&self) -> Duration {
        Duration::from_millis(self.autosave_debounce_ms)
    }
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            watermark_lookback_secs: 30,
            watermark_storage_key: "watermarks".to_string(),
            offline_cache_key: "offline-snapshot".to_string(),
            offline_cache_ceiling_bytes: 50 * 1024 * 1024,
            offline_cache_warn_ratio: 0.8,
            autosave_debounce_ms: 1_000,
        }
    }
}

/// How version conflicts on upsert are resolved
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictStrategy {
    /// Reject and ask the user to refresh and reapply
    Reject,
    /// Last writer wins, with a notice when a newer remote row is overwritten
    #[default]
    WarnAndOverwrite,
    /// Last writer wins, silently
    SilentOverwrite,
}

/// Conflict resolution
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    pub strategy: ConflictStrategy,
    /// Remote `updated_at` further than this into the future is not trusted
    pub version_tolerance_secs: u64,
}

impl ConflictConfig {
    /// Tolerance window
    #[must_use]
    pub fn version_tolerance(&self) -> chrono::Duration {
        chrono::Duration::seconds(i64::try_from(self.version_tolerance_secs).unwrap_or(0))
    }
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            strategy: ConflictStrategy::default(),
            version_tolerance_secs: 5 * 60,
        }
    }
}

/// Local storage tiers
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Tier A database file; in-memory when unset
    pub sqlite_path: Option<PathBuf>,
    /// Tier B directory; in-memory when unset
    pub kv_dir: Option<PathBuf>,
    /// Tier B byte quota across all keys
    pub kv_quota_bytes: usize,
    /// Wait after a tier A failure before writes try it again
    pub primary_recheck_ms: u64,
}

impl StorageConfig {
    /// Tier A recheck interval
    #[must_use]
    pub fn primary_recheck(&self) -> Duration {
        Duration::from_millis(self.primary_recheck_ms)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: None,
            kv_dir: None,
            kv_quota_bytes: 5 * 1024 * 1024,
            primary_recheck_ms: 30_000,
        }
    }
}
