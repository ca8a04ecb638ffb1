//! Engine configuration
//!
//! [`EngineConfig`] groups one section per subsystem. Every field has a
//! default, so a RON document only needs to name what it overrides:
//!
//! ```
//! use hotswap_engine::EngineConfig;
//!
//! let config = EngineConfig::from_ron_str("(breaker: (failure_threshold: 3))").unwrap();
//! assert_eq!(config.breaker.failure_threshold, 3);
//! assert_eq!(config.breaker.open_timeout_ms, 1_000);
//! ```

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level engine configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub transaction: TransactionConfig,
    pub snapshot: SnapshotConfig,
    pub conflict: ConflictConfig,
    pub recovery: RecoveryConfig,
    pub breaker: BreakerConfig,
    pub health: HealthConfig,
}

impl EngineConfig {
    /// Parse a configuration from RON text and validate it
    pub fn from_ron_str(text: &str) -> Result<Self> {
        let config: EngineConfig =
            ron::from_str(text).map_err(|e| Error::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration as pretty RON
    pub fn to_ron_string(&self) -> Result<String> {
        ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
            .map_err(|e| Error::Config(e.to_string()))
    }

    /// Check cross-field constraints
    pub fn validate(&self) -> Result<()> {
        let t = &self.transaction;
        ensure(t.max_concurrent > 0, "transaction.max_concurrent must be > 0")?;
        ensure(t.prepare_timeout_ms > 0, "transaction.prepare_timeout_ms must be > 0")?;
        ensure(t.history_depth > 0, "transaction.history_depth must be > 0")?;

        let s = &self.snapshot;
        ensure(s.max_snapshot_bytes > 0, "snapshot.max_snapshot_bytes must be > 0")?;
        ensure(
            s.max_snapshot_bytes <= s.total_budget_bytes,
            "snapshot.max_snapshot_bytes exceeds snapshot.total_budget_bytes",
        )?;

        let c = &self.conflict;
        ensure(
            (0.0..=1.0).contains(&c.confidence_threshold),
            "conflict.confidence_threshold must be within [0, 1]",
        )?;
        ensure(c.region_size > 0, "conflict.region_size must be > 0")?;
        ensure(
            c.model_weights.len() == crate::conflict::FEATURE_COUNT,
            "conflict.model_weights has the wrong length",
        )?;

        let r = &self.recovery;
        ensure(
            r.backoff_base_ms <= r.backoff_cap_ms,
            "recovery.backoff_base_ms exceeds recovery.backoff_cap_ms",
        )?;
        ensure(
            (0.0..=1.0).contains(&r.high_risk_threshold),
            "recovery.high_risk_threshold must be within [0, 1]",
        )?;

        let b = &self.breaker;
        ensure(b.failure_threshold > 0, "breaker.failure_threshold must be > 0")?;
        ensure(b.success_threshold > 0, "breaker.success_threshold must be > 0")?;

        let h = &self.health;
        ensure(h.window >= 2, "health.window must be >= 2")?;
        ensure(h.channel_capacity > 0, "health.channel_capacity must be > 0")?;
        ensure(
            (0.0..=1.0).contains(&h.confidence_floor),
            "health.confidence_floor must be within [0, 1]",
        )?;
        ensure(
            h.model_weights.len() == crate::health::FEATURE_COUNT,
            "health.model_weights has the wrong length",
        )?;
        Ok(())
    }
}

fn ensure(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(Error::Config(message.to_string()))
    }
}

/// Transaction manager settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Maximum number of open transactions
    pub max_concurrent: usize,
    /// Idle time after which `abort_expired` aborts a transaction
    pub transaction_timeout_ms: u64,
    /// Bound on the wait for all prepare votes
    pub prepare_timeout_ms: u64,
    /// Bound on a blocking intent lock acquisition
    pub intent_timeout_ms: u64,
    /// Committed versions kept per module
    pub history_depth: usize,
    /// Committed transaction records kept for replay and inspection
    pub committed_history: usize,
}

impl TransactionConfig {
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    pub fn prepare_timeout(&self) -> Duration {
        Duration::from_millis(self.prepare_timeout_ms)
    }

    pub fn intent_timeout(&self) -> Duration {
        Duration::from_millis(self.intent_timeout_ms)
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 64,
            transaction_timeout_ms: 5_000,
            prepare_timeout_ms: 100,
            intent_timeout_ms: 50,
            history_depth: 16,
            committed_history: 256,
        }
    }
}

/// Snapshot store settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Largest single state blob accepted by `capture`
    pub max_snapshot_bytes: usize,
    /// Total stored bytes across all live snapshots
    pub total_budget_bytes: usize,
    /// Blobs at least this large are compressed
    pub compression_threshold: usize,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: 16 * 1024 * 1024,
            total_budget_bytes: 256 * 1024 * 1024,
            compression_threshold: 4 * 1024,
        }
    }
}

/// Conflict detector and resolver settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Merges scored below this confidence escalate to manual review
    pub confidence_threshold: f64,
    /// Byte region size for diffing raw and `Bytes` state
    pub region_size: usize,
    /// Merge-success model bias
    pub model_bias: f64,
    /// Merge-success model weights, one per conflict feature
    pub model_weights: Vec<f64>,
    /// Step size for online model updates
    pub learning_rate: f64,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: 0.6,
            region_size: 64,
            model_bias: 1.5,
            // overlap ratio, structural ratio, complexity, severity, identical ratio, semantic ratio
            model_weights: vec![-1.0, -2.0, -1.0, -2.0, 1.0, 1.0],
            learning_rate: 0.01,
        }
    }
}

/// Recovery engine settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RecoveryConfig {
    /// Attempts made by the retry strategy before escalating
    pub max_retry_attempts: u32,
    /// First backoff delay; doubles per attempt
    pub backoff_base_ms: u64,
    /// Upper bound on a single backoff delay
    pub backoff_cap_ms: u64,
    /// Target duration of one recovery; overruns are counted, not enforced
    pub budget_ms: u64,
    /// Failure probability at which retry escalates to isolation
    pub high_risk_threshold: f64,
    /// Recovery actions kept for inspection
    pub history_capacity: usize,
}

impl RecoveryConfig {
    /// Backoff before retry `attempt` (zero-based)
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        let ms = self.backoff_base_ms.saturating_mul(factor).min(self.backoff_cap_ms);
        Duration::from_millis(ms)
    }
}

impl Default for RecoveryConfig {
    fn default() -> Self {
        Self {
            max_retry_attempts: 3,
            backoff_base_ms: 1,
            backoff_cap_ms: 50,
            budget_ms: 50,
            high_risk_threshold: 0.6,
            history_capacity: 256,
        }
    }
}

/// Circuit breaker settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BreakerConfig {
    /// Consecutive failures that open a closed breaker
    pub failure_threshold: u32,
    /// Successful half-open trials needed to close again
    pub success_threshold: u32,
    /// Time an open breaker waits before admitting a trial
    pub open_timeout_ms: u64,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 1,
            open_timeout_ms: 1_000,
        }
    }
}

/// Health monitor and failure predictor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthConfig {
    /// Samples kept per metric
    pub window: usize,
    /// Predictions below this confidence are invalid
    pub confidence_floor: f64,
    /// Samples needed for full confidence
    pub min_samples: usize,
    /// Interval of the background monitor loop
    pub monitor_interval_ms: u64,
    /// Interval of the background prediction loop
    pub prediction_interval_ms: u64,
    /// Capacity of the sample channel; samples beyond it are dropped
    pub channel_capacity: usize,
    /// Mispredictions kept for offline retraining
    pub misprediction_log: usize,
    /// Failure model bias
    pub model_bias: f64,
    /// Failure model weights: error rate, latency trend, resource usage, conflict density
    pub model_weights: Vec<f64>,
    /// Step size for online model updates
    pub learning_rate: f64,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            window: 64,
            confidence_floor: 0.5,
            min_samples: 8,
            monitor_interval_ms: 10,
            prediction_interval_ms: 100,
            channel_capacity: 1024,
            misprediction_log: 128,
            model_bias: -3.0,
            model_weights: vec![4.0, 2.0, 2.0, 1.5],
            learning_rate: 0.01,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_partial_ron() {
        let config = EngineConfig::from_ron_str(
            "(transaction: (prepare_timeout_ms: 20), conflict: (confidence_threshold: 0.9))",
        )
        .unwrap();
        assert_eq!(config.transaction.prepare_timeout_ms, 20);
        assert_eq!(config.transaction.max_concurrent, 64);
        assert_eq!(config.conflict.confidence_threshold, 0.9);
    }

    #[test]
    fn test_ron_roundtrip() {
        let config = EngineConfig::default();
        let text = config.to_ron_string().unwrap();
        assert_eq!(EngineConfig::from_ron_str(&text).unwrap(), config);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = EngineConfig::default();
        config.conflict.confidence_threshold = 1.5;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        let mut config = EngineConfig::default();
        config.health.model_weights.pop();
        assert!(config.validate().is_err());

        assert!(EngineConfig::from_ron_str("(breaker: (failure_threshold: 0))").is_err());
        assert!(EngineConfig::from_ron_str("not ron").is_err());
    }

    #[test]
    fn test_backoff_is_capped() {
        let config = RecoveryConfig {
            backoff_base_ms: 2,
            backoff_cap_ms: 10,
            ..RecoveryConfig::default()
        };
        assert_eq!(config.backoff(0), Duration::from_millis(2));
        assert_eq!(config.backoff(1), Duration::from_millis(4));
        assert_eq!(config.backoff(3), Duration::from_millis(10));
        assert_eq!(config.backoff(80), Duration::from_millis(10));
    }
}
