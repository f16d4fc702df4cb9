//! Configuration for the replication layer
//!
//! Values are loaded once (file + environment) and handed to the core as
//! plain value objects. Nothing under `replication` reads configuration
//! sources on its own.

use crate::common::{Error, Result};
use crate::replication::{OpKind, OpResult};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Smallest relative timeout accepted for a single replica attempt.
pub const MIN_RELATIVE_TIMEOUT_MS: u64 = 100;

/// Environment variable prefix, e.g. `KVQUORUM__TIMEOUT__MAX_RETRIES=3`
pub const ENV_PREFIX: &str = "KVQUORUM";

/// Global configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicationConfig {
    /// Success thresholds per operation kind
    pub quorum: QuorumConfig,

    /// Per-attempt timeout and retry budget
    pub timeout: TimeoutConfig,

    /// Result reported when replica timeouts are what made success unreachable
    pub exhaustion_result: ExhaustionResult,

    /// Interval of the timer facility driving timeout ticks
    #[serde(default = "default_tick_interval")]
    pub tick_interval_ms: u64,
}

fn default_tick_interval() -> u64 {
    25
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            quorum: QuorumConfig::default(),
            timeout: TimeoutConfig::default(),
            exhaustion_result: ExhaustionResult::default(),
            tick_interval_ms: default_tick_interval(),
        }
    }
}

/// How many replica acknowledgements an operation needs out of N.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ThresholdPolicy {
    All,
    Majority,
    One,
    Count(usize),
}

impl ThresholdPolicy {
    /// Resolve against a replica set of size `n`.
    ///
    /// `Count` is clamped into `[1, n]`; an empty set resolves to 0 and is
    /// rejected later at admission.
    pub fn resolve(&self, n: usize) -> usize {
        match *self {
            ThresholdPolicy::All => n,
            ThresholdPolicy::Majority => n / 2 + 1,
            ThresholdPolicy::One => 1,
            ThresholdPolicy::Count(k) => k.clamp(1, n.max(1)),
        }
        .min(n)
    }
}

/// Threshold policy per operation kind
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct QuorumConfig {
    pub put: ThresholdPolicy,
    pub get: ThresholdPolicy,
    pub invalidate: ThresholdPolicy,
}

impl Default for QuorumConfig {
    fn default() -> Self {
        Self {
            put: ThresholdPolicy::Majority,
            get: ThresholdPolicy::Majority,
            invalidate: ThresholdPolicy::All,
        }
    }
}

impl QuorumConfig {
    pub fn policy(&self, kind: OpKind) -> ThresholdPolicy {
        match kind {
            OpKind::Put => self.put,
            OpKind::Get => self.get,
            OpKind::Invalidate => self.invalidate,
        }
    }
}

/// Timeout configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimeoutConfig {
    /// Relative timeout of the first attempt to a replica
    #[serde(default = "default_base_timeout")]
    pub base_timeout_ms: u64,

    /// Retries issued to a silent replica before it is marked timed out
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    /// Growth factor of the per-attempt timeout
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,

    /// Upper bound on any single attempt's timeout
    #[serde(default = "default_max_timeout")]
    pub max_timeout_ms: u64,
}

fn default_base_timeout() -> u64 {
    MIN_RELATIVE_TIMEOUT_MS
}
fn default_max_retries() -> u32 {
    2
}
fn default_backoff_multiplier() -> f64 {
    1.0
}
fn default_max_timeout() -> u64 {
    10_000
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            base_timeout_ms: default_base_timeout(),
            max_retries: default_max_retries(),
            backoff_multiplier: default_backoff_multiplier(),
            max_timeout_ms: default_max_timeout(),
        }
    }
}

impl TimeoutConfig {
    pub fn base_timeout(&self) -> Duration {
        Duration::from_millis(self.base_timeout_ms)
    }

    pub fn max_timeout(&self) -> Duration {
        Duration::from_millis(self.max_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.base_timeout_ms < MIN_RELATIVE_TIMEOUT_MS {
            return Err(Error::InvalidConfig(format!(
                "base_timeout_ms must be at least {} (got {})",
                MIN_RELATIVE_TIMEOUT_MS, self.base_timeout_ms
            )));
        }
        if !self.backoff_multiplier.is_finite() || self.backoff_multiplier < 1.0 {
            return Err(Error::InvalidConfig(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if self.max_timeout_ms < self.base_timeout_ms {
            return Err(Error::InvalidConfig(format!(
                "max_timeout_ms ({}) is below base_timeout_ms ({})",
                self.max_timeout_ms, self.base_timeout_ms
            )));
        }
        Ok(())
    }
}

/// Aggregate result when timed-out replicas decide the outcome.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExhaustionResult {
    #[default]
    Timeout,
    Failed,
}

impl ExhaustionResult {
    pub fn as_op_result(self) -> OpResult {
        match self {
            ExhaustionResult::Timeout => OpResult::Timeout,
            ExhaustionResult::Failed => OpResult::Failed,
        }
    }
}

impl ReplicationConfig {
    /// Load from an optional TOML file, then `KVQUORUM__*` environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: ReplicationConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        self.timeout.validate()?;
        if self.tick_interval_ms == 0 {
            return Err(Error::InvalidConfig("tick_interval_ms must be > 0".into()));
        }
        for (name, policy) in [
            ("put", self.quorum.put),
            ("get", self.quorum.get),
            ("invalidate", self.quorum.invalidate),
        ] {
            if policy == ThresholdPolicy::Count(0) {
                return Err(Error::InvalidConfig(format!(
                    "quorum.{} count must be at least 1",
                    name
                )));
            }
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::Mutex;

    // `load` reads the process environment; tests that call it take turns.
    static LOAD_LOCK: Mutex<()> = Mutex::new(());

    #[test]
    fn test_defaults_are_valid() {
        let config = ReplicationConfig::default();
        config.validate().unwrap();
        assert_eq!(config.timeout.base_timeout(), Duration::from_millis(100));
        assert_eq!(config.timeout.max_retries, 2);
        assert_eq!(config.exhaustion_result, ExhaustionResult::Timeout);
    }

    #[test]
    fn test_threshold_resolution() {
        assert_eq!(ThresholdPolicy::All.resolve(3), 3);
        assert_eq!(ThresholdPolicy::Majority.resolve(3), 2);
        assert_eq!(ThresholdPolicy::Majority.resolve(4), 3);
        assert_eq!(ThresholdPolicy::Majority.resolve(1), 1);
        assert_eq!(ThresholdPolicy::One.resolve(5), 1);
        assert_eq!(ThresholdPolicy::Count(7).resolve(3), 3);
        assert_eq!(ThresholdPolicy::Count(2).resolve(3), 2);
        assert_eq!(ThresholdPolicy::All.resolve(0), 0);
        assert_eq!(ThresholdPolicy::One.resolve(0), 0);
    }

    #[test]
    fn test_timeout_below_minimum_rejected() {
        let timeout = TimeoutConfig {
            base_timeout_ms: 50,
            ..Default::default()
        };
        assert!(matches!(timeout.validate(), Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_backoff_below_one_rejected() {
        let timeout = TimeoutConfig {
            backoff_multiplier: 0.5,
            ..Default::default()
        };
        assert!(timeout.validate().is_err());
    }

    #[test]
    fn test_zero_count_rejected() {
        let mut config = ReplicationConfig::default();
        config.quorum.get = ThresholdPolicy::Count(0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_load_from_toml() {
        let _guard = LOAD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(
            file,
            r#"
exhaustion_result = "failed"
tick_interval_ms = 10

[quorum]
put = "all"
get = "one"

[timeout]
base_timeout_ms = 250
max_retries = 4
"#
        )
        .unwrap();

        let config = ReplicationConfig::load(Some(file.path())).unwrap();
        assert_eq!(config.quorum.put, ThresholdPolicy::All);
        assert_eq!(config.quorum.get, ThresholdPolicy::One);
        assert_eq!(config.quorum.invalidate, ThresholdPolicy::All);
        assert_eq!(config.timeout.base_timeout_ms, 250);
        assert_eq!(config.timeout.max_retries, 4);
        assert_eq!(config.exhaustion_result, ExhaustionResult::Failed);
        assert_eq!(config.tick_interval_ms, 10);
    }

    #[test]
    fn test_load_rejects_short_timeout() {
        let _guard = LOAD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[timeout]\nbase_timeout_ms = 20").unwrap();

        let result = ReplicationConfig::load(Some(file.path()));
        assert!(matches!(result, Err(Error::InvalidConfig(_))));
    }

    #[test]
    fn test_environment_overrides() {
        let _guard = LOAD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        std::env::set_var("KVQUORUM__TIMEOUT__MAX_RETRIES", "5");
        std::env::set_var("KVQUORUM__EXHAUSTION_RESULT", "failed");
        let loaded = ReplicationConfig::load(None);
        std::env::remove_var("KVQUORUM__TIMEOUT__MAX_RETRIES");
        std::env::remove_var("KVQUORUM__EXHAUSTION_RESULT");

        let config = loaded.unwrap();
        assert_eq!(config.timeout.max_retries, 5);
        assert_eq!(config.exhaustion_result, ExhaustionResult::Failed);
        assert_eq!(config.timeout.base_timeout_ms, MIN_RELATIVE_TIMEOUT_MS);
    }

    #[test]
    fn test_environment_wins_over_file() {
        let _guard = LOAD_LOCK.lock().unwrap_or_else(|e| e.into_inner());
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        writeln!(file, "[timeout]\nmax_retries = 4\nbase_timeout_ms = 200").unwrap();

        std::env::set_var("KVQUORUM__TIMEOUT__MAX_RETRIES", "7");
        let loaded = ReplicationConfig::load(Some(file.path()));
        std::env::remove_var("KVQUORUM__TIMEOUT__MAX_RETRIES");

        let config = loaded.unwrap();
        assert_eq!(config.timeout.max_retries, 7);
        assert_eq!(config.timeout.base_timeout_ms, 200);
    }
}
