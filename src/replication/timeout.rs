//! Per-attempt deadlines and retry escalation
//!
//! The policy only computes; the coordinator applies its decisions.

use super::entry_state::EntryState;
use crate::common::{Error, Result, TimeoutConfig};
use std::time::{Duration, Instant};

/// What to do with a stalled replica
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutDecision {
    /// Reset the entry and re-send; carries the retry number being started
    Retry { attempt: u32 },
    /// Retry budget exhausted; mark the entry timed out
    Expire,
}

#[derive(Debug, Clone)]
pub struct TimeoutPolicy {
    base: Duration,
    max_timeout: Duration,
    max_retries: u32,
    backoff_multiplier: f64,
}

impl TimeoutPolicy {
    /// Build from validated configuration.
    pub fn new(config: &TimeoutConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            base: config.base_timeout(),
            max_timeout: config.max_timeout(),
            max_retries: config.max_retries,
            backoff_multiplier: config.backoff_multiplier,
        })
    }

    /// Same policy with a different base timeout, still bounded below by
    /// the configured minimum.
    pub fn with_base_timeout(&self, base: Duration) -> Result<Self> {
        let to_millis = |d: Duration| {
            u64::try_from(d.as_millis()).map_err(|_| {
                Error::InvalidOperation(format!("timeout override {:?} is out of range", base))
            })
        };
        let config = TimeoutConfig {
            base_timeout_ms: to_millis(base)?,
            max_retries: self.max_retries,
            backoff_multiplier: self.backoff_multiplier,
            max_timeout_ms: to_millis(self.max_timeout.max(base))?,
        };
        Self::new(&config)
    }

    pub fn base_timeout(&self) -> Duration {
        self.base
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Relative timeout of the attempt following `retries` earlier retries
    pub fn attempt_timeout(&self, retries: u32) -> Duration {
        if retries == 0 || self.backoff_multiplier <= 1.0 {
            return self.base;
        }
        let factor = self.backoff_multiplier.powi(retries.min(i32::MAX as u32) as i32);
        let scaled = self.base.as_secs_f64() * factor;
        if !scaled.is_finite() || scaled >= self.max_timeout.as_secs_f64() {
            self.max_timeout
        } else {
            Duration::from_secs_f64(scaled)
        }
    }

    /// Time after which an attempt started at `start` is stalled
    pub fn deadline(&self, start: Instant, retries: u32) -> Instant {
        start + self.attempt_timeout(retries)
    }

    pub fn is_stalled(&self, entry: &EntryState, now: Instant) -> bool {
        !entry.is_complete() && now >= self.deadline(entry.attempt_started(), entry.retries())
    }

    /// Decide for a stalled entry. Callers check [`is_stalled`](Self::is_stalled) first.
    pub fn decide(&self, entry: &EntryState) -> TimeoutDecision {
        if entry.retries() < self.max_retries {
            TimeoutDecision::Retry {
                attempt: entry.retries() + 1,
            }
        } else {
            TimeoutDecision::Expire
        }
    }
}

impl Default for TimeoutPolicy {
    fn default() -> Self {
        let config = TimeoutConfig::default();
        Self {
            base: config.base_timeout(),
            max_timeout: config.max_timeout(),
            max_retries: config.max_retries,
            backoff_multiplier: config.backoff_multiplier,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(base_ms: u64, retries: u32, backoff: f64) -> TimeoutPolicy {
        TimeoutPolicy::new(&TimeoutConfig {
            base_timeout_ms: base_ms,
            max_retries: retries,
            backoff_multiplier: backoff,
            max_timeout_ms: 1_000,
        })
        .unwrap()
    }

    #[test]
    fn test_rejects_below_minimum() {
        let config = TimeoutConfig {
            base_timeout_ms: 99,
            ..Default::default()
        };
        assert!(TimeoutPolicy::new(&config).is_err());
    }

    #[test]
    fn test_deadline_constant_without_backoff() {
        let p = policy(100, 2, 1.0);
        let start = Instant::now();
        assert_eq!(p.deadline(start, 0), start + Duration::from_millis(100));
        assert_eq!(p.deadline(start, 2), start + Duration::from_millis(100));
    }

    #[test]
    fn test_backoff_is_capped() {
        let p = policy(200, 5, 2.0);
        assert_eq!(p.attempt_timeout(0), Duration::from_millis(200));
        assert_eq!(p.attempt_timeout(1), Duration::from_millis(400));
        assert_eq!(p.attempt_timeout(2), Duration::from_millis(800));
        assert_eq!(p.attempt_timeout(3), Duration::from_millis(1_000));
        assert_eq!(p.attempt_timeout(60), Duration::from_millis(1_000));
    }

    #[test]
    fn test_stalled_only_after_deadline() {
        let p = policy(100, 2, 1.0);
        let start = Instant::now();
        let entry = EntryState::new(start);
        assert!(!p.is_stalled(&entry, start + Duration::from_millis(99)));
        assert!(p.is_stalled(&entry, start + Duration::from_millis(100)));
    }

    #[test]
    fn test_retry_then_expire() {
        let p = policy(100, 2, 1.0);
        let start = Instant::now();
        let mut entry = EntryState::new(start);

        assert_eq!(p.decide(&entry), TimeoutDecision::Retry { attempt: 1 });
        entry.reset(start + Duration::from_millis(100));
        assert_eq!(p.decide(&entry), TimeoutDecision::Retry { attempt: 2 });
        entry.reset(start + Duration::from_millis(200));
        assert_eq!(p.decide(&entry), TimeoutDecision::Expire);
    }

    #[test]
    fn test_zero_retries_expires_immediately() {
        let p = policy(100, 0, 1.0);
        let entry = EntryState::new(Instant::now());
        assert_eq!(p.decide(&entry), TimeoutDecision::Expire);
    }

    #[test]
    fn test_override_base_timeout() {
        let p = policy(100, 2, 1.0);
        let longer = p.with_base_timeout(Duration::from_millis(500)).unwrap();
        assert_eq!(longer.base_timeout(), Duration::from_millis(500));
        assert_eq!(longer.max_retries(), 2);
        assert!(p.with_base_timeout(Duration::from_millis(10)).is_err());
    }

    #[test]
    fn test_override_beyond_millisecond_range_rejected() {
        let p = policy(100, 2, 1.0);
        assert!(matches!(
            p.with_base_timeout(Duration::MAX),
            Err(Error::InvalidOperation(_))
        ));
        assert!(matches!(
            p.with_base_timeout(Duration::from_secs(u64::MAX / 1000 + 1)),
            Err(Error::InvalidOperation(_))
        ));
    }
}
