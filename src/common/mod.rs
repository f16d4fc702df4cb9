//! Common utilities and types shared across kvquorum

pub mod config;
pub mod error;
pub mod metrics;
pub mod utils;

pub use self::config::{
    ExhaustionResult, QuorumConfig, ReplicationConfig, ThresholdPolicy, TimeoutConfig,
    MIN_RELATIVE_TIMEOUT_MS,
};
pub use error::{Error, Result};
pub use metrics::{Counter, Gauge, Histogram, ReplicationMetrics};
pub use utils::{as_millis_f64, parse_duration};
