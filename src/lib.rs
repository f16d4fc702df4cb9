//! # kvquorum
//!
//! The replication-consistency layer of a distributed key-value storage
//! daemon:
//! - Per-replica result tracking for every put, get and invalidate
//! - Quorum decisions with fail-fast when success becomes unreachable
//! - Per-attempt timeouts with bounded retries and backoff
//! - Exactly-once finalization, including under cancellation races
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────┐
//! │            ReplicationService            │
//! │  admit / on_response / tick / cancel     │
//! └───────────┬──────────────────────────────┘
//!             │ OperationRegistry (id → coordinator)
//!   ┌─────────┴──────────┬──────────────┐
//! ┌─▼──────────┐   ┌─────▼──────┐   ┌───▼────────┐
//! │ Op 1       │   │ Op 2       │   │ Op 3       │
//! │ r1 r2 r3   │   │ r1 r4 r5   │   │ r2 r3 r6   │
//! └────────────┘   └────────────┘   └────────────┘
//! ```
//!
//! ## Usage
//!
//! ### Run the simulator
//! ```bash
//! kvquorum-sim run --replicas 5 --ops 1000 --fail-rate 0.1 --drop-rate 0.05
//! ```

pub mod common;
pub mod replication;

// Re-export commonly used types
pub use common::{Error, ReplicationConfig, Result};
pub use replication::{OpResult, OperationHandle, ReplicationService, StorageOperation};

/// Current version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build info
pub const BUILD_INFO: &str = concat!(env!("CARGO_PKG_VERSION"), " (", env!("CARGO_PKG_NAME"), ")");
