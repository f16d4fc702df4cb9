//! Replica-state tracking and quorum decisions
//!
//! For every put, get or invalidate the storage daemon issues against a key,
//! a [`StorageOperationCoordinator`] tracks one [`EntryState`] per replica,
//! asks the [`Quorum`] evaluator after every change whether the operation is
//! decided, and escalates silent replicas through the [`TimeoutPolicy`].
//!
//! ```text
//! admit ──► OperationRegistry ──► Coordinator ──send──► ReplicaTransport
//!                                    ▲    ▲
//!             on_response ───────────┘    └──────── on_timeout_tick (ticker)
//!                                    │
//!                                    ▼
//!                 finalize once ──► OperationHandle + retire
//! ```

pub mod coordinator;
pub mod entry_state;
pub mod handle;
pub mod quorum;
pub mod registry;
pub mod service;
pub mod timeout;
pub mod transport;
pub mod types;

pub use coordinator::{
    OperationPhase, OperationSnapshot, ReplicaSnapshot, ResponseOutcome,
    StorageOperationCoordinator,
};
pub use entry_state::{EntryState, Recorded};
pub use handle::{OperationHandle, Progress};
pub use quorum::{Quorum, Tally};
pub use registry::OperationRegistry;
pub use service::{spawn_timeout_ticker, ReplicationService};
pub use timeout::{TimeoutDecision, TimeoutPolicy};
pub use transport::{ChannelTransport, Outbound, ReplicaTransport};
pub use types::{
    OpKind, OpResult, OperationId, ReplicaId, ReplicaRequest, ReplicaResponse, ResponseCode,
    StorageOperation,
};
