//! Coordination of one in-flight storage operation
//!
//! All events for an operation (responses, timeout ticks, cancellation) go
//! through a single mutex scoped to that operation, so the read-modify-write
//! of an entry and the quorum decision that follows never interleave.
//! Finalization happens at most once: the first path to move the phase out
//! of `Admitted` owns the completion channel.

use super::entry_state::{EntryState, Recorded};
use super::handle::OperationHandle;
use super::quorum::{Quorum, Tally};
use super::registry::OperationRegistry;
use super::timeout::{TimeoutDecision, TimeoutPolicy};
use super::transport::ReplicaTransport;
use super::types::{
    OpKind, OpResult, OperationId, ReplicaId, ReplicaRequest, ReplicaResponse, StorageOperation,
};
use crate::common::{as_millis_f64, ReplicationMetrics, Result};
use bytes::Bytes;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Instant;
use tokio::sync::oneshot;

/// Operation-level lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationPhase {
    Admitted,
    Finalizing,
    Retired,
}

/// What happened to a routed response
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// Entry updated, quorum still undecided
    Applied,
    /// Entry updated and the operation finalized with this result
    Finalized(OpResult),
    /// Entry already terminal
    Duplicate,
    /// Operation already finalized or retired
    Late,
    /// Replica is not part of this operation
    UnknownReplica,
}

/// Shared collaborators handed to every coordinator
#[derive(Clone)]
pub struct CoordinatorContext {
    pub policy: TimeoutPolicy,
    pub exhaustion: OpResult,
    pub transport: Arc<dyn ReplicaTransport>,
    pub metrics: Arc<ReplicationMetrics>,
    pub registry: Weak<OperationRegistry>,
}

/// Point-in-time view of one replica's entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaSnapshot {
    pub replica: ReplicaId,
    pub result: OpResult,
    pub retries: u32,
    pub responses: u32,
}

#[derive(Debug, Clone)]
pub struct OperationSnapshot {
    pub id: OperationId,
    pub phase: OperationPhase,
    pub result: OpResult,
    pub replicas: Vec<ReplicaSnapshot>,
}

struct OperationState {
    phase: OperationPhase,
    result: OpResult,
    /// Fan-out order
    order: Vec<ReplicaId>,
    entries: HashMap<ReplicaId, EntryState>,
    completion: Option<oneshot::Sender<OpResult>>,
}

impl OperationState {
    fn results(&self) -> impl Iterator<Item = OpResult> + '_ {
        self.entries.values().map(EntryState::current_result)
    }
}

pub struct StorageOperationCoordinator {
    id: OperationId,
    key: String,
    kind: OpKind,
    payload: Option<Bytes>,
    quorum: Quorum,
    admitted_at: Instant,
    ctx: CoordinatorContext,
    responded: Arc<AtomicUsize>,
    state: Mutex<OperationState>,
}

impl StorageOperationCoordinator {
    /// Validate an operation and build its coordinator. Nothing is sent until
    /// [`start`](Self::start).
    pub fn new(
        operation: StorageOperation,
        mut ctx: CoordinatorContext,
        now: Instant,
    ) -> Result<(Arc<Self>, OperationHandle)> {
        operation.validate()?;
        if let Some(timeout) = operation.timeout {
            ctx.policy = ctx.policy.with_base_timeout(timeout)?;
        }

        let (tx, rx) = oneshot::channel();
        let responded = Arc::new(AtomicUsize::new(0));
        let n = operation.replicas.len();

        let entries = operation
            .replicas
            .iter()
            .map(|replica| (replica.clone(), EntryState::new(now)))
            .collect();

        let coordinator = Arc::new(Self {
            id: operation.id,
            key: operation.key,
            kind: operation.kind,
            payload: operation.payload,
            quorum: Quorum::new(n, operation.threshold),
            admitted_at: now,
            ctx,
            responded: responded.clone(),
            state: Mutex::new(OperationState {
                phase: OperationPhase::Admitted,
                result: OpResult::Incomplete,
                order: operation.replicas,
                entries,
                completion: Some(tx),
            }),
        });

        let handle = OperationHandle::new(coordinator.id, n, responded, rx);
        Ok((coordinator, handle))
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn quorum(&self) -> Quorum {
        self.quorum
    }

    fn lock_state(&self) -> MutexGuard<'_, OperationState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn request(&self, attempt: u32) -> ReplicaRequest {
        ReplicaRequest {
            operation_id: self.id,
            key: self.key.clone(),
            kind: self.kind,
            attempt,
            payload: self.payload.clone(),
        }
    }

    /// Fan out the first attempt to every replica.
    pub fn start(&self) {
        let state = self.lock_state();
        if state.phase != OperationPhase::Admitted {
            return;
        }
        tracing::debug!(
            "Op {} ({} {}): sending to {} replicas, need {}",
            self.id,
            self.kind,
            self.key,
            self.quorum.replicas,
            self.quorum.threshold
        );
        for replica in &state.order {
            self.ctx.transport.send(replica, self.request(0));
        }
    }

    /// Route one replica response to its entry and re-evaluate the quorum.
    pub fn on_response(&self, response: &ReplicaResponse, now: Instant) -> ResponseOutcome {
        let mut state = self.lock_state();
        if state.phase != OperationPhase::Admitted {
            self.ctx.metrics.late_responses.inc();
            tracing::debug!(
                "Op {}: late response from {} dropped",
                self.id,
                response.replica
            );
            return ResponseOutcome::Late;
        }

        let Some(entry) = state.entries.get_mut(&response.replica) else {
            self.ctx.metrics.stray_responses.inc();
            tracing::warn!(
                "Op {}: response from {} which is not in the replica set",
                self.id,
                response.replica
            );
            return ResponseOutcome::UnknownReplica;
        };

        match entry.record(response, now) {
            Recorded::Duplicate => {
                self.ctx.metrics.duplicate_responses.inc();
                tracing::debug!(
                    "Op {}: duplicate response from {} ({:?})",
                    self.id,
                    response.replica,
                    response.code
                );
                ResponseOutcome::Duplicate
            }
            Recorded::Applied(result) => {
                if result == OpResult::InvalidVersion {
                    tracing::warn!(
                        "Op {}: version conflict at {} (replica version {:?})",
                        self.id,
                        response.replica,
                        response.version
                    );
                } else {
                    tracing::debug!("Op {}: {} -> {}", self.id, response.replica, result);
                }
                match self.evaluate(&mut state) {
                    OpResult::Incomplete => ResponseOutcome::Applied,
                    decided => {
                        self.finalize(state, decided, now);
                        ResponseOutcome::Finalized(decided)
                    }
                }
            }
        }
    }

    /// Apply the timeout policy to every stalled replica. Returns the result
    /// if this tick finalized the operation.
    pub fn on_timeout_tick(&self, now: Instant) -> Option<OpResult> {
        let mut state = self.lock_state();
        if state.phase != OperationPhase::Admitted {
            return None;
        }

        let mut expired = false;
        let OperationState { order, entries, .. } = &mut *state;
        for replica in order.iter() {
            let Some(entry) = entries.get_mut(replica) else {
                continue;
            };
            if !self.ctx.policy.is_stalled(entry, now) {
                continue;
            }
            match self.ctx.policy.decide(entry) {
                TimeoutDecision::Retry { attempt } => {
                    entry.reset(now);
                    self.ctx.metrics.retries_sent.inc();
                    tracing::warn!(
                        "Op {}: {} silent, retry {}/{}",
                        self.id,
                        replica,
                        attempt,
                        self.ctx.policy.max_retries()
                    );
                    self.ctx.transport.send(replica, self.request(attempt));
                }
                TimeoutDecision::Expire => {
                    if entry.mark_timed_out() {
                        expired = true;
                        self.ctx.metrics.replica_timeouts.inc();
                        tracing::warn!(
                            "Op {}: {} timed out after {} retries",
                            self.id,
                            replica,
                            entry.retries()
                        );
                    }
                }
            }
        }

        if !expired {
            return None;
        }
        match self.evaluate(&mut state) {
            OpResult::Incomplete => None,
            decided => {
                self.finalize(state, decided, now);
                Some(decided)
            }
        }
    }

    /// Force finalization with `Error`. Returns false if the operation had
    /// already been decided.
    pub fn cancel(&self, now: Instant) -> bool {
        let state = self.lock_state();
        if state.phase != OperationPhase::Admitted {
            return false;
        }
        self.ctx.metrics.cancelled.inc();
        tracing::info!("Op {}: cancelled", self.id);
        self.finalize(state, OpResult::Error, now);
        true
    }

    /// Aggregate decision for the current entries; refreshes the progress
    /// counter as a side channel for the handle.
    fn evaluate(&self, state: &mut OperationState) -> OpResult {
        let tally = Tally::from_results(state.results());
        self.responded.store(tally.responded(), Ordering::Release);

        match self.quorum.evaluate_tally(&tally, self.ctx.exhaustion) {
            OpResult::Incomplete if tally.incomplete == 0 => OpResult::Failed,
            decided => decided,
        }
    }

    fn finalize(&self, mut state: MutexGuard<'_, OperationState>, result: OpResult, now: Instant) {
        debug_assert!(result.is_complete());
        state.phase = OperationPhase::Finalizing;
        state.result = result;
        let completion = state.completion.take();
        drop(state);

        let elapsed = now.saturating_duration_since(self.admitted_at);
        tracing::info!(
            "Op {} ({} {}) finalized: {} after {:.1}ms",
            self.id,
            self.kind,
            self.key,
            result,
            as_millis_f64(elapsed)
        );
        self.ctx.metrics.record_finalized(result, elapsed);

        if let Some(registry) = self.ctx.registry.upgrade() {
            registry.retire(&self.id);
        }
        self.lock_state().phase = OperationPhase::Retired;

        // Signal last so a woken caller observes the operation as retired.
        if let Some(tx) = completion {
            if tx.send(result).is_err() {
                tracing::debug!("Op {}: caller went away before completion", self.id);
            }
        }
    }

    pub fn phase(&self) -> OperationPhase {
        self.lock_state().phase
    }

    /// Overall result; `Incomplete` until finalized
    pub fn result(&self) -> OpResult {
        self.lock_state().result
    }

    pub fn snapshot(&self) -> OperationSnapshot {
        let state = self.lock_state();
        let replicas = state
            .order
            .iter()
            .filter_map(|replica| {
                state.entries.get(replica).map(|entry| ReplicaSnapshot {
                    replica: replica.clone(),
                    result: entry.current_result(),
                    retries: entry.retries(),
                    responses: entry.responses(),
                })
            })
            .collect();
        OperationSnapshot {
            id: self.id,
            phase: state.phase,
            result: state.result,
            replicas,
        }
    }
}

impl std::fmt::Debug for StorageOperationCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StorageOperationCoordinator")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("key", &self.key)
            .field("quorum", &self.quorum)
            .finish_non_exhaustive()
    }
}
