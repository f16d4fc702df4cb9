//! Per-(operation, replica) state
//!
//! An entry starts `Incomplete` and moves to a terminal result on the first
//! response. Further responses are duplicates until the owning coordinator
//! explicitly starts a new attempt with [`EntryState::reset`].

use super::types::{OpResult, ReplicaResponse};
use std::time::Instant;

/// Outcome of [`EntryState::record`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Recorded {
    /// The entry moved to this terminal result
    Applied(OpResult),
    /// The entry was already terminal; nothing changed
    Duplicate,
}

impl Recorded {
    pub fn is_duplicate(&self) -> bool {
        matches!(self, Recorded::Duplicate)
    }
}

/// Transition function over the result tag.
///
/// Returns the next result, or `None` when the incoming result must be
/// ignored. An incoming `Incomplete` never changes anything.
fn transition(current: OpResult, incoming: OpResult) -> Option<OpResult> {
    match (current, incoming) {
        (_, OpResult::Incomplete) => None,
        (OpResult::Incomplete, next) => Some(next),
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct EntryState {
    result: OpResult,
    /// All responses seen, duplicates included
    responses: u32,
    retries: u32,
    attempt_started: Instant,
    last_response: Option<Instant>,
    version: Option<u64>,
}

impl EntryState {
    pub fn new(now: Instant) -> Self {
        Self {
            result: OpResult::Incomplete,
            responses: 0,
            retries: 0,
            attempt_started: now,
            last_response: None,
            version: None,
        }
    }

    /// Ingest one replica response.
    pub fn record(&mut self, response: &ReplicaResponse, now: Instant) -> Recorded {
        self.responses = self.responses.saturating_add(1);
        self.last_response = Some(now);

        match transition(self.result, response.result()) {
            Some(next) => {
                self.result = next;
                if response.version.is_some() {
                    self.version = response.version;
                }
                Recorded::Applied(next)
            }
            None => Recorded::Duplicate,
        }
    }

    /// Start a new attempt. A timed-out entry is final and is never reset.
    ///
    /// Returns false if the reset was refused.
    pub fn reset(&mut self, now: Instant) -> bool {
        if self.result == OpResult::Timeout {
            return false;
        }
        self.result = OpResult::Incomplete;
        self.retries = self.retries.saturating_add(1);
        self.attempt_started = now;
        true
    }

    /// Retry budget exhausted. Only an incomplete entry can time out.
    pub fn mark_timed_out(&mut self) -> bool {
        match transition(self.result, OpResult::Timeout) {
            Some(next) => {
                self.result = next;
                true
            }
            None => false,
        }
    }

    pub fn current_result(&self) -> OpResult {
        self.result
    }

    pub fn is_complete(&self) -> bool {
        self.result.is_complete()
    }

    pub fn retries(&self) -> u32 {
        self.retries
    }

    pub fn responses(&self) -> u32 {
        self.responses
    }

    pub fn attempt_started(&self) -> Instant {
        self.attempt_started
    }

    pub fn last_response_at(&self) -> Option<Instant> {
        self.last_response
    }

    /// Version reported by the replica, if any
    pub fn version(&self) -> Option<u64> {
        self.version
    }
}
