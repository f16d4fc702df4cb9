//! Quorum evaluation
//!
//! A pure function from per-replica results to the aggregate result of an
//! operation. Success is checked first, then whether success is still
//! reachable.

use super::types::OpResult;

/// Replica set size and success threshold of one operation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quorum {
    pub replicas: usize,
    pub threshold: usize,
}

/// Per-result counts over a replica set
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Tally {
    pub incomplete: usize,
    pub succeeded: usize,
    /// `Failed` and `Error`
    pub failed: usize,
    pub invalid_version: usize,
    pub timed_out: usize,
}

impl Tally {
    pub fn from_results(results: impl IntoIterator<Item = OpResult>) -> Self {
        let mut tally = Tally::default();
        for result in results {
            match result {
                OpResult::Incomplete => tally.incomplete += 1,
                OpResult::Succeeded => tally.succeeded += 1,
                OpResult::Failed | OpResult::Error => tally.failed += 1,
                OpResult::InvalidVersion => tally.invalid_version += 1,
                OpResult::Timeout => tally.timed_out += 1,
            }
        }
        tally
    }

    /// Replicas that can no longer reach `Succeeded`
    pub fn unreachable(&self) -> usize {
        self.failed + self.invalid_version + self.timed_out
    }

    /// Replicas that answered; timed-out replicas never did
    pub fn responded(&self) -> usize {
        self.succeeded + self.failed + self.invalid_version
    }

    pub fn completed(&self) -> usize {
        self.succeeded + self.unreachable()
    }
}

impl Quorum {
    pub fn new(replicas: usize, threshold: usize) -> Self {
        Self {
            replicas,
            threshold,
        }
    }

    /// Failures the replica set can absorb and still succeed
    pub fn tolerance(&self) -> usize {
        self.replicas.saturating_sub(self.threshold)
    }

    /// Aggregate result for the given per-replica results.
    ///
    /// `exhaustion` is reported when timed-out replicas are what made success
    /// unreachable (`Timeout` or `Failed`, per configuration).
    pub fn evaluate(
        &self,
        results: impl IntoIterator<Item = OpResult>,
        exhaustion: OpResult,
    ) -> OpResult {
        self.evaluate_tally(&Tally::from_results(results), exhaustion)
    }

    pub fn evaluate_tally(&self, tally: &Tally, exhaustion: OpResult) -> OpResult {
        if tally.succeeded >= self.threshold {
            return OpResult::Succeeded;
        }

        let tolerance = self.tolerance();
        if tally.unreachable() <= tolerance {
            return OpResult::Incomplete;
        }

        // Report the narrowest cause that alone makes success unreachable.
        if tally.failed > tolerance {
            OpResult::Failed
        } else if tally.failed + tally.invalid_version > tolerance {
            OpResult::InvalidVersion
        } else {
            exhaustion
        }
    }
}
