//! Identifiers, results and messages shared by the replication core

use crate::common::{Error, Result};
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// Unique identifier of one storage operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(Uuid);

impl OperationId {
    /// Fresh random (v4) identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for OperationId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies a replica (storage node) in an operation's replica set
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ReplicaId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OpKind {
    Put,
    Get,
    Invalidate,
}

impl fmt::Display for OpKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OpKind::Put => write!(f, "put"),
            OpKind::Get => write!(f, "get"),
            OpKind::Invalidate => write!(f, "invalidate"),
        }
    }
}

/// Outcome of an operation, or of one replica's part in it.
///
/// `Incomplete` is the only non-terminal value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpResult {
    Incomplete,
    Succeeded,
    Failed,
    Error,
    Timeout,
    InvalidVersion,
}

impl OpResult {
    pub fn is_complete(&self) -> bool {
        !matches!(self, OpResult::Incomplete)
    }

    /// Terminal and not a success
    pub fn is_failure(&self) -> bool {
        self.is_complete() && !matches!(self, OpResult::Succeeded)
    }
}

impl fmt::Display for OpResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            OpResult::Incomplete => "incomplete",
            OpResult::Succeeded => "succeeded",
            OpResult::Failed => "failed",
            OpResult::Error => "error",
            OpResult::Timeout => "timeout",
            OpResult::InvalidVersion => "invalid_version",
        };
        f.write_str(s)
    }
}

/// Result code reported by a replica
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseCode {
    Ok,
    Failed,
    Error,
    VersionConflict,
}

impl ResponseCode {
    pub fn as_op_result(self) -> OpResult {
        match self {
            ResponseCode::Ok => OpResult::Succeeded,
            ResponseCode::Failed => OpResult::Failed,
            ResponseCode::Error => OpResult::Error,
            ResponseCode::VersionConflict => OpResult::InvalidVersion,
        }
    }
}

/// One replica's reported result for one operation attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReplicaResponse {
    pub operation_id: OperationId,
    pub replica: ReplicaId,
    pub code: ResponseCode,
    /// Version held by the replica, set on conflicts
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<u64>,
}

impl ReplicaResponse {
    pub fn new(operation_id: OperationId, replica: ReplicaId, code: ResponseCode) -> Self {
        Self {
            operation_id,
            replica,
            code,
            version: None,
        }
    }

    pub fn with_version(mut self, version: u64) -> Self {
        self.version = Some(version);
        self
    }

    pub fn result(&self) -> OpResult {
        self.code.as_op_result()
    }
}

/// Request sent to one replica for one attempt
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicaRequest {
    pub operation_id: OperationId,
    pub key: String,
    pub kind: OpKind,
    /// 0 for the first send, incremented per retry
    pub attempt: u32,
    pub payload: Option<Bytes>,
}

/// Unit of coordination, as submitted for admission
#[derive(Debug, Clone)]
pub struct StorageOperation {
    pub id: OperationId,
    pub key: String,
    pub kind: OpKind,
    pub replicas: Vec<ReplicaId>,
    /// Required success count (W or R)
    pub threshold: usize,
    pub payload: Option<Bytes>,
    /// Overrides the configured per-attempt base timeout
    pub timeout: Option<Duration>,
}

impl StorageOperation {
    pub fn new(
        id: OperationId,
        key: impl Into<String>,
        kind: OpKind,
        replicas: Vec<ReplicaId>,
        threshold: usize,
    ) -> Self {
        Self {
            id,
            key: key.into(),
            kind,
            replicas,
            threshold,
            payload: None,
            timeout: None,
        }
    }

    pub fn with_payload(mut self, payload: impl Into<Bytes>) -> Self {
        self.payload = Some(payload.into());
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    /// Check the admission invariants: non-empty distinct replica set and
    /// `1 <= threshold <= N`.
    pub fn validate(&self) -> Result<()> {
        let n = self.replicas.len();
        if n == 0 {
            return Err(Error::InvalidOperation(format!(
                "operation {} has an empty replica set",
                self.id
            )));
        }
        if self.threshold == 0 || self.threshold > n {
            return Err(Error::InvalidOperation(format!(
                "operation {}: threshold {} out of range [1, {}]",
                self.id, self.threshold, n
            )));
        }
        let mut seen = HashSet::with_capacity(n);
        for replica in &self.replicas {
            if !seen.insert(replica) {
                return Err(Error::InvalidOperation(format!(
                    "operation {}: replica {} listed twice",
                    self.id, replica
                )));
            }
        }
        Ok(())
    }
}
