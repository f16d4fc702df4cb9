//! Error types for kvquorum

use crate::replication::OperationId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously to callers.
///
/// Replica-level outcomes (failed, error, invalid version, timeout) are not
/// errors: they are folded into the operation's [`OpResult`](crate::replication::OpResult).
#[derive(Error, Debug)]
pub enum Error {
    // === Admission Errors ===
    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Duplicate operation: {0}")]
    DuplicateOperation(OperationId),

    #[error("Operation not found: {0}")]
    NotFound(OperationId),

    // === Config Errors ===
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Config source error: {0}")]
    Config(#[from] config::ConfigError),

    // === I/O Errors ===
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // === Generic ===
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Is this a retryable error?
    ///
    /// Only an identifier collision is worth retrying, with a fresh id.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::DuplicateOperation(_))
    }

    /// Was the request rejected before any replica was contacted?
    pub fn is_admission_error(&self) -> bool {
        matches!(
            self,
            Error::InvalidOperation(_) | Error::DuplicateOperation(_)
        )
    }
}

impl From<&str> for Error {
    fn from(s: &str) -> Self {
        Error::Other(s.to_string())
    }
}

impl From<String> for Error {
    fn from(s: String) -> Self {
        Error::Other(s)
    }
}

impl From<anyhow::Error> for Error {
    fn from(e: anyhow::Error) -> Self {
        Error::Other(e.to_string())
    }
}
