//! Process-wide table of in-flight operations
//!
//! A single short critical section guards the map. Per-response processing
//! only touches it for the lookup; coordinators never run under its lock.

use super::coordinator::StorageOperationCoordinator;
use super::types::OperationId;
use crate::common::{Error, Result};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
pub struct OperationRegistry {
    operations: Mutex<HashMap<OperationId, Arc<StorageOperationCoordinator>>>,
}

impl OperationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<OperationId, Arc<StorageOperationCoordinator>>> {
        self.operations.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a coordinator under its operation id.
    pub fn create(&self, coordinator: Arc<StorageOperationCoordinator>) -> Result<OperationId> {
        let id = coordinator.id();
        let mut operations = self.lock();
        if operations.contains_key(&id) {
            return Err(Error::DuplicateOperation(id));
        }
        operations.insert(id, coordinator);
        Ok(id)
    }

    pub fn lookup(&self, id: &OperationId) -> Result<Arc<StorageOperationCoordinator>> {
        self.lock().get(id).cloned().ok_or(Error::NotFound(*id))
    }

    /// Remove an operation; returns it if it was registered.
    pub fn retire(&self, id: &OperationId) -> Option<Arc<StorageOperationCoordinator>> {
        self.lock().remove(id)
    }

    pub fn contains(&self, id: &OperationId) -> bool {
        self.lock().contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Handles to every registered operation, taken under one lock
    pub fn snapshot(&self) -> Vec<Arc<StorageOperationCoordinator>> {
        self.lock().values().cloned().collect()
    }
}
