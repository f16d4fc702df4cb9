//! Caller side of an admitted operation

use super::types::{OpResult, OperationId};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// How many replicas have answered with a terminal result. Replicas
/// marked timed out are not counted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Progress {
    pub responded: usize,
    pub replicas: usize,
}

/// Resolves exactly once with the operation's terminal result.
#[derive(Debug)]
pub struct OperationHandle {
    id: OperationId,
    replicas: usize,
    responded: Arc<AtomicUsize>,
    rx: oneshot::Receiver<OpResult>,
    /// Result once observed; the receiver is spent after the first read
    done: Option<OpResult>,
}

impl OperationHandle {
    pub(crate) fn new(
        id: OperationId,
        replicas: usize,
        responded: Arc<AtomicUsize>,
        rx: oneshot::Receiver<OpResult>,
    ) -> Self {
        Self {
            id,
            replicas,
            responded,
            rx,
            done: None,
        }
    }

    pub fn id(&self) -> OperationId {
        self.id
    }

    pub fn progress(&self) -> Progress {
        Progress {
            responded: self.responded.load(Ordering::Acquire),
            replicas: self.replicas,
        }
    }

    /// Wait for the terminal result. A coordinator that disappears without
    /// finalizing yields `Error`.
    pub async fn result(self) -> OpResult {
        if let Some(result) = self.done {
            return result;
        }
        self.rx.await.unwrap_or(OpResult::Error)
    }

    /// Non-blocking poll; `None` while the operation is in flight. Once a
    /// result is observed every later call returns the same one.
    pub fn try_result(&mut self) -> Option<OpResult> {
        if self.done.is_none() {
            self.done = match self.rx.try_recv() {
                Ok(result) => Some(result),
                Err(oneshot::error::TryRecvError::Empty) => None,
                Err(oneshot::error::TryRecvError::Closed) => Some(OpResult::Error),
            };
        }
        self.done
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_resolves_with_sent_result() {
        let (tx, rx) = oneshot::channel();
        let handle = OperationHandle::new(OperationId::new(), 3, Arc::new(AtomicUsize::new(2)), rx);
        assert_eq!(
            handle.progress(),
            Progress {
                responded: 2,
                replicas: 3
            }
        );
        tx.send(OpResult::Succeeded).unwrap();
        assert_eq!(handle.result().await, OpResult::Succeeded);
    }

    #[test]
    fn test_dropped_sender_fails_closed() {
        let (tx, rx) = oneshot::channel::<OpResult>();
        let mut handle = OperationHandle::new(OperationId::new(), 1, Arc::new(AtomicUsize::new(0)), rx);
        assert_eq!(handle.try_result(), None);
        drop(tx);
        assert_eq!(handle.try_result(), Some(OpResult::Error));
        assert_eq!(handle.try_result(), Some(OpResult::Error));
    }

    #[test]
    fn test_try_result_is_stable_after_completion() {
        let (tx, rx) = oneshot::channel();
        let mut handle = OperationHandle::new(OperationId::new(), 1, Arc::new(AtomicUsize::new(1)), rx);
        tx.send(OpResult::Succeeded).unwrap();

        assert_eq!(handle.try_result(), Some(OpResult::Succeeded));
        assert_eq!(handle.try_result(), Some(OpResult::Succeeded));
    }

    #[tokio::test]
    async fn test_result_after_try_result_returns_same_value() {
        let (tx, rx) = oneshot::channel();
        let mut handle = OperationHandle::new(OperationId::new(), 1, Arc::new(AtomicUsize::new(1)), rx);
        tx.send(OpResult::InvalidVersion).unwrap();

        assert_eq!(handle.try_result(), Some(OpResult::InvalidVersion));
        assert_eq!(handle.result().await, OpResult::InvalidVersion);
    }
}
