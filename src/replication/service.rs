//! Entry point for the storage daemon: admission, response routing, timer
//! ticks and cancellation over the shared [`OperationRegistry`].

use super::coordinator::{CoordinatorContext, ResponseOutcome, StorageOperationCoordinator};
use super::handle::OperationHandle;
use super::registry::OperationRegistry;
use super::timeout::TimeoutPolicy;
use super::transport::ReplicaTransport;
use super::types::{OpKind, OperationId, ReplicaId, ReplicaResponse, StorageOperation};
use crate::common::{ReplicationConfig, ReplicationMetrics, Result};
use bytes::Bytes;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

pub struct ReplicationService {
    config: ReplicationConfig,
    policy: TimeoutPolicy,
    registry: Arc<OperationRegistry>,
    transport: Arc<dyn ReplicaTransport>,
    metrics: Arc<ReplicationMetrics>,
}

impl ReplicationService {
    pub fn new(config: ReplicationConfig, transport: Arc<dyn ReplicaTransport>) -> Result<Self> {
        Self::with_metrics(config, transport, Arc::new(ReplicationMetrics::new()))
    }

    pub fn with_metrics(
        config: ReplicationConfig,
        transport: Arc<dyn ReplicaTransport>,
        metrics: Arc<ReplicationMetrics>,
    ) -> Result<Self> {
        config.validate()?;
        let policy = TimeoutPolicy::new(&config.timeout)?;
        Ok(Self {
            config,
            policy,
            registry: Arc::new(OperationRegistry::new()),
            transport,
            metrics,
        })
    }

    pub fn config(&self) -> &ReplicationConfig {
        &self.config
    }

    pub fn metrics(&self) -> &Arc<ReplicationMetrics> {
        &self.metrics
    }

    pub fn registry(&self) -> &Arc<OperationRegistry> {
        &self.registry
    }

    /// Build an operation with a fresh id and the kind's configured threshold.
    pub fn prepare(
        &self,
        key: impl Into<String>,
        kind: OpKind,
        replicas: Vec<ReplicaId>,
        payload: Option<Bytes>,
    ) -> StorageOperation {
        let threshold = self.config.quorum.policy(kind).resolve(replicas.len());
        let mut op = StorageOperation::new(OperationId::new(), key, kind, replicas, threshold);
        op.payload = payload;
        op
    }

    fn context(&self) -> CoordinatorContext {
        CoordinatorContext {
            policy: self.policy.clone(),
            exhaustion: self.config.exhaustion_result.as_op_result(),
            transport: self.transport.clone(),
            metrics: self.metrics.clone(),
            registry: Arc::downgrade(&self.registry),
        }
    }

    pub fn admit(&self, operation: StorageOperation) -> Result<OperationHandle> {
        self.admit_at(operation, Instant::now())
    }

    /// Validate, register and fan out. Fails with `InvalidOperation` or
    /// `DuplicateOperation` before any replica is contacted.
    pub fn admit_at(&self, operation: StorageOperation, now: Instant) -> Result<OperationHandle> {
        let admitted = StorageOperationCoordinator::new(operation, self.context(), now)
            .and_then(|(coordinator, handle)| {
                // Counted before it becomes visible to cancel and tick paths.
                self.metrics.in_flight.inc();
                if let Err(e) = self.registry.create(coordinator.clone()) {
                    self.metrics.in_flight.dec();
                    return Err(e);
                }
                Ok((coordinator, handle))
            });

        let (coordinator, handle) = match admitted {
            Ok(admitted) => admitted,
            Err(e) => {
                self.metrics.rejected.inc();
                tracing::warn!("Rejected operation: {}", e);
                return Err(e);
            }
        };

        self.metrics.admitted.inc();
        coordinator.start();
        Ok(handle)
    }

    pub fn on_response(&self, response: ReplicaResponse) -> ResponseOutcome {
        self.on_response_at(response, Instant::now())
    }

    /// Route a replica response to its operation. Responses for retired or
    /// unknown operations are dropped and counted.
    pub fn on_response_at(&self, response: ReplicaResponse, now: Instant) -> ResponseOutcome {
        match self.registry.lookup(&response.operation_id) {
            Ok(coordinator) => coordinator.on_response(&response, now),
            Err(_) => {
                self.metrics.late_responses.inc();
                tracing::debug!(
                    "Response from {} for retired operation {} dropped",
                    response.replica,
                    response.operation_id
                );
                ResponseOutcome::Late
            }
        }
    }

    /// Drive the timeout policy of every in-flight operation. Returns how
    /// many operations this tick finalized.
    pub fn on_timeout_tick(&self, now: Instant) -> usize {
        self.registry
            .snapshot()
            .into_iter()
            .filter_map(|coordinator| coordinator.on_timeout_tick(now))
            .count()
    }

    pub fn cancel(&self, id: &OperationId) -> bool {
        self.cancel_at(id, Instant::now())
    }

    /// Finalize with `Error` unless a result was already decided.
    pub fn cancel_at(&self, id: &OperationId, now: Instant) -> bool {
        match self.registry.lookup(id) {
            Ok(coordinator) => coordinator.cancel(now),
            Err(_) => {
                tracing::debug!("Cancel for retired operation {} ignored", id);
                false
            }
        }
    }

    pub fn lookup(&self, id: &OperationId) -> Result<Arc<StorageOperationCoordinator>> {
        self.registry.lookup(id)
    }

    pub fn in_flight(&self) -> usize {
        self.registry.len()
    }
}

/// Timer facility: tick every registered operation at `interval`.
pub fn spawn_timeout_ticker(service: Arc<ReplicationService>, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let finalized = service.on_timeout_tick(Instant::now());
            if finalized > 0 {
                tracing::debug!("Timeout tick finalized {} operations", finalized);
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::{Error, ThresholdPolicy};
    use crate::replication::transport::ChannelTransport;
    use crate::replication::types::{OpResult, ResponseCode};

    fn service() -> (ReplicationService, tokio::sync::mpsc::UnboundedReceiver<crate::replication::Outbound>) {
        let (transport, rx) = ChannelTransport::new();
        let service = ReplicationService::new(ReplicationConfig::default(), Arc::new(transport)).unwrap();
        (service, rx)
    }

    fn replicas(n: usize) -> Vec<ReplicaId> {
        (1..=n).map(|i| ReplicaId::new(format!("r{}", i))).collect()
    }

    #[test]
    fn test_prepare_uses_kind_policy() {
        let (transport, _rx) = ChannelTransport::new();
        let mut config = ReplicationConfig::default();
        config.quorum.get = ThresholdPolicy::One;
        let service = ReplicationService::new(config, Arc::new(transport)).unwrap();

        assert_eq!(service.prepare("k", OpKind::Put, replicas(3), None).threshold, 2);
        assert_eq!(service.prepare("k", OpKind::Get, replicas(3), None).threshold, 1);
        assert_eq!(service.prepare("k", OpKind::Invalidate, replicas(3), None).threshold, 3);
    }

    #[test]
    fn test_admit_rejects_invalid() {
        let (service, mut rx) = service();
        let op = service.prepare("k", OpKind::Put, vec![], None);
        assert!(matches!(service.admit(op), Err(Error::InvalidOperation(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(service.metrics().rejected.get(), 1);
        assert_eq!(service.in_flight(), 0);
    }

    #[test]
    fn test_admit_rejects_duplicate_id_without_sending() {
        let (service, mut rx) = service();
        let op = service.prepare("k", OpKind::Put, replicas(2), None);
        let again = op.clone();

        let _handle = service.admit(op).unwrap();
        while rx.try_recv().is_ok() {}

        assert!(matches!(service.admit(again), Err(Error::DuplicateOperation(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(service.in_flight(), 1);
    }

    #[test]
    fn test_response_after_retirement_is_late() {
        let (service, _rx) = service();
        let op = service.prepare("k", OpKind::Get, replicas(1), None);
        let id = op.id;
        let mut handle = service.admit(op).unwrap();

        let ok = ReplicaResponse::new(id, "r1".into(), ResponseCode::Ok);
        assert_eq!(
            service.on_response(ok.clone()),
            ResponseOutcome::Finalized(OpResult::Succeeded)
        );
        assert!(matches!(service.lookup(&id), Err(Error::NotFound(_))));
        assert_eq!(service.on_response(ok), ResponseOutcome::Late);
        assert!(!service.cancel(&id));
        assert_eq!(handle.try_result(), Some(OpResult::Succeeded));
        assert_eq!(service.metrics().late_responses.get(), 1);
        assert_eq!(service.metrics().in_flight.get(), 0);
    }

    #[test]
    fn test_cancel_of_unknown_operation_counts_nothing() {
        let (service, _rx) = service();
        assert!(!service.cancel(&OperationId::new()));
        assert_eq!(service.metrics().late_responses.get(), 0);
        assert_eq!(service.metrics().cancelled.get(), 0);
    }

    #[test]
    fn test_admit_rejects_unrepresentable_timeout() {
        let (service, mut rx) = service();
        let op = service
            .prepare("k", OpKind::Get, replicas(1), None)
            .with_timeout(Duration::MAX);
        assert!(matches!(service.admit(op), Err(Error::InvalidOperation(_))));
        assert!(rx.try_recv().is_err());
        assert_eq!(service.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_ticker_times_out_silent_replica() {
        let (transport, _rx) = ChannelTransport::new();
        let mut config = ReplicationConfig::default();
        config.timeout.max_retries = 0;
        let service = Arc::new(ReplicationService::new(config, Arc::new(transport)).unwrap());
        let ticker = spawn_timeout_ticker(service.clone(), Duration::from_millis(10));

        let op = service.prepare("k", OpKind::Put, replicas(1), None);
        let handle = service.admit(op).unwrap();

        let result = tokio::time::timeout(Duration::from_secs(5), handle.result())
            .await
            .unwrap();
        ticker.abort();

        assert_eq!(result, OpResult::Timeout);
        assert_eq!(service.in_flight(), 0);
    }
}
