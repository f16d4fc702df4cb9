//! Replica communication seam
//!
//! The byte-level replica protocol lives behind [`ReplicaTransport`]; the
//! core only hands it requests and receives [`ReplicaResponse`]s back through
//! the service.
//!
//! [`ReplicaResponse`]: super::types::ReplicaResponse

use super::types::{ReplicaId, ReplicaRequest};
use tokio::sync::mpsc;

/// Fire-and-forget delivery of requests to replicas.
///
/// `send` is called while the operation's state is locked, so it must return
/// without waiting on the network. Delivery is not guaranteed; lost requests
/// are recovered by the timeout policy.
pub trait ReplicaTransport: Send + Sync + 'static {
    fn send(&self, replica: &ReplicaId, request: ReplicaRequest);
}

/// A request addressed to one replica
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outbound {
    pub replica: ReplicaId,
    pub request: ReplicaRequest,
}

/// Transport over an unbounded tokio channel; a network task drains the
/// receiving side.
#[derive(Debug, Clone)]
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Outbound>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Outbound>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl ReplicaTransport for ChannelTransport {
    fn send(&self, replica: &ReplicaId, request: ReplicaRequest) {
        let operation_id = request.operation_id;
        if self
            .tx
            .send(Outbound {
                replica: replica.clone(),
                request,
            })
            .is_err()
        {
            tracing::warn!(
                "Dropping request for {} to {}: transport closed",
                operation_id,
                replica
            );
        }
    }
}
