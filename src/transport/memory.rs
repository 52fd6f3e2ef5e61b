//! In-process transport
//!
//! Endpoints register a [`MessageHandler`] under an address. Requests are
//! handled on the caller's task, so the same synchronous request/response
//! contract holds as over TCP. Reachability can be toggled per address and
//! every delivered request is recorded.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

use super::{MessageHandler, Transport, TransportError};
use crate::coord::types::{Envelope, Reply, RunId, WorkerAddress};

/// One request that reached its endpoint
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveryRecord {
    pub to: WorkerAddress,
    pub run_id: RunId,
    pub kind: &'static str,
}

#[derive(Clone)]
pub struct InMemoryNetwork {
    inner: Arc<Inner>,
}

struct Inner {
    endpoints: DashMap<WorkerAddress, Arc<dyn MessageHandler>>,
    unreachable: DashSet<WorkerAddress>,
    deliveries: Mutex<Vec<DeliveryRecord>>,
    request_timeout: Duration,
}

impl InMemoryNetwork {
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                endpoints: DashMap::new(),
                unreachable: DashSet::new(),
                deliveries: Mutex::new(Vec::new()),
                request_timeout,
            }),
        }
    }

    pub fn register(&self, address: impl Into<WorkerAddress>, handler: Arc<dyn MessageHandler>) {
        let address = address.into();
        debug!("registering in-memory endpoint {}", address);
        self.inner.endpoints.insert(address, handler);
    }

    pub fn deregister(&self, address: &WorkerAddress) {
        self.inner.endpoints.remove(address);
    }

    /// Simulate a partitioned or crashed peer
    pub fn set_reachable(&self, address: &WorkerAddress, reachable: bool) {
        if reachable {
            self.inner.unreachable.remove(address);
        } else {
            self.inner.unreachable.insert(address.clone());
        }
    }

    pub fn deliveries(&self) -> Vec<DeliveryRecord> {
        self.inner.deliveries.lock().clone()
    }

    /// Kinds of messages delivered to `address`, in delivery order
    pub fn kinds_delivered_to(&self, address: &WorkerAddress) -> Vec<&'static str> {
        self.inner
            .deliveries
            .lock()
            .iter()
            .filter(|record| &record.to == address)
            .map(|record| record.kind)
            .collect()
    }
}

impl Default for InMemoryNetwork {
    fn default() -> Self {
        Self::new(Duration::from_secs(5))
    }
}

#[async_trait]
impl Transport for InMemoryNetwork {
    async fn request(
        &self,
        peer: &WorkerAddress,
        envelope: Envelope,
    ) -> Result<Reply, TransportError> {
        if self.inner.unreachable.contains(peer) {
            return Err(TransportError::Unreachable(peer.clone()));
        }
        let handler = self
            .inner
            .endpoints
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| TransportError::Unreachable(peer.clone()))?;

        self.inner.deliveries.lock().push(DeliveryRecord {
            to: peer.clone(),
            run_id: envelope.run_id,
            kind: envelope.message.kind(),
        });

        tokio::time::timeout(self.inner.request_timeout, handler.handle(envelope))
            .await
            .map_err(|_| TransportError::Timeout {
                peer: peer.clone(),
                timeout_ms: self.inner.request_timeout.as_millis() as u64,
            })
    }
}
