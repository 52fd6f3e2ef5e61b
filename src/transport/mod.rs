//! Synchronous request/response transport
//!
//! Every request carries one [`Envelope`] and is answered by exactly one
//! [`Reply`]. The same seam is used controller→worker, worker→worker and
//! worker→controller.

pub mod codec;
pub mod memory;
pub mod tcp;

pub use memory::{DeliveryRecord, InMemoryNetwork};
pub use tcp::{serve, TcpTransport};

use async_trait::async_trait;
use thiserror::Error;
use tracing::{debug, warn};

use crate::coord::types::{Envelope, Reply, WorkerAddress};
use crate::core::errors::{DagwireError, Result};
use crate::core::retry::RetryPolicy;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(WorkerAddress),

    #[error("request to {peer} timed out after {timeout_ms}ms")]
    Timeout { peer: WorkerAddress, timeout_ms: u64 },

    #[error("connection to {peer} failed: {source}")]
    Io {
        peer: WorkerAddress,
        #[source]
        source: std::io::Error,
    },

    #[error("frame codec error: {0}")]
    Codec(String),

    #[error("endpoint {0} closed before replying")]
    Closed(WorkerAddress),
}

/// Client side of the transport
#[async_trait]
pub trait Transport: Send + Sync {
    async fn request(
        &self,
        peer: &WorkerAddress,
        envelope: Envelope,
    ) -> std::result::Result<Reply, TransportError>;
}

/// Server side of the transport: answers one request with one reply
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, envelope: Envelope) -> Reply;
}

/// Send a request, retrying transport failures with the policy's backoff.
///
/// Only transport failures are retried; an explicit reply (including an error
/// reply) is returned as-is. After the last attempt the failure surfaces as
/// [`DagwireError::WorkerUnavailable`].
pub async fn request_with_retry(
    transport: &dyn Transport,
    peer: &WorkerAddress,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<Reply> {
    let attempts = policy.max_attempts();
    let mut attempt = 1;
    loop {
        match transport.request(peer, envelope.clone()).await {
            Ok(reply) => return Ok(reply),
            Err(err) if attempt < attempts => {
                let delay = policy.delay_for(attempt);
                warn!(
                    "{} to {} failed (attempt {}/{}): {}; retrying in {:?}",
                    envelope.message.kind(),
                    peer,
                    attempt,
                    attempts,
                    err,
                    delay
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
            Err(err) => {
                return Err(DagwireError::WorkerUnavailable {
                    worker: peer.clone(),
                    attempts,
                    source: err,
                })
            }
        }
    }
}

/// Like [`request_with_retry`] but only an `Ack` counts as success
pub async fn send_expecting_ack(
    transport: &dyn Transport,
    peer: &WorkerAddress,
    envelope: &Envelope,
    policy: &RetryPolicy,
) -> Result<()> {
    let reply = request_with_retry(transport, peer, envelope, policy).await?;
    expect_ack(peer, reply)
}

pub fn expect_ack(peer: &WorkerAddress, reply: Reply) -> Result<()> {
    match reply {
        Reply::Ack => {
            debug!("ack from {}", peer);
            Ok(())
        }
        Reply::Error { kind, message } => Err(DagwireError::Rejected {
            peer: peer.clone(),
            kind,
            message,
        }),
        other => Err(DagwireError::UnexpectedReply {
            peer: peer.clone(),
            reply: format!("{:?}", other),
        }),
    }
}
