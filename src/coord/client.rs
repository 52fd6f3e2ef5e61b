//! Submitter-side helper for the controller endpoint

use std::sync::Arc;
use tracing::info;

use crate::coord::types::{Envelope, Message, Reply, RunId, WorkerAddress};
use crate::core::config::ClusterConfig;
use crate::core::errors::{DagwireError, Result};
use crate::core::retry::RetryPolicy;
use crate::graph::WorkflowDefinition;
use crate::transport::{request_with_retry, TcpTransport, Transport};

/// Synchronous answer to a submission
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitStatus {
    Accepted(RunId),
    Rejected(String),
}

pub struct ControllerClient {
    controller: WorkerAddress,
    transport: Arc<dyn Transport>,
    retry: RetryPolicy,
}

impl ControllerClient {
    pub fn new(controller: impl Into<WorkerAddress>, transport: Arc<dyn Transport>) -> Self {
        Self {
            controller: controller.into(),
            transport,
            retry: RetryPolicy::default(),
        }
    }

    /// Client talking TCP to the configured controller
    pub fn from_config(config: &ClusterConfig) -> Self {
        Self {
            controller: config.controller.clone(),
            transport: Arc::new(TcpTransport::from_config(config)),
            retry: config.retry.clone(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub async fn submit(&self, definition: WorkflowDefinition) -> Result<SubmitStatus> {
        // the controller replaces this id with the one it assigns
        let envelope = Envelope::new(RunId::new(), Message::SubmitWorkflow { definition });
        match self.request(&envelope).await? {
            Reply::Accepted { run_id } => {
                info!("workflow accepted as run {}", run_id);
                Ok(SubmitStatus::Accepted(run_id))
            }
            Reply::Rejected { reason } => Ok(SubmitStatus::Rejected(reason)),
            other => Err(self.unexpected(other)),
        }
    }

    /// Ask the controller to abort `run_id`; `false` if it was not active
    pub async fn terminate(&self, run_id: RunId) -> Result<bool> {
        let envelope = Envelope::new(run_id, Message::TerminateRun);
        match self.request(&envelope).await? {
            Reply::Ack => Ok(true),
            Reply::Rejected { .. } => Ok(false),
            other => Err(self.unexpected(other)),
        }
    }

    async fn request(&self, envelope: &Envelope) -> Result<Reply> {
        request_with_retry(self.transport.as_ref(), &self.controller, envelope, &self.retry).await
    }

    fn unexpected(&self, reply: Reply) -> DagwireError {
        match reply {
            Reply::Error { kind, message } => DagwireError::Rejected {
                peer: self.controller.clone(),
                kind,
                message,
            },
            other => DagwireError::UnexpectedReply {
                peer: self.controller.clone(),
                reply: format!("{:?}", other),
            },
        }
    }
}
