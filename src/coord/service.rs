//! The controller's listening endpoint
//!
//! Workers send their TerminationReport / FailureReport here, and submitters
//! use it to start and terminate runs. A submission is answered as soon as it
//! is validated; the run itself proceeds in the background.

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::coord::controller::{Controller, RunEvent};
use crate::coord::types::{Envelope, ErrorKind, Message, Reply, RunId};
use crate::core::errors::DagwireError;
use crate::graph::{OperatorGraph, WorkflowDefinition};
use crate::transport::MessageHandler;

/// Final or current state of a submitted run
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunOutcome {
    Running,
    Completed { operators: usize },
    Failed { reason: String },
    Aborted,
}

#[derive(Clone)]
pub struct ControllerService {
    controller: Arc<Controller>,
    outcomes: Arc<DashMap<RunId, RunOutcome>>,
}

impl ControllerService {
    pub fn new(controller: Arc<Controller>) -> Self {
        Self {
            controller,
            outcomes: Arc::new(DashMap::new()),
        }
    }

    pub fn controller(&self) -> &Arc<Controller> {
        &self.controller
    }

    pub fn outcome(&self, run_id: &RunId) -> Option<RunOutcome> {
        self.outcomes.get(run_id).map(|entry| entry.value().clone())
    }

    fn submit(&self, definition: WorkflowDefinition) -> Reply {
        let graph = match OperatorGraph::from_definition(&definition) {
            Ok(graph) => graph,
            Err(err) => {
                warn!("rejecting workflow: {}", err);
                return Reply::Rejected {
                    reason: err.to_string(),
                };
            }
        };
        let run_id = match self.controller.begin() {
            Ok(run_id) => run_id,
            Err(err) => {
                warn!("rejecting workflow: {}", err);
                return Reply::Rejected {
                    reason: err.to_string(),
                };
            }
        };

        info!(
            "accepted workflow {} as run {}",
            definition.name.as_deref().unwrap_or("<unnamed>"),
            run_id
        );
        self.outcomes.insert(run_id, RunOutcome::Running);

        let controller = self.controller.clone();
        let outcomes = self.outcomes.clone();
        tokio::spawn(async move {
            let outcome = match controller.execute_reserved(run_id, &graph).await {
                Ok(report) => RunOutcome::Completed {
                    operators: report.total_completed(),
                },
                Err(DagwireError::Aborted { .. }) => RunOutcome::Aborted,
                Err(err) => {
                    error!("run {} failed: {}", run_id, err);
                    RunOutcome::Failed {
                        reason: err.to_string(),
                    }
                }
            };
            controller.finish(run_id);
            outcomes.insert(run_id, outcome);
        });

        Reply::Accepted { run_id }
    }

    async fn terminate(&self, run_id: RunId) -> Reply {
        match self.controller.terminate(run_id).await {
            Ok(completed) => {
                info!("run {} terminated on {} workers", run_id, completed.len());
                Reply::Ack
            }
            Err(err) => Reply::Rejected {
                reason: err.to_string(),
            },
        }
    }

    async fn forward(&self, event: RunEvent) -> Reply {
        match self.controller.event_sender().send(event).await {
            Ok(()) => Reply::Ack,
            Err(_) => Reply::error(ErrorKind::Internal, "controller event queue closed"),
        }
    }
}

#[async_trait]
impl MessageHandler for ControllerService {
    async fn handle(&self, envelope: Envelope) -> Reply {
        let Envelope { run_id, message } = envelope;
        match message {
            Message::TerminationReport(report) => {
                self.forward(RunEvent::Terminated { run_id, report }).await
            }
            Message::FailureReport(report) => {
                warn!(
                    "worker {} reported failure for run {}: {}",
                    report.worker, run_id, report.reason
                );
                self.forward(RunEvent::Failed { run_id, report }).await
            }
            // the envelope's run id is ignored, the controller assigns its own
            Message::SubmitWorkflow { definition } => self.submit(definition),
            Message::TerminateRun => self.terminate(run_id).await,
            other @ (Message::Assignment(_)
            | Message::Start
            | Message::Result(_)
            | Message::AbortRequest) => Reply::unexpected("controller", &other),
        }
    }
}
