//! Identifiers and protocol messages exchanged between controller and workers
//!
//! Every request is an [`Envelope`] carrying exactly one [`Message`] and is
//! answered by exactly one [`Reply`].

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use uuid::Uuid;

use crate::graph::WorkflowDefinition;

/// Opaque per-operator computation descriptor and result payload
pub type Payload = Value;

/// Unique identifier of an operator in the DAG
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OperatorId(String);

impl OperatorId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for OperatorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for OperatorId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for OperatorId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Network address of a worker or the controller
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct WorkerAddress(String);

impl WorkerAddress {
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for WorkerAddress {
    fn from(address: &str) -> Self {
        Self(address.to_string())
    }
}

impl From<String> for WorkerAddress {
    fn from(address: String) -> Self {
        Self(address)
    }
}

impl From<std::net::SocketAddr> for WorkerAddress {
    fn from(address: std::net::SocketAddr) -> Self {
        Self(address.to_string())
    }
}

/// Identifier of one execution of a workflow
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(Uuid);

impl RunId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for RunId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Placement of one operator, broadcast to every worker
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub operator_id: OperatorId,
    /// Worker that owns and executes the operator
    pub worker: WorkerAddress,
    pub upstream: Vec<OperatorId>,
    pub downstream: Vec<OperatorId>,
    #[serde(default)]
    pub payload: Payload,
}

/// Output of a finished operator, sent to each downstream owner
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub operator_id: OperatorId,
    pub worker: WorkerAddress,
    #[serde(default)]
    pub payload: Payload,
}

/// Sent by a worker once it has no remaining local work
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct TerminationReport {
    pub worker: WorkerAddress,
    pub completed: Vec<OperatorId>,
}

/// Sent by a worker when a required path failed for good
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct FailureReport {
    pub worker: WorkerAddress,
    pub operator_id: Option<OperatorId>,
    pub reason: String,
}

/// All protocol messages
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Message {
    Assignment(Assignment),
    Start,
    Result(ExecutionResult),
    TerminationReport(TerminationReport),
    FailureReport(FailureReport),
    AbortRequest,
    SubmitWorkflow { definition: WorkflowDefinition },
    TerminateRun,
}

impl Message {
    /// Short name used in logs and delivery records
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Assignment(_) => "assignment",
            Message::Start => "start",
            Message::Result(_) => "result",
            Message::TerminationReport(_) => "termination_report",
            Message::FailureReport(_) => "failure_report",
            Message::AbortRequest => "abort_request",
            Message::SubmitWorkflow { .. } => "submit_workflow",
            Message::TerminateRun => "terminate_run",
        }
    }
}

/// A message bound to the run it belongs to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub run_id: RunId,
    pub message: Message,
}

impl Envelope {
    pub fn new(run_id: RunId, message: Message) -> Self {
        Self { run_id, message }
    }
}

/// Error classes carried by [`Reply::Error`]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Malformed,
    Unexpected,
    StaleRun,
    Internal,
}

/// The single response to a request
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Reply {
    Ack,
    AbortAck {
        worker: WorkerAddress,
        completed: Vec<OperatorId>,
    },
    Accepted {
        run_id: RunId,
    },
    Rejected {
        reason: String,
    },
    Error {
        kind: ErrorKind,
        message: String,
    },
}

impl Reply {
    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Reply::Error {
            kind,
            message: message.into(),
        }
    }

    /// Reply for a message kind the receiving endpoint does not serve
    pub fn unexpected(endpoint: &str, message: &Message) -> Self {
        Reply::error(
            ErrorKind::Unexpected,
            format!("{} does not accept {} messages", endpoint, message.kind()),
        )
    }

    pub fn from_error(err: &crate::DagwireError) -> Self {
        Reply::error(err.reply_kind(), err.to_string())
    }
}
