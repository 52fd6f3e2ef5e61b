use thiserror::Error;

use crate::coord::types::{ErrorKind, OperatorId, RunId, WorkerAddress};
use crate::transport::TransportError;

/// Unified error type for the dagwire runtime
#[derive(Debug, Error)]
pub enum DagwireError {
    /// A single request could not be delivered
    #[error("Transport error talking to {peer}: {source}")]
    Transport {
        peer: WorkerAddress,
        #[source]
        source: TransportError,
    },

    /// Retry budget exhausted for a peer
    #[error("Worker unavailable: {worker} (gave up after {attempts} attempts)")]
    WorkerUnavailable {
        worker: WorkerAddress,
        attempts: u32,
        #[source]
        source: TransportError,
    },

    /// Rollout aborted because a worker could not take an assignment
    #[error("Assignment rollout failed at {worker}: {message}")]
    AssignmentTransport {
        worker: WorkerAddress,
        message: String,
    },

    #[error("Malformed message: {message}")]
    MalformedMessage { message: String },

    #[error("Duplicate result from {from} for {operator}")]
    DuplicateResult {
        operator: OperatorId,
        from: OperatorId,
    },

    #[error("Operator not assigned to this worker: {operator}")]
    UnassignedOperator { operator: OperatorId },

    #[error("Message for run {got} while bound to run {expected}")]
    StaleRun { expected: RunId, got: RunId },

    #[error("Invalid graph: {message}")]
    InvalidGraph { message: String },

    #[error("Configuration error: {message}")]
    Configuration {
        message: String,
        field: Option<String>,
    },

    /// The peer answered with an explicit error reply
    #[error("{peer} rejected request ({kind:?}): {message}")]
    Rejected {
        peer: WorkerAddress,
        kind: ErrorKind,
        message: String,
    },

    #[error("Unexpected reply from {peer}: {reply}")]
    UnexpectedReply { peer: WorkerAddress, reply: String },

    #[error("Run {run_id} failed: {reason}")]
    RunFailed { run_id: RunId, reason: String },

    #[error("Run {run_id} was aborted")]
    Aborted { run_id: RunId },

    #[error("A run is already in progress: {run_id}")]
    RunInProgress { run_id: RunId },

    #[error("Operation timed out: {operation} (timeout: {timeout_ms}ms)")]
    Timeout { operation: String, timeout_ms: u64 },

    #[error("Serialization failed: {format}")]
    Serialization {
        format: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("IO operation failed: {operation}")]
    Io {
        operation: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel error: {channel} - {message}")]
    Channel { channel: String, message: String },

    #[error("Internal error: {message}")]
    Internal { message: String },
}

impl DagwireError {
    pub fn malformed<S: Into<String>>(message: S) -> Self {
        Self::MalformedMessage {
            message: message.into(),
        }
    }

    pub fn invalid_graph<S: Into<String>>(message: S) -> Self {
        Self::InvalidGraph {
            message: message.into(),
        }
    }

    pub fn configuration<S: Into<String>>(message: S) -> Self {
        Self::Configuration {
            message: message.into(),
            field: None,
        }
    }

    /// Create a configuration error pointing at a specific field
    pub fn configuration_field<S: Into<String>, F: Into<String>>(message: S, field: F) -> Self {
        Self::Configuration {
            message: message.into(),
            field: Some(field.into()),
        }
    }

    pub fn serialization<S: Into<String>, E: std::error::Error + Send + Sync + 'static>(
        format: S,
        source: E,
    ) -> Self {
        Self::Serialization {
            format: format.into(),
            source: Box::new(source),
        }
    }

    pub fn io<S: Into<String>>(operation: S, source: std::io::Error) -> Self {
        Self::Io {
            operation: operation.into(),
            source,
        }
    }

    pub fn channel<S: Into<String>, M: Into<String>>(channel: S, message: M) -> Self {
        Self::Channel {
            channel: channel.into(),
            message: message.into(),
        }
    }

    pub fn timeout<S: Into<String>>(operation: S, timeout_ms: u64) -> Self {
        Self::Timeout {
            operation: operation.into(),
            timeout_ms,
        }
    }

    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Whether the failure is a benign protocol event rather than a real fault
    pub fn is_benign(&self) -> bool {
        matches!(
            self,
            Self::DuplicateResult { .. } | Self::UnassignedOperator { .. }
        )
    }

    /// Check if error is recoverable
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Transport { .. } | Self::Timeout { .. } | Self::Io { .. } => true,
            Self::DuplicateResult { .. } | Self::UnassignedOperator { .. } => true,
            Self::WorkerUnavailable { .. } | Self::AssignmentTransport { .. } => false,
            Self::Configuration { .. } | Self::InvalidGraph { .. } => false,
            _ => false,
        }
    }

    /// Get error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::Transport { .. } => "transport",
            Self::WorkerUnavailable { .. } => "worker_unavailable",
            Self::AssignmentTransport { .. } => "assignment",
            Self::MalformedMessage { .. } => "malformed",
            Self::DuplicateResult { .. } => "duplicate_result",
            Self::UnassignedOperator { .. } => "unassigned_operator",
            Self::StaleRun { .. } => "stale_run",
            Self::InvalidGraph { .. } => "graph",
            Self::Configuration { .. } => "configuration",
            Self::Rejected { .. } => "rejected",
            Self::UnexpectedReply { .. } => "unexpected_reply",
            Self::RunFailed { .. } => "run_failed",
            Self::Aborted { .. } => "aborted",
            Self::RunInProgress { .. } => "run_in_progress",
            Self::Timeout { .. } => "timeout",
            Self::Serialization { .. } => "serialization",
            Self::Io { .. } => "io",
            Self::Channel { .. } => "channel",
            Self::Internal { .. } => "internal",
        }
    }

    /// Error kind to put on the wire when this error answers a request
    pub fn reply_kind(&self) -> ErrorKind {
        match self {
            Self::MalformedMessage { .. } | Self::InvalidGraph { .. } => ErrorKind::Malformed,
            Self::StaleRun { .. } => ErrorKind::StaleRun,
            _ => ErrorKind::Internal,
        }
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, DagwireError>;

impl From<std::io::Error> for DagwireError {
    fn from(err: std::io::Error) -> Self {
        Self::io("io_operation", err)
    }
}

impl From<serde_json::Error> for DagwireError {
    fn from(err: serde_json::Error) -> Self {
        Self::serialization("json", err)
    }
}

impl From<serde_yaml::Error> for DagwireError {
    fn from(err: serde_yaml::Error) -> Self {
        Self::serialization("yaml", err)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        let err = DagwireError::malformed("bad frame");
        assert_eq!(err.category(), "malformed");
        assert_eq!(err.reply_kind(), ErrorKind::Malformed);

        let err = DagwireError::StaleRun {
            expected: RunId::new(),
            got: RunId::new(),
        };
        assert_eq!(err.reply_kind(), ErrorKind::StaleRun);
    }

    #[test]
    fn test_benign_errors() {
        let dup = DagwireError::DuplicateResult {
            operator: OperatorId::from("c"),
            from: OperatorId::from("a"),
        };
        assert!(dup.is_benign());
        assert!(dup.is_recoverable());

        let unassigned = DagwireError::UnassignedOperator {
            operator: OperatorId::from("x"),
        };
        assert!(unassigned.is_benign());

        assert!(!DagwireError::configuration("no workers").is_benign());
        assert!(!DagwireError::configuration("no workers").is_recoverable());
    }

    #[test]
    fn test_unavailable_is_not_recoverable() {
        let err = DagwireError::WorkerUnavailable {
            worker: WorkerAddress::from("w1"),
            attempts: 3,
            source: TransportError::Unreachable(WorkerAddress::from("w1")),
        };
        assert!(!err.is_recoverable());
        assert!(err.to_string().contains("w1"));
    }
}
