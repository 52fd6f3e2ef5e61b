//! Worker side of the protocol

pub mod action;
pub mod runtime;
pub mod state;

pub use action::{EchoFunction, FnOperator, OperatorCtx, OperatorFunction};
pub use runtime::{WorkerHandle, WorkerRuntime};
pub use state::{OperatorStatus, RunPhase, WorkerSnapshot, WorkerState};
