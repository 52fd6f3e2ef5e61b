//! dagwire - distributed execution of operator DAGs over a fixed worker pool
//!
//! A controller places every operator on a worker (round robin), broadcasts
//! the assignments, then starts the run. Workers track their own operators'
//! dependencies, execute operators as soon as every upstream result has
//! arrived, and push results straight to the workers owning the downstream
//! operators. Each worker reports to the controller once it has no local work
//! left.

pub mod coord;
pub mod core;
pub mod graph;
pub mod transport;
pub mod worker;

pub use coord::{
    Controller, ControllerClient, ControllerService, OperatorId, Placement, PlacementPolicy,
    RoundRobin, RunId, RunReport, WorkerAddress,
};
pub use crate::core::{ClusterConfig, DagwireError, Result, RetryPolicy, WorkerConfig};
pub use graph::{OperatorGraph, WorkflowDefinition};
pub use transport::{InMemoryNetwork, TcpTransport, Transport};
pub use worker::{EchoFunction, OperatorFunction, WorkerHandle, WorkerRuntime};

use tracing_subscriber::EnvFilter;

/// Install a fmt subscriber filtered by `RUST_LOG` (default `info`)
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init();
}
