// Core infrastructure shared by the controller, workers and transports

pub mod config;
pub mod errors;
pub mod retry;

// Re-export commonly used types
pub use config::{ClusterConfig, WorkerConfig};
pub use errors::{DagwireError, Result};
pub use retry::{BackoffStrategy, RetryPolicy};
