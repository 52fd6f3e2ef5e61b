use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use crate::coord::types::WorkerAddress;
use crate::core::errors::{DagwireError, Result};
use crate::core::retry::RetryPolicy;

/// Static description of the controller and its worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Well-known address the controller listens on
    pub controller: WorkerAddress,
    /// Ordered worker pool; the order drives placement
    pub workers: Vec<WorkerAddress>,
    /// Retry policy for every request in the protocol
    #[serde(default)]
    pub retry: RetryPolicy,
    /// Timeout for a single request/response exchange
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// How long the controller waits for every worker to report
    #[serde(default = "default_completion_timeout_ms")]
    pub completion_timeout_ms: u64,
    /// Largest frame accepted on a TCP connection
    #[serde(default = "default_max_frame_bytes")]
    pub max_frame_bytes: usize,
    /// Operators a worker may run at the same time
    #[serde(default = "default_max_concurrent_operators")]
    pub max_concurrent_operators: usize,
    /// Capacity of actor inboxes and the controller event queue
    #[serde(default = "default_inbox_capacity")]
    pub inbox_capacity: usize,
}

fn default_request_timeout_ms() -> u64 {
    5_000
}

fn default_completion_timeout_ms() -> u64 {
    3_600_000 // 1 hour
}

fn default_max_frame_bytes() -> usize {
    16 * 1024 * 1024
}

fn default_max_concurrent_operators() -> usize {
    4
}

fn default_inbox_capacity() -> usize {
    1_024
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            controller: WorkerAddress::from("localhost:6000"),
            workers: vec![
                WorkerAddress::from("localhost:5555"),
                WorkerAddress::from("localhost:5556"),
                WorkerAddress::from("localhost:5557"),
            ],
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
            completion_timeout_ms: default_completion_timeout_ms(),
            max_frame_bytes: default_max_frame_bytes(),
            max_concurrent_operators: default_max_concurrent_operators(),
            inbox_capacity: default_inbox_capacity(),
        }
    }
}

impl ClusterConfig {
    /// Config with the given addresses and default tuning
    pub fn with_workers<I, A>(controller: impl Into<WorkerAddress>, workers: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<WorkerAddress>,
    {
        Self {
            controller: controller.into(),
            workers: workers.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from a `.json` or YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .map_err(|e| DagwireError::io(format!("read config {}", path.display()), e))?;
        match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => Self::from_json_str(&contents),
            _ => Self::from_yaml_str(&contents),
        }
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.controller.as_str().trim().is_empty() {
            return Err(DagwireError::configuration_field(
                "controller address must not be empty",
                "controller",
            ));
        }
        if self.workers.is_empty() {
            return Err(DagwireError::configuration_field(
                "worker pool must contain at least one worker",
                "workers",
            ));
        }
        let mut seen = HashSet::new();
        for worker in &self.workers {
            if worker.as_str().trim().is_empty() {
                return Err(DagwireError::configuration_field(
                    "worker address must not be empty",
                    "workers",
                ));
            }
            if worker == &self.controller {
                return Err(DagwireError::configuration_field(
                    format!("worker {} shares the controller address", worker),
                    "workers",
                ));
            }
            if !seen.insert(worker) {
                return Err(DagwireError::configuration_field(
                    format!("duplicate worker address {}", worker),
                    "workers",
                ));
            }
        }
        if self.request_timeout_ms == 0 {
            return Err(DagwireError::configuration_field(
                "request_timeout_ms must be greater than 0",
                "request_timeout_ms",
            ));
        }
        if self.completion_timeout_ms == 0 {
            return Err(DagwireError::configuration_field(
                "completion_timeout_ms must be greater than 0",
                "completion_timeout_ms",
            ));
        }
        if self.max_frame_bytes < 64 {
            return Err(DagwireError::configuration_field(
                "max_frame_bytes is too small",
                "max_frame_bytes",
            ));
        }
        if self.max_concurrent_operators == 0 {
            return Err(DagwireError::configuration_field(
                "max_concurrent_operators must be greater than 0",
                "max_concurrent_operators",
            ));
        }
        if self.inbox_capacity == 0 {
            return Err(DagwireError::configuration_field(
                "inbox_capacity must be greater than 0",
                "inbox_capacity",
            ));
        }
        self.retry.validate()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn completion_timeout(&self) -> Duration {
        Duration::from_millis(self.completion_timeout_ms)
    }

    /// Settings for the worker at `index` in the pool
    pub fn worker_config(&self, index: usize) -> Result<WorkerConfig> {
        let address = self.workers.get(index).cloned().ok_or_else(|| {
            DagwireError::configuration_field(
                format!(
                    "invalid worker index {}, must be between 0 and {}",
                    index,
                    self.workers.len().saturating_sub(1)
                ),
                "workers",
            )
        })?;
        Ok(WorkerConfig {
            address,
            controller: self.controller.clone(),
            retry: self.retry.clone(),
            request_timeout_ms: self.request_timeout_ms,
            max_concurrent_operators: self.max_concurrent_operators,
            inbox_capacity: self.inbox_capacity,
        })
    }
}

/// Per-process settings of a worker runtime
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    pub address: WorkerAddress,
    pub controller: WorkerAddress,
    pub retry: RetryPolicy,
    pub request_timeout_ms: u64,
    pub max_concurrent_operators: usize,
    pub inbox_capacity: usize,
}

impl WorkerConfig {
    pub fn new(address: impl Into<WorkerAddress>, controller: impl Into<WorkerAddress>) -> Self {
        Self {
            address: address.into(),
            controller: controller.into(),
            retry: RetryPolicy::default(),
            request_timeout_ms: default_request_timeout_ms(),
            max_concurrent_operators: default_max_concurrent_operators(),
            inbox_capacity: default_inbox_capacity(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}
