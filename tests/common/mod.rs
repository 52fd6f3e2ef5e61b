//! In-process cluster harness shared by the integration suites

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;
use std::sync::Arc;

use dagwire::coord::{Controller, ControllerService, OperatorId, Payload, WorkerAddress};
use dagwire::core::{ClusterConfig, RetryPolicy};
use dagwire::core::retry::BackoffStrategy;
use dagwire::transport::InMemoryNetwork;
use dagwire::worker::{OperatorCtx, OperatorFunction, WorkerHandle, WorkerRuntime};

pub const CONTROLLER: &str = "ctl";

/// One operator execution as seen by the function
#[derive(Debug, Clone)]
pub struct Execution {
    pub operator: OperatorId,
    pub worker: WorkerAddress,
    pub inputs: Vec<OperatorId>,
}

/// Shared, ordered log of executions across all workers
#[derive(Debug, Default)]
pub struct ExecutionLog {
    entries: Mutex<Vec<Execution>>,
}

impl ExecutionLog {
    pub fn record(&self, ctx: &OperatorCtx) {
        self.entries.lock().push(Execution {
            operator: ctx.operator_id.clone(),
            worker: ctx.worker.clone(),
            inputs: ctx.inputs.keys().cloned().collect(),
        });
    }

    pub fn entries(&self) -> Vec<Execution> {
        self.entries.lock().clone()
    }

    pub fn order(&self) -> Vec<String> {
        self.entries
            .lock()
            .iter()
            .map(|e| e.operator.as_str().to_string())
            .collect()
    }

    pub fn position(&self, operator: &str) -> Option<usize> {
        self.order().iter().position(|op| op == operator)
    }

    pub fn count(&self, operator: &str) -> usize {
        self.order().iter().filter(|op| *op == operator).count()
    }
}

/// Records every execution and returns the operator id
pub struct RecordingFunction {
    pub log: Arc<ExecutionLog>,
}

#[async_trait]
impl OperatorFunction for RecordingFunction {
    fn name(&self) -> &str {
        "recording"
    }

    async fn execute(&self, ctx: &OperatorCtx) -> anyhow::Result<Payload> {
        self.log.record(ctx);
        Ok(json!({ "from": ctx.operator_id }))
    }
}

pub fn fast_retry() -> RetryPolicy {
    RetryPolicy {
        max_retries: 2,
        base_delay_ms: 1,
        max_delay_ms: 5,
        multiplier: 2.0,
        backoff: BackoffStrategy::Exponential,
    }
}

pub fn worker_names(count: usize) -> Vec<String> {
    (0..count).map(|i| format!("w{}", i)).collect()
}

pub struct Cluster {
    pub network: InMemoryNetwork,
    pub config: ClusterConfig,
    pub controller: Arc<Controller>,
    pub service: ControllerService,
    pub workers: Vec<WorkerHandle>,
    pub log: Arc<ExecutionLog>,
}

impl Cluster {
    /// Cluster whose workers record executions into a shared log
    pub fn new(worker_count: usize) -> Self {
        let log = Arc::new(ExecutionLog::default());
        let function = Arc::new(RecordingFunction { log: log.clone() });
        let mut cluster = Self::with_function(worker_count, function);
        cluster.log = log;
        cluster
    }

    pub fn with_function(worker_count: usize, function: Arc<dyn OperatorFunction>) -> Self {
        let network = InMemoryNetwork::default();
        let mut config = ClusterConfig::with_workers(CONTROLLER, worker_names(worker_count));
        config.retry = fast_retry();
        config.completion_timeout_ms = 5_000;

        let controller = Arc::new(Controller::new(config.clone(), Arc::new(network.clone())));
        let service = ControllerService::new(controller.clone());
        network.register(CONTROLLER, Arc::new(service.clone()));

        let mut workers = Vec::new();
        for index in 0..worker_count {
            let worker_config = config
                .worker_config(index)
                .expect("worker index within pool");
            let handle =
                WorkerRuntime::spawn(worker_config, function.clone(), Arc::new(network.clone()));
            network.register(handle.address().clone(), Arc::new(handle.clone()));
            workers.push(handle);
        }

        Self {
            network,
            config,
            controller,
            service,
            workers,
            log: Arc::new(ExecutionLog::default()),
        }
    }

    pub fn worker(&self, index: usize) -> &WorkerHandle {
        &self.workers[index]
    }

    pub fn address(&self, index: usize) -> WorkerAddress {
        self.config.workers[index].clone()
    }
}
