//! Controller - drives one run across the worker pool
//!
//! A run is a two-phase rollout: every Assignment is sent to every worker and
//! acknowledged, then Start is broadcast. The controller then waits until each
//! worker has sent a TerminationReport. Worker reports reach the controller
//! through its listening endpoint (see `ControllerService`) and are funneled
//! into a single event queue.

use chrono::{DateTime, Utc};
use futures::future::join_all;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, instrument, warn};

use crate::coord::placement::{Placement, PlacementPolicy, RoundRobin};
use crate::coord::types::{
    Assignment, Envelope, FailureReport, Message, OperatorId, Reply, RunId, TerminationReport,
    WorkerAddress,
};
use crate::core::config::ClusterConfig;
use crate::core::errors::{DagwireError, Result};
use crate::graph::OperatorGraph;
use crate::transport::{request_with_retry, send_expecting_ack, Transport};

/// Worker-originated events for a run
#[derive(Debug, Clone)]
pub enum RunEvent {
    Terminated {
        run_id: RunId,
        report: TerminationReport,
    },
    Failed {
        run_id: RunId,
        report: FailureReport,
    },
    Aborted {
        run_id: RunId,
    },
}

impl RunEvent {
    pub fn run_id(&self) -> RunId {
        match self {
            RunEvent::Terminated { run_id, .. }
            | RunEvent::Failed { run_id, .. }
            | RunEvent::Aborted { run_id } => *run_id,
        }
    }
}

/// Summary of a completed run
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: RunId,
    pub placement: Placement,
    /// Operators each worker reported as completed
    pub completed: BTreeMap<WorkerAddress, Vec<OperatorId>>,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
}

impl RunReport {
    pub fn total_completed(&self) -> usize {
        self.completed.values().map(Vec::len).sum()
    }

    pub fn duration(&self) -> chrono::Duration {
        self.finished_at - self.started_at
    }
}

pub struct Controller {
    config: ClusterConfig,
    transport: Arc<dyn Transport>,
    placement: Arc<dyn PlacementPolicy>,
    events_tx: mpsc::Sender<RunEvent>,
    events_rx: tokio::sync::Mutex<mpsc::Receiver<RunEvent>>,
    active: Mutex<Option<RunId>>,
    // set by terminate, checked at every rollout step
    cancelled: Mutex<Option<RunId>>,
}

impl Controller {
    pub fn new(config: ClusterConfig, transport: Arc<dyn Transport>) -> Self {
        let (events_tx, events_rx) = mpsc::channel(config.inbox_capacity.max(1));
        Self {
            config,
            transport,
            placement: Arc::new(RoundRobin),
            events_tx,
            events_rx: tokio::sync::Mutex::new(events_rx),
            active: Mutex::new(None),
            cancelled: Mutex::new(None),
        }
    }

    pub fn with_placement(mut self, placement: Arc<dyn PlacementPolicy>) -> Self {
        self.placement = placement;
        self
    }

    pub fn config(&self) -> &ClusterConfig {
        &self.config
    }

    pub fn workers(&self) -> &[WorkerAddress] {
        &self.config.workers
    }

    /// Sender for worker reports
    pub fn event_sender(&self) -> mpsc::Sender<RunEvent> {
        self.events_tx.clone()
    }

    pub fn active_run(&self) -> Option<RunId> {
        *self.active.lock()
    }

    /// Reserve the controller for a new run
    pub fn begin(&self) -> Result<RunId> {
        let mut active = self.active.lock();
        if let Some(run_id) = *active {
            return Err(DagwireError::RunInProgress { run_id });
        }
        let run_id = RunId::new();
        *active = Some(run_id);
        Ok(run_id)
    }

    /// Release the reservation taken by [`Controller::begin`]
    pub fn finish(&self, run_id: RunId) {
        let mut active = self.active.lock();
        if *active == Some(run_id) {
            *active = None;
        }
        let mut cancelled = self.cancelled.lock();
        if *cancelled == Some(run_id) {
            *cancelled = None;
        }
    }

    pub fn is_cancelled(&self, run_id: RunId) -> bool {
        *self.cancelled.lock() == Some(run_id)
    }

    /// Fail with `Aborted` once the run was terminated.
    ///
    /// Workers that bound to the run after the terminate broadcast are told to
    /// abort again.
    async fn ensure_live(&self, run_id: RunId) -> Result<()> {
        if self.is_cancelled(run_id) {
            warn!("run {} was terminated during rollout", run_id);
            self.abort(run_id).await;
            return Err(DagwireError::Aborted { run_id });
        }
        Ok(())
    }

    /// Placement of `graph` over the configured pool
    pub fn plan(&self, graph: &OperatorGraph) -> Result<Placement> {
        Placement::compute(graph, &self.config.workers, self.placement.as_ref())
    }

    /// Assign, start and wait for one run
    pub async fn run(&self, graph: &OperatorGraph) -> Result<RunReport> {
        let run_id = self.begin()?;
        let result = self.execute_reserved(run_id, graph).await;
        self.finish(run_id);
        result
    }

    /// Drive a run already reserved with [`Controller::begin`]
    #[instrument(skip_all, fields(run_id = %run_id))]
    pub async fn execute_reserved(&self, run_id: RunId, graph: &OperatorGraph) -> Result<RunReport> {
        let started_at = Utc::now();
        info!(
            "starting run {} with {} operators on {} workers ({})",
            run_id,
            graph.len(),
            self.config.workers.len(),
            self.placement.name()
        );

        self.ensure_live(run_id).await?;
        let placement = self.assign_all(run_id, graph).await?;
        self.ensure_live(run_id).await?;

        if let Err(err) = self.start_all(run_id).await {
            error!("start of run {} failed: {}", run_id, err);
            self.abort(run_id).await;
            return Err(err);
        }

        match self.await_completion(run_id).await {
            Ok(completed) => {
                let report = RunReport {
                    run_id,
                    placement,
                    completed,
                    started_at,
                    finished_at: Utc::now(),
                };
                info!(
                    "run {} completed: {} operators in {}ms",
                    run_id,
                    report.total_completed(),
                    report.duration().num_milliseconds()
                );
                Ok(report)
            }
            Err(err @ DagwireError::Aborted { .. }) => {
                warn!("run {} was aborted", run_id);
                self.abort(run_id).await;
                Err(err)
            }
            Err(err) => {
                error!("run {} failed: {}", run_id, err);
                self.abort(run_id).await;
                Err(err)
            }
        }
    }

    /// Phase one: send every Assignment to every worker.
    ///
    /// All-or-nothing. If any worker cannot take an assignment the rollout is
    /// abandoned, reachable workers are told to abort, and no Start is sent.
    /// A terminated run stops between assignments with `Aborted`.
    pub async fn assign_all(&self, run_id: RunId, graph: &OperatorGraph) -> Result<Placement> {
        let placement = self.plan(graph)?;

        for node in graph.operators() {
            self.ensure_live(run_id).await?;
            let owner = placement.worker_for(&node.id).cloned().ok_or_else(|| {
                DagwireError::internal(format!("operator {} has no placement", node.id))
            })?;
            let envelope = Envelope::new(
                run_id,
                Message::Assignment(Assignment {
                    operator_id: node.id.clone(),
                    worker: owner.clone(),
                    upstream: node.upstream.iter().cloned().collect(),
                    downstream: node.downstream.iter().cloned().collect(),
                    payload: node.payload.clone(),
                }),
            );
            debug!("assigning {} to {}", node.id, owner);

            // the owner first, then the routing copies
            if let Err(err) = self.send(&owner, &envelope).await {
                return Err(self.rollout_failed(run_id, owner, err).await);
            }
            let envelope = &envelope;
            let copies = self
                .config
                .workers
                .iter()
                .filter(|worker| **worker != owner)
                .map(|worker| async move { (worker, self.send(worker, envelope).await) });
            for (worker, outcome) in join_all(copies).await {
                if let Err(err) = outcome {
                    return Err(self.rollout_failed(run_id, worker.clone(), err).await);
                }
            }
        }

        info!("run {}: {} assignments acknowledged", run_id, placement.len());
        Ok(placement)
    }

    async fn rollout_failed(
        &self,
        run_id: RunId,
        worker: WorkerAddress,
        err: DagwireError,
    ) -> DagwireError {
        self.abort(run_id).await;
        // workers refuse assignments of a run terminated mid-rollout
        if self.is_cancelled(run_id) {
            warn!("rollout of run {} stopped at {}: run was terminated", run_id, worker);
            return DagwireError::Aborted { run_id };
        }
        error!("assignment rollout of run {} failed at {}: {}", run_id, worker, err);
        DagwireError::AssignmentTransport {
            worker,
            message: err.to_string(),
        }
    }

    /// Phase two: broadcast Start
    pub async fn start_all(&self, run_id: RunId) -> Result<()> {
        let envelope = Envelope::new(run_id, Message::Start);
        let sends = self
            .config
            .workers
            .iter()
            .map(|worker| self.send(worker, &envelope));
        for outcome in join_all(sends).await {
            outcome?;
        }
        info!("run {} started on all workers", run_id);
        Ok(())
    }

    /// Wait until every worker has reported, a worker reports a failure, or the
    /// completion timeout elapses
    pub async fn await_completion(
        &self,
        run_id: RunId,
    ) -> Result<BTreeMap<WorkerAddress, Vec<OperatorId>>> {
        let mut events = self.events_rx.lock().await;
        let timeout = self.config.completion_timeout();
        let deadline = tokio::time::Instant::now() + timeout;
        let mut reported = BTreeMap::new();

        while reported.len() < self.config.workers.len() {
            let event = match tokio::time::timeout_at(deadline, events.recv()).await {
                Ok(Some(event)) => event,
                Ok(None) => {
                    return Err(DagwireError::channel("run_events", "event queue closed"));
                }
                Err(_) => {
                    return Err(DagwireError::timeout(
                        format!("completion of run {}", run_id),
                        timeout.as_millis() as u64,
                    ));
                }
            };
            if event.run_id() != run_id {
                debug!("ignoring event for run {}", event.run_id());
                continue;
            }
            match event {
                RunEvent::Terminated { report, .. } => {
                    if !self.config.workers.contains(&report.worker) {
                        warn!("termination report from unknown worker {}", report.worker);
                        continue;
                    }
                    info!(
                        "worker {} finished run {} ({} operators)",
                        report.worker,
                        run_id,
                        report.completed.len()
                    );
                    reported.insert(report.worker, report.completed);
                    debug!("{}/{} workers reported", reported.len(), self.config.workers.len());
                }
                RunEvent::Failed { report, .. } => {
                    let operator = report
                        .operator_id
                        .map(|op| format!(" at operator {}", op))
                        .unwrap_or_default();
                    return Err(DagwireError::RunFailed {
                        run_id,
                        reason: format!("worker {} failed{}: {}", report.worker, operator, report.reason),
                    });
                }
                RunEvent::Aborted { .. } => return Err(DagwireError::Aborted { run_id }),
            }
        }
        Ok(reported)
    }

    /// Broadcast AbortRequest and gather what each worker had completed.
    ///
    /// Best effort: unreachable workers are logged and skipped.
    pub async fn abort(&self, run_id: RunId) -> BTreeMap<WorkerAddress, Vec<OperatorId>> {
        let envelope = Envelope::new(run_id, Message::AbortRequest);
        let requests = self.config.workers.iter().map(|worker| {
            let envelope = &envelope;
            async move {
                let reply =
                    request_with_retry(self.transport.as_ref(), worker, envelope, &self.config.retry)
                        .await;
                (worker, reply)
            }
        });

        let mut completed = BTreeMap::new();
        for (worker, reply) in join_all(requests).await {
            match reply {
                Ok(Reply::AbortAck {
                    worker: from,
                    completed: done,
                }) => {
                    debug!("{} aborted with {} completed operators", from, done.len());
                    completed.insert(from, done);
                }
                Ok(other) => warn!("unexpected abort reply from {}: {:?}", worker, other),
                Err(err) => warn!("could not abort run {} on {}: {}", run_id, worker, err),
            }
        }
        completed
    }

    /// Abort the active run on request of the submitter
    pub async fn terminate(&self, run_id: RunId) -> Result<BTreeMap<WorkerAddress, Vec<OperatorId>>> {
        if self.active_run() != Some(run_id) {
            return Err(DagwireError::RunFailed {
                run_id,
                reason: "run is not active".to_string(),
            });
        }
        info!("terminating run {}", run_id);
        *self.cancelled.lock() = Some(run_id);
        let completed = self.abort(run_id).await;
        self.events_tx
            .send(RunEvent::Aborted { run_id })
            .await
            .map_err(|_| DagwireError::channel("run_events", "event queue closed"))?;
        Ok(completed)
    }

    async fn send(&self, worker: &WorkerAddress, envelope: &Envelope) -> Result<()> {
        send_expecting_ack(self.transport.as_ref(), worker, envelope, &self.config.retry).await
    }
}
