//! Worker runtime - one actor per worker process
//!
//! The actor task exclusively owns [`WorkerState`]. Inbound protocol messages,
//! operator completions and delivery outcomes all arrive on one mpsc queue, so
//! state is mutated from a single place. Operator execution and outbound sends
//! run on spawned tasks that post back to the queue when they finish.

use async_trait::async_trait;
use futures::FutureExt;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::coord::types::{
    Assignment, Envelope, ErrorKind, ExecutionResult, FailureReport, Message, OperatorId, Payload,
    Reply, RunId, TerminationReport, WorkerAddress,
};
use crate::core::config::WorkerConfig;
use crate::core::errors::{DagwireError, Result};
use crate::transport::{send_expecting_ack, MessageHandler, Transport};
use crate::worker::action::{OperatorCtx, OperatorFunction};
use crate::worker::state::{ExecutionTicket, RunPhase, WorkerSnapshot, WorkerState};

/// Everything the actor reacts to
enum WorkerCommand {
    /// Protocol message from a peer, answered through `reply`
    Deliver {
        envelope: Envelope,
        reply: oneshot::Sender<Reply>,
    },
    /// An operator execution finished
    Finished {
        run_id: RunId,
        operator_id: OperatorId,
        outcome: anyhow::Result<Payload>,
    },
    /// An outbound Result send finished (after retries)
    DeliveryDone {
        id: u64,
        run_id: RunId,
        operator_id: OperatorId,
        target: WorkerAddress,
        outcome: Result<()>,
    },
    Snapshot {
        reply: oneshot::Sender<WorkerSnapshot>,
    },
    Shutdown,
}

/// Cheap handle to a running worker actor
#[derive(Clone)]
pub struct WorkerHandle {
    address: WorkerAddress,
    tx: mpsc::Sender<WorkerCommand>,
}

impl WorkerHandle {
    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    /// Inspectable copy of the worker's state
    pub async fn snapshot(&self) -> Result<WorkerSnapshot> {
        let (reply, rx) = oneshot::channel();
        self.tx
            .send(WorkerCommand::Snapshot { reply })
            .await
            .map_err(|_| DagwireError::channel("worker_inbox", "worker stopped"))?;
        rx.await
            .map_err(|_| DagwireError::channel("worker_snapshot", "worker dropped the request"))
    }

    pub async fn shutdown(&self) {
        let _ = self.tx.send(WorkerCommand::Shutdown).await;
    }
}

#[async_trait]
impl MessageHandler for WorkerHandle {
    async fn handle(&self, envelope: Envelope) -> Reply {
        let (reply, rx) = oneshot::channel();
        if self
            .tx
            .send(WorkerCommand::Deliver { envelope, reply })
            .await
            .is_err()
        {
            return Reply::error(ErrorKind::Internal, format!("worker {} stopped", self.address));
        }
        rx.await.unwrap_or_else(|_| {
            Reply::error(
                ErrorKind::Internal,
                format!("worker {} dropped the request", self.address),
            )
        })
    }
}

pub struct WorkerRuntime {
    config: WorkerConfig,
    function: Arc<dyn OperatorFunction>,
    transport: Arc<dyn Transport>,
    state: WorkerState,
    inbox: mpsc::Receiver<WorkerCommand>,
    // weak so the actor stops once every handle is dropped
    self_tx: mpsc::WeakSender<WorkerCommand>,
    // executions of the bound run only; leftovers of an earlier run hold no slot
    executing: usize,
    deliveries: HashMap<u64, JoinHandle<()>>,
    next_delivery: u64,
    // TerminationReport or FailureReport already sent for the bound run
    reported: bool,
}

impl WorkerRuntime {
    /// Start the actor and return a handle to it
    pub fn spawn(
        config: WorkerConfig,
        function: Arc<dyn OperatorFunction>,
        transport: Arc<dyn Transport>,
    ) -> WorkerHandle {
        let (tx, inbox) = mpsc::channel(config.inbox_capacity.max(1));
        let handle = WorkerHandle {
            address: config.address.clone(),
            tx: tx.clone(),
        };
        let runtime = WorkerRuntime {
            state: WorkerState::new(config.address.clone()),
            config,
            function,
            transport,
            inbox,
            self_tx: tx.downgrade(),
            executing: 0,
            deliveries: HashMap::new(),
            next_delivery: 0,
            reported: false,
        };
        drop(tx);
        let span = info_span!("worker", address = %handle.address);
        tokio::spawn(runtime.run().instrument(span));
        handle
    }

    async fn run(mut self) {
        info!(
            "worker started with function '{}' (max {} concurrent operators)",
            self.function.name(),
            self.config.max_concurrent_operators
        );
        while let Some(command) = self.inbox.recv().await {
            match command {
                WorkerCommand::Deliver { envelope, reply } => {
                    let response = self.handle_envelope(envelope);
                    let _ = reply.send(response);
                }
                WorkerCommand::Finished {
                    run_id,
                    operator_id,
                    outcome,
                } => self.on_finished(run_id, operator_id, outcome),
                WorkerCommand::DeliveryDone {
                    id,
                    run_id,
                    operator_id,
                    target,
                    outcome,
                } => self.on_delivery_done(id, run_id, operator_id, target, outcome),
                WorkerCommand::Snapshot { reply } => {
                    let mut snapshot = self.state.snapshot();
                    snapshot.pending_deliveries = self.deliveries.len();
                    let _ = reply.send(snapshot);
                }
                WorkerCommand::Shutdown => break,
            }
            self.pump();
            self.maybe_report();
        }
        self.cancel_deliveries();
        info!("worker stopped");
    }

    fn handle_envelope(&mut self, envelope: Envelope) -> Reply {
        let Envelope { run_id, message } = envelope;
        let kind = message.kind();
        debug!("received {} for run {}", kind, run_id);

        let outcome = match message {
            Message::Assignment(assignment) => self.on_assignment(run_id, assignment),
            Message::Start => self.on_start(run_id),
            Message::Result(result) => self.on_result(run_id, result),
            Message::AbortRequest => return self.on_abort(run_id),
            other @ (Message::TerminationReport(_)
            | Message::FailureReport(_)
            | Message::SubmitWorkflow { .. }
            | Message::TerminateRun) => {
                warn!("rejecting {} message", other.kind());
                return Reply::unexpected("worker", &other);
            }
        };

        match outcome {
            Ok(()) => Reply::Ack,
            Err(err @ DagwireError::DuplicateResult { .. }) => {
                debug!("ignoring {}", err);
                Reply::Ack
            }
            Err(err @ DagwireError::UnassignedOperator { .. }) => {
                warn!("ignoring {}: {}", kind, err);
                Reply::Ack
            }
            Err(err) => {
                warn!("rejecting {} ({}): {}", kind, err.category(), err);
                Reply::from_error(&err)
            }
        }
    }

    fn bind(&mut self, run_id: RunId) -> Result<()> {
        if self.state.bind_run(run_id)? {
            debug!("bound to run {}", run_id);
            self.cancel_deliveries();
            self.executing = 0;
            self.reported = false;
        }
        Ok(())
    }

    fn on_assignment(&mut self, run_id: RunId, assignment: Assignment) -> Result<()> {
        self.bind(run_id)?;
        let operator = assignment.operator_id.clone();
        let owner = assignment.worker.clone();
        let ready = self.state.assign(assignment)?;
        if owner == self.config.address {
            debug!("assigned operator {}", operator);
        }
        if !ready.is_empty() {
            debug!("ready after assignment: {:?}", ready);
        }
        Ok(())
    }

    fn on_start(&mut self, run_id: RunId) -> Result<()> {
        self.bind(run_id)?;
        let ready = self.state.start();
        info!("run {} started, {} operators ready", run_id, ready.len());
        Ok(())
    }

    fn on_result(&mut self, run_id: RunId, result: ExecutionResult) -> Result<()> {
        self.state.check_run(run_id)?;
        let ready = self.state.record_result(&result)?;
        debug!(
            "result of {} from {}, ready: {:?}",
            result.operator_id, result.worker, ready
        );
        Ok(())
    }

    fn on_abort(&mut self, run_id: RunId) -> Reply {
        let completed = match self.state.check_run(run_id) {
            Ok(()) => {
                let completed = self.state.abort();
                self.cancel_deliveries();
                self.reported = true;
                info!("run {} aborted after {} operators", run_id, completed.len());
                completed
            }
            Err(err) => {
                debug!("abort for a run this worker is not bound to: {}", err);
                Vec::new()
            }
        };
        Reply::AbortAck {
            worker: self.config.address.clone(),
            completed,
        }
    }

    /// Launch ready operators up to the concurrency limit
    fn pump(&mut self) {
        while self.executing < self.config.max_concurrent_operators {
            let Some(ticket) = self.state.next_ready() else {
                break;
            };
            self.launch(ticket);
        }
    }

    fn launch(&mut self, ticket: ExecutionTicket) {
        let Some(run_id) = self.state.run_id() else {
            return;
        };
        let ctx = OperatorCtx {
            run_id,
            operator_id: ticket.operator_id,
            worker: self.config.address.clone(),
            payload: ticket.payload,
            inputs: ticket.inputs,
        };
        debug!("executing operator {}", ctx.operator_id);
        self.executing += 1;

        let function = self.function.clone();
        let tx = self.self_tx.clone();
        tokio::spawn(async move {
            let outcome = match AssertUnwindSafe(function.execute(&ctx)).catch_unwind().await {
                Ok(outcome) => outcome,
                Err(_) => Err(anyhow::anyhow!("operator function panicked")),
            };
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(WorkerCommand::Finished {
                        run_id,
                        operator_id: ctx.operator_id,
                        outcome,
                    })
                    .await;
            }
        });
    }

    fn on_finished(&mut self, run_id: RunId, operator_id: OperatorId, outcome: anyhow::Result<Payload>) {
        if self.state.run_id() != Some(run_id) {
            debug!("discarding output of {} from earlier run {}", operator_id, run_id);
            return;
        }
        self.executing = self.executing.saturating_sub(1);
        if self.state.phase() == RunPhase::Aborted {
            debug!("discarding output of {} from run {}", operator_id, run_id);
            return;
        }

        let payload = match outcome {
            Ok(payload) => payload,
            Err(err) => {
                error!("operator {} failed: {:#}", operator_id, err);
                if let Err(err) = self.state.fail(&operator_id) {
                    error!("could not mark {} failed: {}", operator_id, err);
                }
                self.report_failure(
                    run_id,
                    Some(operator_id),
                    format!("operator execution failed: {:#}", err),
                );
                return;
            }
        };

        let completion = match self.state.complete(&operator_id, payload) {
            Ok(completion) => completion,
            Err(err) => {
                error!("could not complete {}: {}", operator_id, err);
                return;
            }
        };
        debug!(
            "operator {} done, forwarding to {} workers",
            operator_id,
            completion.targets.len()
        );

        if !completion.unrouted.is_empty() {
            error!(
                "downstream operators of {} have no owner: {:?}",
                operator_id, completion.unrouted
            );
            self.report_failure(
                run_id,
                Some(operator_id),
                format!("downstream operators without owner: {:?}", completion.unrouted),
            );
            return;
        }

        for target in completion.targets {
            self.deliver(run_id, target, completion.result.clone());
        }
    }

    fn deliver(&mut self, run_id: RunId, target: WorkerAddress, result: ExecutionResult) {
        let id = self.next_delivery;
        self.next_delivery += 1;

        let transport = self.transport.clone();
        let retry = self.config.retry.clone();
        let tx = self.self_tx.clone();
        let operator_id = result.operator_id.clone();
        let envelope = Envelope::new(run_id, Message::Result(result));

        let handle = tokio::spawn(async move {
            let outcome = send_expecting_ack(transport.as_ref(), &target, &envelope, &retry).await;
            if let Some(tx) = tx.upgrade() {
                let _ = tx
                    .send(WorkerCommand::DeliveryDone {
                        id,
                        run_id,
                        operator_id,
                        target,
                        outcome,
                    })
                    .await;
            }
        });
        self.deliveries.insert(id, handle);
    }

    fn on_delivery_done(
        &mut self,
        id: u64,
        run_id: RunId,
        operator_id: OperatorId,
        target: WorkerAddress,
        outcome: Result<()>,
    ) {
        self.deliveries.remove(&id);
        if self.state.run_id() != Some(run_id) {
            return;
        }
        match outcome {
            Ok(()) => debug!("delivered result of {} to {}", operator_id, target),
            Err(err) => {
                error!(
                    "could not deliver result of {} to {}: {}",
                    operator_id, target, err
                );
                self.report_failure(run_id, Some(operator_id), err.to_string());
            }
        }
    }

    fn cancel_deliveries(&mut self) {
        for (_, handle) in self.deliveries.drain() {
            handle.abort();
        }
    }

    /// Send the TerminationReport once local work is finished
    fn maybe_report(&mut self) {
        if self.reported || !self.deliveries.is_empty() || !self.state.all_done() {
            return;
        }
        let Some(run_id) = self.state.run_id() else {
            return;
        };
        self.reported = true;
        let completed = self.state.completed().to_vec();
        info!(
            "run {} finished locally, {} operators completed",
            run_id,
            completed.len()
        );
        self.notify_controller(
            run_id,
            Message::TerminationReport(TerminationReport {
                worker: self.config.address.clone(),
                completed,
            }),
        );
    }

    fn report_failure(&mut self, run_id: RunId, operator_id: Option<OperatorId>, reason: String) {
        // a failed worker never sends a TerminationReport for the run
        self.reported = true;
        self.notify_controller(
            run_id,
            Message::FailureReport(FailureReport {
                worker: self.config.address.clone(),
                operator_id,
                reason,
            }),
        );
    }

    fn notify_controller(&self, run_id: RunId, message: Message) {
        let transport = self.transport.clone();
        let retry = self.config.retry.clone();
        let controller = self.config.controller.clone();
        let envelope = Envelope::new(run_id, message);
        tokio::spawn(async move {
            let kind = envelope.message.kind();
            if let Err(err) =
                send_expecting_ack(transport.as_ref(), &controller, &envelope, &retry).await
            {
                error!("could not send {} to controller {}: {}", kind, controller, err);
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::retry::RetryPolicy;
    use crate::transport::InMemoryNetwork;
    use crate::worker::action::{EchoFunction, FnOperator};
    use crate::worker::state::OperatorStatus;
    use parking_lot::Mutex;
    use serde_json::json;
    use std::time::Duration;

    /// Records everything the controller would receive
    #[derive(Default)]
    struct ControllerProbe {
        received: Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl MessageHandler for ControllerProbe {
        async fn handle(&self, envelope: Envelope) -> Reply {
            self.received.lock().push(envelope.message);
            Reply::Ack
        }
    }

    fn assignment(id: &str, worker: &str, upstream: &[&str], downstream: &[&str]) -> Message {
        Message::Assignment(Assignment {
            operator_id: OperatorId::from(id),
            worker: WorkerAddress::from(worker),
            upstream: upstream.iter().map(|u| OperatorId::from(*u)).collect(),
            downstream: downstream.iter().map(|d| OperatorId::from(*d)).collect(),
            payload: json!(null),
        })
    }

    fn spawn_worker(network: &InMemoryNetwork, address: &str) -> WorkerHandle {
        let config = WorkerConfig::new(address, "ctl").with_retry(RetryPolicy::none());
        let handle = WorkerRuntime::spawn(config, Arc::new(EchoFunction), Arc::new(network.clone()));
        network.register(address, Arc::new(handle.clone()));
        handle
    }

    async fn wait_for_reports(probe: &ControllerProbe, count: usize) -> Vec<Message> {
        for _ in 0..200 {
            let received = probe.received.lock().clone();
            if received.len() >= count {
                return received;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("controller saw {:?}", probe.received.lock());
    }

    #[tokio::test]
    async fn test_single_operator_reports_termination() {
        let network = InMemoryNetwork::default();
        let probe = Arc::new(ControllerProbe::default());
        network.register("ctl", probe.clone());
        let worker = spawn_worker(&network, "w0");
        let run = RunId::new();

        assert_eq!(worker.handle(Envelope::new(run, assignment("a", "w0", &[], &[]))).await, Reply::Ack);
        assert_eq!(worker.handle(Envelope::new(run, Message::Start)).await, Reply::Ack);

        let reports = wait_for_reports(&probe, 1).await;
        match &reports[0] {
            Message::TerminationReport(report) => {
                assert_eq!(report.completed, vec![OperatorId::from("a")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_fan_in_with_duplicate_result() {
        let network = InMemoryNetwork::default();
        let probe = Arc::new(ControllerProbe::default());
        network.register("ctl", probe.clone());
        let worker = spawn_worker(&network, "w2");
        let run = RunId::new();

        for message in [
            assignment("a", "w0", &[], &["c"]),
            assignment("b", "w1", &[], &["c"]),
            assignment("c", "w2", &["a", "b"], &[]),
            Message::Start,
        ] {
            assert_eq!(worker.handle(Envelope::new(run, message)).await, Reply::Ack);
        }

        let result_of = |id: &str, from: &str| {
            Envelope::new(
                run,
                Message::Result(ExecutionResult {
                    operator_id: OperatorId::from(id),
                    worker: WorkerAddress::from(from),
                    payload: json!(id),
                }),
            )
        };
        assert_eq!(worker.handle(result_of("a", "w0")).await, Reply::Ack);
        assert_eq!(worker.handle(result_of("a", "w0")).await, Reply::Ack);

        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.status_of("c"), Some(OperatorStatus::Assigned));
        assert_eq!(snapshot.operators[&OperatorId::from("c")].received, 1);

        assert_eq!(worker.handle(result_of("b", "w1")).await, Reply::Ack);
        wait_for_reports(&probe, 1).await;
        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.status_of("c"), Some(OperatorStatus::Done));
    }

    #[tokio::test]
    async fn test_unreachable_downstream_reports_failure() {
        let network = InMemoryNetwork::default();
        let probe = Arc::new(ControllerProbe::default());
        network.register("ctl", probe.clone());
        let worker = spawn_worker(&network, "w0");
        let run = RunId::new();

        for message in [
            assignment("a", "w0", &[], &["b"]),
            assignment("b", "w1", &["a"], &[]),
            Message::Start,
        ] {
            worker.handle(Envelope::new(run, message)).await;
        }

        let reports = wait_for_reports(&probe, 1).await;
        match &reports[0] {
            Message::FailureReport(report) => {
                assert_eq!(report.operator_id, Some(OperatorId::from("a")));
                assert!(report.reason.contains("w1"));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stale_run_and_unexpected_messages() {
        let network = InMemoryNetwork::default();
        let worker = spawn_worker(&network, "w0");
        let run = RunId::new();
        worker.handle(Envelope::new(run, assignment("a", "w0", &["x"], &[]))).await;
        worker.handle(Envelope::new(run, Message::Start)).await;

        let stale = worker
            .handle(Envelope::new(RunId::new(), assignment("z", "w0", &[], &[])))
            .await;
        assert!(matches!(stale, Reply::Error { kind: ErrorKind::StaleRun, .. }));

        let unexpected = worker.handle(Envelope::new(run, Message::TerminateRun)).await;
        assert!(matches!(unexpected, Reply::Error { kind: ErrorKind::Unexpected, .. }));
    }

    #[tokio::test]
    async fn test_abort_replies_with_completed() {
        let network = InMemoryNetwork::default();
        let worker = spawn_worker(&network, "w0");
        let run = RunId::new();
        // waits forever on an input that never arrives
        worker.handle(Envelope::new(run, assignment("b", "w0", &["a"], &[]))).await;
        worker.handle(Envelope::new(run, Message::Start)).await;

        match worker.handle(Envelope::new(run, Message::AbortRequest)).await {
            Reply::AbortAck { worker: from, completed } => {
                assert_eq!(from.as_str(), "w0");
                assert!(completed.is_empty());
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(worker.snapshot().await.unwrap().phase, RunPhase::Aborted);
    }

    /// Downstream endpoint that never answers
    struct Stall;

    #[async_trait]
    impl MessageHandler for Stall {
        async fn handle(&self, _envelope: Envelope) -> Reply {
            futures::future::pending::<()>().await;
            Reply::Ack
        }
    }

    #[tokio::test]
    async fn test_abort_cancels_pending_delivery() {
        let network = InMemoryNetwork::default();
        let probe = Arc::new(ControllerProbe::default());
        network.register("ctl", probe.clone());
        network.register("w1", Arc::new(Stall));
        let worker = spawn_worker(&network, "w0");
        let run = RunId::new();

        for message in [
            assignment("a", "w0", &[], &["b"]),
            assignment("b", "w1", &["a"], &[]),
            Message::Start,
        ] {
            assert_eq!(worker.handle(Envelope::new(run, message)).await, Reply::Ack);
        }

        // a is done and its Result is stuck on the way to w1
        let mut in_flight = false;
        for _ in 0..200 {
            if worker.snapshot().await.unwrap().pending_deliveries == 1 {
                in_flight = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(in_flight);

        match worker.handle(Envelope::new(run, Message::AbortRequest)).await {
            Reply::AbortAck { completed, .. } => assert_eq!(completed, vec![OperatorId::from("a")]),
            other => panic!("unexpected {:?}", other),
        }
        let snapshot = worker.snapshot().await.unwrap();
        assert_eq!(snapshot.pending_deliveries, 0);
        assert_eq!(snapshot.phase, RunPhase::Aborted);

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(probe.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_stuck_operator_of_aborted_run_frees_its_slot() {
        let network = InMemoryNetwork::default();
        let probe = Arc::new(ControllerProbe::default());
        network.register("ctl", probe.clone());
        let function = FnOperator::new("stuck", |ctx: OperatorCtx| async move {
            if ctx.operator_id.as_str() == "stuck" {
                futures::future::pending::<()>().await;
            }
            Ok(json!(null))
        });
        let mut config = WorkerConfig::new("w0", "ctl").with_retry(RetryPolicy::none());
        config.max_concurrent_operators = 1;
        let worker = WorkerRuntime::spawn(config, Arc::new(function), Arc::new(network.clone()));

        let first = RunId::new();
        worker.handle(Envelope::new(first, assignment("stuck", "w0", &[], &[]))).await;
        worker.handle(Envelope::new(first, Message::Start)).await;
        let mut executing = false;
        for _ in 0..200 {
            let snapshot = worker.snapshot().await.unwrap();
            if snapshot.status_of("stuck") == Some(OperatorStatus::Executing) {
                executing = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(executing);
        worker.handle(Envelope::new(first, Message::AbortRequest)).await;

        let second = RunId::new();
        assert_eq!(
            worker.handle(Envelope::new(second, assignment("a", "w0", &[], &[]))).await,
            Reply::Ack
        );
        assert_eq!(worker.handle(Envelope::new(second, Message::Start)).await, Reply::Ack);

        let reports = wait_for_reports(&probe, 1).await;
        match &reports[0] {
            Message::TerminationReport(report) => {
                assert_eq!(report.completed, vec![OperatorId::from("a")]);
            }
            other => panic!("unexpected {:?}", other),
        }
    }
}
