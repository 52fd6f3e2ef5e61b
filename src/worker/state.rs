//! Worker-local dependency tracking
//!
//! `WorkerState` is owned by exactly one worker actor and is never shared.
//! It records the routing table broadcast during assignment and, for every
//! locally owned operator, which upstream results have arrived. An operator
//! moves `Assigned -> Ready` exactly once, when every upstream result has been
//! received and the run has started.

use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};

use crate::coord::types::{Assignment, ExecutionResult, OperatorId, Payload, RunId, WorkerAddress};
use crate::core::errors::{DagwireError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum OperatorStatus {
    Assigned,
    Ready,
    Executing,
    Done,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunPhase {
    /// No run bound yet
    Idle,
    /// Receiving assignments, Start not seen
    Assigning,
    Running,
    Aborted,
}

#[derive(Debug, Clone)]
struct OperatorEntry {
    assignment: Assignment,
    required: BTreeSet<OperatorId>,
    received: BTreeMap<OperatorId, Payload>,
    status: OperatorStatus,
}

/// Everything the execution loop needs to run one operator
#[derive(Debug, Clone)]
pub struct ExecutionTicket {
    pub operator_id: OperatorId,
    pub payload: Payload,
    pub inputs: BTreeMap<OperatorId, Payload>,
}

/// Outcome of finishing an operator
#[derive(Debug, Clone)]
pub struct Completion {
    pub result: ExecutionResult,
    /// Distinct workers owning at least one downstream operator
    pub targets: Vec<WorkerAddress>,
    /// Downstream operators with no routing entry
    pub unrouted: Vec<OperatorId>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OperatorSnapshot {
    pub status: OperatorStatus,
    pub received: usize,
    pub required: usize,
}

/// Point-in-time copy of a worker's state
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkerSnapshot {
    pub address: WorkerAddress,
    pub run_id: Option<RunId>,
    pub phase: RunPhase,
    pub operators: BTreeMap<OperatorId, OperatorSnapshot>,
    pub routes: usize,
    pub completed: Vec<OperatorId>,
    pub pending_deliveries: usize,
}

impl WorkerSnapshot {
    pub fn status_of(&self, operator: &str) -> Option<OperatorStatus> {
        self.operators
            .get(&OperatorId::from(operator))
            .map(|entry| entry.status)
    }
}

#[derive(Debug)]
pub struct WorkerState {
    address: WorkerAddress,
    run_id: Option<RunId>,
    phase: RunPhase,
    operators: HashMap<OperatorId, OperatorEntry>,
    // local operators in assignment order
    local_order: Vec<OperatorId>,
    routing: HashMap<OperatorId, WorkerAddress>,
    ready: VecDeque<OperatorId>,
    completed: Vec<OperatorId>,
}

impl WorkerState {
    pub fn new(address: WorkerAddress) -> Self {
        Self {
            address,
            run_id: None,
            phase: RunPhase::Idle,
            operators: HashMap::new(),
            local_order: Vec::new(),
            routing: HashMap::new(),
            ready: VecDeque::new(),
            completed: Vec::new(),
        }
    }

    pub fn address(&self) -> &WorkerAddress {
        &self.address
    }

    pub fn run_id(&self) -> Option<RunId> {
        self.run_id
    }

    pub fn phase(&self) -> RunPhase {
        self.phase
    }

    /// Bind to `run_id` for an Assignment or Start.
    ///
    /// Returns `true` when state from a previous run was discarded. A run that
    /// is still executing cannot be replaced.
    pub fn bind_run(&mut self, run_id: RunId) -> Result<bool> {
        match self.run_id {
            Some(current) if current == run_id => Ok(false),
            Some(current) if self.phase == RunPhase::Running && !self.all_done() => {
                Err(DagwireError::StaleRun {
                    expected: current,
                    got: run_id,
                })
            }
            _ => {
                self.reset(run_id);
                Ok(true)
            }
        }
    }

    /// Ensure a message belongs to the bound run
    pub fn check_run(&self, run_id: RunId) -> Result<()> {
        match self.run_id {
            Some(current) if current == run_id => Ok(()),
            Some(current) => Err(DagwireError::StaleRun {
                expected: current,
                got: run_id,
            }),
            None => Err(DagwireError::malformed(format!(
                "no run bound on {}, got message for {}",
                self.address, run_id
            ))),
        }
    }

    fn reset(&mut self, run_id: RunId) {
        self.run_id = Some(run_id);
        self.phase = RunPhase::Assigning;
        self.operators.clear();
        self.local_order.clear();
        self.routing.clear();
        self.ready.clear();
        self.completed.clear();
    }

    /// Record an Assignment; returns operators that became Ready
    pub fn assign(&mut self, assignment: Assignment) -> Result<Vec<OperatorId>> {
        let run_id = self
            .run_id
            .ok_or_else(|| DagwireError::internal("assignment before a run was bound"))?;
        if self.phase == RunPhase::Aborted {
            return Err(DagwireError::Aborted { run_id });
        }
        let id = assignment.operator_id.clone();
        if id.as_str().is_empty() {
            return Err(DagwireError::malformed("assignment with empty operator id"));
        }
        if assignment.upstream.contains(&id) || assignment.downstream.contains(&id) {
            return Err(DagwireError::malformed(format!(
                "operator '{}' lists itself as a neighbour",
                id
            )));
        }

        // routing entries are write-once
        match self.routing.get(&id) {
            Some(owner) if owner != &assignment.worker => {
                return Err(DagwireError::malformed(format!(
                    "operator '{}' already routed to {}, not {}",
                    id, owner, assignment.worker
                )));
            }
            Some(_) => {}
            None => {
                self.routing.insert(id.clone(), assignment.worker.clone());
            }
        }

        if assignment.worker != self.address {
            return Ok(Vec::new());
        }

        if let Some(existing) = self.operators.get(&id) {
            if existing.assignment == assignment {
                return Ok(Vec::new());
            }
            return Err(DagwireError::malformed(format!(
                "conflicting assignment for operator '{}'",
                id
            )));
        }

        let entry = OperatorEntry {
            required: assignment.upstream.iter().cloned().collect(),
            received: BTreeMap::new(),
            status: OperatorStatus::Assigned,
            assignment,
        };
        self.operators.insert(id.clone(), entry);
        self.local_order.push(id.clone());

        let mut newly_ready = Vec::new();
        if self.phase == RunPhase::Running && self.try_ready(&id) {
            newly_ready.push(id);
        }
        Ok(newly_ready)
    }

    /// Handle Start; returns operators that became Ready
    pub fn start(&mut self) -> Vec<OperatorId> {
        if self.phase != RunPhase::Assigning {
            return Vec::new();
        }
        self.phase = RunPhase::Running;
        let mut newly_ready = Vec::new();
        for id in self.local_order.clone() {
            if self.try_ready(&id) {
                newly_ready.push(id);
            }
        }
        newly_ready
    }

    /// Record an upstream result for every local consumer.
    ///
    /// A repeated result is a no-op reported as `DuplicateResult`; a result no
    /// local operator consumes is reported as `UnassignedOperator`.
    pub fn record_result(&mut self, result: &ExecutionResult) -> Result<Vec<OperatorId>> {
        if self.phase == RunPhase::Aborted {
            return Ok(Vec::new());
        }
        let from = &result.operator_id;
        let consumers: Vec<OperatorId> = self
            .local_order
            .iter()
            .filter(|id| {
                self.operators
                    .get(*id)
                    .map(|entry| entry.required.contains(from))
                    .unwrap_or(false)
            })
            .cloned()
            .collect();

        if consumers.is_empty() {
            return Err(DagwireError::UnassignedOperator {
                operator: from.clone(),
            });
        }

        let mut fresh = false;
        let mut newly_ready = Vec::new();
        for id in &consumers {
            let Some(entry) = self.operators.get_mut(id) else {
                continue;
            };
            if entry.received.contains_key(from) {
                continue;
            }
            entry.received.insert(from.clone(), result.payload.clone());
            fresh = true;
            if self.phase == RunPhase::Running && self.try_ready(id) {
                newly_ready.push(id.clone());
            }
        }

        if !fresh {
            return Err(DagwireError::DuplicateResult {
                operator: consumers[0].clone(),
                from: from.clone(),
            });
        }
        Ok(newly_ready)
    }

    fn try_ready(&mut self, id: &OperatorId) -> bool {
        let Some(entry) = self.operators.get_mut(id) else {
            return false;
        };
        if entry.status != OperatorStatus::Assigned || entry.received.len() != entry.required.len() {
            return false;
        }
        entry.status = OperatorStatus::Ready;
        self.ready.push_back(id.clone());
        true
    }

    /// Take the next Ready operator and mark it Executing
    pub fn next_ready(&mut self) -> Option<ExecutionTicket> {
        if self.phase != RunPhase::Running {
            return None;
        }
        let id = self.ready.pop_front()?;
        let entry = self.operators.get_mut(&id)?;
        entry.status = OperatorStatus::Executing;
        Some(ExecutionTicket {
            operator_id: id,
            payload: entry.assignment.payload.clone(),
            inputs: entry.received.clone(),
        })
    }

    pub fn has_ready(&self) -> bool {
        self.phase == RunPhase::Running && !self.ready.is_empty()
    }

    /// Mark an executing operator Done and resolve where its result goes
    pub fn complete(&mut self, id: &OperatorId, payload: Payload) -> Result<Completion> {
        let entry = self
            .operators
            .get_mut(id)
            .ok_or_else(|| DagwireError::UnassignedOperator {
                operator: id.clone(),
            })?;
        if entry.status != OperatorStatus::Executing {
            return Err(DagwireError::internal(format!(
                "operator '{}' completed while {:?}",
                id, entry.status
            )));
        }
        entry.status = OperatorStatus::Done;
        self.completed.push(id.clone());

        let mut targets: Vec<WorkerAddress> = Vec::new();
        let mut unrouted = Vec::new();
        for downstream in &entry.assignment.downstream {
            match self.routing.get(downstream) {
                Some(owner) if !targets.contains(owner) => targets.push(owner.clone()),
                Some(_) => {}
                None => unrouted.push(downstream.clone()),
            }
        }

        Ok(Completion {
            result: ExecutionResult {
                operator_id: id.clone(),
                worker: self.address.clone(),
                payload,
            },
            targets,
            unrouted,
        })
    }

    pub fn fail(&mut self, id: &OperatorId) -> Result<()> {
        let entry = self
            .operators
            .get_mut(id)
            .ok_or_else(|| DagwireError::UnassignedOperator {
                operator: id.clone(),
            })?;
        entry.status = OperatorStatus::Failed;
        Ok(())
    }

    /// Stop at the operator boundary; returns what completed so far
    pub fn abort(&mut self) -> Vec<OperatorId> {
        self.phase = RunPhase::Aborted;
        self.ready.clear();
        self.completed.clone()
    }

    /// Started and every local operator is Done
    pub fn all_done(&self) -> bool {
        self.phase == RunPhase::Running
            && self
                .operators
                .values()
                .all(|entry| entry.status == OperatorStatus::Done)
    }

    pub fn completed(&self) -> &[OperatorId] {
        &self.completed
    }

    pub fn route(&self, id: &OperatorId) -> Option<&WorkerAddress> {
        self.routing.get(id)
    }

    pub fn snapshot(&self) -> WorkerSnapshot {
        WorkerSnapshot {
            address: self.address.clone(),
            run_id: self.run_id,
            phase: self.phase,
            operators: self
                .operators
                .iter()
                .map(|(id, entry)| {
                    (
                        id.clone(),
                        OperatorSnapshot {
                            status: entry.status,
                            received: entry.received.len(),
                            required: entry.required.len(),
                        },
                    )
                })
                .collect(),
            routes: self.routing.len(),
            completed: self.completed.clone(),
            pending_deliveries: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn ids(list: &[&str]) -> Vec<OperatorId> {
        list.iter().map(|id| OperatorId::from(*id)).collect()
    }

    fn assignment(id: &str, worker: &str, upstream: &[&str], downstream: &[&str]) -> Assignment {
        Assignment {
            operator_id: OperatorId::from(id),
            worker: WorkerAddress::from(worker),
            upstream: ids(upstream),
            downstream: ids(downstream),
            payload: json!({"op": id}),
        }
    }

    fn result(id: &str, worker: &str) -> ExecutionResult {
        ExecutionResult {
            operator_id: OperatorId::from(id),
            worker: WorkerAddress::from(worker),
            payload: json!(id),
        }
    }

    fn bound(address: &str) -> WorkerState {
        let mut state = WorkerState::new(WorkerAddress::from(address));
        state.bind_run(RunId::new()).unwrap();
        state
    }

    #[test]
    fn test_single_source_operator() {
        let mut state = bound("w0");
        assert!(state.assign(assignment("a", "w0", &[], &[])).unwrap().is_empty());
        assert_eq!(state.snapshot().status_of("a"), Some(OperatorStatus::Assigned));

        assert_eq!(state.start(), ids(&["a"]));
        let ticket = state.next_ready().unwrap();
        assert_eq!(ticket.operator_id.as_str(), "a");
        assert!(ticket.inputs.is_empty());

        let completion = state.complete(&ticket.operator_id, json!(1)).unwrap();
        assert!(completion.targets.is_empty());
        assert!(completion.unrouted.is_empty());
        assert!(state.all_done());
    }

    #[test]
    fn test_fan_in_waits_for_both_inputs() {
        let mut state = bound("w2");
        state.assign(assignment("a", "w0", &[], &["c"])).unwrap();
        state.assign(assignment("b", "w1", &[], &["c"])).unwrap();
        state.assign(assignment("c", "w2", &["a", "b"], &[])).unwrap();
        assert!(state.start().is_empty());

        assert!(state.record_result(&result("a", "w0")).unwrap().is_empty());
        let snapshot = state.snapshot();
        assert_eq!(snapshot.status_of("c"), Some(OperatorStatus::Assigned));
        assert_eq!(snapshot.operators[&OperatorId::from("c")].received, 1);

        assert_eq!(state.record_result(&result("b", "w1")).unwrap(), ids(&["c"]));
        let ticket = state.next_ready().unwrap();
        assert_eq!(ticket.inputs.len(), 2);
        assert_eq!(ticket.inputs[&OperatorId::from("b")], json!("b"));
    }

    #[test]
    fn test_duplicate_result_is_not_counted() {
        let mut state = bound("w2");
        state.assign(assignment("a", "w0", &[], &["c"])).unwrap();
        state.assign(assignment("b", "w1", &[], &["c"])).unwrap();
        state.assign(assignment("c", "w2", &["a", "b"], &[])).unwrap();
        state.start();

        state.record_result(&result("a", "w0")).unwrap();
        let err = state.record_result(&result("a", "w0")).unwrap_err();
        assert!(matches!(err, DagwireError::DuplicateResult { .. }));
        assert_eq!(state.snapshot().operators[&OperatorId::from("c")].received, 1);
        assert_eq!(state.snapshot().status_of("c"), Some(OperatorStatus::Assigned));
    }

    #[test]
    fn test_result_before_start_is_kept() {
        let mut state = bound("w1");
        state.assign(assignment("a", "w0", &[], &["b"])).unwrap();
        state.assign(assignment("b", "w1", &["a"], &[])).unwrap();

        // the upstream worker may start and finish before our Start arrives
        assert!(state.record_result(&result("a", "w0")).unwrap().is_empty());
        assert_eq!(state.snapshot().status_of("b"), Some(OperatorStatus::Assigned));
        assert_eq!(state.start(), ids(&["b"]));
    }

    #[test]
    fn test_late_source_assignment_becomes_ready() {
        let mut state = bound("w0");
        state.start();
        assert_eq!(state.assign(assignment("a", "w0", &[], &[])).unwrap(), ids(&["a"]));
    }

    #[test]
    fn test_ready_exactly_once() {
        let mut state = bound("w0");
        state.assign(assignment("a", "w0", &[], &[])).unwrap();
        assert_eq!(state.start(), ids(&["a"]));
        assert!(state.start().is_empty());
        state.next_ready().unwrap();
        assert!(state.next_ready().is_none());
    }

    #[test]
    fn test_unconsumed_result_is_unassigned() {
        let mut state = bound("w0");
        state.assign(assignment("a", "w0", &[], &[])).unwrap();
        state.start();
        let err = state.record_result(&result("zzz", "w9")).unwrap_err();
        assert!(matches!(err, DagwireError::UnassignedOperator { .. }));
    }

    #[test]
    fn test_completion_targets_are_distinct_workers() {
        let mut state = bound("w0");
        state.assign(assignment("a", "w0", &[], &["b", "c", "d"])).unwrap();
        state.assign(assignment("b", "w1", &["a"], &[])).unwrap();
        state.assign(assignment("c", "w1", &["a"], &[])).unwrap();
        state.start();
        let ticket = state.next_ready().unwrap();
        let completion = state.complete(&ticket.operator_id, json!(null)).unwrap();
        assert_eq!(completion.targets, vec![WorkerAddress::from("w1")]);
        // d was never assigned anywhere
        assert_eq!(completion.unrouted, ids(&["d"]));
    }

    #[test]
    fn test_routing_is_write_once() {
        let mut state = bound("w0");
        state.assign(assignment("a", "w1", &[], &[])).unwrap();
        // same entry again is fine
        state.assign(assignment("a", "w1", &[], &[])).unwrap();
        let err = state.assign(assignment("a", "w2", &[], &[])).unwrap_err();
        assert!(matches!(err, DagwireError::MalformedMessage { .. }));
        assert_eq!(state.route(&OperatorId::from("a")), Some(&WorkerAddress::from("w1")));
    }

    #[test]
    fn test_self_dependency_is_malformed() {
        let mut state = bound("w0");
        let err = state.assign(assignment("a", "w0", &["a"], &[])).unwrap_err();
        assert!(matches!(err, DagwireError::MalformedMessage { .. }));
    }

    #[test]
    fn test_stale_run_rejected_while_running() {
        let mut state = WorkerState::new(WorkerAddress::from("w0"));
        let first = RunId::new();
        state.bind_run(first).unwrap();
        state.assign(assignment("a", "w0", &[], &[])).unwrap();
        state.start();

        let second = RunId::new();
        assert!(matches!(
            state.bind_run(second),
            Err(DagwireError::StaleRun { .. })
        ));
        assert!(state.check_run(second).is_err());
        assert!(state.check_run(first).is_ok());

        // once the local work is done, a new run may replace it
        let ticket = state.next_ready().unwrap();
        state.complete(&ticket.operator_id, json!(null)).unwrap();
        assert!(state.bind_run(second).unwrap());
        assert_eq!(state.phase(), RunPhase::Assigning);
        assert!(state.snapshot().operators.is_empty());
    }

    #[test]
    fn test_abort_stops_scheduling() {
        let mut state = bound("w0");
        state.assign(assignment("a", "w0", &[], &[])).unwrap();
        state.assign(assignment("b", "w0", &[], &[])).unwrap();
        state.start();
        let ticket = state.next_ready().unwrap();
        state.complete(&ticket.operator_id, json!(null)).unwrap();

        assert_eq!(state.abort(), ids(&["a"]));
        assert!(state.next_ready().is_none());
        assert!(!state.all_done());
        assert_eq!(state.phase(), RunPhase::Aborted);
    }
}
