//! Operator placement
//!
//! Placement is a pure function of an operator's position in the graph's
//! traversal order and the size of the worker pool.

use serde::Serialize;
use std::collections::HashMap;

use crate::coord::types::{OperatorId, WorkerAddress};
use crate::core::errors::{DagwireError, Result};
use crate::graph::OperatorGraph;

/// Maps a traversal index to a worker slot
pub trait PlacementPolicy: Send + Sync {
    fn name(&self) -> &str;

    /// Worker slot in `0..worker_count` for the operator at `index`
    fn place(&self, index: usize, worker_count: usize) -> usize;
}

/// Cyclic assignment by index modulo worker count
#[derive(Debug, Clone, Copy, Default)]
pub struct RoundRobin;

impl PlacementPolicy for RoundRobin {
    fn name(&self) -> &str {
        "round_robin"
    }

    fn place(&self, index: usize, worker_count: usize) -> usize {
        index % worker_count
    }
}

/// Operator → worker routing table for one run
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct Placement {
    entries: Vec<(OperatorId, WorkerAddress)>,
    #[serde(skip)]
    lookup: HashMap<OperatorId, usize>,
}

impl Placement {
    /// Compute the placement of every operator in traversal order
    pub fn compute(
        graph: &OperatorGraph,
        workers: &[WorkerAddress],
        policy: &dyn PlacementPolicy,
    ) -> Result<Self> {
        if workers.is_empty() {
            return Err(DagwireError::configuration_field(
                "cannot place operators on an empty worker pool",
                "workers",
            ));
        }
        let mut placement = Placement::default();
        for (index, node) in graph.operators().enumerate() {
            let slot = policy.place(index, workers.len());
            let worker = workers.get(slot).ok_or_else(|| {
                DagwireError::internal(format!(
                    "placement policy '{}' chose slot {} for a pool of {}",
                    policy.name(),
                    slot,
                    workers.len()
                ))
            })?;
            placement.lookup.insert(node.id.clone(), placement.entries.len());
            placement.entries.push((node.id.clone(), worker.clone()));
        }
        Ok(placement)
    }

    pub fn worker_for(&self, operator: &OperatorId) -> Option<&WorkerAddress> {
        self.lookup
            .get(operator)
            .map(|&position| &self.entries[position].1)
    }

    /// Operators placed on `worker`, in traversal order
    pub fn operators_on(&self, worker: &WorkerAddress) -> Vec<OperatorId> {
        self.entries
            .iter()
            .filter(|(_, owner)| owner == worker)
            .map(|(operator, _)| operator.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&OperatorId, &WorkerAddress)> {
        self.entries.iter().map(|(operator, worker)| (operator, worker))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
