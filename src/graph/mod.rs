//! Operator DAG supplied by the graph provider
//!
//! Operators keep their insertion order, which is the traversal order used
//! for placement. Edges are checked on insertion so the graph is always
//! acyclic.

pub mod definition;

pub use definition::{LinkSpec, OperatorSpec, WorkflowDefinition};

use petgraph::algo::{has_path_connecting, toposort};
use petgraph::graph::{DiGraph, NodeIndex};
use std::collections::{BTreeSet, HashMap};

use crate::coord::types::{OperatorId, Payload};
use crate::core::errors::{DagwireError, Result};

/// One operator with its direct neighbours
#[derive(Debug, Clone, PartialEq)]
pub struct OperatorNode {
    pub id: OperatorId,
    pub upstream: BTreeSet<OperatorId>,
    pub downstream: BTreeSet<OperatorId>,
    pub payload: Payload,
}

#[derive(Debug, Clone, Default)]
pub struct OperatorGraph {
    graph: DiGraph<OperatorId, ()>,
    indices: HashMap<OperatorId, NodeIndex>,
    nodes: Vec<OperatorNode>,
}

impl OperatorGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build and validate a graph from its serialized definition
    pub fn from_definition(definition: &WorkflowDefinition) -> Result<Self> {
        let mut graph = Self::new();
        for spec in &definition.operators {
            graph.add_operator(spec.id.clone(), spec.payload.clone())?;
        }
        for link in &definition.links {
            graph.add_edge(&link.source, &link.target)?;
        }
        Ok(graph)
    }

    pub fn to_definition(&self) -> WorkflowDefinition {
        let mut links = Vec::new();
        for node in &self.nodes {
            for target in &node.downstream {
                links.push(LinkSpec {
                    source: node.id.clone(),
                    target: target.clone(),
                });
            }
        }
        WorkflowDefinition {
            name: None,
            operators: self
                .nodes
                .iter()
                .map(|node| OperatorSpec {
                    id: node.id.clone(),
                    payload: node.payload.clone(),
                })
                .collect(),
            links,
        }
    }

    pub fn add_operator(&mut self, id: impl Into<OperatorId>, payload: Payload) -> Result<()> {
        let id = id.into();
        if id.as_str().is_empty() {
            return Err(DagwireError::invalid_graph("operator id must not be empty"));
        }
        if self.indices.contains_key(&id) {
            return Err(DagwireError::invalid_graph(format!(
                "duplicate operator id '{}'",
                id
            )));
        }
        let index = self.graph.add_node(id.clone());
        self.indices.insert(id.clone(), index);
        self.nodes.push(OperatorNode {
            id,
            upstream: BTreeSet::new(),
            downstream: BTreeSet::new(),
            payload,
        });
        Ok(())
    }

    /// Add a dependency edge; `source` must finish before `target` runs
    pub fn add_edge(&mut self, source: &OperatorId, target: &OperatorId) -> Result<()> {
        let from = self.index_of(source)?;
        let to = self.index_of(target)?;
        if from == to {
            return Err(DagwireError::invalid_graph(format!(
                "operator '{}' cannot depend on itself",
                source
            )));
        }
        if has_path_connecting(&self.graph, to, from, None) {
            return Err(DagwireError::invalid_graph(format!(
                "link {} -> {} would create a cycle",
                source, target
            )));
        }
        self.graph.update_edge(from, to, ());
        let from_pos = self.position(source)?;
        self.nodes[from_pos].downstream.insert(target.clone());
        let to_pos = self.position(target)?;
        self.nodes[to_pos].upstream.insert(source.clone());
        Ok(())
    }

    fn index_of(&self, id: &OperatorId) -> Result<NodeIndex> {
        self.indices
            .get(id)
            .copied()
            .ok_or_else(|| DagwireError::invalid_graph(format!("unknown operator '{}'", id)))
    }

    fn position(&self, id: &OperatorId) -> Result<usize> {
        // NodeIndex values follow insertion order because nodes are never removed
        let index = self.index_of(id)?;
        Ok(index.index())
    }

    /// Operators in insertion order
    pub fn operators(&self) -> impl Iterator<Item = &OperatorNode> {
        self.nodes.iter()
    }

    pub fn get(&self, id: &OperatorId) -> Option<&OperatorNode> {
        self.indices.get(id).map(|index| &self.nodes[index.index()])
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    /// Operators without upstream dependencies
    pub fn sources(&self) -> Vec<OperatorId> {
        self.nodes
            .iter()
            .filter(|node| node.upstream.is_empty())
            .map(|node| node.id.clone())
            .collect()
    }

    /// A topological order of all operators
    pub fn topological_order(&self) -> Result<Vec<OperatorId>> {
        let order = toposort(&self.graph, None).map_err(|cycle| {
            DagwireError::invalid_graph(format!(
                "cycle through operator '{}'",
                self.graph[cycle.node_id()]
            ))
        })?;
        Ok(order.into_iter().map(|index| self.graph[index].clone()).collect())
    }
}
