//! Device placement plans and their serialization

use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};

use rustc_hash::FxHasher;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SearchError};
use crate::graph::{Graph, Node};
use crate::machine::{MachineView, ParallelConfig};
use crate::ops::{Operator, OperatorKind};

/// Identifies a node of a graph independently of its process-local id.
///
/// `position` follows [`Graph::topo_order`], where the relative order of
/// independent nodes depends on the order they were created in. A graph
/// rebuilt with the same operators created in another order may not match.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NodeSignature {
    /// Index in the graph's topological order
    pub position: usize,
    pub kind: OperatorKind,
    /// Hash of the operator's parameters and input shapes
    pub fingerprint: u64,
}

impl fmt::Display for NodeSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:016x})", self.kind, self.fingerprint)
    }
}

impl NodeSignature {
    fn of(position: usize, op: &Operator) -> Self {
        let mut hasher = FxHasher::default();
        op.params().hash(&mut hasher);
        op.input_shapes().hash(&mut hasher);
        Self {
            position,
            kind: op.kind(),
            fingerprint: hasher.finish(),
        }
    }
}

/// A chosen graph together with the view of each of its nodes
#[derive(Clone, Debug)]
pub struct Plan {
    graph: Graph,
    views: BTreeMap<Node, MachineView>,
    cost: f32,
}

impl Plan {
    pub fn new(graph: Graph, views: BTreeMap<Node, MachineView>, cost: f32) -> Self {
        Self { graph, views, cost }
    }

    pub fn graph(&self) -> &Graph {
        &self.graph
    }

    pub fn views(&self) -> &BTreeMap<Node, MachineView> {
        &self.views
    }

    pub fn view_of(&self, node: &Node) -> Option<&MachineView> {
        self.views.get(node)
    }

    /// Estimated execution time of the plan
    pub fn cost(&self) -> f32 {
        self.cost
    }

    /// The plan in legacy per-operator form; each view partitions the first
    /// split dimension of the operator's output.
    pub fn parallel_configs(&self) -> BTreeMap<Node, ParallelConfig> {
        self.views
            .iter()
            .map(|(node, view)| {
                let shape = node.op.output_shapes().first();
                let ndims = shape.map_or(1, |s| s.num_dims());
                let dim = shape
                    .and_then(|s| s.dims().iter().position(|d| d.degree > 1))
                    .unwrap_or(0);
                (node.clone(), ParallelConfig::from_machine_view(view, ndims, dim))
            })
            .collect()
    }

    /// Serializes the views as an ordered list of (signature, view) pairs
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut entries = Vec::with_capacity(self.views.len());
        for (position, node) in self.graph.topo_order()?.iter().enumerate() {
            let view = self.views.get(node).ok_or_else(|| {
                SearchError::PlanMismatch(format!("{} has no view", node))
            })?;
            entries.push((NodeSignature::of(position, &node.op), view.clone()));
        }
        let saved = SavedPlan {
            cost: self.cost,
            entries,
        };
        Ok(serde_json::to_vec(&saved)?)
    }

    /// Loads a plan saved by [`Plan::to_bytes`] and attaches it to `graph`
    pub fn from_bytes(bytes: &[u8], graph: &Graph) -> Result<Plan> {
        SavedPlan::from_bytes(bytes)?.bind(graph)
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "plan (cost {:.4}):", self.cost)?;
        for (node, view) in &self.views {
            writeln!(f, "  {} -> {}", node, view)?;
        }
        Ok(())
    }
}

/// A plan detached from any graph
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SavedPlan {
    pub cost: f32,
    pub entries: Vec<(NodeSignature, MachineView)>,
}

impl SavedPlan {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Matches the saved entries against `graph` node by node, in
    /// topological order.
    pub fn bind(&self, graph: &Graph) -> Result<Plan> {
        let order = graph.topo_order()?;
        if order.len() != self.entries.len() {
            return Err(SearchError::PlanMismatch(format!(
                "plan has {} nodes, graph has {}",
                self.entries.len(),
                order.len()
            )));
        }
        let mut views = BTreeMap::new();
        for (position, (node, (signature, view))) in order.iter().zip(&self.entries).enumerate() {
            let expected = NodeSignature::of(position, &node.op);
            if *signature != expected {
                return Err(SearchError::PlanMismatch(format!(
                    "node {} is {} but the plan expects {}",
                    position, expected, signature
                )));
            }
            views.insert(node.clone(), view.clone());
        }
        Ok(Plan::new(graph.clone(), views, self.cost))
    }
}
