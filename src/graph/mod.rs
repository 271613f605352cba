//! Parallel computation graph
//!
//! A [`Graph`] is a DAG of [`Node`]s connected by tensor [`Edge`]s. Graphs
//! are cheap values: rewrites clone and modify a graph instead of mutating
//! the one being searched, so earlier variants stay queryable.

use std::collections::{BTreeMap, BTreeSet};
use std::hash::{Hash, Hasher};

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};
use rustc_hash::{FxHashMap, FxHasher};

use crate::error::{Result, SearchError};
use crate::ops::ParallelTensorShape;

mod node;
pub mod registry;
mod split;

pub use node::{Edge, Node, CONTROL_SLOT};
pub use registry::OperatorRegistry;
pub use split::Branches;

#[derive(Clone, Debug, Default)]
pub struct Graph {
    in_edges: BTreeMap<Node, BTreeSet<Edge>>,
    out_edges: BTreeMap<Node, BTreeSet<Edge>>,
}

impl Graph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, node: &Node) {
        self.in_edges.entry(node.clone()).or_default();
        self.out_edges.entry(node.clone()).or_default();
    }

    /// Connects output `src_idx` of `src` to input `dst_idx` of `dst`,
    /// adding either node if needed.
    pub fn add_edge(&mut self, src: &Node, src_idx: usize, dst: &Node, dst_idx: usize) {
        self.insert_edge(Edge::new(src.clone(), src_idx, dst.clone(), dst_idx));
    }

    /// Orders `dst` after `src` without moving a tensor
    pub fn add_control_edge(&mut self, src: &Node, dst: &Node) {
        self.insert_edge(Edge::control(src.clone(), dst.clone()));
    }

    pub fn insert_edge(&mut self, edge: Edge) {
        self.add_node(&edge.src);
        self.add_node(&edge.dst);
        self.out_edges
            .entry(edge.src.clone())
            .or_default()
            .insert(edge.clone());
        self.in_edges.entry(edge.dst.clone()).or_default().insert(edge);
    }

    pub fn remove_edge(&mut self, edge: &Edge) {
        if let Some(edges) = self.out_edges.get_mut(&edge.src) {
            edges.remove(edge);
        }
        if let Some(edges) = self.in_edges.get_mut(&edge.dst) {
            edges.remove(edge);
        }
    }

    /// Removes a node and every edge touching it
    pub fn remove_node(&mut self, node: &Node) {
        let incident: Vec<Edge> = self
            .in_edges(node)
            .chain(self.out_edges(node))
            .cloned()
            .collect();
        for edge in &incident {
            self.remove_edge(edge);
        }
        self.in_edges.remove(node);
        self.out_edges.remove(node);
    }

    pub fn contains(&self, node: &Node) -> bool {
        self.in_edges.contains_key(node)
    }

    /// Nodes in guid order
    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.in_edges.keys()
    }

    pub fn num_nodes(&self) -> usize {
        self.in_edges.len()
    }

    pub fn num_edges(&self) -> usize {
        self.out_edges.values().map(|e| e.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.in_edges.is_empty()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.out_edges.values().flatten()
    }

    pub fn in_edges<'a>(&'a self, node: &Node) -> impl Iterator<Item = &'a Edge> {
        self.in_edges.get(node).into_iter().flatten()
    }

    pub fn out_edges<'a>(&'a self, node: &Node) -> impl Iterator<Item = &'a Edge> {
        self.out_edges.get(node).into_iter().flatten()
    }

    pub fn in_degree(&self, node: &Node) -> usize {
        self.in_edges.get(node).map_or(0, |e| e.len())
    }

    pub fn out_degree(&self, node: &Node) -> usize {
        self.out_edges.get(node).map_or(0, |e| e.len())
    }

    /// Distinct producers of `node`'s inputs
    pub fn predecessors(&self, node: &Node) -> BTreeSet<Node> {
        self.in_edges(node).map(|e| e.src.clone()).collect()
    }

    /// Distinct consumers of `node`'s outputs
    pub fn successors(&self, node: &Node) -> BTreeSet<Node> {
        self.out_edges(node).map(|e| e.dst.clone()).collect()
    }

    pub fn find_by_guid(&self, guid: u64) -> Option<&Node> {
        self.in_edges.keys().find(|n| n.guid == guid)
    }

    /// Nodes without inputs
    pub fn sources(&self) -> Vec<Node> {
        self.in_edges
            .iter()
            .filter(|(_, e)| e.is_empty())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Nodes without consumers
    pub fn sinks(&self) -> Vec<Node> {
        self.out_edges
            .iter()
            .filter(|(_, e)| e.is_empty())
            .map(|(n, _)| n.clone())
            .collect()
    }

    /// Shape of the tensor an edge carries; `None` for control edges
    pub fn edge_shape<'a>(&self, edge: &'a Edge) -> Option<&'a ParallelTensorShape> {
        if edge.is_control() {
            return None;
        }
        edge.dst.op.input_shapes().get(edge.dst_idx)
    }

    fn to_petgraph(&self) -> (DiGraph<Node, ()>, FxHashMap<Node, NodeIndex>) {
        let mut pg = DiGraph::with_capacity(self.num_nodes(), self.num_edges());
        let mut index = FxHashMap::default();
        for node in self.nodes() {
            index.insert(node.clone(), pg.add_node(node.clone()));
        }
        for edge in self.edges() {
            pg.add_edge(index[&edge.src], index[&edge.dst], ());
        }
        (pg, index)
    }

    /// Nodes in dependency order
    pub fn topo_order(&self) -> Result<Vec<Node>> {
        let (pg, _) = self.to_petgraph();
        toposort(&pg, None)
            .map(|order| order.into_iter().map(|i| pg[i].clone()).collect())
            .map_err(|cycle| SearchError::Cyclic(pg[cycle.node_id()].guid))
    }

    /// Identity hash of this exact graph: node ids and edges.
    ///
    /// Two graphs hash equal only if they contain the same placements wired
    /// the same way, which makes it safe as part of a memo key.
    pub fn hash(&self) -> u64 {
        let mut hasher = FxHasher::default();
        self.num_nodes().hash(&mut hasher);
        for node in self.nodes() {
            node.guid.hash(&mut hasher);
        }
        for edge in self.edges() {
            (edge.src.guid, edge.src_idx, edge.dst.guid, edge.dst_idx).hash(&mut hasher);
        }
        hasher.finish()
    }

    /// Hash of the graph's shape that ignores node ids.
    ///
    /// Each node is labelled with its canonical operator and the labels of
    /// its producers; the graph hash is taken over the sorted labels. Two
    /// rewrites that arrive at the same structure through different steps
    /// hash equal.
    pub fn structural_hash(&self) -> Result<u64> {
        let mut labels: FxHashMap<Node, u64> = FxHashMap::default();
        for node in self.topo_order()? {
            let mut inputs: Vec<(usize, usize, u64)> = self
                .in_edges(&node)
                .map(|e| (e.dst_idx, e.src_idx, labels[&e.src]))
                .collect();
            inputs.sort_unstable();
            let mut hasher = FxHasher::default();
            node.op.handle().hash(&mut hasher);
            inputs.hash(&mut hasher);
            labels.insert(node, hasher.finish());
        }
        let mut all: Vec<u64> = labels.into_values().collect();
        all.sort_unstable();
        let mut hasher = FxHasher::default();
        all.hash(&mut hasher);
        Ok(hasher.finish())
    }

    /// The subgraph induced by `nodes`: those nodes and every edge between them
    pub fn subgraph(&self, nodes: &BTreeSet<Node>) -> Graph {
        let mut sub = Graph::new();
        for node in nodes {
            sub.add_node(node);
            for edge in self.out_edges(node) {
                if nodes.contains(&edge.dst) {
                    sub.insert_edge(edge.clone());
                }
            }
        }
        sub
    }

    /// Checks that the graph is acyclic and that every data edge connects
    /// matching shapes, with each input slot fed exactly once.
    pub fn check_correctness(&self) -> Result<()> {
        self.topo_order()?;
        for node in self.nodes() {
            let expected = node.op.input_shapes();
            let mut fed = vec![false; expected.len()];
            for edge in self.in_edges(node).filter(|e| !e.is_control()) {
                let Some(want) = expected.get(edge.dst_idx) else {
                    return Err(SearchError::MalformedGraph(format!(
                        "{} has no input slot {}",
                        node, edge.dst_idx
                    )));
                };
                let Some(have) = edge.src.op.output_shapes().get(edge.src_idx) else {
                    return Err(SearchError::MalformedGraph(format!(
                        "{} has no output slot {}",
                        edge.src, edge.src_idx
                    )));
                };
                if have != want {
                    return Err(SearchError::MalformedGraph(format!(
                        "{} -> {}: shape {} does not match {}",
                        edge.src, node, have, want
                    )));
                }
                if std::mem::replace(&mut fed[edge.dst_idx], true) {
                    return Err(SearchError::MalformedGraph(format!(
                        "input slot {} of {} is fed twice",
                        edge.dst_idx, node
                    )));
                }
            }
            if let Some(slot) = fed.iter().position(|f| !f) {
                return Err(SearchError::MalformedGraph(format!(
                    "input slot {} of {} is not fed",
                    slot, node
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineResource;
    use crate::ops::{BinaryOp, DataType, UnaryOp};

    fn registry() -> OperatorRegistry {
        OperatorRegistry::new(&MachineResource::new(1, 4, 1))
    }

    fn shape() -> ParallelTensorShape {
        ParallelTensorShape::new(&[16, 16], DataType::F32)
    }

    #[test]
    fn test_topo_order_and_endpoints() {
        let reg = registry();
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Tanh).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&a, 0, &b, 0);

        assert_eq!(g.topo_order().unwrap(), vec![x.clone(), a.clone(), b.clone()]);
        assert_eq!(g.sources(), vec![x]);
        assert_eq!(g.sinks(), vec![b]);
        assert!(g.check_correctness().is_ok());
    }

    #[test]
    fn test_cycle_is_reported() {
        let reg = registry();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let mut g = Graph::new();
        g.add_edge(&a, 0, &b, 0);
        g.add_edge(&b, 0, &a, 0);
        assert!(matches!(g.topo_order(), Err(SearchError::Cyclic(_))));
    }

    #[test]
    fn test_multi_edges_between_same_pair() {
        let reg = registry();
        let x = reg.input(&shape()).unwrap();
        let add = reg.element_binary(&shape(), &shape(), BinaryOp::Add).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &add, 0);
        g.add_edge(&x, 0, &add, 1);
        assert_eq!(g.num_edges(), 2);
        assert_eq!(g.successors(&x).len(), 1);
        assert!(g.check_correctness().is_ok());
    }

    #[test]
    fn test_unfed_slot_is_malformed() {
        let reg = registry();
        let x = reg.input(&shape()).unwrap();
        let add = reg.element_binary(&shape(), &shape(), BinaryOp::Add).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &add, 0);
        assert!(matches!(
            g.check_correctness(),
            Err(SearchError::MalformedGraph(_))
        ));
    }

    #[test]
    fn test_structural_hash_ignores_guids() {
        let reg = registry();
        let build = || {
            let x = reg.input(&shape()).unwrap();
            let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
            let mut g = Graph::new();
            g.add_edge(&x, 0, &a, 0);
            g
        };
        let (g1, g2) = (build(), build());
        assert_ne!(g1.hash(), g2.hash());
        assert_eq!(g1.structural_hash().unwrap(), g2.structural_hash().unwrap());
    }

    #[test]
    fn test_remove_node_drops_edges() {
        let reg = registry();
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.remove_node(&a);
        assert_eq!(g.num_nodes(), 1);
        assert_eq!(g.num_edges(), 0);
        assert_eq!(g.out_degree(&x), 0);
    }
}
