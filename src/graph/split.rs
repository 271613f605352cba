//! Series-parallel decomposition

use std::collections::BTreeSet;

use petgraph::unionfind::UnionFind;
use rustc_hash::FxHashMap;

use super::{Edge, Graph, Node};
use crate::error::{Result, SearchError};

/// Result of removing the two endpoints of a subgraph
#[derive(Debug)]
pub struct Branches {
    /// One subgraph per connected component, each including both endpoints
    pub branches: Vec<Graph>,
    /// Edges running straight from source to sink
    pub direct: Vec<Edge>,
}

impl Graph {
    /// Finds a node that every source-to-sink path passes through.
    ///
    /// Walks the topological order and keeps the furthest position any edge
    /// seen so far reaches; a node no earlier edge jumps over is a
    /// bottleneck. Among several, the one closest to the middle is chosen
    /// so both halves shrink.
    pub fn find_bottleneck(&self, source: &Node, sink: &Node) -> Result<Option<Node>> {
        let order = self.topo_order()?;
        let position: FxHashMap<&Node, usize> =
            order.iter().enumerate().map(|(i, n)| (n, i)).collect();

        let mut reach = 0;
        let mut candidates = Vec::new();
        for (i, node) in order.iter().enumerate() {
            if i > 0 && reach <= i && node != source && node != sink {
                candidates.push(i);
            }
            for edge in self.out_edges(node) {
                reach = reach.max(position[&edge.dst]);
            }
        }

        let middle = order.len() / 2;
        Ok(candidates
            .into_iter()
            .min_by_key(|&i| (i.abs_diff(middle), i))
            .map(|i| order[i].clone()))
    }

    /// Splits at a bottleneck into the part up to and including it and the
    /// part from it onward.
    pub fn split_at_node(&self, bottleneck: &Node) -> Result<(Graph, Graph)> {
        let order = self.topo_order()?;
        let at = order
            .iter()
            .position(|n| n == bottleneck)
            .ok_or(SearchError::MissingNode(bottleneck.guid))?;
        let first: BTreeSet<Node> = order[..=at].iter().cloned().collect();
        let second: BTreeSet<Node> = order[at..].iter().cloned().collect();
        Ok((self.subgraph(&first), self.subgraph(&second)))
    }

    /// Separates the nodes strictly between `source` and `sink` into
    /// independent branches.
    pub fn split_branches(&self, source: &Node, sink: &Node) -> Branches {
        let inner: Vec<&Node> = self
            .nodes()
            .filter(|n| *n != source && *n != sink)
            .collect();
        let index: FxHashMap<&Node, usize> =
            inner.iter().enumerate().map(|(i, n)| (*n, i)).collect();

        let mut components = UnionFind::new(inner.len());
        let mut direct = Vec::new();
        for edge in self.edges() {
            match (index.get(&edge.src), index.get(&edge.dst)) {
                (Some(&a), Some(&b)) => {
                    components.union(a, b);
                }
                (None, None) if edge.src == *source && edge.dst == *sink => {
                    direct.push(edge.clone())
                }
                _ => {}
            }
        }

        let mut groups: Vec<BTreeSet<Node>> = Vec::new();
        let mut group_of: FxHashMap<usize, usize> = FxHashMap::default();
        for (i, node) in inner.iter().enumerate() {
            let root = components.find(i);
            let g = *group_of.entry(root).or_insert_with(|| {
                groups.push(BTreeSet::from([source.clone(), sink.clone()]));
                groups.len() - 1
            });
            groups[g].insert((*node).clone());
        }

        let branches = groups
            .iter()
            .map(|nodes| {
                let mut branch = self.subgraph(nodes);
                for edge in &direct {
                    branch.remove_edge(edge);
                }
                branch
            })
            .collect();
        Branches { branches, direct }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperatorRegistry;
    use crate::machine::MachineResource;
    use crate::ops::{BinaryOp, DataType, ParallelTensorShape, UnaryOp};

    fn shape() -> ParallelTensorShape {
        ParallelTensorShape::new(&[8, 8], DataType::F32)
    }

    /// x -> a -> b -> c
    fn chain(reg: &OperatorRegistry) -> (Graph, Vec<Node>) {
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let c = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&a, 0, &b, 0);
        g.add_edge(&b, 0, &c, 0);
        (g, vec![x, a, b, c])
    }

    /// x -> {a, b} -> add
    fn diamond(reg: &OperatorRegistry) -> (Graph, Vec<Node>) {
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Tanh).unwrap();
        let add = reg.element_binary(&shape(), &shape(), BinaryOp::Add).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&x, 0, &b, 0);
        g.add_edge(&a, 0, &add, 0);
        g.add_edge(&b, 0, &add, 1);
        (g, vec![x, a, b, add])
    }

    #[test]
    fn test_chain_bottleneck() {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 2, 0));
        let (g, n) = chain(&reg);
        let m = g.find_bottleneck(&n[0], &n[3]).unwrap().unwrap();
        assert_eq!(m, n[2]);

        let (first, second) = g.split_at_node(&m).unwrap();
        assert_eq!(first.num_nodes(), 3);
        assert_eq!(second.num_nodes(), 2);
        assert_eq!(first.num_edges() + second.num_edges(), g.num_edges());
    }

    #[test]
    fn test_diamond_has_no_bottleneck() {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 2, 0));
        let (g, n) = diamond(&reg);
        assert!(g.find_bottleneck(&n[0], &n[3]).unwrap().is_none());

        let split = g.split_branches(&n[0], &n[3]);
        assert_eq!(split.branches.len(), 2);
        assert!(split.direct.is_empty());
        for branch in &split.branches {
            assert_eq!(branch.num_nodes(), 3);
            assert_eq!(branch.num_edges(), 2);
        }
    }

    #[test]
    fn test_direct_edges_are_separated() {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 2, 0));
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let add = reg.element_binary(&shape(), &shape(), BinaryOp::Add).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&a, 0, &add, 0);
        g.add_edge(&x, 0, &add, 1);

        assert!(g.find_bottleneck(&x, &add).unwrap().is_none());
        let split = g.split_branches(&x, &add);
        assert_eq!(split.branches.len(), 1);
        assert_eq!(split.direct.len(), 1);
        assert_eq!(split.branches[0].num_edges(), 2);
    }
}
