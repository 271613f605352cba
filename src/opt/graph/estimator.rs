//! Static ordering heuristic for rewrite candidates

use super::GraphCostEstimator;
use crate::graph::Graph;

/// Scores a graph by the bytes its data-movement operators shuffle plus a
/// fixed charge per node.
///
/// The score never looks at views, so it is cheap enough to compute for
/// every suggestion. Lower is better.
#[derive(Clone, Debug)]
pub struct StaticCostEstimator {
    /// Cost per byte moved by a parallel operator
    pub byte_weight: f32,
    /// Cost per node
    pub node_penalty: f32,
}

impl Default for StaticCostEstimator {
    fn default() -> Self {
        Self {
            byte_weight: 1e-6,
            node_penalty: 1.0,
        }
    }
}

impl StaticCostEstimator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_node_penalty(mut self, penalty: f32) -> Self {
        self.node_penalty = penalty;
        self
    }
}

impl GraphCostEstimator for StaticCostEstimator {
    fn estimate(&self, graph: &Graph) -> f32 {
        let moved: usize = graph
            .nodes()
            .filter(|n| n.op.is_parallel_op())
            .filter_map(|n| n.op.output_shapes().first())
            .map(|s| s.size_in_bytes())
            .sum();
        moved as f32 * self.byte_weight + graph.num_nodes() as f32 * self.node_penalty
    }
}
