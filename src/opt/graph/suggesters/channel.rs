//! Channel parallelism for linear layers

use log::trace;

use crate::graph::{Graph, Node, OperatorRegistry};
use crate::ops::OperatorKind;
use crate::opt::graph::rewrite::{output_shape, wrap_node};
use crate::opt::graph::{GraphSuggester, SuggestResult};

use super::fusion::simplify;
use super::partition::device_limit;

/// Which side of a linear layer's weight is split
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ChannelSplit {
    /// `Replicate` the input; each copy computes a slice of the output
    /// channels and a `Combine` gathers them.
    Output,
    /// `Repartition` the input channel; each part holds partial sums and a
    /// `Reduction` adds them up.
    Input,
}

/// Splits the weight of every linear layer across devices, the two ways
/// that data parallelism cannot express.
pub struct ChannelParallelSuggester {
    max_degree: Option<usize>,
}

impl ChannelParallelSuggester {
    pub fn new() -> Self {
        Self { max_degree: None }
    }

    pub fn with_max_degree(mut self, degree: usize) -> Self {
        self.max_degree = Some(degree);
        self
    }
}

impl Default for ChannelParallelSuggester {
    fn default() -> Self {
        Self::new()
    }
}

/// Rewrites a linear `node` so its channels run `degree` ways, or `None`
/// when the layer cannot be split that way.
pub fn split_channels(
    graph: &Graph,
    registry: &OperatorRegistry,
    node: &Node,
    split: ChannelSplit,
    degree: usize,
) -> Option<Graph> {
    if degree < 2 || !graph.contains(node) || node.op.kind() != OperatorKind::Linear {
        return None;
    }
    let input = node.op.input_shapes().first()?;
    let channel = input.num_data_dims().checked_sub(1)?;

    let pre = match split {
        ChannelSplit::Output => registry.replicate(input, input.replica_dim(), degree),
        ChannelSplit::Input => registry.repartition(input, channel, degree),
    }
    .ok()?;
    let inner = registry
        .get_or_create_node(node.op.params().clone(), &[output_shape(&pre, 0)?.clone()])
        .ok()?;
    let out = output_shape(&inner, 0)?;
    let post = match split {
        ChannelSplit::Output => registry.combine(out, channel, degree),
        ChannelSplit::Input => registry.reduction(out, out.replica_dim(), degree),
    }
    .ok()?;
    if output_shape(&post, 0) != output_shape(node, 0) {
        trace!("{:?} channel split of {} does not map back onto its output", split, node);
        return None;
    }

    wrap_node(graph, node, &[pre], &inner, &post)
}

impl GraphSuggester for ChannelParallelSuggester {
    fn name(&self) -> &'static str {
        "channel_parallel"
    }

    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult> {
        let limit = self
            .max_degree
            .unwrap_or_else(|| device_limit(registry.cluster()));
        let mut results = Vec::new();
        for node in graph.nodes().filter(|n| n.op.kind() == OperatorKind::Linear) {
            let parts = node.op.output_parts();
            for split in [ChannelSplit::Output, ChannelSplit::Input] {
                let mut degree = 2;
                while parts * degree <= limit {
                    if let Some(rewritten) = split_channels(graph, registry, node, split, degree) {
                        let what = match split {
                            ChannelSplit::Output => "output",
                            ChannelSplit::Input => "input",
                        };
                        results.push(SuggestResult::with_description(
                            simplify(&rewritten, registry),
                            self.name(),
                            format!("split {} channels of {} by {}", what, node, degree),
                        ));
                    }
                    degree += 1;
                }
            }
        }
        results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineResource;
    use crate::ops::{DataType, ParallelTensorShape, UnaryOp};

    fn setup(activation: Option<UnaryOp>) -> (OperatorRegistry, Graph, Vec<Node>) {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
        let shape = ParallelTensorShape::new(&[16, 128], DataType::F32);
        let x = reg.input(&shape).unwrap();
        let l = reg.linear(&shape, 256, true, activation).unwrap();
        let y = reg
            .element_unary(&l.op.output_shapes()[0], UnaryOp::Relu)
            .unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &l, 0);
        g.add_edge(&l, 0, &y, 0);
        (reg, g, vec![x, l, y])
    }

    fn kinds(g: &Graph) -> Vec<OperatorKind> {
        g.topo_order().unwrap().iter().map(|n| n.op.kind()).collect()
    }

    fn consumer_shape(g: &Graph, consumer: &Node) -> ParallelTensorShape {
        let edge = g.in_edges(consumer).next().unwrap();
        g.edge_shape(edge).unwrap().clone()
    }

    #[test]
    fn test_output_split_replicates_then_combines() {
        let (reg, g, n) = setup(None);
        let rewritten = split_channels(&g, &reg, &n[1], ChannelSplit::Output, 4).unwrap();
        assert!(rewritten.check_correctness().is_ok());
        assert_eq!(
            kinds(&rewritten),
            vec![
                OperatorKind::Input,
                OperatorKind::Replicate,
                OperatorKind::Linear,
                OperatorKind::Combine,
                OperatorKind::ElementUnary,
            ]
        );
        let inner = rewritten.nodes().find(|m| m.op.kind() == OperatorKind::Linear).unwrap();
        assert_eq!(inner.op.output_parts(), 4);
        assert_eq!(consumer_shape(&rewritten, &n[2]), n[1].op.output_shapes()[0]);
    }

    #[test]
    fn test_input_split_repartitions_then_reduces() {
        let (reg, g, n) = setup(None);
        let rewritten = split_channels(&g, &reg, &n[1], ChannelSplit::Input, 2).unwrap();
        assert!(rewritten.check_correctness().is_ok());
        assert_eq!(
            kinds(&rewritten),
            vec![
                OperatorKind::Input,
                OperatorKind::Repartition,
                OperatorKind::Linear,
                OperatorKind::Reduction,
                OperatorKind::ElementUnary,
            ]
        );
        assert_eq!(consumer_shape(&rewritten, &n[2]), n[1].op.output_shapes()[0]);
    }

    #[test]
    fn test_activation_blocks_partial_sums_only() {
        let (reg, g, n) = setup(Some(UnaryOp::Relu));
        assert!(split_channels(&g, &reg, &n[1], ChannelSplit::Input, 2).is_none());
        assert!(split_channels(&g, &reg, &n[1], ChannelSplit::Output, 2).is_some());
        // only linear layers have channels to split
        assert!(split_channels(&g, &reg, &n[2], ChannelSplit::Output, 2).is_none());
    }

    #[test]
    fn test_suggests_both_splits_within_the_cluster() {
        let (reg, g, _) = setup(None);
        let results = ChannelParallelSuggester::new().suggest(&g, &reg);
        // degree 3 divides neither 128 nor 256
        assert_eq!(results.len(), 4);
        for result in &results {
            assert!(result.graph.check_correctness().is_ok());
            assert!(result.graph.nodes().all(|n| n.op.output_parts() <= 4));
        }
        let has = |kind| {
            results
                .iter()
                .any(|r| r.graph.nodes().any(|n| n.op.kind() == kind))
        };
        assert!(has(OperatorKind::Replicate));
        assert!(has(OperatorKind::Reduction));
    }
}
