//! Partitioning of compute operators

use log::trace;

use crate::graph::{Graph, Node, OperatorRegistry};
use crate::machine::MachineResource;
use crate::opt::graph::rewrite::{output_shape, wrap_node};
use crate::opt::graph::{GraphSuggester, SuggestResult};

use super::fusion::simplify;

/// Splits one compute operator along a dimension.
///
/// Each data input passes through `Repartition(dim, degree)` and the output
/// through `Combine(dim, degree)`, so the rewritten operator runs on
/// `degree` times more devices while its consumers see the original tensor.
pub struct PartitionSuggester {
    /// Largest degree to try; defaults to the device count of the cluster
    max_degree: Option<usize>,
}

impl PartitionSuggester {
    pub fn new() -> Self {
        Self { max_degree: None }
    }

    pub fn with_max_degree(mut self, degree: usize) -> Self {
        self.max_degree = Some(degree);
        self
    }
}

impl Default for PartitionSuggester {
    fn default() -> Self {
        Self::new()
    }
}

/// Number of devices of the larger device kind
pub(crate) fn device_limit(cluster: &MachineResource) -> usize {
    (cluster.num_nodes * cluster.all_gpus_per_node).max(cluster.num_nodes * cluster.all_cpus_per_node)
}

fn is_partitionable(node: &Node) -> bool {
    let kind = node.op.kind();
    !kind.is_free() && !kind.is_parallel_op() && !node.op.is_virtual()
}

/// Rewrites `node` to run split `degree` ways along `dim`, or `None` when
/// the operator cannot be split that way.
pub fn partition_node(
    graph: &Graph,
    registry: &OperatorRegistry,
    node: &Node,
    dim: usize,
    degree: usize,
) -> Option<Graph> {
    if degree < 2 || !graph.contains(node) || !is_partitionable(node) {
        return None;
    }

    let mut repartitions = Vec::with_capacity(node.op.input_shapes().len());
    let mut split_inputs = Vec::with_capacity(node.op.input_shapes().len());
    for shape in node.op.input_shapes() {
        let repartition = registry.repartition(shape, dim, degree).ok()?;
        split_inputs.push(output_shape(&repartition, 0)?.clone());
        repartitions.push(repartition);
    }

    let split = registry
        .get_or_create_node(node.op.params().clone(), &split_inputs)
        .ok()?;
    let combine = registry.combine(output_shape(&split, 0)?, dim, degree).ok()?;
    if output_shape(&combine, 0) != output_shape(node, 0) {
        trace!("{} split along {} does not map back onto its output", node, dim);
        return None;
    }

    wrap_node(graph, node, &repartitions, &split, &combine)
}

/// Uniform data parallelism: every compute operator split `degree` ways
/// along dimension 0, with back-to-back combine/repartition pairs removed.
///
/// Operators that cannot be split stay as they are. Returns `None` if no
/// operator could be split.
pub fn data_parallel_variant(
    graph: &Graph,
    registry: &OperatorRegistry,
    degree: usize,
) -> Option<Graph> {
    let order = graph.topo_order().ok()?;
    let mut current = graph.clone();
    let mut changed = false;
    for node in order.iter().filter(|n| is_partitionable(n)) {
        if let Some(next) = partition_node(&current, registry, node, 0, degree) {
            current = next;
            changed = true;
        }
    }
    changed.then(|| simplify(&current, registry))
}

impl GraphSuggester for PartitionSuggester {
    fn name(&self) -> &'static str {
        "partition"
    }

    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult> {
        let limit = self
            .max_degree
            .unwrap_or_else(|| device_limit(registry.cluster()));
        let mut results = Vec::new();
        for node in graph.nodes().filter(|n| is_partitionable(n)) {
            let Some(shape) = output_shape(node, 0) else {
                continue;
            };
            let parts = node.op.output_parts();
            for dim in 0..shape.num_data_dims() {
                let mut degree = 2;
                while parts * degree <= limit {
                    if let Some(rewritten) = partition_node(graph, registry, node, dim, degree) {
                        results.push(SuggestResult::with_description(
                            simplify(&rewritten, registry),
                            self.name(),
                            format!("split {} along dim {} by {}", node, dim, degree),
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
    use crate::ops::{DataType, OperatorKind, ParallelTensorShape, UnaryOp};

    fn setup() -> (OperatorRegistry, Graph, Vec<Node>) {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 4, 0));
        let shape = ParallelTensorShape::new(&[8, 6], DataType::F32);
        let x = reg.input(&shape).unwrap();
        let a = reg.element_unary(&shape, UnaryOp::Relu).unwrap();
        let b = reg.linear(&shape, 4, true, None).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&a, 0, &b, 0);
        (reg, g, vec![x, a, b])
    }

    #[test]
    fn test_partition_wraps_operator() {
        let (reg, g, n) = setup();
        let rewritten = partition_node(&g, &reg, &n[1], 0, 2).unwrap();
        assert!(rewritten.check_correctness().is_ok());
        assert_eq!(rewritten.num_nodes(), 5);
        assert!(!rewritten.contains(&n[1]));
        let split = rewritten
            .nodes()
            .find(|m| m.op.kind() == OperatorKind::ElementUnary)
            .unwrap();
        assert_eq!(split.op.output_parts(), 2);
    }

    #[test]
    fn test_linear_channel_cannot_be_split() {
        let (reg, g, n) = setup();
        // a split input channel leaves partial sums, which Combine cannot merge
        assert!(partition_node(&g, &reg, &n[2], 1, 2).is_none());
        assert!(partition_node(&g, &reg, &n[2], 0, 2).is_some());
        // 6 is not divisible by 4
        assert!(partition_node(&g, &reg, &n[1], 1, 4).is_none());
        assert!(partition_node(&g, &reg, &n[0], 0, 2).is_none());
    }

    #[test]
    fn test_data_parallel_variant_cancels_inner_pairs() {
        let (reg, g, _) = setup();
        let dp = data_parallel_variant(&g, &reg, 2).unwrap();
        assert!(dp.check_correctness().is_ok());
        let kinds: Vec<OperatorKind> = dp.topo_order().unwrap().iter().map(|n| n.op.kind()).collect();
        assert_eq!(
            kinds,
            vec![
                OperatorKind::Input,
                OperatorKind::Repartition,
                OperatorKind::ElementUnary,
                OperatorKind::Linear,
                OperatorKind::Combine,
            ]
        );
    }

    #[test]
    fn test_suggestions_respect_device_limit() {
        let (reg, g, _) = setup();
        let results = PartitionSuggester::new().suggest(&g, &reg);
        assert!(!results.is_empty());
        for result in &results {
            assert!(result.graph.nodes().all(|n| n.op.output_parts() <= 4));
            assert!(result.graph.check_correctness().is_ok());
        }
    }
}
