//! Fusion of adjacent data-movement operators

use log::trace;

use crate::graph::{Edge, Graph, OperatorRegistry};
use crate::ops::{try_join, ParallelOpInfo};
use crate::opt::graph::rewrite::{output_shape, redirect_outputs, sole_data_input};
use crate::opt::graph::{GraphSuggester, SuggestResult};

use super::partition::device_limit;

/// Joins a parallel operator with the parallel operator it feeds.
///
/// Pairs that [`try_join`] accepts become one operator, and pairs that
/// cancel out disappear. Other pairs are merged into a fused chain that
/// performs both transforms in one step.
pub struct ParallelOpFusionSuggester {
    joins_only: bool,
}

impl ParallelOpFusionSuggester {
    pub fn new() -> Self {
        Self { joins_only: false }
    }

    /// Only propose pairs that [`try_join`] accepts
    pub fn joins_only(mut self) -> Self {
        self.joins_only = true;
        self
    }
}

impl Default for ParallelOpFusionSuggester {
    fn default() -> Self {
        Self::new()
    }
}

struct Fused {
    graph: Graph,
    /// The pair cancelled out
    removed: bool,
    /// The first operator had no other consumer and is gone too
    absorbed: bool,
}

fn fuse_pair(graph: &Graph, registry: &OperatorRegistry, edge: &Edge, joins_only: bool) -> Option<Fused> {
    let (first, second) = (&edge.src, &edge.dst);
    if edge.is_control()
        || !first.op.is_parallel_op()
        || !second.op.is_parallel_op()
        || graph.in_degree(second) != 1
    {
        return None;
    }
    let input = sole_data_input(graph, first)?;
    let input_shape = first.op.input_shapes().first()?;

    let head = first.op.parallel_op_chain();
    let tail = second.op.parallel_op_chain();
    let (last, rest_head) = head.split_last()?;
    let (next, rest_tail) = tail.split_first()?;

    let join = try_join(last, next, device_limit(registry.cluster()));
    let mut chain: Vec<ParallelOpInfo> = rest_head.to_vec();
    if join.join_did_succeed {
        chain.extend(join.op);
    } else if joins_only {
        return None;
    } else {
        chain.extend([*last, *next]);
    }
    chain.extend_from_slice(rest_tail);

    let mut fused_graph = graph.clone();
    fused_graph.remove_edge(edge);
    if chain.is_empty() {
        if Some(input_shape) != output_shape(second, 0) {
            return None;
        }
        redirect_outputs(&mut fused_graph, second, &input.src, input.src_idx);
    } else {
        let fused = match chain.as_slice() {
            [single] => registry.parallel_op(input_shape, *single),
            _ => registry.fused_parallel(input_shape, chain.clone()),
        }
        .ok()?;
        if output_shape(&fused, 0) != output_shape(second, 0) {
            trace!("fusing {} and {} changes the output partitioning", first, second);
            return None;
        }
        fused_graph.add_edge(&input.src, input.src_idx, &fused, 0);
        redirect_outputs(&mut fused_graph, second, &fused, 0);
    }
    fused_graph.remove_node(second);
    let absorbed = fused_graph.out_degree(first) == 0;
    if absorbed {
        fused_graph.remove_node(first);
    }
    Some(Fused {
        graph: fused_graph,
        removed: chain.is_empty(),
        absorbed,
    })
}

/// Applies joinable pairs until none is left, as long as each application
/// shrinks the graph.
pub fn simplify(graph: &Graph, registry: &OperatorRegistry) -> Graph {
    let mut current = graph.clone();
    loop {
        let next = current
            .edges()
            .filter_map(|edge| fuse_pair(&current, registry, edge, true))
            .find(|f| f.removed || f.absorbed);
        match next {
            Some(fused) => current = fused.graph,
            None => return current,
        }
    }
}

impl GraphSuggester for ParallelOpFusionSuggester {
    fn name(&self) -> &'static str {
        "parallel_fusion"
    }

    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult> {
        graph
            .edges()
            .filter_map(|edge| {
                let fused = fuse_pair(graph, registry, edge, self.joins_only)?;
                let verb = if fused.removed { "cancel" } else { "fuse" };
                Some(SuggestResult::with_description(
                    fused.graph,
                    self.name(),
                    format!("{} {} and {}", verb, edge.src, edge.dst),
                ))
            })
            .collect()
    }
}
