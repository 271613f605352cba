//! Fusion of element-wise chains

use crate::graph::{Edge, Graph, Node, OperatorRegistry};
use crate::ops::{OpParams, UnaryOp};
use crate::opt::graph::rewrite::{data_consumers, redirect_inputs, redirect_outputs};
use crate::opt::graph::{GraphSuggester, SuggestResult};

/// Merges an element-wise operator into its only consumer.
///
/// Two unary operators become one `FusedElementwise`; a linear layer
/// without activation followed by a unary operator takes it as its
/// activation.
pub struct ElementwiseFusionSuggester;

impl ElementwiseFusionSuggester {
    pub fn new() -> Self {
        Self
    }
}

impl Default for ElementwiseFusionSuggester {
    fn default() -> Self {
        Self::new()
    }
}

fn unary_chain(node: &Node) -> Option<Vec<UnaryOp>> {
    match node.op.params() {
        OpParams::ElementUnary { op } => Some(vec![*op]),
        OpParams::FusedElementwise { ops } => Some(ops.clone()),
        _ => None,
    }
}

fn fuse(graph: &Graph, registry: &OperatorRegistry, edge: &Edge) -> Option<Graph> {
    let (first, second) = (&edge.src, &edge.dst);
    if edge.is_control() || graph.out_degree(first) != 1 || graph.in_degree(second) != 1 {
        return None;
    }
    let input = first.op.input_shapes().first()?;
    let tail = unary_chain(second)?;

    let fused = match first.op.params() {
        OpParams::Linear {
            out_channels,
            use_bias,
            activation: None,
        } if tail.len() == 1 => registry.get_or_create_node(
            OpParams::Linear {
                out_channels: *out_channels,
                use_bias: *use_bias,
                activation: Some(tail[0]),
            },
            std::slice::from_ref(input),
        ),
        _ => {
            let mut ops = unary_chain(first)?;
            ops.extend(tail);
            registry.fused_elementwise(input, ops)
        }
    }
    .ok()?;

    let mut fused_graph = graph.clone();
    redirect_inputs(&mut fused_graph, first, &fused);
    redirect_outputs(&mut fused_graph, second, &fused, 0);
    fused_graph.remove_node(first);
    fused_graph.remove_node(second);
    Some(fused_graph)
}

impl GraphSuggester for ElementwiseFusionSuggester {
    fn name(&self) -> &'static str {
        "elementwise_fusion"
    }

    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult> {
        graph
            .edges()
            .filter(|e| data_consumers(graph, &e.src) == 1)
            .filter_map(|edge| {
                let fused = fuse(graph, registry, edge)?;
                Some(SuggestResult::with_description(
                    fused,
                    self.name(),
                    format!("fuse {} into {}", edge.src, edge.dst),
                ))
            })
            .collect()
    }
}
