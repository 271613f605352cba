//! Graph surgery shared by the suggesters

use crate::graph::{Edge, Graph, Node};
use crate::ops::ParallelTensorShape;

/// Moves every consumer of `from` over to output `to_idx` of `to`.
/// Control edges stay control edges.
pub(crate) fn redirect_outputs(graph: &mut Graph, from: &Node, to: &Node, to_idx: usize) {
    let outgoing: Vec<Edge> = graph.out_edges(from).cloned().collect();
    for edge in outgoing {
        graph.remove_edge(&edge);
        if edge.is_control() {
            graph.add_control_edge(to, &edge.dst);
        } else {
            graph.add_edge(to, to_idx, &edge.dst, edge.dst_idx);
        }
    }
}

/// Moves every producer of `from` over to the same input slot of `to`
pub(crate) fn redirect_inputs(graph: &mut Graph, from: &Node, to: &Node) {
    let incoming: Vec<Edge> = graph.in_edges(from).cloned().collect();
    for edge in incoming {
        graph.remove_edge(&edge);
        if edge.is_control() {
            graph.add_control_edge(&edge.src, to);
        } else {
            graph.add_edge(&edge.src, edge.src_idx, to, edge.dst_idx);
        }
    }
}

/// Replaces `node` by `inner`. Data input `i` passes through a copy of
/// `inputs[i]` and every consumer reads from `output`, which follows `inner`.
pub(crate) fn wrap_node(
    graph: &Graph,
    node: &Node,
    inputs: &[Node],
    inner: &Node,
    output: &Node,
) -> Option<Graph> {
    let mut rewritten = graph.clone();
    for edge in graph.in_edges(node) {
        if edge.is_control() {
            rewritten.add_control_edge(&edge.src, inner);
            continue;
        }
        let pre = inputs.get(edge.dst_idx)?.duplicate();
        rewritten.add_edge(&edge.src, edge.src_idx, &pre, 0);
        rewritten.add_edge(&pre, 0, inner, edge.dst_idx);
    }
    rewritten.add_edge(inner, 0, output, 0);
    redirect_outputs(&mut rewritten, node, output, 0);
    rewritten.remove_node(node);
    Some(rewritten)
}

/// The single data edge feeding a one-input node
pub(crate) fn sole_data_input(graph: &Graph, node: &Node) -> Option<Edge> {
    let mut data = graph.in_edges(node).filter(|e| !e.is_control());
    let edge = data.next()?;
    data.next().is_none().then(|| edge.clone())
}

/// Number of tensor edges leaving a node
pub(crate) fn data_consumers(graph: &Graph, node: &Node) -> usize {
    graph.out_edges(node).filter(|e| !e.is_control()).count()
}

/// Shape a node produces on output `idx`
pub(crate) fn output_shape(node: &Node, idx: usize) -> Option<&ParallelTensorShape> {
    node.op.output_shapes().get(idx)
}
