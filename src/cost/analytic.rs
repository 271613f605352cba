//! Roofline-style reference oracle

use super::{CostMetrics, CostOracle};
use crate::machine::{DeviceType, MachineResource, MachineView};
use crate::ops::{OpParams, Operator, ParallelTensorShape};

/// Estimates time as `max(flops / throughput, bytes / bandwidth)` per part,
/// plus a fixed launch overhead. Times are in milliseconds.
#[derive(Clone, Debug)]
pub struct AnalyticCostOracle {
    /// Floating point operations per millisecond of one GPU
    pub gpu_flops: f32,
    /// Floating point operations per millisecond of one CPU
    pub cpu_flops: f32,
    /// Bytes per millisecond of device memory
    pub memory_bandwidth: f32,
    /// Bytes per millisecond between devices of the same node
    pub intra_node_bandwidth: f32,
    /// Bytes per millisecond between nodes
    pub inter_node_bandwidth: f32,
    /// Fixed cost of launching any kernel
    pub launch_overhead: f32,
    gpus_per_node: usize,
    cpus_per_node: usize,
}

impl AnalyticCostOracle {
    /// A model of a cluster with the device counts of `cluster`
    pub fn new(cluster: &MachineResource) -> Self {
        Self {
            gpu_flops: 1.0e10,
            cpu_flops: 1.0e8,
            memory_bandwidth: 1.0e9,
            intra_node_bandwidth: 1.0e8,
            inter_node_bandwidth: 1.0e7,
            launch_overhead: 0.01,
            gpus_per_node: cluster.all_gpus_per_node,
            cpus_per_node: cluster.all_cpus_per_node,
        }
    }

    pub fn with_gpu_flops(mut self, flops: f32) -> Self {
        self.gpu_flops = flops;
        self
    }

    pub fn with_inter_node_bandwidth(mut self, bandwidth: f32) -> Self {
        self.inter_node_bandwidth = bandwidth;
        self
    }

    fn node_of(&self, view: &MachineView, device_id: usize) -> usize {
        let per_node = match view.device_type() {
            DeviceType::Gpu => self.gpus_per_node,
            DeviceType::Cpu => self.cpus_per_node,
        };
        device_id / per_node.max(1)
    }

    fn spans_nodes(&self, views: &[&MachineView]) -> bool {
        let mut nodes = views
            .iter()
            .flat_map(|v| v.device_ids().into_iter().map(move |id| self.node_of(v, id)));
        match nodes.next() {
            Some(first) => nodes.any(|n| n != first),
            None => false,
        }
    }
}

/// Forward floating point operations and weight element count
fn flops_and_weights(op: &Operator) -> (f64, usize) {
    let inputs = op.input_shapes();
    let out_volume = op
        .output_shapes()
        .first()
        .map(|s| s.volume() as f64)
        .unwrap_or(0.0);
    match op.params() {
        OpParams::Linear {
            out_channels,
            use_bias,
            ..
        } => {
            let sizes = inputs[0].sizes();
            let in_channels = sizes.last().copied().unwrap_or(1);
            let weights = in_channels * out_channels + if *use_bias { *out_channels } else { 0 };
            (2.0 * inputs[0].volume() as f64 * *out_channels as f64, weights)
        }
        OpParams::ElementUnary { .. } | OpParams::ElementBinary { .. } => (out_volume, 0),
        OpParams::FusedElementwise { ops } => (out_volume * ops.len() as f64, 0),
        OpParams::Softmax { .. } => (5.0 * out_volume, 0),
        OpParams::BatchMatmul => {
            let a = inputs[0].sizes();
            (2.0 * out_volume * a[2] as f64, 0)
        }
        OpParams::MultiHeadAttention {
            embed_dim,
            kdim,
            vdim,
            ..
        } => {
            let q = inputs[0].sizes();
            let k = inputs[1].sizes();
            let (b, sq, sk) = (q[0] as f64, q[1] as f64, k[1] as f64);
            let e = *embed_dim as f64;
            let projections =
                2.0 * b * (sq * q[2] as f64 + sk * *kdim as f64 + sk * *vdim as f64) * e;
            let scores = 4.0 * b * sq * sk * e;
            let output = 2.0 * b * sq * e * e;
            let weights = embed_dim * (q[2] + kdim + vdim + embed_dim);
            (projections + scores + output, weights)
        }
        _ => (0.0, 0),
    }
}

/// Number of slices the weights are cut into; the rest of the parts hold
/// copies. A linear layer's weight is split by its input channel degree and
/// by its input replicas, which become output channel slices.
fn weight_shards(op: &Operator) -> usize {
    match (op.params(), op.input_shapes().first()) {
        (OpParams::Linear { .. }, Some(input)) => {
            let channel = input
                .num_data_dims()
                .checked_sub(1)
                .map_or(1, |c| input.dims()[c].degree);
            (channel * input.dims()[input.replica_dim()].degree).max(1)
        }
        _ => 1,
    }
}

impl CostOracle for AnalyticCostOracle {
    fn measure(
        &self,
        op: &Operator,
        view: &MachineView,
        resources: &MachineResource,
    ) -> Option<CostMetrics> {
        if view.num_parts() != op.output_parts() || !resources.is_valid_view(view) {
            return None;
        }
        if op.kind().is_free() {
            return Some(CostMetrics::zero());
        }

        let parts = view.num_parts() as f32;
        let in_bytes: usize = op.input_shapes().iter().map(|s| s.size_in_bytes()).sum();
        let out_bytes: usize = op.output_shapes().iter().map(|s| s.size_in_bytes()).sum();

        if op.is_parallel_op() {
            let bandwidth = if self.spans_nodes(&[view]) {
                self.inter_node_bandwidth
            } else {
                self.intra_node_bandwidth
            };
            // a fused chain pays for every stage it replaces
            let mut shape = op.input_shapes().first()?.clone();
            let mut metrics = CostMetrics::zero();
            for info in op.parallel_op_chain() {
                let next = info.apply(&shape)?;
                let time = self.launch_overhead + next.size_in_bytes() as f32 / parts / bandwidth;
                metrics = metrics.sequential(&CostMetrics {
                    forward_time: time,
                    backward_time: time,
                    inputs_memory: shape.size_in_bytes(),
                    outputs_memory: next.size_in_bytes(),
                    weights_memory: 0,
                });
                shape = next;
            }
            return Some(metrics);
        }

        let (flops, weights) = flops_and_weights(op);
        let throughput = match view.device_type() {
            DeviceType::Gpu => self.gpu_flops,
            DeviceType::Cpu => self.cpu_flops,
        };
        let compute = flops as f32 / parts / throughput;
        let memory = (in_bytes + out_bytes) as f32 / parts / self.memory_bandwidth;
        let forward = self.launch_overhead + compute.max(memory);
        let element_size = op
            .output_shapes()
            .first()
            .map(|s| s.data_type().size_in_bytes())
            .unwrap_or(4);
        let piece = CostMetrics {
            forward_time: forward,
            backward_time: 2.0 * forward,
            inputs_memory: in_bytes / view.num_parts(),
            outputs_memory: out_bytes / view.num_parts(),
            weights_memory: weights * element_size / weight_shards(op),
        };
        // identical pieces side by side, one per device of the view
        Some((1..view.num_parts()).fold(piece, |acc, _| acc.concurrent(&piece)))
    }

    fn transfer_cost(&self, shape: &ParallelTensorShape, src: &MachineView, dst: &MachineView) -> f32 {
        if src == dst {
            return 0.0;
        }
        let bandwidth = if self.spans_nodes(&[src, dst]) {
            self.inter_node_bandwidth
        } else {
            self.intra_node_bandwidth
        };
        let parts = src.num_parts().max(dst.num_parts()) as f32;
        shape.size_in_bytes() as f32 / parts / bandwidth
    }
}
