//! Node deduplication cache
//!
//! Every operator is created through an [`OperatorRegistry`]. Operators with
//! equal parameters and input shapes resolve to one canonical instance stored
//! in an arena, while every call still yields a fresh [`Node`] placement.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use log::trace;
use rustc_hash::FxHashMap;

use super::Node;
use crate::cost::cache::CacheStats;
use crate::error::Infeasible;
use crate::machine::MachineResource;
use crate::ops::{
    BinaryOp, OpHandle, OpParams, Operator, ParallelOpInfo, ParallelOpKind, ParallelTensorShape,
    UnaryOp,
};

type OperatorKey = (OpParams, Vec<ParallelTensorShape>);

#[derive(Default)]
struct Arena {
    operators: Vec<Arc<Operator>>,
    index: FxHashMap<OperatorKey, OpHandle>,
}

/// Session-scoped store of canonical operators
pub struct OperatorRegistry {
    cluster: MachineResource,
    arena: RwLock<Arena>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl OperatorRegistry {
    /// Creates an empty registry for a cluster; parallel operators that
    /// would not fit on it are rejected.
    pub fn new(cluster: &MachineResource) -> Self {
        Self {
            cluster: cluster.clone(),
            arena: RwLock::new(Arena::default()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn cluster(&self) -> &MachineResource {
        &self.cluster
    }

    /// Returns a new node over the canonical operator for
    /// `(params, input_shapes)`, creating the operator on first use.
    ///
    /// Invalid parameters and capacity violations return `Err` without
    /// allocating a node id.
    pub fn get_or_create_node(
        &self,
        params: OpParams,
        input_shapes: &[ParallelTensorShape],
    ) -> Result<Node, Infeasible> {
        let kind = params.kind();
        let output_shapes = params
            .infer_output_shapes(input_shapes)
            .ok_or(Infeasible::InvalidParams { kind })?;
        if kind.is_parallel_op() {
            self.check_capacity(&params, &input_shapes[0], &output_shapes[0])?;
        }

        let key = (params, input_shapes.to_vec());
        {
            let arena = self.arena.read().unwrap();
            if let Some(&handle) = arena.index.get(&key) {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(Node::new(Arc::clone(&arena.operators[handle])));
            }
        }

        let mut arena = self.arena.write().unwrap();
        // another writer may have inserted the key in between
        if let Some(&handle) = arena.index.get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(Node::new(Arc::clone(&arena.operators[handle])));
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let handle = arena.operators.len();
        let (params, inputs) = key.clone();
        let op = Arc::new(Operator::new(handle, params, inputs, output_shapes));
        trace!("registered {} for {:?}", op, op.input_shapes());
        arena.operators.push(Arc::clone(&op));
        arena.index.insert(key, handle);
        Ok(Node::new(op))
    }

    fn check_capacity(
        &self,
        params: &OpParams,
        input: &ParallelTensorShape,
        output: &ParallelTensorShape,
    ) -> Result<(), Infeasible> {
        let chain: &[ParallelOpInfo] = match params {
            OpParams::Parallel(info) => std::slice::from_ref(info),
            OpParams::FusedParallel { ops } => ops,
            _ => &[],
        };

        let mut shape = input.clone();
        for info in chain {
            if info.op_type == ParallelOpKind::Replicate {
                let degree = shape.dims()[info.parallel_dim].degree * info.parallel_degree;
                if degree > self.cluster.all_gpus_per_node {
                    return Err(Infeasible::ExceedsWorkersPerNode {
                        degree,
                        limit: self.cluster.all_gpus_per_node,
                    });
                }
            }
            shape = info
                .apply(&shape)
                .ok_or(Infeasible::InvalidParams { kind: params.kind() })?;
        }

        let parts = output.total_parts();
        let gpus = self.cluster.num_nodes * self.cluster.all_gpus_per_node;
        let cpus = self.cluster.num_nodes * self.cluster.all_cpus_per_node;
        if parts > gpus && parts > cpus {
            return Err(Infeasible::ExceedsCluster {
                parts,
                limit: gpus.max(cpus),
            });
        }
        Ok(())
    }

    /// Canonical operator behind a handle
    pub fn operator(&self, handle: OpHandle) -> Option<Arc<Operator>> {
        self.arena.read().unwrap().operators.get(handle).cloned()
    }

    pub fn num_operators(&self) -> usize {
        self.arena.read().unwrap().operators.len()
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.num_operators(),
        }
    }

    pub fn input(&self, shape: &ParallelTensorShape) -> Result<Node, Infeasible> {
        self.get_or_create_node(
            OpParams::Input {
                shape: shape.clone(),
            },
            &[],
        )
    }

    pub fn noop(&self, input: &ParallelTensorShape) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::Noop, std::slice::from_ref(input))
    }

    pub fn linear(
        &self,
        input: &ParallelTensorShape,
        out_channels: usize,
        use_bias: bool,
        activation: Option<UnaryOp>,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(
            OpParams::Linear {
                out_channels,
                use_bias,
                activation,
            },
            std::slice::from_ref(input),
        )
    }

    pub fn element_unary(
        &self,
        input: &ParallelTensorShape,
        op: UnaryOp,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::ElementUnary { op }, std::slice::from_ref(input))
    }

    pub fn element_binary(
        &self,
        lhs: &ParallelTensorShape,
        rhs: &ParallelTensorShape,
        op: BinaryOp,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::ElementBinary { op }, &[lhs.clone(), rhs.clone()])
    }

    pub fn softmax(&self, input: &ParallelTensorShape, dim: usize) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::Softmax { dim }, std::slice::from_ref(input))
    }

    pub fn flat(&self, input: &ParallelTensorShape) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::Flat, std::slice::from_ref(input))
    }

    pub fn batch_matmul(
        &self,
        a: &ParallelTensorShape,
        b: &ParallelTensorShape,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::BatchMatmul, &[a.clone(), b.clone()])
    }

    /// Attention with biased projections; key and value sizes are taken
    /// from their shapes.
    pub fn multihead_attention(
        &self,
        query: &ParallelTensorShape,
        key: &ParallelTensorShape,
        value: &ParallelTensorShape,
        embed_dim: usize,
        num_heads: usize,
    ) -> Result<Node, Infeasible> {
        let last = |s: &ParallelTensorShape| s.sizes().last().copied().unwrap_or(0);
        self.get_or_create_node(
            OpParams::MultiHeadAttention {
                embed_dim,
                num_heads,
                kdim: last(key),
                vdim: last(value),
                bias: true,
                add_bias_kv: false,
                add_zero_attn: false,
            },
            &[query.clone(), key.clone(), value.clone()],
        )
    }

    pub fn fused_elementwise(
        &self,
        input: &ParallelTensorShape,
        ops: Vec<UnaryOp>,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(
            OpParams::FusedElementwise { ops },
            std::slice::from_ref(input),
        )
    }

    /// A data-movement node for one transform
    pub fn parallel_op(
        &self,
        input: &ParallelTensorShape,
        info: ParallelOpInfo,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::Parallel(info), std::slice::from_ref(input))
    }

    pub fn repartition(
        &self,
        input: &ParallelTensorShape,
        dim: usize,
        degree: usize,
    ) -> Result<Node, Infeasible> {
        self.parallel_op(input, ParallelOpInfo::repartition(dim, degree))
    }

    pub fn combine(
        &self,
        input: &ParallelTensorShape,
        dim: usize,
        degree: usize,
    ) -> Result<Node, Infeasible> {
        self.parallel_op(input, ParallelOpInfo::combine(dim, degree))
    }

    pub fn replicate(
        &self,
        input: &ParallelTensorShape,
        dim: usize,
        degree: usize,
    ) -> Result<Node, Infeasible> {
        self.parallel_op(input, ParallelOpInfo::replicate(dim, degree))
    }

    pub fn reduction(
        &self,
        input: &ParallelTensorShape,
        dim: usize,
        degree: usize,
    ) -> Result<Node, Infeasible> {
        self.parallel_op(input, ParallelOpInfo::reduction(dim, degree))
    }

    pub fn fused_parallel(
        &self,
        input: &ParallelTensorShape,
        ops: Vec<ParallelOpInfo>,
    ) -> Result<Node, Infeasible> {
        self.get_or_create_node(OpParams::FusedParallel { ops }, std::slice::from_ref(input))
    }
}
