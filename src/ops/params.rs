//! Operator parameters and shape inference

use serde::{Deserialize, Serialize};

use super::parallel::{ParallelOpInfo, ParallelOpKind};
use super::shape::{ParallelDim, ParallelTensorShape};
use super::OperatorKind;

/// Element-wise unary functions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum UnaryOp {
    Identity,
    Relu,
    Sigmoid,
    Tanh,
    Gelu,
    Exp,
}

/// Element-wise binary functions
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
}

/// Immutable parameters of an operator, one variant per operator kind.
///
/// Together with the input shapes this is the structural key under which
/// canonical operators are deduplicated.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OpParams {
    Input {
        shape: ParallelTensorShape,
    },
    Noop,
    Linear {
        out_channels: usize,
        use_bias: bool,
        activation: Option<UnaryOp>,
    },
    ElementUnary {
        op: UnaryOp,
    },
    ElementBinary {
        op: BinaryOp,
    },
    Softmax {
        dim: usize,
    },
    Flat,
    BatchMatmul,
    MultiHeadAttention {
        embed_dim: usize,
        num_heads: usize,
        kdim: usize,
        vdim: usize,
        bias: bool,
        add_bias_kv: bool,
        add_zero_attn: bool,
    },
    FusedElementwise {
        ops: Vec<UnaryOp>,
    },
    Parallel(ParallelOpInfo),
    FusedParallel {
        ops: Vec<ParallelOpInfo>,
    },
}

impl OpParams {
    pub fn kind(&self) -> OperatorKind {
        match self {
            OpParams::Input { .. } => OperatorKind::Input,
            OpParams::Noop => OperatorKind::Noop,
            OpParams::Linear { .. } => OperatorKind::Linear,
            OpParams::ElementUnary { .. } => OperatorKind::ElementUnary,
            OpParams::ElementBinary { .. } => OperatorKind::ElementBinary,
            OpParams::Softmax { .. } => OperatorKind::Softmax,
            OpParams::Flat => OperatorKind::Flat,
            OpParams::BatchMatmul => OperatorKind::BatchMatmul,
            OpParams::MultiHeadAttention { .. } => OperatorKind::MultiHeadAttention,
            OpParams::FusedElementwise { .. } => OperatorKind::FusedElementwise,
            OpParams::Parallel(info) => match info.op_type {
                ParallelOpKind::Repartition => OperatorKind::Repartition,
                ParallelOpKind::Combine => OperatorKind::Combine,
                ParallelOpKind::Replicate => OperatorKind::Replicate,
                ParallelOpKind::Reduction => OperatorKind::Reduction,
            },
            OpParams::FusedParallel { .. } => OperatorKind::FusedParallel,
        }
    }

    /// Number of input tensors the operator consumes
    pub fn num_inputs(&self) -> usize {
        match self {
            OpParams::Input { .. } => 0,
            OpParams::ElementBinary { .. } | OpParams::BatchMatmul => 2,
            OpParams::MultiHeadAttention { .. } => 3,
            _ => 1,
        }
    }

    pub fn is_valid(&self, inputs: &[ParallelTensorShape]) -> bool {
        self.infer_output_shapes(inputs).is_some()
    }

    /// Output shapes for the given inputs, or `None` if the parameters are
    /// not valid for them.
    pub fn infer_output_shapes(
        &self,
        inputs: &[ParallelTensorShape],
    ) -> Option<Vec<ParallelTensorShape>> {
        if inputs.len() != self.num_inputs() || !inputs.iter().all(|s| s.is_valid()) {
            return None;
        }
        let output = match self {
            OpParams::Input { shape } => shape.is_valid().then(|| shape.clone())?,
            OpParams::Noop | OpParams::ElementUnary { .. } => inputs[0].clone(),
            OpParams::FusedElementwise { ops } => {
                if ops.is_empty() {
                    return None;
                }
                inputs[0].clone()
            }
            OpParams::Linear {
                out_channels,
                activation,
                ..
            } => linear_output(&inputs[0], *out_channels, *activation)?,
            OpParams::ElementBinary { .. } => {
                if inputs[0] != inputs[1] {
                    return None;
                }
                inputs[0].clone()
            }
            OpParams::Softmax { dim } => {
                let d = inputs[0].dims().get(*dim)?;
                if d.is_replica_dim || d.degree != 1 {
                    return None;
                }
                inputs[0].clone()
            }
            OpParams::Flat => flat_output(&inputs[0])?,
            OpParams::BatchMatmul => batch_matmul_output(&inputs[0], &inputs[1])?,
            OpParams::MultiHeadAttention {
                embed_dim,
                num_heads,
                kdim,
                vdim,
                ..
            } => attention_output(inputs, *embed_dim, *num_heads, *kdim, *vdim)?,
            OpParams::Parallel(info) => info.apply(&inputs[0])?,
            OpParams::FusedParallel { ops } => {
                if ops.is_empty() {
                    return None;
                }
                ops.iter()
                    .try_fold(inputs[0].clone(), |shape, op| op.apply(&shape))?
            }
        };
        Some(vec![output])
    }
}

/// `[.., in] -> [.., out_channels]`.
///
/// Each input replica computes its own slice of the output channels, and a
/// split input channel leaves one partial sum per part in the output's
/// replica dimension.
fn linear_output(
    input: &ParallelTensorShape,
    out_channels: usize,
    activation: Option<UnaryOp>,
) -> Option<ParallelTensorShape> {
    let data_dims = input.num_data_dims();
    if out_channels == 0 || data_dims == 0 {
        return None;
    }
    let channel = data_dims - 1;
    let replica = input.replica_dim();
    let channel_split = input.dims()[channel].degree;
    let replicas = input.dims()[replica].degree;
    if out_channels % replicas != 0 {
        return None;
    }
    // partial sums must be reduced before any activation
    if channel_split > 1 && activation.is_some_and(|a| a != UnaryOp::Identity) {
        return None;
    }
    Some(
        input
            .with_size(channel, out_channels)
            .with_degree(channel, replicas)
            .with_degree(replica, channel_split),
    )
}

/// `[b, d1, d2, ..] -> [b, d1 * d2 * ..]`; only the batch dimension may be split
fn flat_output(input: &ParallelTensorShape) -> Option<ParallelTensorShape> {
    let data_dims = input.num_data_dims();
    if data_dims < 2 {
        return None;
    }
    let dims = input.dims();
    if dims[1..data_dims].iter().any(|d| d.degree != 1) {
        return None;
    }
    let flattened = ParallelDim {
        size: dims[1..data_dims].iter().map(|d| d.size).product(),
        degree: 1,
        is_replica_dim: false,
    };
    let replica = dims[data_dims];
    Some(ParallelTensorShape::from_dims(
        vec![dims[0], flattened, replica],
        input.data_type(),
    ))
}

/// `[b, m, k] x [b, k, n] -> [b, m, n]`; the contracted dimension must not be split
fn batch_matmul_output(
    a: &ParallelTensorShape,
    b: &ParallelTensorShape,
) -> Option<ParallelTensorShape> {
    if a.num_data_dims() != 3 || b.num_data_dims() != 3 || a.data_type() != b.data_type() {
        return None;
    }
    let (ad, bd) = (a.dims(), b.dims());
    if ad[0] != bd[0] || ad[2].size != bd[1].size || ad[2].degree != 1 || bd[1].degree != 1 {
        return None;
    }
    if ad[3] != bd[3] {
        return None;
    }
    Some(ParallelTensorShape::from_dims(
        vec![ad[0], ad[1], bd[2], ad[3]],
        a.data_type(),
    ))
}

/// query `[b, sq, q]`, key `[b, sk, k]`, value `[b, sk, v]` -> `[b, sq, embed_dim]`.
/// Only the batch dimension may be split.
fn attention_output(
    inputs: &[ParallelTensorShape],
    embed_dim: usize,
    num_heads: usize,
    kdim: usize,
    vdim: usize,
) -> Option<ParallelTensorShape> {
    if num_heads == 0 || embed_dim == 0 || embed_dim % num_heads != 0 {
        return None;
    }
    let (query, key, value) = (&inputs[0], &inputs[1], &inputs[2]);
    if [query, key, value].iter().any(|s| s.num_data_dims() != 3) {
        return None;
    }
    let (q, k, v) = (query.dims(), key.dims(), value.dims());
    let batch = q[0];
    if k[0] != batch || v[0] != batch || k[1].size != v[1].size {
        return None;
    }
    if k[2].size != kdim || v[2].size != vdim {
        return None;
    }
    let unsplit = |d: &[ParallelDim]| d[1].degree == 1 && d[2].degree == 1 && d[3].degree == 1;
    if !(unsplit(q) && unsplit(k) && unsplit(v)) {
        return None;
    }
    Some(ParallelTensorShape::from_dims(
        vec![
            batch,
            q[1],
            ParallelDim {
                size: embed_dim,
                degree: 1,
                is_replica_dim: false,
            },
            q[3],
        ],
        query.data_type(),
    ))
}
