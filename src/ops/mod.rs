//! Operators of a parallel computation graph
//!
//! An [`Operator`] is the canonical, immutable instance shared by every graph
//! node that has the same parameters and input shapes. Operators are created
//! only through [`crate::graph::OperatorRegistry`].

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod parallel;
pub mod params;
pub mod shape;

pub use parallel::{try_join, ParallelOpInfo, ParallelOpJoinResult, ParallelOpKind};
pub use params::{BinaryOp, OpParams, UnaryOp};
pub use shape::{DataType, ParallelDim, ParallelTensorShape};

/// Kind tag of an operator
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum OperatorKind {
    Input,
    Noop,
    Linear,
    ElementUnary,
    ElementBinary,
    Softmax,
    Flat,
    BatchMatmul,
    MultiHeadAttention,
    FusedElementwise,
    Repartition,
    Combine,
    Replicate,
    Reduction,
    FusedParallel,
}

impl OperatorKind {
    /// Data-movement operators
    pub fn is_parallel_op(&self) -> bool {
        matches!(
            self,
            OperatorKind::Repartition
                | OperatorKind::Combine
                | OperatorKind::Replicate
                | OperatorKind::Reduction
                | OperatorKind::FusedParallel
        )
    }

    /// Operators that do no arithmetic of their own
    pub fn is_free(&self) -> bool {
        matches!(self, OperatorKind::Input | OperatorKind::Noop)
    }
}

impl fmt::Display for OperatorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorKind::Input => "input",
            OperatorKind::Noop => "noop",
            OperatorKind::Linear => "linear",
            OperatorKind::ElementUnary => "element_unary",
            OperatorKind::ElementBinary => "element_binary",
            OperatorKind::Softmax => "softmax",
            OperatorKind::Flat => "flat",
            OperatorKind::BatchMatmul => "batch_matmul",
            OperatorKind::MultiHeadAttention => "multihead_attention",
            OperatorKind::FusedElementwise => "fused_elementwise",
            OperatorKind::Repartition => "repartition",
            OperatorKind::Combine => "combine",
            OperatorKind::Replicate => "replicate",
            OperatorKind::Reduction => "reduction",
            OperatorKind::FusedParallel => "fused_parallel",
        };
        write!(f, "{}", name)
    }
}

/// Index of a canonical operator inside its registry arena
pub type OpHandle = usize;

/// Handle of the endpoints the search adds around multi-source or
/// multi-sink graphs; never issued by a registry.
pub(crate) const VIRTUAL_HANDLE: OpHandle = OpHandle::MAX;

/// Canonical operator instance
#[derive(Debug, PartialEq, Eq)]
pub struct Operator {
    handle: OpHandle,
    params: OpParams,
    input_shapes: Vec<ParallelTensorShape>,
    output_shapes: Vec<ParallelTensorShape>,
}

impl Operator {
    pub(crate) fn new(
        handle: OpHandle,
        params: OpParams,
        input_shapes: Vec<ParallelTensorShape>,
        output_shapes: Vec<ParallelTensorShape>,
    ) -> Self {
        Self {
            handle,
            params,
            input_shapes,
            output_shapes,
        }
    }

    /// A zero-cost endpoint that only orders real nodes
    pub(crate) fn virtual_endpoint() -> Self {
        Self::new(
            VIRTUAL_HANDLE,
            OpParams::Noop,
            Vec::new(),
            vec![ParallelTensorShape::new(&[1], DataType::F32)],
        )
    }

    /// Returns true for endpoints added by the search itself
    pub fn is_virtual(&self) -> bool {
        self.handle == VIRTUAL_HANDLE
    }

    pub fn handle(&self) -> OpHandle {
        self.handle
    }

    pub fn kind(&self) -> OperatorKind {
        self.params.kind()
    }

    pub fn params(&self) -> &OpParams {
        &self.params
    }

    pub fn input_shapes(&self) -> &[ParallelTensorShape] {
        &self.input_shapes
    }

    pub fn output_shapes(&self) -> &[ParallelTensorShape] {
        &self.output_shapes
    }

    pub fn is_parallel_op(&self) -> bool {
        self.kind().is_parallel_op()
    }

    /// Parts of the first output; a view for this operator must cover
    /// exactly this many devices.
    pub fn output_parts(&self) -> usize {
        self.output_shapes
            .first()
            .map(|s| s.total_parts())
            .unwrap_or(1)
    }

    /// The single data-movement transform this operator performs, if any
    pub fn parallel_op_info(&self) -> Option<ParallelOpInfo> {
        match &self.params {
            OpParams::Parallel(info) => Some(*info),
            _ => None,
        }
    }

    /// The chain of transforms of a plain or fused data-movement operator
    pub fn parallel_op_chain(&self) -> Vec<ParallelOpInfo> {
        match &self.params {
            OpParams::Parallel(info) => vec![*info],
            OpParams::FusedParallel { ops } => ops.clone(),
            _ => Vec::new(),
        }
    }
}

impl fmt::Display for Operator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}#{}", self.kind(), self.handle)
    }
}
