//! Data-movement operators and the fusion protocol

use std::fmt;

use serde::{Deserialize, Serialize};

use super::shape::ParallelTensorShape;

/// Kind of a data-movement transform
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum ParallelOpKind {
    /// Split a data dimension into more parts
    Repartition,
    /// Merge parts of a data dimension
    Combine,
    /// Add copies along the replica dimension
    Replicate,
    /// Sum copies along the replica dimension
    Reduction,
}

impl ParallelOpKind {
    /// Returns true for the kinds that act on the replica dimension
    pub fn targets_replica_dim(&self) -> bool {
        matches!(self, ParallelOpKind::Replicate | ParallelOpKind::Reduction)
    }
}

/// One data-movement transform: kind, target dimension and degree
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParallelOpInfo {
    pub op_type: ParallelOpKind,
    pub parallel_dim: usize,
    pub parallel_degree: usize,
}

impl ParallelOpInfo {
    pub fn new(op_type: ParallelOpKind, parallel_dim: usize, parallel_degree: usize) -> Self {
        Self {
            op_type,
            parallel_dim,
            parallel_degree,
        }
    }

    pub fn repartition(dim: usize, degree: usize) -> Self {
        Self::new(ParallelOpKind::Repartition, dim, degree)
    }

    pub fn combine(dim: usize, degree: usize) -> Self {
        Self::new(ParallelOpKind::Combine, dim, degree)
    }

    pub fn replicate(dim: usize, degree: usize) -> Self {
        Self::new(ParallelOpKind::Replicate, dim, degree)
    }

    pub fn reduction(dim: usize, degree: usize) -> Self {
        Self::new(ParallelOpKind::Reduction, dim, degree)
    }

    /// Applies this transform to a partitioning.
    ///
    /// Returns `None` when the transform is not defined for `shape`: wrong
    /// kind of dimension, a degree that does not divide, or a zero degree.
    pub fn apply(&self, shape: &ParallelTensorShape) -> Option<ParallelTensorShape> {
        let k = self.parallel_degree;
        let dim = *shape.dims().get(self.parallel_dim)?;
        if k == 0 || dim.is_replica_dim != self.op_type.targets_replica_dim() {
            return None;
        }

        let mut out = shape.clone();
        let target = &mut out.dims_mut()[self.parallel_dim];
        match self.op_type {
            ParallelOpKind::Repartition => {
                let degree = dim.degree.checked_mul(k)?;
                if dim.size % degree != 0 {
                    return None;
                }
                target.degree = degree;
            }
            ParallelOpKind::Combine => {
                if dim.degree % k != 0 {
                    return None;
                }
                target.degree = dim.degree / k;
            }
            ParallelOpKind::Replicate => {
                target.degree = dim.degree.checked_mul(k)?;
                target.size = target.degree;
            }
            ParallelOpKind::Reduction => {
                if dim.degree % k != 0 {
                    return None;
                }
                target.degree = dim.degree / k;
                target.size = target.degree;
            }
        }
        Some(out)
    }
}

impl fmt::Display for ParallelOpInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:?}(dim={}, degree={})",
            self.op_type, self.parallel_dim, self.parallel_degree
        )
    }
}

/// Outcome of [`try_join`].
///
/// `join_did_succeed` with `op == None` means the two transforms cancel out
/// and can both be removed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ParallelOpJoinResult {
    pub op: Option<ParallelOpInfo>,
    pub join_did_succeed: bool,
}

impl ParallelOpJoinResult {
    fn fused(op: ParallelOpInfo) -> Self {
        Self {
            op: Some(op),
            join_did_succeed: true,
        }
    }

    fn identity() -> Self {
        Self {
            op: None,
            join_did_succeed: true,
        }
    }

    fn failed() -> Self {
        Self {
            op: None,
            join_did_succeed: false,
        }
    }
}

/// Tries to replace `a` followed by `b` with a single transform.
///
/// Both must act on the same dimension. Same-kind pairs multiply their
/// degrees (failing above `max_degree`); a repartition and a combine cancel
/// to their net degree when one divides the other. Any other pairing fails.
pub fn try_join(a: &ParallelOpInfo, b: &ParallelOpInfo, max_degree: usize) -> ParallelOpJoinResult {
    use ParallelOpKind::*;

    if a.parallel_dim != b.parallel_dim || a.parallel_degree == 0 || b.parallel_degree == 0 {
        return ParallelOpJoinResult::failed();
    }
    let dim = a.parallel_dim;
    let (k1, k2) = (a.parallel_degree, b.parallel_degree);

    match (a.op_type, b.op_type) {
        (x, y) if x == y => match k1.checked_mul(k2) {
            Some(degree) if degree <= max_degree => {
                ParallelOpJoinResult::fused(ParallelOpInfo::new(x, dim, degree))
            }
            _ => ParallelOpJoinResult::failed(),
        },
        (Repartition, Combine) => net(dim, k1, k2),
        (Combine, Repartition) => net(dim, k2, k1),
        _ => ParallelOpJoinResult::failed(),
    }
}

/// Net effect of splitting by `split` and merging by `merge`
fn net(dim: usize, split: usize, merge: usize) -> ParallelOpJoinResult {
    if split == merge {
        ParallelOpJoinResult::identity()
    } else if split % merge == 0 {
        ParallelOpJoinResult::fused(ParallelOpInfo::repartition(dim, split / merge))
    } else if merge % split == 0 {
        ParallelOpJoinResult::fused(ParallelOpInfo::combine(dim, merge / split))
    } else {
        ParallelOpJoinResult::failed()
    }
}
