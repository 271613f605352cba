//! Parallel tensor shapes

use std::fmt;

use serde::{Deserialize, Serialize};

/// Element type of a tensor
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DataType {
    F16,
    F32,
    F64,
    I32,
    I64,
}

impl DataType {
    pub fn size_in_bytes(&self) -> usize {
        match self {
            DataType::F16 => 2,
            DataType::F32 | DataType::I32 => 4,
            DataType::F64 | DataType::I64 => 8,
        }
    }
}

/// One dimension of a parallel tensor.
///
/// `degree` is the number of parts the dimension is split into. For the
/// replica dimension `size == degree` and counts identical copies.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParallelDim {
    pub size: usize,
    pub degree: usize,
    pub is_replica_dim: bool,
}

/// Shape of a tensor together with how it is partitioned.
///
/// The last dimension is always the replica dimension.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ParallelTensorShape {
    dims: Vec<ParallelDim>,
    data_type: DataType,
}

impl ParallelTensorShape {
    /// An unpartitioned, unreplicated tensor of the given logical sizes
    pub fn new(sizes: &[usize], data_type: DataType) -> Self {
        let mut dims: Vec<ParallelDim> = sizes
            .iter()
            .map(|&size| ParallelDim {
                size,
                degree: 1,
                is_replica_dim: false,
            })
            .collect();
        dims.push(ParallelDim {
            size: 1,
            degree: 1,
            is_replica_dim: true,
        });
        Self { dims, data_type }
    }

    /// Builds a shape from explicit dimensions (replica dimension included)
    pub fn from_dims(dims: Vec<ParallelDim>, data_type: DataType) -> Self {
        Self { dims, data_type }
    }

    pub fn dims(&self) -> &[ParallelDim] {
        &self.dims
    }

    pub fn data_type(&self) -> DataType {
        self.data_type
    }

    /// Number of dimensions including the replica dimension
    pub fn num_dims(&self) -> usize {
        self.dims.len()
    }

    /// Number of logical (non-replica) dimensions
    pub fn num_data_dims(&self) -> usize {
        self.dims.iter().filter(|d| !d.is_replica_dim).count()
    }

    /// Index of the replica dimension
    pub fn replica_dim(&self) -> usize {
        self.dims.len() - 1
    }

    /// Logical sizes of the data dimensions
    pub fn sizes(&self) -> Vec<usize> {
        self.dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| d.size)
            .collect()
    }

    /// Total number of parts the tensor is divided into (replicas included)
    pub fn total_parts(&self) -> usize {
        self.dims.iter().map(|d| d.degree).product()
    }

    /// Elements of the logical tensor
    pub fn volume(&self) -> usize {
        self.dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| d.size)
            .product()
    }

    /// Elements held by each part
    pub fn piece_volume(&self) -> usize {
        self.dims
            .iter()
            .filter(|d| !d.is_replica_dim)
            .map(|d| d.size / d.degree.max(1))
            .product()
    }

    /// Bytes of the logical tensor
    pub fn size_in_bytes(&self) -> usize {
        self.volume() * self.data_type.size_in_bytes()
    }

    /// Checks that every degree is positive and divides its dimension, and
    /// that only the last dimension is a replica dimension.
    pub fn is_valid(&self) -> bool {
        let Some((last, data)) = self.dims.split_last() else {
            return false;
        };
        last.is_replica_dim
            && last.size == last.degree
            && data.iter().all(|d| {
                !d.is_replica_dim && d.degree > 0 && d.size > 0 && d.size % d.degree == 0
            })
    }

    /// Returns a copy with dimension `dim` set to `degree` parts
    pub fn with_degree(&self, dim: usize, degree: usize) -> Self {
        let mut shape = self.clone();
        shape.dims[dim].degree = degree;
        if shape.dims[dim].is_replica_dim {
            shape.dims[dim].size = degree;
        }
        shape
    }

    /// Returns a copy with the logical size of dimension `dim` replaced
    pub fn with_size(&self, dim: usize, size: usize) -> Self {
        let mut shape = self.clone();
        shape.dims[dim].size = size;
        shape
    }

    pub(crate) fn dims_mut(&mut self) -> &mut Vec<ParallelDim> {
        &mut self.dims
    }
}

impl fmt::Display for ParallelTensorShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}[", self.data_type)?;
        for (i, d) in self.dims.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            if d.is_replica_dim {
                write!(f, "r{}", d.degree)?;
            } else {
                write!(f, "{}/{}", d.size, d.degree)?;
            }
        }
        write!(f, "]")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_shape_has_replica_dim() {
        let shape = ParallelTensorShape::new(&[64, 128], DataType::F32);
        assert_eq!(shape.num_dims(), 3);
        assert_eq!(shape.num_data_dims(), 2);
        assert!(shape.dims()[2].is_replica_dim);
        assert_eq!(shape.total_parts(), 1);
        assert_eq!(shape.size_in_bytes(), 64 * 128 * 4);
        assert!(shape.is_valid());
    }

    #[test]
    fn test_degrees() {
        let shape = ParallelTensorShape::new(&[64, 128], DataType::F32)
            .with_degree(0, 4)
            .with_degree(2, 2);
        assert_eq!(shape.total_parts(), 8);
        assert_eq!(shape.piece_volume(), 16 * 128);
        assert_eq!(shape.dims()[2].size, 2);
        assert!(shape.is_valid());
    }

    #[test]
    fn test_non_dividing_degree_is_invalid() {
        let shape = ParallelTensorShape::new(&[10], DataType::F32).with_degree(0, 3);
        assert!(!shape.is_valid());
    }
}
