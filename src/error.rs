//! Error types for the strategy search

use thiserror::Error;

use crate::ops::OperatorKind;

/// Reasons a node cannot be created.
///
/// Infeasibility is an expected, frequent outcome while exploring rewrites,
/// so this type is `Copy` and cheap to construct and match on.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Infeasible {
    /// `is_valid` rejected the parameters for the given input shapes
    #[error("invalid parameters for {kind} operator")]
    InvalidParams { kind: OperatorKind },

    /// The replica degree would exceed the devices of a single node
    #[error("replicate degree {degree} exceeds {limit} workers per node")]
    ExceedsWorkersPerNode { degree: usize, limit: usize },

    /// The total number of parts would exceed the whole cluster
    #[error("{parts} parts exceed the {limit} devices of the cluster")]
    ExceedsCluster { parts: usize, limit: usize },
}

/// A machine view whose shape does not describe any set of devices
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum InvalidView {
    #[error("view has {dims} degrees but {strides} strides")]
    LengthMismatch { dims: usize, strides: usize },

    #[error("view has no dimensions")]
    NoDimensions,

    #[error("view dimension {dim} has degree 0")]
    ZeroDegree { dim: usize },
}

/// Main error type for search operations
#[derive(Debug, Error)]
pub enum SearchError {
    /// No feasible assignment was observed before the budget ran out
    #[error("no feasible plan found within the search budget")]
    NoFeasiblePlan,

    /// Node creation failed
    #[error("infeasible node: {0}")]
    Infeasible(#[from] Infeasible),

    /// The graph contains a cycle
    #[error("graph contains a cycle through node {0}")]
    Cyclic(u64),

    /// A node referenced by the caller is not part of the graph
    #[error("node {0} not found in graph")]
    MissingNode(u64),

    /// The graph violates a structural requirement
    #[error("malformed graph: {0}")]
    MalformedGraph(String),

    /// A serialized plan does not describe the given graph
    #[error("plan does not match graph: {0}")]
    PlanMismatch(String),

    /// A configuration value could not be parsed
    #[error("invalid configuration value for {key}: {value}")]
    InvalidConfig { key: String, value: String },

    /// Plan (de)serialization failed
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result alias used throughout the crate
pub type Result<T> = std::result::Result<T, SearchError>;
