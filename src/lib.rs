//! pcg-search: parallelization strategy search
//!
//! Given a computation graph and a cluster, finds how to partition each
//! operator and which devices should run the parts.
//!
//! # Architecture
//!
//! - **ops**: operator parameters, parallel tensor shapes, data-movement
//!   transforms and their fusion rules
//! - **graph**: the parallel computation graph and the registry that
//!   deduplicates operators
//! - **machine**: cluster budgets, device views and per-operator configs
//! - **cost**: the cost oracle interface, an analytic model and a cache
//! - **opt**: the searches (memoized DP, rewrite search, simulated annealing)
//! - **plan**: the chosen views and their serialization
//!
//! # Example
//!
//! ```ignore
//! use pcg_search::prelude::*;
//!
//! let cluster = MachineResource::new(1, 4, 0);
//! let registry = Arc::new(OperatorRegistry::new(&cluster));
//! let shape = ParallelTensorShape::new(&[64, 256], DataType::F32);
//! let x = registry.input(&shape)?;
//! let y = registry.linear(&shape, 128, true, Some(UnaryOp::Relu))?;
//! let mut graph = Graph::new();
//! graph.add_edge(&x, 0, &y, 0);
//!
//! let oracle = AnalyticCostOracle::new(&cluster);
//! let plan = GraphSearchHelper::new(&oracle, registry)
//!     .without_progress()
//!     .graph_optimize(&graph, &cluster)?;
//! ```

pub mod config;
pub mod cost;
pub mod error;
pub mod graph;
pub mod machine;
pub mod ops;
pub mod opt;
pub mod plan;

pub use config::{McmcConfig, SearchConfig};
pub use error::{Infeasible, InvalidView, Result, SearchError};
pub use plan::{Plan, SavedPlan};

/// Commonly used types and traits
pub mod prelude {
    pub use std::sync::Arc;

    pub use crate::config::{McmcConfig, SearchConfig};
    pub use crate::cost::{AnalyticCostOracle, CachedCostOracle, CompMode, CostMetrics, CostOracle};
    pub use crate::error::{Infeasible, Result, SearchError};
    pub use crate::graph::{Edge, Graph, Node, OperatorRegistry};
    pub use crate::machine::{DeviceType, MachineResource, MachineView, ParallelConfig};
    pub use crate::ops::{
        BinaryOp, DataType, OpParams, OperatorKind, ParallelOpInfo, ParallelTensorShape, UnaryOp,
    };
    pub use crate::opt::progress::{IndicatifProgress, NoOpProgress, SearchProgress, StopReason};
    pub use crate::opt::{GraphSearchHelper, McmcOptimizer, SearchHelper};
    pub use crate::plan::Plan;
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_builds_a_graph() {
        use super::prelude::*;
        let cluster = MachineResource::new(1, 2, 0);
        let registry = OperatorRegistry::new(&cluster);
        let shape = ParallelTensorShape::new(&[4, 4], DataType::F32);
        let x = registry.input(&shape).unwrap();
        let mut graph = Graph::new();
        graph.add_node(&x);
        assert_eq!(graph.num_nodes(), 1);
    }
}
