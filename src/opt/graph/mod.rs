//! Graph-level rewrite search
//!
//! Suggesters propose rewritten variants of a graph (partitioned operators,
//! fused chains), a static estimator orders them, and the DP search prices
//! each variant with its best view assignment.

pub mod estimator;
pub mod history;
pub mod optimizer;
mod rewrite;
pub mod suggesters;

use crate::graph::{Graph, OperatorRegistry};

/// A rewritten graph together with where it came from
#[derive(Clone, Debug)]
pub struct SuggestResult {
    pub graph: Graph,
    /// Name of the suggester that proposed the rewrite
    pub suggester_name: String,
    /// Short human-readable account of the change
    pub description: String,
}

impl SuggestResult {
    pub fn new(graph: Graph, suggester_name: impl Into<String>) -> Self {
        Self {
            graph,
            suggester_name: suggester_name.into(),
            description: String::new(),
        }
    }

    pub fn with_description(
        graph: Graph,
        suggester_name: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            graph,
            suggester_name: suggester_name.into(),
            description: description.into(),
        }
    }
}

/// Proposes rewritten variants of a graph.
///
/// New operators must come from `registry` so that equal rewrites share
/// canonical operators.
pub trait GraphSuggester: Send + Sync {
    fn name(&self) -> &'static str;

    /// Every variant reachable from `graph` by one rewrite
    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult>;
}

/// Cheap score used to order candidates before the DP search prices them
pub trait GraphCostEstimator: Send + Sync {
    fn estimate(&self, graph: &Graph) -> f32;
}

pub use estimator::StaticCostEstimator;
pub use history::{SearchHistory, SearchSnapshot};
pub use optimizer::GraphSearchHelper;
pub use suggesters::{
    ChannelParallelSuggester, CompositeSuggester, ElementwiseFusionSuggester,
    ParallelOpFusionSuggester, PartitionSuggester,
};
