//! Rewrites proposed to the graph search

mod channel;
mod composite;
mod elementwise_fusion;
mod fusion;
mod partition;

pub use channel::{split_channels, ChannelParallelSuggester, ChannelSplit};
pub use composite::CompositeSuggester;
pub use elementwise_fusion::ElementwiseFusionSuggester;
pub use fusion::{simplify, ParallelOpFusionSuggester};
pub use partition::{data_parallel_variant, partition_node, PartitionSuggester};
