//! Graph-level optimizers

mod best_first;

pub use best_first::GraphSearchHelper;
