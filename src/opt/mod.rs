//! Search strategies
//!
//! - [`dp`]: memoized view assignment for a fixed graph
//! - [`graph`]: best-first search over graph rewrites, priced with [`dp`]
//! - [`mcmc`]: simulated annealing over per-operator configs

pub mod dp;
pub mod graph;
pub mod mcmc;
pub mod progress;

pub use dp::SearchHelper;
pub use graph::GraphSearchHelper;
pub use mcmc::McmcOptimizer;
