//! Search configuration
//!
//! Defaults can be overridden through environment variables:
//! - `PCG_SEARCH_BUDGET`: graph search iterations
//! - `PCG_SEARCH_ALPHA`: pruning factor relative to the best cost
//! - `PCG_SEARCH_TIME_LIMIT_MS`: wall-clock limit of the graph search
//! - `PCG_ONLY_DATA_PARALLEL=1`: restrict to uniform data parallelism
//! - `PCG_MCMC_BUDGET`: local search iterations
//! - `PCG_MCMC_SEED`: local search random seed

use std::str::FromStr;
use std::time::Duration;

use crate::cost::CompMode;
use crate::error::{Result, SearchError};

fn env_override<T: FromStr>(key: &str) -> Result<Option<T>> {
    let Ok(value) = std::env::var(key) else {
        return Ok(None);
    };
    let parsed = value.trim().parse::<T>();
    parsed.map(Some).map_err(|_| SearchError::InvalidConfig {
        key: key.to_string(),
        value,
    })
}

fn env_flag(key: &str) -> Option<bool> {
    std::env::var(key)
        .ok()
        .map(|v| matches!(v.trim(), "1" | "true" | "yes"))
}

/// Settings of the graph-rewrite search and the DP evaluation it drives
#[derive(Clone, Debug, PartialEq)]
pub struct SearchConfig {
    /// Maximum number of candidate graphs to evaluate
    pub budget: usize,
    /// Candidates costing more than `alpha * best` are not expanded
    pub alpha: f32,
    /// Optional wall-clock limit
    pub time_limit: Option<Duration>,
    /// Only evaluate uniform data-parallel variants of the input graph
    pub only_data_parallel: bool,
    /// Relative gain below which a new best does not count as improvement
    pub improvement_threshold: f32,
    /// Stop after this many evaluations without improvement
    pub max_no_improvement: Option<usize>,
    /// Number of candidates evaluated together on the thread pool
    pub batch_size: usize,
    pub comp_mode: CompMode,
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            budget: 100,
            alpha: 1.2,
            time_limit: None,
            only_data_parallel: false,
            improvement_threshold: 1e-3,
            max_no_improvement: Some(20),
            batch_size: 1,
            comp_mode: CompMode::Training,
        }
    }
}

impl SearchConfig {
    /// Defaults with `PCG_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(budget) = env_override("PCG_SEARCH_BUDGET")? {
            config.budget = budget;
        }
        if let Some(alpha) = env_override("PCG_SEARCH_ALPHA")? {
            config.alpha = alpha;
        }
        if let Some(ms) = env_override::<u64>("PCG_SEARCH_TIME_LIMIT_MS")? {
            config.time_limit = Some(Duration::from_millis(ms));
        }
        if let Some(flag) = env_flag("PCG_ONLY_DATA_PARALLEL") {
            config.only_data_parallel = flag;
        }
        Ok(config)
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_time_limit(mut self, limit: Duration) -> Self {
        self.time_limit = Some(limit);
        self
    }

    pub fn with_only_data_parallel(mut self, only: bool) -> Self {
        self.only_data_parallel = only;
        self
    }

    pub fn with_improvement_threshold(mut self, threshold: f32) -> Self {
        self.improvement_threshold = threshold;
        self
    }

    pub fn with_no_improvement_limit(mut self, limit: Option<usize>) -> Self {
        self.max_no_improvement = limit;
        self
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size.max(1);
        self
    }

    pub fn with_comp_mode(mut self, mode: CompMode) -> Self {
        self.comp_mode = mode;
        self
    }
}

/// Settings of the simulated-annealing local search
#[derive(Clone, Debug, PartialEq)]
pub struct McmcConfig {
    /// Number of proposals
    pub budget: usize,
    /// Sensitivity of the acceptance probability to cost increases
    pub alpha: f32,
    pub initial_temperature: f32,
    /// Temperature at step `i` is `initial_temperature * cooling_rate^i`
    pub cooling_rate: f32,
    /// Spread a change to neighboring operators
    pub use_propagation: bool,
    pub seed: u64,
    pub comp_mode: CompMode,
}

impl Default for McmcConfig {
    fn default() -> Self {
        Self {
            budget: 1000,
            alpha: 0.05,
            initial_temperature: 1.0,
            cooling_rate: 0.995,
            use_propagation: true,
            seed: 0,
            comp_mode: CompMode::Training,
        }
    }
}

impl McmcConfig {
    /// Defaults with `PCG_MCMC_*` environment overrides applied
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Some(budget) = env_override("PCG_MCMC_BUDGET")? {
            config.budget = budget;
        }
        if let Some(seed) = env_override("PCG_MCMC_SEED")? {
            config.seed = seed;
        }
        Ok(config)
    }

    pub fn with_budget(mut self, budget: usize) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_alpha(mut self, alpha: f32) -> Self {
        self.alpha = alpha;
        self
    }

    pub fn with_temperature(mut self, initial: f32, cooling_rate: f32) -> Self {
        self.initial_temperature = initial;
        self.cooling_rate = cooling_rate;
        self
    }

    pub fn with_propagation(mut self, enabled: bool) -> Self {
        self.use_propagation = enabled;
        self
    }

    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    pub fn with_comp_mode(mut self, mode: CompMode) -> Self {
        self.comp_mode = mode;
        self
    }

    /// Temperature used at step `step`
    pub fn temperature_at(&self, step: usize) -> f32 {
        self.initial_temperature * self.cooling_rate.powi(step.min(i32::MAX as usize) as i32)
    }
}
