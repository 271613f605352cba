//! Best-first search over graph rewrites
//!
//! Candidates wait in a priority queue ordered by a static estimate; the
//! cheapest-looking one is priced with the DP search next. A priced
//! candidate within `alpha` of the best cost is expanded with the
//! suggesters' rewrites.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::time::Instant;

use log::{debug, info, trace};
use rayon::prelude::*;
use rustc_hash::FxHashSet;

use crate::config::SearchConfig;
use crate::cost::CostOracle;
use crate::error::{Result, SearchError};
use crate::graph::{Graph, OperatorRegistry};
use crate::machine::MachineResource;
use crate::opt::dp::SearchHelper;
use crate::opt::graph::estimator::StaticCostEstimator;
use crate::opt::graph::history::{SearchHistory, SearchSnapshot};
use crate::opt::graph::suggesters::{data_parallel_variant, CompositeSuggester};
use crate::opt::graph::{GraphCostEstimator, GraphSuggester};
use crate::opt::progress::{
    FinishInfo, IndicatifProgress, NoOpProgress, ProgressState, SearchProgress, StopReason,
};
use crate::plan::Plan;

/// A graph waiting to be priced
struct Candidate {
    estimate: f32,
    /// Insertion order; earlier wins ties
    seq: usize,
    graph: Graph,
    suggester_name: Option<String>,
    description: String,
}

impl PartialEq for Candidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for Candidate {}

impl PartialOrd for Candidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Candidate {
    // reversed: BinaryHeap pops the cheapest estimate first
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .estimate
            .total_cmp(&self.estimate)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

/// Searches graph rewrites for the cheapest plan.
///
/// # Termination
///
/// The search stops when:
/// - `budget` candidates have been priced
/// - the optional time limit has passed; the input graph is always priced
/// - no candidate is left to price
/// - `max_no_improvement` consecutive candidates failed to beat the best
///   cost by more than `improvement_threshold`
pub struct GraphSearchHelper<O, S = CompositeSuggester, E = StaticCostEstimator, P = IndicatifProgress>
where
    O: CostOracle,
    S: GraphSuggester,
    E: GraphCostEstimator,
    P: SearchProgress,
{
    dp: SearchHelper<O>,
    registry: Arc<OperatorRegistry>,
    suggester: S,
    estimator: E,
    config: SearchConfig,
    progress: Option<P>,
    history: Option<SearchHistory>,
}

impl<O: CostOracle> GraphSearchHelper<O, CompositeSuggester, StaticCostEstimator, IndicatifProgress> {
    /// A search with the default rewrites over the registry's cluster
    pub fn new(oracle: O, registry: Arc<OperatorRegistry>) -> Self {
        let config = SearchConfig::default();
        let dp = SearchHelper::new(oracle, registry.cluster()).with_comp_mode(config.comp_mode);
        Self {
            dp,
            registry,
            suggester: CompositeSuggester::default_rewrites(),
            estimator: StaticCostEstimator::new(),
            config,
            progress: if cfg!(debug_assertions) {
                Some(IndicatifProgress::new())
            } else {
                None
            },
            history: None,
        }
    }
}

impl<O, S, E, P> GraphSearchHelper<O, S, E, P>
where
    O: CostOracle,
    S: GraphSuggester,
    E: GraphCostEstimator,
    P: SearchProgress,
{
    pub fn with_config(mut self, config: SearchConfig) -> Self {
        self.dp = self.dp.with_comp_mode(config.comp_mode);
        self.config = config;
        self
    }

    pub fn with_suggester<S2: GraphSuggester>(self, suggester: S2) -> GraphSearchHelper<O, S2, E, P> {
        GraphSearchHelper {
            dp: self.dp,
            registry: self.registry,
            suggester,
            estimator: self.estimator,
            config: self.config,
            progress: self.progress,
            history: self.history,
        }
    }

    pub fn with_estimator<E2: GraphCostEstimator>(self, estimator: E2) -> GraphSearchHelper<O, S, E2, P> {
        GraphSearchHelper {
            dp: self.dp,
            registry: self.registry,
            suggester: self.suggester,
            estimator,
            config: self.config,
            progress: self.progress,
            history: self.history,
        }
    }

    pub fn with_progress<P2: SearchProgress>(self, progress: P2) -> GraphSearchHelper<O, S, E, P2> {
        GraphSearchHelper {
            dp: self.dp,
            registry: self.registry,
            suggester: self.suggester,
            estimator: self.estimator,
            config: self.config,
            progress: Some(progress),
            history: self.history,
        }
    }

    pub fn without_progress(self) -> GraphSearchHelper<O, S, E, NoOpProgress> {
        GraphSearchHelper {
            dp: self.dp,
            registry: self.registry,
            suggester: self.suggester,
            estimator: self.estimator,
            config: self.config,
            progress: None,
            history: self.history,
        }
    }

    /// Record every priced candidate
    pub fn with_history(mut self) -> Self {
        self.history = Some(SearchHistory::new());
        self
    }

    /// Returns `None` if recording was not enabled or the history was taken
    pub fn take_history(&mut self) -> Option<SearchHistory> {
        self.history.take()
    }

    pub fn config(&self) -> &SearchConfig {
        &self.config
    }

    /// The DP evaluator, shared by every candidate of this session
    pub fn dp(&self) -> &SearchHelper<O> {
        &self.dp
    }

    /// Cheapest plan over `graph` and its rewrites that fits `resources`.
    ///
    /// Returns the best plan found when a budget runs out, and
    /// [`SearchError::NoFeasiblePlan`] if no candidate fits at all.
    pub fn graph_optimize(&mut self, graph: &Graph, resources: &MachineResource) -> Result<Plan> {
        graph.check_correctness()?;
        let start = Instant::now();
        info!(
            "Graph search started (budget={}, alpha={}, only_data_parallel={})",
            self.config.budget, self.config.alpha, self.config.only_data_parallel
        );
        if let Some(ref mut progress) = self.progress {
            progress.start(self.config.budget, "Graph search");
        }

        let (best, evaluated, reason) = match self.search(graph, resources, start) {
            Ok(outcome) => outcome,
            Err(e) => {
                if let Some(ref mut progress) = self.progress {
                    progress.abort();
                }
                return Err(e);
            }
        };
        let best_cost = best.as_ref().map_or(f32::INFINITY, |p| p.cost());
        if let Some(ref mut progress) = self.progress {
            progress.finish(
                &FinishInfo::new(start.elapsed(), evaluated, self.config.budget, reason, "Graph search")
                    .with_best_cost(best_cost),
            );
        }

        let stats = self.dp.memo_stats();
        match best {
            Some(plan) => {
                info!(
                    "Graph search complete: cost {:.2e} after {} candidates, {} ({} memo entries, {} hits)",
                    plan.cost(),
                    evaluated,
                    reason,
                    stats.entries,
                    stats.hits
                );
                Ok(plan)
            }
            None => {
                info!("Graph search found no feasible plan in {} candidates", evaluated);
                Err(SearchError::NoFeasiblePlan)
            }
        }
    }

    /// The search loop: best plan, candidates priced and why it stopped
    fn search(
        &mut self,
        graph: &Graph,
        resources: &MachineResource,
        start: Instant,
    ) -> Result<(Option<Plan>, usize, StopReason)> {
        let deadline = self.config.time_limit.map(|limit| start + limit);
        let mut seen: FxHashSet<u64> = FxHashSet::default();
        let mut queue = BinaryHeap::new();
        let mut seq = 0;
        seen.insert(graph.structural_hash()?);
        queue.push(Candidate {
            estimate: self.estimator.estimate(graph),
            seq,
            graph: graph.clone(),
            suggester_name: None,
            description: "input graph".to_string(),
        });

        if self.config.only_data_parallel {
            let limit = resources.total_gpus().max(resources.total_cpus());
            for degree in 2..=limit {
                let Some(variant) = data_parallel_variant(graph, &self.registry, degree) else {
                    continue;
                };
                if seen.insert(variant.structural_hash()?) {
                    seq += 1;
                    queue.push(Candidate {
                        estimate: self.estimator.estimate(&variant),
                        seq,
                        graph: variant,
                        suggester_name: Some("data_parallel".to_string()),
                        description: format!("data parallel x{}", degree),
                    });
                }
            }
        }

        let mut best: Option<Plan> = None;
        let mut evaluated = 0;
        let mut no_improvement = 0;
        let mut reason = StopReason::BudgetExhausted;

        'search: while evaluated < self.config.budget {
            if evaluated > 0 && deadline.is_some_and(|d| Instant::now() >= d) {
                info!("Time limit reached after {} candidates", evaluated);
                reason = StopReason::Deadline;
                break;
            }
            let batch_size = self.config.batch_size.min(self.config.budget - evaluated);
            let batch: Vec<Candidate> = std::iter::from_fn(|| queue.pop()).take(batch_size).collect();
            if batch.is_empty() {
                info!("No more candidates after {} evaluations", evaluated);
                reason = StopReason::Exhausted;
                break;
            }

            let plans = self.evaluate(&batch, resources)?;
            for (candidate, plan) in batch.into_iter().zip(plans) {
                let step = evaluated;
                evaluated += 1;
                let best_cost = best.as_ref().map_or(f32::INFINITY, |p| p.cost());
                let cost = plan.as_ref().map_or(f32::INFINITY, |p| p.cost());
                let name = candidate.suggester_name.as_deref().unwrap_or("initial");

                let improved = cost < best_cost * (1.0 - self.config.improvement_threshold);
                if improved {
                    if best_cost.is_finite() {
                        info!(
                            "Step {}: cost improved {:.2e} -> {:.2e} ({:+.1}%) via {} - {}",
                            step,
                            best_cost,
                            cost,
                            (cost - best_cost) / best_cost * 100.0,
                            name,
                            candidate.description
                        );
                    } else {
                        info!("Step {}: first feasible plan, cost {:.2e}", step, cost);
                    }
                    no_improvement = 0;
                } else {
                    no_improvement += 1;
                    debug!(
                        "Step {}: no improvement (cost={:.2e}, best={:.2e}, {} in a row)",
                        step, cost, best_cost, no_improvement
                    );
                }
                if cost < best_cost {
                    best = plan;
                }

                if let Some(ref mut history) = self.history {
                    let snapshot = SearchSnapshot::new(step, candidate.graph.clone(), cost, &candidate.description)
                        .with_candidates(queue.len())
                        .with_improved(improved);
                    history.add_snapshot(match candidate.suggester_name.clone() {
                        Some(name) => snapshot.with_suggester(name),
                        None => snapshot,
                    });
                }

                let bound = best.as_ref().map_or(f32::INFINITY, |p| p.cost()) * self.config.alpha;
                if cost <= bound && !self.config.only_data_parallel {
                    for result in self.suggester.suggest(&candidate.graph, &self.registry) {
                        if !seen.insert(result.graph.structural_hash()?) {
                            continue;
                        }
                        seq += 1;
                        trace!("queued {} - {}", result.suggester_name, result.description);
                        queue.push(Candidate {
                            estimate: self.estimator.estimate(&result.graph),
                            seq,
                            graph: result.graph,
                            suggester_name: Some(result.suggester_name),
                            description: result.description,
                        });
                    }
                } else {
                    trace!("Step {}: pruned (cost={:.2e}, bound={:.2e})", step, cost, bound);
                }

                if self
                    .config
                    .max_no_improvement
                    .is_some_and(|limit| no_improvement >= limit)
                {
                    info!("No cost improvement for {} candidates - search complete", no_improvement);
                    reason = StopReason::NoImprovement;
                    self.report(evaluated, best.as_ref(), queue.len());
                    break 'search;
                }
            }
            self.report(evaluated, best.as_ref(), queue.len());
        }
        Ok((best, evaluated, reason))
    }

    fn report(&mut self, evaluated: usize, best: Option<&Plan>, queued: usize) {
        if let Some(ref mut progress) = self.progress {
            let stats = self.dp.memo_stats();
            progress.update(
                &ProgressState::new(
                    evaluated,
                    self.config.budget,
                    best.map_or(f32::INFINITY, |p| p.cost()),
                )
                .with_detail(format!(
                    "{} queued, memo {} entries, {} hits",
                    queued, stats.entries, stats.hits
                )),
            );
        }
    }

    /// Prices a batch; infeasible candidates yield `None`
    fn evaluate(&self, batch: &[Candidate], resources: &MachineResource) -> Result<Vec<Option<Plan>>> {
        let dp = &self.dp;
        let price = |candidate: &Candidate| match dp.optimal_plan(&candidate.graph, resources) {
            Ok(plan) => Ok(Some(plan)),
            Err(SearchError::NoFeasiblePlan) => Ok(None),
            Err(e) => Err(e),
        };
        if batch.len() > 1 {
            batch.par_iter().map(price).collect()
        } else {
            batch.iter().map(price).collect()
        }
    }
}
