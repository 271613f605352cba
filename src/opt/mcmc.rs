//! Simulated-annealing search over per-operator configs
//!
//! Works on a fixed graph. Each step moves one operator to another legal
//! [`ParallelConfig`], sometimes dragging neighbors along, and prices the
//! mapping by simulating its execution.

use std::collections::BTreeMap;
use std::time::Instant;

use log::{debug, info};
use rand::distributions::{Distribution, WeightedIndex};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rustc_hash::{FxHashMap, FxHashSet};

use crate::config::McmcConfig;
use crate::cost::CostOracle;
use crate::error::{Result, SearchError};
use crate::graph::{Graph, Node};
use crate::machine::{DeviceType, MachineResource, MachineView, ParallelConfig};
use crate::ops::ParallelTensorShape;
use crate::opt::progress::{
    FinishInfo, IndicatifProgress, NoOpProgress, ProgressState, SearchProgress, StopReason,
};
use crate::plan::Plan;

/// Chance that a move also spreads to a neighbor
pub const PROPAGATION_CHANCE: f64 = 0.25;
/// Chance that spreading goes on for one more hop
pub const CONTINUE_PROPAGATION_CHANCE: f64 = 0.75;
/// Exponent applied to output size when picking the neighbor to spread to
pub const PROPAGATION_SIZE_WEIGHT: f64 = 1.0;

/// The graph in index form, built once per run
struct Problem {
    nodes: Vec<Node>,
    /// Legal configs per node, in view order
    legal: Vec<Vec<ParallelConfig>>,
    /// (producer, tensor shape) per incoming edge; control edges carry none
    inputs: Vec<Vec<(usize, Option<ParallelTensorShape>)>>,
    neighbors: Vec<Vec<usize>>,
    /// Output bytes, for propagation
    sizes: Vec<f64>,
}

/// Index of the dimension a config partitions, for a given output shape
fn split_dim(shape: Option<&ParallelTensorShape>) -> (usize, usize) {
    let ndims = shape.map_or(1, |s| s.num_dims());
    let dim = shape
        .and_then(|s| s.dims().iter().position(|d| d.degree > 1))
        .unwrap_or(0);
    (ndims, dim)
}

pub struct McmcOptimizer<O, P = IndicatifProgress>
where
    O: CostOracle,
    P: SearchProgress,
{
    oracle: O,
    cluster: MachineResource,
    config: McmcConfig,
    all_views: Vec<MachineView>,
    progress: Option<P>,
}

impl<O: CostOracle> McmcOptimizer<O, IndicatifProgress> {
    pub fn new(oracle: O, cluster: &MachineResource) -> Self {
        Self {
            oracle,
            cluster: cluster.clone(),
            config: McmcConfig::default(),
            all_views: MachineView::all_valid_views(
                cluster.num_nodes,
                cluster.all_gpus_per_node,
                cluster.all_cpus_per_node,
            ),
            progress: if cfg!(debug_assertions) {
                Some(IndicatifProgress::new())
            } else {
                None
            },
        }
    }
}

impl<O, P> McmcOptimizer<O, P>
where
    O: CostOracle,
    P: SearchProgress,
{
    pub fn with_config(mut self, config: McmcConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_progress<P2: SearchProgress>(self, progress: P2) -> McmcOptimizer<O, P2> {
        McmcOptimizer {
            oracle: self.oracle,
            cluster: self.cluster,
            config: self.config,
            all_views: self.all_views,
            progress: Some(progress),
        }
    }

    pub fn without_progress(self) -> McmcOptimizer<O, NoOpProgress> {
        McmcOptimizer {
            oracle: self.oracle,
            cluster: self.cluster,
            config: self.config,
            all_views: self.all_views,
            progress: None,
        }
    }

    pub fn config(&self) -> &McmcConfig {
        &self.config
    }

    /// Every config the search may give `node`
    pub fn legal_configs(&self, node: &Node) -> Vec<ParallelConfig> {
        let parts = node.op.output_parts();
        let (ndims, dim) = split_dim(node.op.output_shapes().first());
        self.all_views
            .iter()
            .filter(|v| v.num_parts() == parts && self.cluster.is_valid_view(v))
            .map(|v| ParallelConfig::from_machine_view(v, ndims, dim))
            .collect()
    }

    fn problem(&self, graph: &Graph) -> Result<Problem> {
        let nodes = graph.topo_order()?;
        let index: FxHashMap<&Node, usize> = nodes.iter().enumerate().map(|(i, n)| (n, i)).collect();

        let mut legal = Vec::with_capacity(nodes.len());
        let mut inputs = Vec::with_capacity(nodes.len());
        let mut neighbors = Vec::with_capacity(nodes.len());
        let mut sizes = Vec::with_capacity(nodes.len());
        for node in &nodes {
            let configs = self.legal_configs(node);
            if configs.is_empty() {
                debug!("{} has no legal config on this cluster", node);
                return Err(SearchError::NoFeasiblePlan);
            }
            legal.push(configs);
            inputs.push(
                graph
                    .in_edges(node)
                    .map(|e| (index[&e.src], graph.edge_shape(e).cloned()))
                    .collect(),
            );
            let mut adjacent: Vec<usize> = graph
                .predecessors(node)
                .iter()
                .chain(graph.successors(node).iter())
                .map(|n| index[n])
                .collect();
            adjacent.sort_unstable();
            adjacent.dedup();
            neighbors.push(adjacent);
            sizes.push(
                node.op
                    .output_shapes()
                    .first()
                    .map_or(1.0, |s| s.size_in_bytes().max(1) as f64),
            );
        }
        Ok(Problem {
            nodes,
            legal,
            inputs,
            neighbors,
            sizes,
        })
    }

    /// Makespan of `mapping`: operators run in topological order, each once
    /// its inputs have arrived and all of its devices are free.
    fn simulate(&self, problem: &Problem, mapping: &[ParallelConfig]) -> f32 {
        let mut views = Vec::with_capacity(mapping.len());
        for config in mapping {
            match config.to_machine_view() {
                Some(view) => views.push(view),
                None => return f32::INFINITY,
            }
        }

        let mut device_free: FxHashMap<(DeviceType, usize), f32> = FxHashMap::default();
        let mut finish = vec![0.0f32; mapping.len()];
        for (i, node) in problem.nodes.iter().enumerate() {
            let view = &views[i];
            let Some(metrics) = self.oracle.measure_config(&node.op, &mapping[i], &self.cluster) else {
                return f32::INFINITY;
            };
            let compute = metrics.total_time(self.config.comp_mode);

            let mut ready = 0.0f32;
            for (src, shape) in &problem.inputs[i] {
                let transfer = shape
                    .as_ref()
                    .map_or(0.0, |s| self.oracle.transfer_cost(s, &views[*src], view));
                ready = ready.max(finish[*src] + transfer);
            }
            let devices = view.device_ids();
            let start = devices
                .iter()
                .filter_map(|&d| device_free.get(&(view.device_type(), d)))
                .fold(ready, |acc, &t| acc.max(t));
            let end = start + compute;
            for d in devices {
                device_free.insert((view.device_type(), d), end);
            }
            finish[i] = end;
        }
        finish.into_iter().fold(0.0, f32::max)
    }

    /// Copies the config at `start` along a random walk over neighbors,
    /// preferring neighbors with large outputs.
    fn propagate(&self, problem: &Problem, mapping: &mut [ParallelConfig], start: usize, rng: &mut StdRng) {
        let mut visited: FxHashSet<usize> = FxHashSet::default();
        visited.insert(start);
        let mut current = start;
        loop {
            let candidates: Vec<usize> = problem.neighbors[current]
                .iter()
                .copied()
                .filter(|n| !visited.contains(n))
                .collect();
            if candidates.is_empty() {
                return;
            }
            let weights = candidates
                .iter()
                .map(|&n| problem.sizes[n].powf(PROPAGATION_SIZE_WEIGHT));
            let Ok(dist) = WeightedIndex::new(weights) else {
                return;
            };
            let next = candidates[dist.sample(rng)];

            let view = mapping[current].to_machine_view();
            if let Some(config) = problem.legal[next]
                .iter()
                .find(|c| c.to_machine_view() == view)
            {
                mapping[next] = config.clone();
            }
            visited.insert(next);
            current = next;
            if rng.gen::<f64>() >= CONTINUE_PROPAGATION_CHANCE {
                return;
            }
        }
    }

    /// Anneals from the lowest-numbered legal config of every operator
    pub fn optimize(&mut self, graph: &Graph) -> Result<Plan> {
        self.optimize_from(graph, &BTreeMap::new())
    }

    /// Anneals from `initial`; operators it does not cover start on their
    /// first legal config.
    ///
    /// With a fixed seed the first `N` steps of a run are the same whatever
    /// the budget, so a larger budget never returns a worse plan.
    pub fn optimize_from(
        &mut self,
        graph: &Graph,
        initial: &BTreeMap<Node, ParallelConfig>,
    ) -> Result<Plan> {
        if graph.is_empty() {
            return Err(SearchError::MalformedGraph("graph has no nodes".to_string()));
        }
        let problem = self.problem(graph)?;
        let started = Instant::now();
        let budget = self.config.budget;
        info!(
            "Local search started ({} operators, budget={}, seed={})",
            problem.nodes.len(),
            budget,
            self.config.seed
        );
        if let Some(ref mut progress) = self.progress {
            progress.start(budget, "Local search");
        }

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut current: Vec<ParallelConfig> = problem
            .nodes
            .iter()
            .zip(&problem.legal)
            .map(|(node, legal)| initial.get(node).unwrap_or(&legal[0]).clone())
            .collect();
        let mut current_cost = self.simulate(&problem, &current);
        let mut best = current.clone();
        let mut best_cost = current_cost;

        for step in 0..budget {
            let mut candidate = current.clone();
            let i = rng.gen_range(0..candidate.len());
            let choice = rng.gen_range(0..problem.legal[i].len());
            candidate[i] = problem.legal[i][choice].clone();
            if self.config.use_propagation && rng.gen::<f64>() < PROPAGATION_CHANCE {
                self.propagate(&problem, &mut candidate, i, &mut rng);
            }

            let cost = self.simulate(&problem, &candidate);
            let temperature = self.config.temperature_at(step);
            // drawn every step so runs of different length stay in lockstep
            let roll: f32 = rng.gen();
            let accept = cost < current_cost
                || roll < (-(cost - current_cost) / (self.config.alpha * temperature)).exp();
            if accept {
                current = candidate;
                current_cost = cost;
                if current_cost < best_cost {
                    debug!("Step {}: best cost {:.3e} -> {:.3e}", step, best_cost, current_cost);
                    best = current.clone();
                    best_cost = current_cost;
                }
            }

            if let Some(ref mut progress) = self.progress {
                progress.update(
                    &ProgressState::new(step + 1, budget, best_cost)
                        .with_detail(format!("T={:.3e}, current {:.3e}", temperature, current_cost)),
                );
            }
        }

        if let Some(ref mut progress) = self.progress {
            progress.finish(
                &FinishInfo::new(
                    started.elapsed(),
                    budget,
                    budget,
                    StopReason::BudgetExhausted,
                    "Local search",
                )
                .with_best_cost(best_cost),
            );
        }

        if !best_cost.is_finite() {
            info!("Local search found no feasible mapping");
            return Err(SearchError::NoFeasiblePlan);
        }
        info!("Local search complete: best cost {:.3e}", best_cost);

        let mut views = BTreeMap::new();
        for (node, config) in problem.nodes.iter().zip(&best) {
            // every finite mapping converted to views while simulating
            if let Some(view) = config.to_machine_view() {
                views.insert(node.clone(), view);
            }
        }
        Ok(Plan::new(graph.clone(), views, best_cost))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::analytic::AnalyticCostOracle;
    use crate::cost::CostMetrics;
    use crate::graph::OperatorRegistry;
    use crate::ops::{BinaryOp, DataType, Operator, UnaryOp};
    use rstest::rstest;

    fn branches(reg: &OperatorRegistry) -> Graph {
        let shape = ParallelTensorShape::new(&[64, 64], DataType::F32);
        let x = reg.input(&shape).unwrap();
        let a = reg.element_unary(&shape, UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape, UnaryOp::Tanh).unwrap();
        let add = reg.element_binary(&shape, &shape, BinaryOp::Add).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&x, 0, &b, 0);
        g.add_edge(&a, 0, &add, 0);
        g.add_edge(&b, 0, &add, 1);
        g
    }

    #[rstest]
    #[case(true)]
    #[case(false)]
    fn test_more_budget_never_hurts(#[case] propagation: bool) {
        let cluster = MachineResource::new(2, 2, 1);
        let reg = OperatorRegistry::new(&cluster);
        let g = branches(&reg);
        let oracle = AnalyticCostOracle::new(&cluster);
        let run = |budget: usize| {
            McmcOptimizer::new(&oracle, &cluster)
                .with_config(
                    McmcConfig::default()
                        .with_budget(budget)
                        .with_seed(11)
                        .with_propagation(propagation),
                )
                .without_progress()
                .optimize(&g)
                .unwrap()
                .cost()
        };
        let (short, long) = (run(25), run(50));
        assert!(long <= short);
    }

    #[test]
    fn test_same_seed_same_result() {
        let cluster = MachineResource::new(1, 4, 0);
        let reg = OperatorRegistry::new(&cluster);
        let g = branches(&reg);
        let oracle = AnalyticCostOracle::new(&cluster);
        let run = || {
            McmcOptimizer::new(&oracle, &cluster)
                .with_config(McmcConfig::default().with_budget(40).with_seed(3))
                .without_progress()
                .optimize(&g)
                .unwrap()
        };
        let (p1, p2) = (run(), run());
        assert_eq!(p1.cost(), p2.cost());
        assert_eq!(
            p1.views().values().collect::<Vec<_>>(),
            p2.views().values().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_branches_spread_over_devices() {
        struct Flat;
        impl CostOracle for Flat {
            fn measure(&self, _: &Operator, _: &MachineView, _: &MachineResource) -> Option<CostMetrics> {
                Some(CostMetrics::forward(1.0))
            }
        }
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let g = branches(&reg);
        let plan = McmcOptimizer::new(Flat, &cluster)
            .with_config(McmcConfig::default().with_budget(200).with_seed(5))
            .without_progress()
            .optimize(&g)
            .unwrap();
        // input, both branches side by side, then the add
        assert_eq!(plan.cost(), 3.0);
        assert_eq!(plan.views().len(), 4);
    }

    #[test]
    fn test_default_optimizer_reports_progress_in_debug_builds() {
        let cluster = MachineResource::new(1, 1, 0);
        let optimizer = McmcOptimizer::new(AnalyticCostOracle::new(&cluster), &cluster);
        assert_eq!(optimizer.progress.is_some(), cfg!(debug_assertions));
    }

    #[test]
    fn test_no_devices_is_infeasible() {
        let cluster = MachineResource::new(1, 0, 0);
        let reg = OperatorRegistry::new(&cluster);
        let g = branches(&reg);
        let result = McmcOptimizer::new(AnalyticCostOracle::new(&cluster), &cluster)
            .without_progress()
            .optimize(&g);
        assert!(matches!(result, Err(SearchError::NoFeasiblePlan)));
    }

    #[test]
    fn test_simulation_prices_configs_through_the_oracle() {
        // refuses any config spread over more than one device
        struct SingleDeviceOnly;
        impl CostOracle for SingleDeviceOnly {
            fn measure(&self, _: &Operator, _: &MachineView, _: &MachineResource) -> Option<CostMetrics> {
                Some(CostMetrics::forward(1.0))
            }

            fn measure_config(
                &self,
                _: &Operator,
                config: &ParallelConfig,
                _: &MachineResource,
            ) -> Option<CostMetrics> {
                (config.device_ids.len() == 1).then(|| CostMetrics::forward(1.0))
            }
        }
        let cluster = MachineResource::new(1, 4, 0);
        let reg = OperatorRegistry::new(&cluster);
        let shape = ParallelTensorShape::new(&[64, 64], DataType::F32);
        let x = reg.input(&shape).unwrap();
        let split = reg.repartition(&shape, 0, 2).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &split, 0);

        let optimizer = McmcOptimizer::new(SingleDeviceOnly, &cluster).without_progress();
        let problem = optimizer.problem(&g).unwrap();
        let mapping: Vec<ParallelConfig> = problem.legal.iter().map(|l| l[0].clone()).collect();
        assert!(optimizer.simulate(&problem, &mapping).is_infinite());
    }

    #[test]
    fn test_simulated_makespan_serializes_shared_device() {
        struct Flat;
        impl CostOracle for Flat {
            fn measure(&self, _: &Operator, _: &MachineView, _: &MachineResource) -> Option<CostMetrics> {
                Some(CostMetrics::forward(1.0))
            }
        }
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let g = branches(&reg);
        let optimizer = McmcOptimizer::new(Flat, &cluster).without_progress();
        let problem = optimizer.problem(&g).unwrap();
        let everything_on_gpu0: Vec<ParallelConfig> = problem.legal.iter().map(|l| l[0].clone()).collect();
        assert_eq!(optimizer.simulate(&problem, &everything_on_gpu0), 4.0);
    }
}
