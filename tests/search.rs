mod common;

use std::sync::Arc;

use common::{init_logger, mlp};
use pcg_search::cost::{AnalyticCostOracle, CachedCostOracle};
use pcg_search::graph::OperatorRegistry;
use pcg_search::machine::MachineResource;
use pcg_search::opt::{GraphSearchHelper, McmcOptimizer, SearchHelper};
use pcg_search::{McmcConfig, Plan, SearchConfig, SearchError};
use rstest::rstest;

fn mcmc_cost(budget: usize, seed: u64, propagate: bool) -> f32 {
    let cluster = MachineResource::new(1, 4, 0);
    let reg = OperatorRegistry::new(&cluster);
    let (g, _) = mlp(&reg);
    let oracle = AnalyticCostOracle::new(&cluster);
    let config = McmcConfig::default()
        .with_budget(budget)
        .with_seed(seed)
        .with_propagation(propagate);
    McmcOptimizer::new(&oracle, &cluster)
        .with_config(config)
        .without_progress()
        .optimize(&g)
        .unwrap()
        .cost()
}

#[rstest]
#[case(10, 1, false)]
#[case(25, 7, true)]
#[case(40, 42, false)]
fn test_mcmc_longer_runs_never_do_worse(#[case] n: usize, #[case] seed: u64, #[case] propagate: bool) {
    init_logger();
    let short = mcmc_cost(n, seed, propagate);
    let long = mcmc_cost(2 * n, seed, propagate);
    assert!(long <= short, "budget {} gave {}, budget {} gave {}", n, short, 2 * n, long);
}

#[test]
fn test_graph_search_beats_or_matches_fixed_graph() {
    init_logger();
    let cluster = MachineResource::new(1, 4, 0);
    let reg = Arc::new(OperatorRegistry::new(&cluster));
    let (g, _) = mlp(&reg);
    let oracle = CachedCostOracle::new(AnalyticCostOracle::new(&cluster));

    let fixed = SearchHelper::new(&oracle, &cluster)
        .optimal_plan(&g, &cluster)
        .unwrap();
    let mut search = GraphSearchHelper::new(&oracle, Arc::clone(&reg))
        .with_config(SearchConfig::default().with_budget(20).with_batch_size(4))
        .without_progress();
    let best = search.graph_optimize(&g, &cluster).unwrap();

    assert!(best.cost() <= fixed.cost());
    assert!(best.graph().check_correctness().is_ok());
    for node in best.graph().nodes() {
        let view = best.view_of(node).unwrap();
        assert!(cluster.is_valid_view(view), "{} placed on {}", node, view);
    }
    assert!(oracle.stats().hits > 0);
}

#[test]
fn test_data_parallel_fallback_finds_a_plan() {
    let cluster = MachineResource::new(2, 2, 0);
    let reg = Arc::new(OperatorRegistry::new(&cluster));
    let (g, _) = mlp(&reg);
    let oracle = AnalyticCostOracle::new(&cluster);
    let mut search = GraphSearchHelper::new(&oracle, reg)
        .with_config(SearchConfig::default().with_only_data_parallel(true))
        .without_progress();
    let plan = search.graph_optimize(&g, &cluster).unwrap();
    assert!(plan.cost().is_finite());
}

#[test]
fn test_searched_plan_survives_serialization() {
    let cluster = MachineResource::new(1, 2, 0);
    let reg = Arc::new(OperatorRegistry::new(&cluster));
    let (g, _) = mlp(&reg);
    let oracle = AnalyticCostOracle::new(&cluster);
    let mut search = GraphSearchHelper::new(&oracle, reg)
        .with_config(SearchConfig::default().with_budget(8))
        .without_progress();
    let plan = search.graph_optimize(&g, &cluster).unwrap();

    let bytes = plan.to_bytes().unwrap();
    let loaded = Plan::from_bytes(&bytes, plan.graph()).unwrap();
    assert_eq!(loaded.cost(), plan.cost());
    assert_eq!(loaded.views(), plan.views());

    // the same bytes do not fit a different graph
    let other_reg = OperatorRegistry::new(&cluster);
    let (other, _) = mlp(&other_reg);
    let mut smaller = other.clone();
    let last = other.sinks()[0].clone();
    smaller.remove_node(&last);
    assert!(matches!(
        Plan::from_bytes(&bytes, &smaller),
        Err(SearchError::PlanMismatch(_))
    ));
}

#[test]
fn test_no_devices_means_no_plan() {
    let cluster = MachineResource::new(1, 0, 0);
    let reg = OperatorRegistry::new(&cluster);
    let (g, _) = mlp(&reg);
    let oracle = AnalyticCostOracle::new(&cluster);
    let result = McmcOptimizer::new(&oracle, &cluster)
        .with_config(McmcConfig::default().with_budget(5))
        .without_progress()
        .optimize(&g);
    assert!(matches!(result, Err(SearchError::NoFeasiblePlan)));
}
