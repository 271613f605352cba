//! Memoized series-parallel search for the cheapest view assignment
//!
//! [`SearchHelper::graph_cost`] solves the subgraph between a source and a
//! sink whose views are fixed. The subgraph is split at a bottleneck node
//! (sequential composition: costs add) or into independent branches
//! (parallel composition: branches on disjoint halves of the resources run
//! concurrently, so the slower one counts). Every subproblem is memoized,
//! which keeps the search polynomial in the number of nodes.

use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};

use log::{debug, trace, warn};
use rustc_hash::FxHashMap;

use crate::cost::cache::CacheStats;
use crate::cost::{CompMode, CostOracle};
use crate::error::{Result, SearchError};
use crate::graph::{Edge, Graph, Node};
use crate::machine::{MachineResource, MachineView};
use crate::ops::Operator;
use crate::plan::Plan;

pub mod memo;

pub use memo::{MemoKey, MemoTable, SubgraphPlan};

/// Dynamic-programming evaluator of a fixed graph.
///
/// One helper serves one optimization session: its memo table assumes the
/// oracle and the cluster do not change.
pub struct SearchHelper<O> {
    oracle: O,
    cluster: MachineResource,
    all_views: Vec<MachineView>,
    comp_mode: CompMode,
    memo: MemoTable,
    candidates: RwLock<FxHashMap<(MachineResource, usize), Arc<Vec<MachineView>>>>,
}

impl<O: CostOracle> SearchHelper<O> {
    pub fn new(oracle: O, cluster: &MachineResource) -> Self {
        let all_views = MachineView::all_valid_views(
            cluster.num_nodes,
            cluster.all_gpus_per_node,
            cluster.all_cpus_per_node,
        );
        Self {
            oracle,
            cluster: cluster.clone(),
            all_views,
            comp_mode: CompMode::Training,
            memo: MemoTable::new(),
            candidates: RwLock::new(FxHashMap::default()),
        }
    }

    pub fn with_comp_mode(mut self, mode: CompMode) -> Self {
        self.comp_mode = mode;
        self
    }

    pub fn oracle(&self) -> &O {
        &self.oracle
    }

    pub fn cluster(&self) -> &MachineResource {
        &self.cluster
    }

    pub fn comp_mode(&self) -> CompMode {
        self.comp_mode
    }

    pub fn memo_stats(&self) -> CacheStats {
        self.memo.stats()
    }

    /// Views inside `resources` covering exactly `parts` devices, in
    /// tie-break order.
    pub fn candidate_views(&self, resources: &MachineResource, parts: usize) -> Arc<Vec<MachineView>> {
        let key = (resources.clone(), parts);
        if let Some(views) = self.candidates.read().unwrap().get(&key) {
            return Arc::clone(views);
        }
        let mut views: Vec<MachineView> = self
            .all_views
            .iter()
            .filter(|v| v.num_parts() == parts && resources.is_valid_view(v))
            .cloned()
            .collect();
        views.sort_by(|a, b| a.num_parts().cmp(&b.num_parts()).then_with(|| a.cmp(b)));
        let views = Arc::new(views);
        self.candidates
            .write()
            .unwrap()
            .entry(key)
            .or_insert(views)
            .clone()
    }

    fn views_for(&self, op: &Operator, resources: &MachineResource) -> Arc<Vec<MachineView>> {
        if op.is_virtual() {
            // endpoints cost nothing anywhere; any one device will do
            let any = self.candidate_views(resources, 1);
            return Arc::new(any.iter().take(1).cloned().collect());
        }
        self.candidate_views(resources, op.output_parts())
    }

    /// Compute time of one node on `view`, infinite when infeasible
    pub fn node_cost(&self, node: &Node, view: &MachineView, resources: &MachineResource) -> f32 {
        if node.op.is_virtual() {
            return 0.0;
        }
        self.oracle
            .measure(&node.op, view, resources)
            .map_or(f32::INFINITY, |m| m.total_time(self.comp_mode))
    }

    fn transfer(&self, graph: &Graph, edge: &Edge, src: &MachineView, dst: &MachineView) -> f32 {
        graph
            .edge_shape(edge)
            .map_or(0.0, |shape| self.oracle.transfer_cost(shape, src, dst))
    }

    /// Minimum cost of the subgraph between `source` and `sink` with their
    /// views fixed. The source's compute is never counted; the sink's is
    /// counted iff `include_sink_compute_time`. Infeasible subproblems cost
    /// `f32::INFINITY`.
    #[allow(clippy::too_many_arguments)]
    pub fn graph_cost(
        &self,
        graph: &Graph,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
        include_sink_compute_time: bool,
    ) -> Result<f32> {
        self.solve(
            graph,
            sink,
            sink_view,
            source,
            source_view,
            resources,
            include_sink_compute_time,
        )
        .map(|plan| plan.cost)
    }

    /// Adds the views achieving `optimal_cost` for the same subproblem as
    /// [`SearchHelper::graph_cost`] to `views`.
    #[allow(clippy::too_many_arguments)]
    pub fn construct_optimal_view(
        &self,
        graph: &Graph,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
        include_sink_compute_time: bool,
        optimal_cost: f32,
        views: &mut BTreeMap<Node, MachineView>,
    ) -> Result<()> {
        let plan = self.solve(
            graph,
            sink,
            sink_view,
            source,
            source_view,
            resources,
            include_sink_compute_time,
        )?;
        if !plan.is_feasible() {
            return Err(SearchError::NoFeasiblePlan);
        }
        if plan.cost != optimal_cost {
            warn!(
                "requested views for cost {} but the subproblem costs {}",
                optimal_cost, plan.cost
            );
        }
        views.extend(plan.views.iter().map(|(n, v)| (n.clone(), v.clone())));
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn solve(
        &self,
        graph: &Graph,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
        include_sink: bool,
    ) -> Result<Arc<SubgraphPlan>> {
        let key = MemoKey {
            graph_hash: graph.hash(),
            sink: sink.guid,
            sink_view: sink_view.clone(),
            source: source.guid,
            source_view: source_view.clone(),
            resources: resources.clone(),
            include_sink,
        };
        if let Some(plan) = self.memo.get(&key) {
            return Ok(plan);
        }

        let plan = if include_sink {
            let inner = self.solve(graph, sink, sink_view, source, source_view, resources, false)?;
            let sink_cost = if sink == source {
                0.0
            } else {
                self.node_cost(sink, sink_view, resources)
            };
            let cost = inner.cost + sink_cost;
            if cost.is_finite() {
                let mut views = inner.views.clone();
                views.insert(sink.clone(), sink_view.clone());
                SubgraphPlan { cost, views }
            } else {
                SubgraphPlan::infeasible()
            }
        } else {
            self.solve_between(graph, sink, sink_view, source, source_view, resources)?
        };

        trace!(
            "memo {} -> {} on {}x{} gpus: {}",
            source,
            sink,
            resources.num_nodes,
            resources.available_gpus_per_node,
            plan.cost
        );
        Ok(self.memo.insert(key, plan))
    }

    fn solve_between(
        &self,
        graph: &Graph,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
    ) -> Result<SubgraphPlan> {
        if source == sink {
            return Ok(SubgraphPlan {
                cost: 0.0,
                views: BTreeMap::new(),
            });
        }
        if !graph.contains(source) || !graph.contains(sink) {
            let missing = if graph.contains(source) { sink } else { source };
            return Err(SearchError::MissingNode(missing.guid));
        }

        if graph.num_nodes() == 2 {
            let cost = graph
                .out_edges(source)
                .filter(|e| e.dst == *sink)
                .map(|e| self.transfer(graph, e, source_view, sink_view))
                .sum();
            return Ok(SubgraphPlan {
                cost,
                views: BTreeMap::new(),
            });
        }

        if let Some(mid) = graph.find_bottleneck(source, sink)? {
            return self.sequential_split(graph, &mid, sink, sink_view, source, source_view, resources);
        }

        let split = graph.split_branches(source, sink);
        let direct: f32 = split
            .direct
            .iter()
            .map(|e| self.transfer(graph, e, source_view, sink_view))
            .sum();
        let mut plan = match split.branches.len() {
            0 => SubgraphPlan {
                cost: 0.0,
                views: BTreeMap::new(),
            },
            1 if !split.direct.is_empty() => (*self.solve(
                &split.branches[0],
                sink,
                sink_view,
                source,
                source_view,
                resources,
                false,
            )?)
            .clone(),
            1 => self.greedy(graph, sink, sink_view, source, source_view, resources)?,
            _ => self.parallel_split(&split.branches, sink, sink_view, source, source_view, resources)?,
        };
        plan.cost += direct;
        Ok(plan)
    }

    #[allow(clippy::too_many_arguments)]
    fn sequential_split(
        &self,
        graph: &Graph,
        mid: &Node,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
    ) -> Result<SubgraphPlan> {
        let (first, second) = graph.split_at_node(mid)?;
        let mut best: Option<(f32, Arc<SubgraphPlan>, Arc<SubgraphPlan>)> = None;

        for view in self.views_for(&mid.op, resources).iter() {
            let pre = self.solve(&first, mid, view, source, source_view, resources, true)?;
            let bound = best.as_ref().map_or(f32::INFINITY, |b| b.0);
            if !pre.is_feasible() || pre.cost >= bound {
                continue;
            }
            let post = self.solve(&second, sink, sink_view, mid, view, resources, false)?;
            let cost = pre.cost + post.cost;
            if cost < bound {
                best = Some((cost, pre, post));
            }
        }

        Ok(match best {
            Some((cost, pre, post)) => {
                debug!("sequential split at {}: {}", mid, cost);
                let mut views = pre.views.clone();
                views.extend(post.views.iter().map(|(n, v)| (n.clone(), v.clone())));
                SubgraphPlan { cost, views }
            }
            None => SubgraphPlan::infeasible(),
        })
    }

    /// Branches either share all resources (costs add) or run concurrently
    /// on the two halves of a resource split (slowest branch counts).
    fn parallel_split(
        &self,
        branches: &[Graph],
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
    ) -> Result<SubgraphPlan> {
        let first = &branches[0];
        let rest = merge(&branches[1..]);
        let solve = |g: &Graph, r: &MachineResource| {
            self.solve(g, sink, sink_view, source, source_view, r, false)
        };

        let a = solve(first, resources)?;
        let b = solve(&rest, resources)?;
        let mut best = (a.cost + b.cost, a, b);

        for (r1, r2) in resources.split_options() {
            for (ra, rb) in [(&r1, &r2), (&r2, &r1)] {
                let a = solve(first, ra)?;
                if !a.is_feasible() || a.cost >= best.0 {
                    continue;
                }
                let b = solve(&rest, rb)?;
                let cost = a.cost.max(b.cost);
                if cost < best.0 {
                    best = (cost, a, b);
                }
            }
        }

        let (cost, a, b) = best;
        if !cost.is_finite() {
            return Ok(SubgraphPlan::infeasible());
        }
        debug!("parallel split of {} branches: {}", branches.len(), cost);
        let mut views = a.views.clone();
        views.extend(b.views.iter().map(|(n, v)| (n.clone(), v.clone())));
        Ok(SubgraphPlan { cost, views })
    }

    /// Fallback for subgraphs that are not series-parallel: places nodes
    /// one by one in topological order, each on its cheapest view given its
    /// already placed producers.
    fn greedy(
        &self,
        graph: &Graph,
        sink: &Node,
        sink_view: &MachineView,
        source: &Node,
        source_view: &MachineView,
        resources: &MachineResource,
    ) -> Result<SubgraphPlan> {
        debug!(
            "subgraph {} -> {} is not series-parallel, placing greedily",
            source, sink
        );
        let mut placed: BTreeMap<Node, MachineView> = BTreeMap::new();
        placed.insert(source.clone(), source_view.clone());
        let mut total = 0.0;

        for node in graph.topo_order()? {
            if node == *source || node == *sink {
                continue;
            }
            let mut best: Option<(f32, &MachineView)> = None;
            let views = self.views_for(&node.op, resources);
            for view in views.iter() {
                let mut cost = self.node_cost(&node, view, resources);
                for edge in graph.in_edges(&node) {
                    if let Some(src_view) = placed.get(&edge.src) {
                        cost += self.transfer(graph, edge, src_view, view);
                    }
                }
                if cost < best.map_or(f32::INFINITY, |b| b.0) {
                    best = Some((cost, view));
                }
            }
            let Some((cost, view)) = best else {
                return Ok(SubgraphPlan::infeasible());
            };
            total += cost;
            placed.insert(node.clone(), view.clone());
        }

        for edge in graph.in_edges(sink) {
            if edge.src != *source {
                if let Some(src_view) = placed.get(&edge.src) {
                    total += self.transfer(graph, edge, src_view, sink_view);
                }
            }
        }

        placed.remove(source);
        Ok(SubgraphPlan {
            cost: total,
            views: placed,
        })
    }

    /// Finds the cheapest plan for a whole graph.
    ///
    /// Graphs with several sources or sinks are closed off with zero-cost
    /// endpoints first. Fails with [`SearchError::NoFeasiblePlan`] when no
    /// assignment fits `resources`.
    pub fn optimal_plan(&self, graph: &Graph, resources: &MachineResource) -> Result<Plan> {
        graph.topo_order()?;
        let (work, source, sink) = close_off(graph)?;

        let mut best: Option<(f32, BTreeMap<Node, MachineView>)> = None;
        let source_views = self.views_for(&source.op, resources);
        let sink_views = self.views_for(&sink.op, resources);

        for source_view in source_views.iter() {
            let base = self.node_cost(&source, source_view, resources);
            if !base.is_finite() {
                continue;
            }
            if source == sink {
                if base < best.as_ref().map_or(f32::INFINITY, |b| b.0) {
                    best = Some((base, BTreeMap::from([(source.clone(), source_view.clone())])));
                }
                continue;
            }
            for sink_view in sink_views.iter() {
                let sub = self.solve(&work, &sink, sink_view, &source, source_view, resources, true)?;
                let cost = base + sub.cost;
                if cost < best.as_ref().map_or(f32::INFINITY, |b| b.0) {
                    let mut views = sub.views.clone();
                    views.insert(source.clone(), source_view.clone());
                    best = Some((cost, views));
                }
            }
        }

        let Some((cost, mut views)) = best else {
            return Err(SearchError::NoFeasiblePlan);
        };
        views.retain(|node, _| !node.op.is_virtual());
        let stats = self.memo.stats();
        debug!(
            "optimal plan cost {} ({} memo entries, {} hits)",
            cost, stats.entries, stats.hits
        );
        Ok(Plan::new(graph.clone(), views, cost))
    }
}

/// Union of several branch graphs sharing the same endpoints
fn merge(graphs: &[Graph]) -> Graph {
    let mut merged = Graph::new();
    for g in graphs {
        for node in g.nodes() {
            merged.add_node(node);
        }
        for edge in g.edges() {
            merged.insert_edge(edge.clone());
        }
    }
    merged
}

/// Returns a single-source, single-sink copy of `graph` and its endpoints
fn close_off(graph: &Graph) -> Result<(Graph, Node, Node)> {
    let sources = graph.sources();
    let sinks = graph.sinks();
    if sources.is_empty() || sinks.is_empty() {
        return Err(SearchError::MalformedGraph("graph has no nodes".to_string()));
    }

    let mut work = graph.clone();
    let source = if sources.len() == 1 {
        sources[0].clone()
    } else {
        let endpoint = Node::new(Arc::new(Operator::virtual_endpoint()));
        for s in &sources {
            work.add_control_edge(&endpoint, s);
        }
        endpoint
    };
    let sink = if sinks.len() == 1 {
        sinks[0].clone()
    } else {
        let endpoint = Node::new(Arc::new(Operator::virtual_endpoint()));
        for s in &sinks {
            work.add_control_edge(s, &endpoint);
        }
        endpoint
    };
    Ok((work, source, sink))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cost::CostMetrics;
    use crate::graph::OperatorRegistry;
    use crate::machine::DeviceType;
    use crate::ops::{BinaryOp, DataType, OpHandle, ParallelTensorShape, UnaryOp};

    /// Fixed cost per operator, independent of the view
    struct TableOracle {
        costs: FxHashMap<OpHandle, f32>,
    }

    impl CostOracle for TableOracle {
        fn measure(
            &self,
            op: &Operator,
            view: &MachineView,
            resources: &MachineResource,
        ) -> Option<CostMetrics> {
            if !resources.is_valid_view(view) {
                return None;
            }
            Some(CostMetrics::forward(
                self.costs.get(&op.handle()).copied().unwrap_or(0.0),
            ))
        }
    }

    fn shape() -> ParallelTensorShape {
        ParallelTensorShape::new(&[8, 8], DataType::F32)
    }

    #[test]
    fn test_single_node_graph() {
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let x = reg.input(&shape()).unwrap();
        let mut g = Graph::new();
        g.add_node(&x);
        let oracle = TableOracle {
            costs: FxHashMap::from_iter([(x.op.handle(), 1.5)]),
        };
        let plan = SearchHelper::new(oracle, &cluster)
            .optimal_plan(&g, &cluster)
            .unwrap();
        assert_eq!(plan.cost(), 1.5);
        assert_eq!(plan.view_of(&x), Some(&MachineView::single(DeviceType::Gpu, 0)));
    }

    #[test]
    fn test_multiple_sinks_are_closed_off() {
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Tanh).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&x, 0, &b, 0);
        let oracle = TableOracle {
            costs: FxHashMap::from_iter([(a.op.handle(), 2.0), (b.op.handle(), 2.0)]),
        };
        let plan = SearchHelper::new(oracle, &cluster)
            .optimal_plan(&g, &cluster)
            .unwrap();
        // both branches run side by side on one GPU each
        assert_eq!(plan.cost(), 2.0);
        assert_eq!(plan.views().len(), 3);
        assert_ne!(plan.view_of(&a), plan.view_of(&b));
    }

    #[test]
    fn test_non_series_parallel_falls_back_to_greedy() {
        // x -> a, x -> b, a -> c, b -> c, a -> d, b -> d, c -> e, d -> e
        let cluster = MachineResource::new(1, 1, 0);
        let reg = OperatorRegistry::new(&cluster);
        let s = shape();
        let x = reg.input(&s).unwrap();
        let a = reg.element_unary(&s, UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&s, UnaryOp::Relu).unwrap();
        let c = reg.element_binary(&s, &s, BinaryOp::Add).unwrap();
        let d = reg.element_binary(&s, &s, BinaryOp::Mul).unwrap();
        let e = reg.element_binary(&s, &s, BinaryOp::Sub).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&x, 0, &b, 0);
        g.add_edge(&a, 0, &c, 0);
        g.add_edge(&b, 0, &c, 1);
        g.add_edge(&a, 0, &d, 0);
        g.add_edge(&b, 0, &d, 1);
        g.add_edge(&c, 0, &e, 0);
        g.add_edge(&d, 0, &e, 1);

        let costs = FxHashMap::from_iter([
            (a.op.handle(), 1.0),
            (c.op.handle(), 2.0),
            (d.op.handle(), 3.0),
            (e.op.handle(), 4.0),
        ]);
        let plan = SearchHelper::new(TableOracle { costs }, &cluster)
            .optimal_plan(&g, &cluster)
            .unwrap();
        // a and b share an operator; one GPU runs everything in sequence
        assert_eq!(plan.cost(), 1.0 + 1.0 + 2.0 + 3.0 + 4.0);
        assert_eq!(plan.views().len(), 6);
    }

    #[test]
    fn test_infeasible_graph_reports_no_plan() {
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);

        struct Never;
        impl CostOracle for Never {
            fn measure(&self, _: &Operator, _: &MachineView, _: &MachineResource) -> Option<CostMetrics> {
                None
            }
        }
        let helper = SearchHelper::new(Never, &cluster);
        assert!(matches!(
            helper.optimal_plan(&g, &cluster),
            Err(SearchError::NoFeasiblePlan)
        ));
    }

    #[test]
    fn test_memo_is_hit_on_repeat() {
        let cluster = MachineResource::new(1, 2, 0);
        let reg = OperatorRegistry::new(&cluster);
        let x = reg.input(&shape()).unwrap();
        let a = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let b = reg.element_unary(&shape(), UnaryOp::Relu).unwrap();
        let mut g = Graph::new();
        g.add_edge(&x, 0, &a, 0);
        g.add_edge(&a, 0, &b, 0);

        let helper = SearchHelper::new(
            TableOracle {
                costs: FxHashMap::from_iter([(a.op.handle(), 1.0)]),
            },
            &cluster,
        );
        let v = MachineView::single(DeviceType::Gpu, 0);
        helper.graph_cost(&g, &b, &v, &x, &v, &cluster, true).unwrap();
        let entries = helper.memo_stats().entries;
        helper.graph_cost(&g, &b, &v, &x, &v, &cluster, true).unwrap();
        assert_eq!(helper.memo_stats().entries, entries);
        assert!(helper.memo_stats().hits >= 1);
    }
}
