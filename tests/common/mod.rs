//! Shared fixtures for the integration tests

#![allow(dead_code)]

use pcg_search::cost::{CostMetrics, CostOracle};
use pcg_search::graph::{Graph, Node, OperatorRegistry};
use pcg_search::machine::{MachineResource, MachineView};
use pcg_search::ops::{DataType, OpHandle, Operator, ParallelTensorShape, UnaryOp};
use rustc_hash::FxHashMap;

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Fixed compute time per operator on any view inside the resources
pub struct TableOracle {
    costs: FxHashMap<OpHandle, f32>,
}

impl TableOracle {
    pub fn new(entries: &[(&Node, f32)]) -> Self {
        Self {
            costs: entries.iter().map(|(n, c)| (n.op.handle(), *c)).collect(),
        }
    }
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

pub fn square(n: usize) -> ParallelTensorShape {
    ParallelTensorShape::new(&[n, n], DataType::F32)
}

/// x -> linear(512) -> relu -> linear(128) on a [256, 512] batch
pub fn mlp(reg: &OperatorRegistry) -> (Graph, Vec<Node>) {
    let shape = ParallelTensorShape::new(&[256, 512], DataType::F32);
    let hidden = ParallelTensorShape::new(&[256, 512], DataType::F32);
    let x = reg.input(&shape).unwrap();
    let l1 = reg.linear(&shape, 512, true, None).unwrap();
    let r = reg.element_unary(&hidden, UnaryOp::Relu).unwrap();
    let l2 = reg.linear(&hidden, 128, true, None).unwrap();
    let mut g = Graph::new();
    g.add_edge(&x, 0, &l1, 0);
    g.add_edge(&l1, 0, &r, 0);
    g.add_edge(&r, 0, &l2, 0);
    (g, vec![x, l1, r, l2])
}
