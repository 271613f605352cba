//! Cost oracle interface
//!
//! The search never looks inside an oracle; it only relies on `measure` being
//! a pure function of its arguments. [`CachedCostOracle`] memoizes any oracle
//! and [`AnalyticCostOracle`] is a roofline-style reference model.

use serde::{Deserialize, Serialize};

use crate::machine::{MachineResource, MachineView, ParallelConfig};
use crate::ops::{Operator, ParallelTensorShape};

pub mod analytic;
pub mod cache;

pub use analytic::AnalyticCostOracle;
pub use cache::CachedCostOracle;

/// Whether costs count the backward pass
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum CompMode {
    #[default]
    Training,
    Inference,
}

/// Estimated execution time and memory footprint of one operator
#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CostMetrics {
    pub forward_time: f32,
    pub backward_time: f32,
    pub inputs_memory: usize,
    pub outputs_memory: usize,
    pub weights_memory: usize,
}

impl CostMetrics {
    /// Metrics of an operator that does nothing
    pub fn zero() -> Self {
        Self::default()
    }

    /// Metrics with only a forward time
    pub fn forward(time: f32) -> Self {
        Self {
            forward_time: time,
            ..Self::default()
        }
    }

    /// Time that counts toward the objective under `mode`
    pub fn total_time(&self, mode: CompMode) -> f32 {
        match mode {
            CompMode::Training => self.forward_time + self.backward_time,
            CompMode::Inference => self.forward_time,
        }
    }

    pub fn total_memory(&self) -> usize {
        self.inputs_memory + self.outputs_memory + self.weights_memory
    }

    /// Cost of running `self` and then `other`
    pub fn sequential(&self, other: &CostMetrics) -> CostMetrics {
        CostMetrics {
            forward_time: self.forward_time + other.forward_time,
            backward_time: self.backward_time + other.backward_time,
            inputs_memory: self.inputs_memory + other.inputs_memory,
            outputs_memory: self.outputs_memory + other.outputs_memory,
            weights_memory: self.weights_memory + other.weights_memory,
        }
    }

    /// Cost of running `self` and `other` at the same time on disjoint devices
    pub fn concurrent(&self, other: &CostMetrics) -> CostMetrics {
        CostMetrics {
            forward_time: self.forward_time.max(other.forward_time),
            backward_time: self.backward_time.max(other.backward_time),
            inputs_memory: self.inputs_memory + other.inputs_memory,
            outputs_memory: self.outputs_memory + other.outputs_memory,
            weights_memory: self.weights_memory + other.weights_memory,
        }
    }
}

/// Estimates operator cost on a device assignment.
///
/// Implementations must be side-effect free and safe to call from several
/// threads at once.
pub trait CostOracle: Send + Sync {
    /// Cost of `op` on `view`, or `None` if the assignment is infeasible
    fn measure(
        &self,
        op: &Operator,
        view: &MachineView,
        resources: &MachineResource,
    ) -> Option<CostMetrics>;

    /// Time to move a tensor of `shape` from `src` to `dst`
    fn transfer_cost(
        &self,
        _shape: &ParallelTensorShape,
        _src: &MachineView,
        _dst: &MachineView,
    ) -> f32 {
        0.0
    }

    /// Cost of `op` under a legacy per-operator config.
    ///
    /// Configs whose device list has no view equivalent are infeasible.
    fn measure_config(
        &self,
        op: &Operator,
        config: &ParallelConfig,
        resources: &MachineResource,
    ) -> Option<CostMetrics> {
        let view = config.to_machine_view()?;
        self.measure(op, &view, resources)
    }
}

impl<T: CostOracle + ?Sized> CostOracle for &T {
    fn measure(
        &self,
        op: &Operator,
        view: &MachineView,
        resources: &MachineResource,
    ) -> Option<CostMetrics> {
        (**self).measure(op, view, resources)
    }

    fn transfer_cost(
        &self,
        shape: &ParallelTensorShape,
        src: &MachineView,
        dst: &MachineView,
    ) -> f32 {
        (**self).transfer_cost(shape, src, dst)
    }
}

impl<T: CostOracle + ?Sized> CostOracle for std::sync::Arc<T> {
    fn measure(
        &self,
        op: &Operator,
        view: &MachineView,
        resources: &MachineResource,
    ) -> Option<CostMetrics> {
        (**self).measure(op, view, resources)
    }

    fn transfer_cost(
        &self,
        shape: &ParallelTensorShape,
        src: &MachineView,
        dst: &MachineView,
    ) -> f32 {
        (**self).transfer_cost(shape, src, dst)
    }
}
