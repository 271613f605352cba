//! Cluster capacity budgets

use serde::{Deserialize, Serialize};

use super::view::{DeviceType, MachineView};

/// The slice of the cluster a (sub)plan may use.
///
/// A resource is a rectangular window: `num_nodes` consecutive nodes starting
/// at `start_node_id`, and on each of them the devices
/// `[start_*_id, start_*_id + available_*_per_node)`. Splitting a resource
/// always yields disjoint windows.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MachineResource {
    pub num_nodes: usize,
    pub all_gpus_per_node: usize,
    pub available_gpus_per_node: usize,
    pub all_cpus_per_node: usize,
    pub available_cpus_per_node: usize,
    pub start_node_id: usize,
    pub start_gpu_id: usize,
    pub start_cpu_id: usize,
}

impl MachineResource {
    /// The whole cluster
    pub fn new(num_nodes: usize, gpus_per_node: usize, cpus_per_node: usize) -> Self {
        Self {
            num_nodes,
            all_gpus_per_node: gpus_per_node,
            available_gpus_per_node: gpus_per_node,
            all_cpus_per_node: cpus_per_node,
            available_cpus_per_node: cpus_per_node,
            start_node_id: 0,
            start_gpu_id: 0,
            start_cpu_id: 0,
        }
    }

    /// Number of GPUs inside this window
    pub fn total_gpus(&self) -> usize {
        self.num_nodes * self.available_gpus_per_node
    }

    /// Number of CPUs inside this window
    pub fn total_cpus(&self) -> usize {
        self.num_nodes * self.available_cpus_per_node
    }

    /// Returns true if every device of `view` lies inside this window
    pub fn is_valid_view(&self, view: &MachineView) -> bool {
        let (per_node, start, available) = match view.device_type() {
            DeviceType::Gpu => (
                self.all_gpus_per_node,
                self.start_gpu_id,
                self.available_gpus_per_node,
            ),
            DeviceType::Cpu => (
                self.all_cpus_per_node,
                self.start_cpu_id,
                self.available_cpus_per_node,
            ),
        };
        if per_node == 0 || available == 0 {
            return false;
        }
        view.device_ids().into_iter().all(|id| {
            let node = id / per_node;
            let local = id % per_node;
            node >= self.start_node_id
                && node < self.start_node_id + self.num_nodes
                && local >= start
                && local < start + available
        })
    }

    /// Every way of cutting this window into two disjoint non-empty halves.
    ///
    /// Multi-node windows are cut between nodes; the GPUs of each node are
    /// also cut at every offset. When cutting GPUs the host CPUs stay with
    /// the first half.
    pub fn split_options(&self) -> Vec<(MachineResource, MachineResource)> {
        let mut options = Vec::new();

        for i in 1..self.num_nodes {
            let mut first = self.clone();
            let mut second = self.clone();
            first.num_nodes = i;
            second.num_nodes = self.num_nodes - i;
            second.start_node_id = self.start_node_id + i;
            options.push((first, second));
        }

        for i in 1..self.available_gpus_per_node {
            let mut first = self.clone();
            let mut second = self.clone();
            first.available_gpus_per_node = i;
            second.available_gpus_per_node = self.available_gpus_per_node - i;
            second.start_gpu_id = self.start_gpu_id + i;
            second.available_cpus_per_node = 0;
            options.push((first, second));
        }

        options
    }
}
