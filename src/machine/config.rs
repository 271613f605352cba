//! Per-operator parallel configuration used by local search

use serde::{Deserialize, Serialize};

use super::view::{DeviceType, MachineView};

/// Legacy per-operator descriptor: a partition degree for every output tensor
/// dimension plus the explicit list of devices running the parts.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ParallelConfig {
    pub device_type: DeviceType,
    pub dims: Vec<usize>,
    pub device_ids: Vec<usize>,
}

impl ParallelConfig {
    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }

    /// Converts to a one-dimensional view if the devices form an arithmetic
    /// progression; arbitrary device lists have no view equivalent.
    pub fn to_machine_view(&self) -> Option<MachineView> {
        if self.device_ids.len() != self.num_parts() || self.device_ids.is_empty() {
            return None;
        }
        let start = self.device_ids[0];
        if self.device_ids.len() == 1 {
            return Some(MachineView::single(self.device_type, start));
        }
        let stride = self.device_ids[1].checked_sub(start)?;
        if stride == 0 {
            return None;
        }
        let regular = self
            .device_ids
            .iter()
            .enumerate()
            .all(|(i, &id)| id == start + i * stride);
        regular.then(|| {
            MachineView::new(
                self.device_type,
                start,
                vec![self.device_ids.len()],
                vec![stride],
            )
        })
    }

    /// Builds a config that partitions `dim` across the devices of `view`
    pub fn from_machine_view(view: &MachineView, ndims: usize, dim: usize) -> Self {
        let mut dims = vec![1; ndims];
        dims[dim] = view.num_parts();
        Self {
            device_type: view.device_type(),
            dims,
            device_ids: view.device_ids(),
        }
    }
}
