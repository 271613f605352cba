//! Device assignments for a single operator

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::InvalidView;

/// Kind of processor a view is placed on
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum DeviceType {
    Gpu,
    Cpu,
}

/// An assignment of parallel replicas to a strided set of physical devices.
///
/// Device `i` of the view (as a multi-index `idx`) lives on physical device
/// `start_device_id + Σ idx[k] * strides[k]`. The stride of a degree-1
/// dimension never matters, so it is normalized to 1 on construction; this
/// keeps derived equality and hashing structural.
///
/// Deserialized views go through the same checks as [`MachineView::try_new`].
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "RawMachineView")]
pub struct MachineView {
    device_type: DeviceType,
    start_device_id: usize,
    dims: Vec<usize>,
    strides: Vec<usize>,
}

/// Unchecked wire form of a view
#[derive(Deserialize)]
struct RawMachineView {
    device_type: DeviceType,
    start_device_id: usize,
    dims: Vec<usize>,
    strides: Vec<usize>,
}

impl TryFrom<RawMachineView> for MachineView {
    type Error = InvalidView;

    fn try_from(raw: RawMachineView) -> Result<Self, Self::Error> {
        MachineView::try_new(raw.device_type, raw.start_device_id, raw.dims, raw.strides)
    }
}

impl MachineView {
    /// Creates a view from per-dimension degrees and strides.
    ///
    /// # Panics
    ///
    /// Panics if the shape is rejected by [`MachineView::try_new`].
    pub fn new(
        device_type: DeviceType,
        start_device_id: usize,
        dims: Vec<usize>,
        strides: Vec<usize>,
    ) -> Self {
        match Self::try_new(device_type, start_device_id, dims, strides) {
            Ok(view) => view,
            Err(e) => panic!("invalid MachineView: {}", e),
        }
    }

    /// Creates a view, rejecting mismatched lengths, an empty shape and
    /// zero degrees.
    pub fn try_new(
        device_type: DeviceType,
        start_device_id: usize,
        dims: Vec<usize>,
        strides: Vec<usize>,
    ) -> Result<Self, InvalidView> {
        if dims.len() != strides.len() {
            return Err(InvalidView::LengthMismatch {
                dims: dims.len(),
                strides: strides.len(),
            });
        }
        if dims.is_empty() {
            return Err(InvalidView::NoDimensions);
        }
        if let Some(dim) = dims.iter().position(|&d| d == 0) {
            return Err(InvalidView::ZeroDegree { dim });
        }
        let strides = dims
            .iter()
            .zip(strides)
            .map(|(&d, s)| if d == 1 { 1 } else { s })
            .collect();
        Ok(Self {
            device_type,
            start_device_id,
            dims,
            strides,
        })
    }

    /// A one-dimensional view over `degree` consecutive devices
    pub fn contiguous(device_type: DeviceType, start_device_id: usize, degree: usize) -> Self {
        Self::new(device_type, start_device_id, vec![degree], vec![1])
    }

    /// A view on a single device
    pub fn single(device_type: DeviceType, device_id: usize) -> Self {
        Self::contiguous(device_type, device_id, 1)
    }

    pub fn device_type(&self) -> DeviceType {
        self.device_type
    }

    pub fn start_device_id(&self) -> usize {
        self.start_device_id
    }

    pub fn ndims(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[usize] {
        &self.dims
    }

    pub fn strides(&self) -> &[usize] {
        &self.strides
    }

    /// Number of replicas (product of the per-dimension degrees)
    pub fn num_parts(&self) -> usize {
        self.dims.iter().product()
    }

    /// Physical device ids covered by this view, in row-major index order
    pub fn device_ids(&self) -> Vec<usize> {
        let mut ids = vec![self.start_device_id];
        for (&degree, &stride) in self.dims.iter().zip(&self.strides) {
            ids = ids
                .iter()
                .flat_map(|&base| (0..degree).map(move |i| base + i * stride))
                .collect();
        }
        ids
    }

    /// Enumerates every view the search may assign on a cluster.
    ///
    /// GPU views are
    /// - contiguous runs of any length and offset inside a single node,
    /// - runs of whole consecutive nodes,
    /// - one device per node, strided across consecutive nodes.
    ///
    /// CPU views are contiguous runs inside a single node. The result is
    /// sorted and free of duplicates.
    pub fn all_valid_views(
        num_nodes: usize,
        gpus_per_node: usize,
        cpus_per_node: usize,
    ) -> Vec<MachineView> {
        let mut views = Vec::new();

        for (device_type, per_node) in [(DeviceType::Gpu, gpus_per_node), (DeviceType::Cpu, cpus_per_node)] {
            for node in 0..num_nodes {
                let base = node * per_node;
                for degree in 1..=per_node {
                    for offset in 0..=(per_node - degree) {
                        views.push(Self::contiguous(device_type, base + offset, degree));
                    }
                }
            }
        }

        if gpus_per_node > 0 {
            for span in 2..=num_nodes {
                for first_node in 0..=(num_nodes - span) {
                    let base = first_node * gpus_per_node;
                    views.push(Self::contiguous(DeviceType::Gpu, base, span * gpus_per_node));
                    if gpus_per_node > 1 {
                        for local in 0..gpus_per_node {
                            views.push(Self::new(
                                DeviceType::Gpu,
                                base + local,
                                vec![span],
                                vec![gpus_per_node],
                            ));
                        }
                    }
                }
            }
        }

        views.sort();
        views.dedup();
        views
    }
}

impl fmt::Display for MachineView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}@{}", self.device_type, self.start_device_id)?;
        for (d, s) in self.dims.iter().zip(&self.strides) {
            write!(f, "[{}:{}]", d, s)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rustc_hash::FxHashSet;

    #[test]
    fn test_device_ids_strided() {
        let view = MachineView::new(DeviceType::Gpu, 1, vec![3], vec![4]);
        assert_eq!(view.device_ids(), vec![1, 5, 9]);
        assert_eq!(view.num_parts(), 3);
    }

    #[test]
    fn test_device_ids_two_dims() {
        let view = MachineView::new(DeviceType::Gpu, 0, vec![2, 2], vec![1, 4]);
        assert_eq!(view.device_ids(), vec![0, 4, 1, 5]);
    }

    #[test]
    fn test_degree_one_stride_is_normalized() {
        let a = MachineView::new(DeviceType::Gpu, 3, vec![1], vec![8]);
        let b = MachineView::single(DeviceType::Gpu, 3);
        assert_eq!(a, b);

        let mut set = FxHashSet::default();
        set.insert(a);
        assert!(set.contains(&b));
    }

    #[test]
    fn test_different_device_type_is_different_view() {
        let gpu = MachineView::single(DeviceType::Gpu, 0);
        let cpu = MachineView::single(DeviceType::Cpu, 0);
        assert_ne!(gpu, cpu);
    }

    #[test]
    fn test_all_valid_views_single_node() {
        let views = MachineView::all_valid_views(1, 4, 0);
        // 4 + 3 + 2 + 1 contiguous runs
        assert_eq!(views.len(), 10);
        assert!(views.contains(&MachineView::contiguous(DeviceType::Gpu, 1, 2)));
        assert!(views.iter().all(|v| v.device_ids().iter().all(|&d| d < 4)));
    }

    #[test]
    fn test_all_valid_views_multi_node() {
        let views = MachineView::all_valid_views(2, 2, 1);
        assert!(views.contains(&MachineView::contiguous(DeviceType::Gpu, 0, 4)));
        assert!(views.contains(&MachineView::new(DeviceType::Gpu, 1, vec![2], vec![2])));
        assert!(views.contains(&MachineView::single(DeviceType::Cpu, 1)));
        let mut sorted = views.clone();
        sorted.dedup();
        assert_eq!(sorted.len(), views.len());
    }

    #[test]
    fn test_try_new_rejects_shapes_without_devices() {
        assert_eq!(
            MachineView::try_new(DeviceType::Gpu, 0, vec![0, 3], vec![1]),
            Err(InvalidView::LengthMismatch { dims: 2, strides: 1 })
        );
        assert_eq!(
            MachineView::try_new(DeviceType::Gpu, 0, vec![2, 0], vec![1, 1]),
            Err(InvalidView::ZeroDegree { dim: 1 })
        );
        assert_eq!(
            MachineView::try_new(DeviceType::Cpu, 0, vec![], vec![]),
            Err(InvalidView::NoDimensions)
        );
    }

    #[test]
    fn test_deserialize_validates_and_normalizes() {
        let bad = r#"{"device_type":"Gpu","start_device_id":0,"dims":[0,3],"strides":[1]}"#;
        let err = serde_json::from_str::<MachineView>(bad).unwrap_err();
        assert!(err.to_string().contains("2 degrees but 1 strides"), "{}", err);

        let zero = r#"{"device_type":"Gpu","start_device_id":0,"dims":[0],"strides":[1]}"#;
        assert!(serde_json::from_str::<MachineView>(zero).is_err());

        let loose = r#"{"device_type":"Gpu","start_device_id":3,"dims":[1],"strides":[8]}"#;
        let view: MachineView = serde_json::from_str(loose).unwrap();
        assert_eq!(view, MachineView::single(DeviceType::Gpu, 3));
    }
}
