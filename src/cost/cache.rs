//! Memoizing oracle wrapper

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

use rustc_hash::FxHashMap;

use super::{CostMetrics, CostOracle};
use crate::machine::{MachineResource, MachineView};
use crate::ops::{OpHandle, Operator, ParallelTensorShape};

/// Hit/miss counters of a session cache
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: usize,
    pub misses: usize,
    pub entries: usize,
}

type MeasureKey = (OpHandle, MachineView, MachineResource);

/// Remembers every `measure` answer of the wrapped oracle.
///
/// Entries are keyed by canonical operator handle, so one cache must only
/// serve operators of a single [`crate::graph::OperatorRegistry`]. Since
/// nodes with equal signatures share a handle, each distinct operator is
/// measured at most once per (view, resources).
pub struct CachedCostOracle<O> {
    inner: O,
    table: RwLock<FxHashMap<MeasureKey, Option<CostMetrics>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl<O: CostOracle> CachedCostOracle<O> {
    pub fn new(inner: O) -> Self {
        Self {
            inner,
            table: RwLock::new(FxHashMap::default()),
            hits: AtomicUsize::new(0),
            misses: AtomicUsize::new(0),
        }
    }

    pub fn inner(&self) -> &O {
        &self.inner
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.table.read().unwrap().len(),
        }
    }
}

impl<O: CostOracle> CostOracle for CachedCostOracle<O> {
    fn measure(
        &self,
        op: &Operator,
        view: &MachineView,
        resources: &MachineResource,
    ) -> Option<CostMetrics> {
        let key = (op.handle(), view.clone(), resources.clone());
        if let Some(cached) = self.table.read().unwrap().get(&key) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return *cached;
        }
        self.misses.fetch_add(1, Ordering::Relaxed);
        let metrics = self.inner.measure(op, view, resources);
        // first writer wins
        *self.table.write().unwrap().entry(key).or_insert(metrics)
    }

    fn transfer_cost(
        &self,
        shape: &ParallelTensorShape,
        src: &MachineView,
        dst: &MachineView,
    ) -> f32 {
        self.inner.transfer_cost(shape, src, dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::OperatorRegistry;
    use crate::machine::DeviceType;
    use crate::ops::{DataType, UnaryOp};

    struct CountingOracle {
        calls: AtomicUsize,
    }

    impl CostOracle for CountingOracle {
        fn measure(
            &self,
            _op: &Operator,
            _view: &MachineView,
            _resources: &MachineResource,
        ) -> Option<CostMetrics> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Some(CostMetrics::forward(1.0))
        }
    }

    #[test]
    fn test_shared_operator_measured_once() {
        let resources = MachineResource::new(1, 2, 0);
        let registry = OperatorRegistry::new(&resources);
        let shape = ParallelTensorShape::new(&[8, 8], DataType::F32);
        let a = registry.element_unary(&shape, UnaryOp::Relu).unwrap();
        let b = registry.element_unary(&shape, UnaryOp::Relu).unwrap();
        assert_ne!(a.guid, b.guid);

        let oracle = CachedCostOracle::new(CountingOracle {
            calls: AtomicUsize::new(0),
        });
        let view = MachineView::single(DeviceType::Gpu, 0);
        oracle.measure(&a.op, &view, &resources);
        oracle.measure(&b.op, &view, &resources);

        assert_eq!(oracle.inner().calls.load(Ordering::SeqCst), 1);
        let stats = oracle.stats();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 1);
        assert_eq!(stats.entries, 1);
    }
}
