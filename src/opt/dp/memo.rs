//! Append-only memo table of solved subproblems

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

use rustc_hash::FxHashMap;

use crate::cost::cache::CacheStats;
use crate::graph::Node;
use crate::machine::{MachineResource, MachineView};

/// Identifies one `graph_cost` subproblem
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct MemoKey {
    pub graph_hash: u64,
    pub sink: u64,
    pub sink_view: MachineView,
    pub source: u64,
    pub source_view: MachineView,
    pub resources: MachineResource,
    pub include_sink: bool,
}

/// Optimal cost of a subproblem and the views that achieve it.
///
/// `views` covers every node strictly between source and sink, plus the
/// sink when its compute time was included.
#[derive(Clone, Debug, PartialEq)]
pub struct SubgraphPlan {
    pub cost: f32,
    pub views: BTreeMap<Node, MachineView>,
}

impl SubgraphPlan {
    pub fn infeasible() -> Self {
        Self {
            cost: f32::INFINITY,
            views: BTreeMap::new(),
        }
    }

    pub fn is_feasible(&self) -> bool {
        self.cost.is_finite()
    }
}

/// Shared memo table; once written, an entry never changes
#[derive(Default)]
pub struct MemoTable {
    entries: RwLock<FxHashMap<MemoKey, Arc<SubgraphPlan>>>,
    hits: AtomicUsize,
    misses: AtomicUsize,
}

impl MemoTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &MemoKey) -> Option<Arc<SubgraphPlan>> {
        let found = self.entries.read().unwrap().get(key).cloned();
        match found {
            Some(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            None => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        found
    }

    /// Stores `plan` unless the key is already present, and returns the
    /// entry that ends up in the table.
    pub fn insert(&self, key: MemoKey, plan: SubgraphPlan) -> Arc<SubgraphPlan> {
        let mut entries = self.entries.write().unwrap();
        Arc::clone(entries.entry(key).or_insert_with(|| Arc::new(plan)))
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            entries: self.len(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::DeviceType;

    fn key(include_sink: bool) -> MemoKey {
        MemoKey {
            graph_hash: 1,
            sink: 2,
            sink_view: MachineView::single(DeviceType::Gpu, 0),
            source: 3,
            source_view: MachineView::single(DeviceType::Gpu, 0),
            resources: MachineResource::new(1, 1, 0),
            include_sink,
        }
    }

    #[test]
    fn test_first_writer_wins() {
        let table = MemoTable::new();
        let first = SubgraphPlan {
            cost: 1.0,
            views: BTreeMap::new(),
        };
        let stored = table.insert(key(false), first.clone());
        let again = table.insert(key(false), SubgraphPlan::infeasible());
        assert_eq!(*stored, first);
        assert_eq!(*again, first);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_include_sink_is_part_of_key() {
        let table = MemoTable::new();
        table.insert(key(false), SubgraphPlan::infeasible());
        assert!(table.get(&key(true)).is_none());
        assert!(table.get(&key(false)).is_some());
        let stats = table.stats();
        assert_eq!((stats.hits, stats.misses, stats.entries), (1, 1, 1));
    }
}
