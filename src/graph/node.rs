use std::cmp::Ordering;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::Arc;

use crate::ops::Operator;

static NEXT_GUID: AtomicU64 = AtomicU64::new(1);

/// Allocates a process-wide node id; ids are never reused
pub(crate) fn next_guid() -> u64 {
    NEXT_GUID.fetch_add(1, AtomicOrdering::SeqCst)
}

/// A placement of a canonical operator in a graph.
///
/// Identity, ordering and hashing use `guid` only: two nodes sharing an
/// operator are still distinct placements.
#[derive(Clone, Debug)]
pub struct Node {
    pub guid: u64,
    pub op: Arc<Operator>,
}

impl Node {
    pub(crate) fn new(op: Arc<Operator>) -> Self {
        Self {
            guid: next_guid(),
            op,
        }
    }

    /// A new placement of the same operator
    pub fn duplicate(&self) -> Self {
        Self::new(Arc::clone(&self.op))
    }
}

impl PartialEq for Node {
    fn eq(&self, other: &Self) -> bool {
        self.guid == other.guid
    }
}

impl Eq for Node {}

impl Hash for Node {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.guid.hash(state);
    }
}

impl PartialOrd for Node {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Node {
    fn cmp(&self, other: &Self) -> Ordering {
        self.guid.cmp(&other.guid)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}({})", self.op.kind(), self.guid)
    }
}

/// A tensor flowing from an output slot of `src` into an input slot of `dst`.
///
/// Edges whose slots are [`CONTROL_SLOT`] carry no tensor and only order
/// their endpoints.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Edge {
    pub src: Node,
    pub dst: Node,
    pub src_idx: usize,
    pub dst_idx: usize,
}

/// Slot index of an edge that carries no data
pub const CONTROL_SLOT: usize = usize::MAX;

impl Edge {
    pub fn new(src: Node, src_idx: usize, dst: Node, dst_idx: usize) -> Self {
        Self {
            src,
            dst,
            src_idx,
            dst_idx,
        }
    }

    pub fn control(src: Node, dst: Node) -> Self {
        Self::new(src, CONTROL_SLOT, dst, CONTROL_SLOT)
    }

    pub fn is_control(&self) -> bool {
        self.src_idx == CONTROL_SLOT || self.dst_idx == CONTROL_SLOT
    }
}
