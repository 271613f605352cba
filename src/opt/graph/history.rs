//! Record of the graph search

use crate::graph::Graph;

/// One evaluated candidate
#[derive(Clone, Debug)]
pub struct SearchSnapshot {
    /// Evaluation index, 0 for the input graph
    pub step: usize,
    pub graph: Graph,
    /// DP cost of the candidate
    pub cost: f32,
    pub description: String,
    /// Suggester that produced the candidate, `None` for the input graph
    pub suggester_name: Option<String>,
    /// Candidates waiting in the queue when this one was evaluated
    pub num_candidates: usize,
    /// Whether this candidate became the best so far
    pub improved: bool,
}

impl SearchSnapshot {
    pub fn new(step: usize, graph: Graph, cost: f32, description: impl Into<String>) -> Self {
        Self {
            step,
            graph,
            cost,
            description: description.into(),
            suggester_name: None,
            num_candidates: 0,
            improved: false,
        }
    }

    pub fn with_suggester(mut self, name: impl Into<String>) -> Self {
        self.suggester_name = Some(name.into());
        self
    }

    pub fn with_candidates(mut self, num_candidates: usize) -> Self {
        self.num_candidates = num_candidates;
        self
    }

    pub fn with_improved(mut self, improved: bool) -> Self {
        self.improved = improved;
        self
    }
}

#[derive(Clone, Default, Debug)]
pub struct SearchHistory {
    snapshots: Vec<SearchSnapshot>,
}

impl SearchHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_snapshot(&mut self, snapshot: SearchSnapshot) {
        self.snapshots.push(snapshot);
    }

    pub fn snapshots(&self) -> &[SearchSnapshot] {
        &self.snapshots
    }

    pub fn len(&self) -> usize {
        self.snapshots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.snapshots.is_empty()
    }

    pub fn get(&self, step: usize) -> Option<&SearchSnapshot> {
        self.snapshots.get(step)
    }

    /// (step, cost) of every evaluation
    pub fn cost_transition(&self) -> Vec<(usize, f32)> {
        self.snapshots.iter().map(|s| (s.step, s.cost)).collect()
    }

    /// Running minimum of the cost, one entry per evaluation
    pub fn best_cost_transition(&self) -> Vec<(usize, f32)> {
        let mut best = f32::INFINITY;
        self.snapshots
            .iter()
            .map(|s| {
                best = best.min(s.cost);
                (s.step, best)
            })
            .collect()
    }

    /// Snapshots that improved on every earlier one
    pub fn improvements(&self) -> impl Iterator<Item = &SearchSnapshot> {
        self.snapshots.iter().filter(|s| s.improved)
    }
}
