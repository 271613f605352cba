use log::trace;

use crate::graph::{Graph, OperatorRegistry};
use crate::opt::graph::{GraphSuggester, SuggestResult};

use super::{
    ChannelParallelSuggester, ElementwiseFusionSuggester, ParallelOpFusionSuggester,
    PartitionSuggester,
};

/// Union of the suggestions of several suggesters
pub struct CompositeSuggester {
    suggesters: Vec<Box<dyn GraphSuggester>>,
}

impl CompositeSuggester {
    pub fn new(suggesters: Vec<Box<dyn GraphSuggester>>) -> Self {
        Self { suggesters }
    }

    /// Partitioning, linear channel splits and both kinds of fusion
    pub fn default_rewrites() -> Self {
        Self::new(vec![
            Box::new(PartitionSuggester::new()),
            Box::new(ChannelParallelSuggester::new()),
            Box::new(ElementwiseFusionSuggester::new()),
            Box::new(ParallelOpFusionSuggester::new()),
        ])
    }

    pub fn add_suggester(&mut self, suggester: Box<dyn GraphSuggester>) {
        self.suggesters.push(suggester);
    }
}

impl Default for CompositeSuggester {
    fn default() -> Self {
        Self::default_rewrites()
    }
}

impl GraphSuggester for CompositeSuggester {
    fn name(&self) -> &'static str {
        "composite"
    }

    fn suggest(&self, graph: &Graph, registry: &OperatorRegistry) -> Vec<SuggestResult> {
        let mut all_results = Vec::new();
        for suggester in &self.suggesters {
            let results = suggester.suggest(graph, registry);
            trace!("suggester '{}' returned {} results", suggester.name(), results.len());
            all_results.extend(results);
        }
        all_results
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::machine::MachineResource;

    struct Fixed(&'static str, usize);

    impl GraphSuggester for Fixed {
        fn name(&self) -> &'static str {
            self.0
        }

        fn suggest(&self, _graph: &Graph, _registry: &OperatorRegistry) -> Vec<SuggestResult> {
            (0..self.1)
                .map(|i| SuggestResult::with_description(Graph::new(), self.0, format!("#{}", i)))
                .collect()
        }
    }

    #[test]
    fn test_composite_suggester() {
        let reg = OperatorRegistry::new(&MachineResource::new(1, 1, 0));
        let composite = CompositeSuggester::new(vec![Box::new(Fixed("one", 1)), Box::new(Fixed("two", 2))]);
        let suggestions = composite.suggest(&Graph::new(), &reg);
        assert_eq!(suggestions.len(), 3);
        assert_eq!(suggestions[2].suggester_name, "two");
    }
}
