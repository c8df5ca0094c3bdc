/// Counters collected by the neighbour search and merged across queries.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SearchTelemetry {
    pub segments: usize,
    pub tree_levels: Vec<usize>,
    pub brute_force_queries: usize,
    pub tree_queries: usize,
    /// Tree queries whose candidate set stayed below k and were answered by a scan.
    pub tree_fallbacks: usize,
    pub frontier_expanded: usize,
    pub distance_evals: usize,
    pub duplicates_found: usize,
}

impl SearchTelemetry {
    pub fn record_tree(&mut self, levels: usize) {
        self.segments += 1;
        self.tree_levels.push(levels);
    }

    pub fn record_frontier(&mut self, expanded: usize) {
        self.frontier_expanded += expanded;
    }

    pub fn record_distances(&mut self, count: usize) {
        self.distance_evals += count;
    }

    pub fn add_from(&mut self, other: &SearchTelemetry) {
        self.segments += other.segments;
        self.tree_levels
            .extend_from_slice(other.tree_levels.as_slice());
        self.brute_force_queries += other.brute_force_queries;
        self.tree_queries += other.tree_queries;
        self.tree_fallbacks += other.tree_fallbacks;
        self.frontier_expanded += other.frontier_expanded;
        self.distance_evals += other.distance_evals;
        self.duplicates_found += other.duplicates_found;
    }

    pub fn max_tree_level(&self) -> usize {
        self.tree_levels.iter().copied().max().unwrap_or(0)
    }

    pub fn log_summary(&self, context: &str) {
        log::debug!(
            "{context}: {} segment(s), max tree level {}, {} tree queries ({} fallbacks), \
             {} brute-force queries, {} distance evaluations",
            self.segments,
            self.max_tree_level(),
            self.tree_queries,
            self.tree_fallbacks,
            self.brute_force_queries,
            self.distance_evals
        );
    }
}
