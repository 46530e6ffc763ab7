use serde::Serialize;

/// Counters for one reimport run.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReimportStatistics {
    pub features_processed: usize,
    pub new_edges: usize,
    pub simple_updates: usize,
    pub topological_updates: usize,
    pub splits: usize,
    pub unchanged: usize,

    pub skipped_degenerate: usize,
    pub skipped_non_routable: usize,
    pub skipped_duplicate: usize,

    pub edges_deleted: usize,
    pub nodes_created: usize,
    pub nodes_deleted: usize,
    pub nodes_merged: usize,

    /// Direction could not be decided; attributes were reset.
    pub stationing_ambiguous: usize,
    /// Projected segments came out inverted; attributes were reset.
    pub projection_order_reversed: usize,
    /// Every fallback to default attributes, whatever the cause.
    pub attribute_resets: usize,
    /// Topological updates with no valid split, applied by overwriting the edge.
    pub non_split_topological_changes: usize,
    pub fatal_errors: usize,

    /// Edges whose stored geometry disagrees with their nodes after the run.
    pub post_run_topology_errors: usize,
}

impl ReimportStatistics {
    /// A run fails when it processed nothing, hit an unrecoverable error,
    /// or left a broken graph behind.
    pub fn is_failed(&self) -> bool {
        self.features_processed == 0 || self.fatal_errors > 0 || self.post_run_topology_errors > 0
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

/// Counters for one topology correction pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TopologyCorrectionStatistics {
    pub orphans_removed: usize,
    pub clusters_found: usize,
    pub nodes_merged: usize,
    /// Merges skipped because they would have collapsed an edge onto itself.
    pub self_loop_merges_skipped: usize,
    pub nodes_snapped: usize,
    pub falsely_connected_edges_fixed: usize,
    pub nodes_created: usize,
}
