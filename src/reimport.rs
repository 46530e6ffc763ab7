// ===========================================================================
// Reimport orchestration
// ===========================================================================
//
// One pass over the external dataset:
//   - partitions in row-major order, each with its own node index and commit
//   - retirement of edges the dataset no longer contains (or split up)
//   - post-run topology error count
//
// Any unrecoverable error discards the pending journal and aborts the run
// through the sink. The in-memory network is left as it was at the failure
// point and has to be reloaded before it is used again.
// ===========================================================================

use ahash::AHashSet;
use anyhow::Context;
use geo::Rect;
use tracing::{error, info, warn};

use crate::config::ReimportConfig;
use crate::edge_creator::EdgeCreator;
use crate::error::ReimportError;
use crate::feature_source::{DlmFeature, FeatureSource, Partition};
use crate::geometry_utils::{combined_envelope, expand_rect};
use crate::graph_types::{Edge, EdgeId, Provenance};
use crate::network::RoadNetwork;
use crate::sink::PartitionSink;
use crate::spatial_index::SpatialNodeIndex;
use crate::split::{SplitDetector, SplitExecutor};
use crate::statistics::{ReimportStatistics, TopologyCorrectionStatistics};
use crate::topology_correction::{TopologyCorrectionPass, count_topology_errors};
use crate::update_classifier::{EdgeUpdateClassifier, UpdateClass};

pub const RETIREMENT_LABEL: &str = "retirement";

pub struct Reimporter<'a> {
    config: &'a ReimportConfig,
    stats: ReimportStatistics,
    seen: AHashSet<String>,
}

impl<'a> Reimporter<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self {
            config,
            stats: ReimportStatistics::default(),
            seen: AHashSet::new(),
        }
    }

    pub fn statistics(&self) -> &ReimportStatistics {
        &self.stats
    }

    /// Reconcile `network` with everything `source` delivers.
    ///
    /// Returns the run statistics; callers still have to check
    /// [`ReimportStatistics::is_failed`] before trusting the result.
    pub fn run(
        &mut self,
        network: &mut RoadNetwork,
        source: &mut dyn FeatureSource,
        sink: &mut dyn PartitionSink,
    ) -> anyhow::Result<ReimportStatistics> {
        self.config.validate().context("invalid reimport configuration")?;
        self.stats = ReimportStatistics::default();
        self.seen.clear();

        // Anything pending belongs to an earlier, unrelated unit of work.
        let stale = network.drain_journal();
        if !stale.is_empty() {
            warn!(mutations = stale.len(), "dropping mutations journaled before the run");
        }

        if let Some(extent) = source.extent() {
            let partitions = Partition::grid(extent, self.config.partition_size);
            info!(partitions = partitions.len(), "starting reimport");
            for partition in &partitions {
                if let Err(e) = self.process_partition(network, source, sink, partition) {
                    return Err(self.abort(network, sink, e));
                }
            }
        } else {
            warn!("feature source is empty");
        }

        if self.stats.features_processed == 0 {
            // An empty delivery would otherwise retire the whole network.
            warn!("no features processed, skipping retirement");
        } else if let Err(e) = self.retire_vanished(network, sink) {
            return Err(self.abort(network, sink, e));
        }

        self.stats.post_run_topology_errors =
            count_topology_errors(network, self.config.snap_tolerance);
        info!(
            processed = self.stats.features_processed,
            new = self.stats.new_edges,
            simple = self.stats.simple_updates,
            topological = self.stats.topological_updates,
            splits = self.stats.splits,
            unchanged = self.stats.unchanged,
            deleted = self.stats.edges_deleted,
            resets = self.stats.attribute_resets,
            topology_errors = self.stats.post_run_topology_errors,
            failed = self.stats.is_failed(),
            "reimport finished"
        );
        Ok(self.stats.clone())
    }

    /// Run the topology correction pass and fold its counts into the run
    /// statistics.
    pub fn correct_topology(
        &mut self,
        network: &mut RoadNetwork,
        sink: &mut dyn PartitionSink,
    ) -> anyhow::Result<TopologyCorrectionStatistics> {
        let correction = TopologyCorrectionPass::new(self.config).run(network, sink)?;
        self.stats.nodes_merged += correction.nodes_merged;
        self.stats.nodes_deleted += correction.orphans_removed;
        self.stats.nodes_created += correction.nodes_created;
        self.stats.post_run_topology_errors =
            count_topology_errors(network, self.config.snap_tolerance);
        Ok(correction)
    }

    fn abort(
        &mut self,
        network: &mut RoadNetwork,
        sink: &mut dyn PartitionSink,
        cause: anyhow::Error,
    ) -> anyhow::Error {
        let discarded = network.drain_journal().len();
        self.stats.fatal_errors += 1;
        error!(error = ?cause, discarded, "reimport aborted");
        if let Err(abort_error) = sink.abort_run(&format!("{cause:#}")) {
            error!(error = ?abort_error, "sink failed to abort the run");
        }
        cause
    }

    fn process_partition(
        &mut self,
        network: &mut RoadNetwork,
        source: &mut dyn FeatureSource,
        sink: &mut dyn PartitionSink,
        partition: &Partition,
    ) -> anyhow::Result<()> {
        let label = partition.to_string();
        let features = source
            .features_in(partition)
            .with_context(|| format!("reading features of partition {label}"))?;
        if features.is_empty() {
            return Ok(());
        }

        let Some(area) = features_area(&features, self.config.max_search_radius()) else {
            return Ok(());
        };
        let mut index =
            SpatialNodeIndex::from_nodes(network.nodes_in(&area), self.config.snap_tolerance);

        let creator = EdgeCreator::new(self.config);
        let classifier = EdgeUpdateClassifier::new(self.config);
        let mut deferred: Vec<(EdgeId, DlmFeature)> = Vec::new();
        let count = features.len();

        for feature in features {
            self.stats.features_processed += 1;
            if !feature.routable {
                self.stats.skipped_non_routable += 1;
                continue;
            }
            if !self.seen.insert(feature.external_id.clone()) {
                warn!(partition = %label, external_id = %feature.external_id, "duplicate external id, skipped");
                self.stats.skipped_duplicate += 1;
                continue;
            }

            let Some(edge) = network.edge_by_external_id(&feature.external_id).cloned() else {
                match creator.create(network, &mut index, &feature, &mut self.stats) {
                    Ok(_) => self.stats.new_edges += 1,
                    Err(e) => self.skip_or_fail(&feature, e, &label)?,
                }
                continue;
            };

            match classifier.classify(network, &edge, &feature, &index) {
                Ok(UpdateClass::Unchanged) => {
                    classifier.apply_unchanged(network, &edge, &feature, &mut self.stats)
                }
                Ok(UpdateClass::Simple { from, to }) => classifier
                    .apply_simple(network, &edge, &feature, from, to, &mut self.stats)
                    .with_context(|| format!("simple update of {}", feature.external_id))?,
                Ok(UpdateClass::Topological) => deferred.push((edge.id, feature)),
                Err(e) => self.skip_or_fail(&feature, e, &label)?,
            }
        }

        // Topological updates last, so split detection sees every edge this
        // partition created.
        let nothing_excluded = AHashSet::new();
        for (edge_id, feature) in deferred {
            let Some(edge) = network.edge(edge_id).cloned() else {
                continue;
            };
            classifier
                .apply_topological(
                    network,
                    &mut index,
                    &edge,
                    &feature,
                    &nothing_excluded,
                    &mut self.stats,
                )
                .with_context(|| format!("topological update of {}", feature.external_id))?;
        }

        sink.commit_partition(&label, network.drain_journal())
            .with_context(|| format!("committing partition {label}"))?;
        info!(partition = %label, features = count, "partition reconciled");
        Ok(())
    }

    /// Recoverable per-feature errors become statistics; anything else stops the run.
    fn skip_or_fail(
        &mut self,
        feature: &DlmFeature,
        e: ReimportError,
        label: &str,
    ) -> anyhow::Result<()> {
        match e {
            ReimportError::DegenerateGeometry { .. } => {
                warn!(partition = label, external_id = %feature.external_id, "degenerate geometry, skipped");
                self.stats.skipped_degenerate += 1;
                Ok(())
            }
            other => Err(anyhow::Error::new(other)
                .context(format!("feature {} in partition {label}", feature.external_id))),
        }
    }

    /// Delete (or split up) external-dataset edges the dataset no longer has,
    /// then drop the nodes that lost all their edges.
    fn retire_vanished(
        &mut self,
        network: &mut RoadNetwork,
        sink: &mut dyn PartitionSink,
    ) -> anyhow::Result<()> {
        let vanished: Vec<EdgeId> = network
            .edges()
            .filter(|edge| self.is_vanished(edge))
            .map(|edge| edge.id)
            .collect();
        let excluded: AHashSet<EdgeId> = vanished.iter().copied().collect();

        let detector = SplitDetector::new(self.config);
        let executor = SplitExecutor::new(self.config);
        for id in &vanished {
            let Some(old) = network.edge(*id).cloned() else {
                continue;
            };
            match detector.detect(network, &old, None, &excluded) {
                Some(chain) => executor
                    .execute(network, &chain, &old, true, &mut self.stats)
                    .with_context(|| format!("splitting vanished edge {}", old.id))?,
                None => {
                    if network.remove_edge(old.id).is_some() {
                        self.stats.edges_deleted += 1;
                    }
                }
            }
        }

        for node in network.orphan_nodes() {
            if network.remove_node(node) {
                self.stats.nodes_deleted += 1;
            }
        }

        let mutations = network.pending_mutations();
        sink.commit_partition(RETIREMENT_LABEL, network.drain_journal())
            .context("committing retirement")?;
        info!(
            vanished = vanished.len(),
            mutations,
            deleted = self.stats.edges_deleted,
            nodes_deleted = self.stats.nodes_deleted,
            "retired vanished edges"
        );
        Ok(())
    }

    fn is_vanished(&self, edge: &Edge) -> bool {
        edge.provenance == Provenance::ExternalDataset
            && edge
                .external_id
                .as_ref()
                .is_some_and(|id| !self.seen.contains(id))
    }
}

/// Envelope of all feature geometries, grown by `margin`.
fn features_area(features: &[DlmFeature], margin: f64) -> Option<Rect> {
    combined_envelope(features.iter().map(|f| &f.geometry)).map(|rect| expand_rect(rect, margin))
}
