// ===========================================================================
// Classification of known features against their stored edge
// ===========================================================================
use ahash::AHashSet;
use geo::{Coord, LineString};
use tracing::{debug, warn};

use crate::attributes::EdgeAttributes;
use crate::config::ReimportConfig;
use crate::edge_creator::{endpoints, resolve_endpoint_nodes};
use crate::error::Result;
use crate::feature_source::DlmFeature;
use crate::geometry_utils::coord_distance;
use crate::graph_types::{Edge, EdgeId, NodeId};
use crate::linear_projection::LinearAttributeProjector;
use crate::network::RoadNetwork;
use crate::spatial_index::SpatialNodeIndex;
use crate::split::{SplitDetector, SplitExecutor, record_recoverable};
use crate::statistics::ReimportStatistics;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateClass {
    /// Geometry is identical; only protected fields may change.
    Unchanged,
    /// Endpoints still resolve to the edge's own nodes. `from`/`to` are
    /// swapped against the stored edge when the feature was digitized the
    /// other way round.
    Simple { from: NodeId, to: NodeId },
    /// Endpoints moved to other nodes (or to none).
    Topological,
}

pub struct EdgeUpdateClassifier<'a> {
    config: &'a ReimportConfig,
}

impl<'a> EdgeUpdateClassifier<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    pub fn classify(
        &self,
        network: &RoadNetwork,
        edge: &Edge,
        feature: &DlmFeature,
        index: &SpatialNodeIndex,
    ) -> Result<UpdateClass> {
        if edge.geometry == feature.geometry || self.is_pinned_form(network, edge, feature) {
            return Ok(UpdateClass::Unchanged);
        }
        let (start, end) = endpoints(
            &feature.external_id,
            &feature.geometry,
            self.config.snap_tolerance,
        )?;

        match (index.find_nearest(start), index.find_nearest(end)) {
            (Some(s), Some(e)) if s == edge.from && e == edge.to => {
                Ok(UpdateClass::Simple { from: s, to: e })
            }
            (Some(s), Some(e)) if s == edge.to && e == edge.from => {
                Ok(UpdateClass::Simple { from: s, to: e })
            }
            _ => Ok(UpdateClass::Topological),
        }
    }

    /// The stored geometry is exactly what an earlier topological update made
    /// of this feature: ends pinned onto nodes within the search radius.
    fn is_pinned_form(&self, network: &RoadNetwork, edge: &Edge, feature: &DlmFeature) -> bool {
        let radius = self.config.topological_search_radius;
        let near = |coord: Option<&Coord>, node: NodeId| {
            coord
                .zip(network.node(node))
                .is_some_and(|(c, n)| coord_distance(*c, n.point) <= radius)
        };
        near(feature.geometry.0.first(), edge.from)
            && near(feature.geometry.0.last(), edge.to)
            && edge.geometry == self.pinned(network, &feature.geometry, edge.from, edge.to)
    }

    /// Refresh name and number when the dataset carries new values.
    pub fn apply_unchanged(
        &self,
        network: &mut RoadNetwork,
        edge: &Edge,
        feature: &DlmFeature,
        stats: &mut ReimportStatistics,
    ) {
        let mut updated = edge.clone();
        if updated
            .attributes
            .refresh_protected(feature.name.as_deref(), feature.number.as_deref())
        {
            network.update_edge(updated);
        }
        stats.unchanged += 1;
    }

    /// Replace the geometry and re-project every group onto it.
    pub fn apply_simple(
        &self,
        network: &mut RoadNetwork,
        edge: &Edge,
        feature: &DlmFeature,
        from: NodeId,
        to: NodeId,
        stats: &mut ReimportStatistics,
    ) -> Result<()> {
        let mut updated = edge.clone();
        updated.attributes = self.reprojected_or_reset(edge, feature, stats)?;
        updated.geometry = feature.geometry.clone();
        updated.from = from;
        updated.to = to;
        network.update_edge(updated);
        stats.simple_updates += 1;
        Ok(())
    }

    /// Endpoints changed: try to explain the change as a split first, and
    /// otherwise rewrite the edge onto its new nodes.
    pub fn apply_topological(
        &self,
        network: &mut RoadNetwork,
        index: &mut SpatialNodeIndex,
        edge: &Edge,
        feature: &DlmFeature,
        excluded: &AHashSet<EdgeId>,
        stats: &mut ReimportStatistics,
    ) -> Result<()> {
        stats.topological_updates += 1;
        let radius = self.config.topological_search_radius;
        let (start, end) = endpoints(
            &feature.external_id,
            &feature.geometry,
            self.config.snap_tolerance,
        )?;

        let stand_in = match (
            index.find_nearest_within(start, radius),
            index.find_nearest_within(end, radius),
        ) {
            (Some(from), Some(to)) if from != to => {
                let mut stand_in = Edge {
                    geometry: self.pinned(network, &feature.geometry, from, to),
                    from,
                    to,
                    ..edge.clone()
                };
                stand_in
                    .attributes
                    .refresh_protected(feature.name.as_deref(), feature.number.as_deref());
                Some(stand_in)
            }
            _ => None,
        };

        let detector = SplitDetector::new(self.config);
        let executor = SplitExecutor::new(self.config);

        if let Some(chain) = detector.detect(network, edge, stand_in.as_ref(), excluded) {
            match stand_in {
                Some(stand_in) if chain.contains(edge.id) => {
                    debug!(external_id = %feature.external_id, edge_id = %edge.id, "topological update is part of a split");
                    network.update_edge(stand_in);
                    executor.execute(network, &chain, edge, false, stats)?;
                }
                _ => {
                    debug!(external_id = %feature.external_id, edge_id = %edge.id, "edge was split and moved elsewhere");
                    executor.execute(network, &chain, edge, false, stats)?;
                    let mut attributes = EdgeAttributes {
                        name: edge.attributes.name.clone(),
                        number: edge.attributes.number.clone(),
                        ..Default::default()
                    };
                    attributes.refresh_protected(feature.name.as_deref(), feature.number.as_deref());
                    self.rewrite(network, index, edge, feature, attributes, stats);
                }
            }
            return Ok(());
        }

        let attributes = self.reprojected_or_reset(edge, feature, stats)?;
        self.rewrite(network, index, edge, feature, attributes, stats);
        stats.non_split_topological_changes += 1;
        Ok(())
    }

    /// Move the edge onto nodes at its new endpoints, creating them if needed.
    fn rewrite(
        &self,
        network: &mut RoadNetwork,
        index: &mut SpatialNodeIndex,
        edge: &Edge,
        feature: &DlmFeature,
        attributes: EdgeAttributes,
        stats: &mut ReimportStatistics,
    ) {
        let radius = self.config.topological_search_radius;
        let geometry = feature.geometry.clone();
        let (Some(start), Some(end)) = (geometry.0.first().copied(), geometry.0.last().copied())
        else {
            return;
        };

        let (from, to) = resolve_endpoint_nodes(network, index, start, end, radius, stats);

        let geometry = self.pinned(network, &geometry, from, to);
        network.update_edge(Edge {
            geometry,
            from,
            to,
            attributes,
            ..edge.clone()
        });
    }

    /// `geometry` with its ends moved onto the nodes they were resolved to,
    /// where they lie further away than the snap tolerance.
    fn pinned(
        &self,
        network: &RoadNetwork,
        geometry: &LineString,
        from: NodeId,
        to: NodeId,
    ) -> LineString {
        let mut coords = geometry.0.clone();
        let last = coords.len().saturating_sub(1);
        for (position, node) in [(0, from), (last, to)] {
            if let (Some(coord), Some(node)) = (coords.get_mut(position), network.node(node)) {
                if coord_distance(*coord, node.point) > self.config.snap_tolerance {
                    *coord = node.point;
                }
            }
        }
        LineString::new(coords)
    }

    /// Attributes of `edge` re-projected onto the feature geometry, or the
    /// defaults (protected fields kept) when projection fails recoverably.
    fn reprojected_or_reset(
        &self,
        edge: &Edge,
        feature: &DlmFeature,
        stats: &mut ReimportStatistics,
    ) -> Result<EdgeAttributes> {
        let projector = LinearAttributeProjector::new(self.config);
        let mut attributes =
            match projector.reproject_attributes(&edge.attributes, &edge.geometry, &feature.geometry)
            {
                Ok(projected) => projected.attributes,
                Err(e) if e.is_recoverable() => {
                    warn!(
                        external_id = %feature.external_id,
                        edge_id = %edge.id,
                        error = %e,
                        lost_attributes = edge.attributes.has_non_default_groups(),
                        "attribute projection failed, resetting to defaults"
                    );
                    record_recoverable(&e, stats);
                    let mut reset = edge.attributes.clone();
                    reset.reset_to_default();
                    reset
                }
                Err(e) => return Err(e),
            };
        attributes.refresh_protected(feature.name.as_deref(), feature.number.as_deref());
        Ok(attributes)
    }
}
