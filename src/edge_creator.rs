use geo::{Coord, LineString};
use tracing::debug;

use crate::attributes::EdgeAttributes;
use crate::config::ReimportConfig;
use crate::error::{ReimportError, Result};
use crate::feature_source::DlmFeature;
use crate::geometry_utils::{coord_distance, end_coord, line_length, start_coord};
use crate::graph_types::{EdgeId, NodeId, Provenance};
use crate::network::RoadNetwork;
use crate::spatial_index::SpatialNodeIndex;
use crate::statistics::ReimportStatistics;

/// Find a node within `radius` of `point`, or create one there.
pub fn resolve_or_create_node(
    network: &mut RoadNetwork,
    index: &mut SpatialNodeIndex,
    point: Coord,
    radius: f64,
    stats: &mut ReimportStatistics,
) -> NodeId {
    if let Some(existing) = index.find_nearest_within(point, radius) {
        return existing;
    }
    let id = network.add_node(point, Provenance::ExternalDataset);
    if let Some(node) = network.node(id) {
        index.insert(node);
    }
    stats.nodes_created += 1;
    id
}

/// Nodes for both ends of a line. When one node catches both ends, the end
/// gets a node of its own so the edge never becomes a self-loop.
pub fn resolve_endpoint_nodes(
    network: &mut RoadNetwork,
    index: &mut SpatialNodeIndex,
    start: Coord,
    end: Coord,
    radius: f64,
    stats: &mut ReimportStatistics,
) -> (NodeId, NodeId) {
    let from = resolve_or_create_node(network, index, start, radius, stats);
    let to = resolve_or_create_node(network, index, end, radius, stats);
    if to != from {
        return (from, to);
    }
    let to = network.add_node(end, Provenance::ExternalDataset);
    if let Some(node) = network.node(to) {
        index.insert(node);
    }
    stats.nodes_created += 1;
    (from, to)
}

/// Start and end of `geometry`, rejecting closed rings and lines without length.
pub fn endpoints(
    external_id: &str,
    geometry: &LineString,
    snap_tolerance: f64,
) -> Result<(Coord, Coord)> {
    let degenerate = || ReimportError::DegenerateGeometry {
        external_id: external_id.to_string(),
    };
    let (Some(start), Some(end)) = (start_coord(geometry), end_coord(geometry)) else {
        return Err(degenerate());
    };
    if coord_distance(start, end) <= snap_tolerance || line_length(geometry) <= f64::EPSILON {
        return Err(degenerate());
    }
    Ok((start, end))
}

pub struct EdgeCreator<'a> {
    config: &'a ReimportConfig,
}

impl<'a> EdgeCreator<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    /// Insert `feature` as a new edge with one full-span segment per group.
    pub fn create(
        &self,
        network: &mut RoadNetwork,
        index: &mut SpatialNodeIndex,
        feature: &DlmFeature,
        stats: &mut ReimportStatistics,
    ) -> Result<EdgeId> {
        let (start, end) = endpoints(
            &feature.external_id,
            &feature.geometry,
            self.config.snap_tolerance,
        )?;

        let (from, to) = resolve_endpoint_nodes(
            network,
            index,
            start,
            end,
            self.config.snap_tolerance,
            stats,
        );

        let attributes = EdgeAttributes::from_payloads(
            feature.name.clone(),
            feature.number.clone(),
            &feature.payloads,
        );
        let id = network.add_edge(
            Some(feature.external_id.clone()),
            feature.geometry.clone(),
            from,
            to,
            Provenance::ExternalDataset,
            attributes,
        );
        debug!(external_id = %feature.external_id, edge_id = %id, %from, %to, "created edge");
        Ok(id)
    }
}
