// ===========================================================================
// Topology correction pass
// ===========================================================================
//
// Runs after a reimport has committed. Three repairs, each committed on its
// own and safe to repeat:
//   1. orphan cleanup
//   2. duplicate node merge (DBSCAN over external-dataset nodes)
//   3. endpoint reconciliation (node position vs. edge geometry ends)
// ===========================================================================

use ahash::AHashMap;
use anyhow::Context;
use geo::Coord;
use rstar::RTree;
use rstar::primitives::GeomWithData;
use std::cmp::Reverse;
use std::collections::VecDeque;
use tracing::{debug, info};

use crate::config::ReimportConfig;
use crate::geometry_utils::coord_distance;
use crate::graph_types::{Edge, EdgeId, NodeId, Provenance};
use crate::network::RoadNetwork;
use crate::sink::PartitionSink;
use crate::spatial_index::SpatialNodeIndex;
use crate::statistics::TopologyCorrectionStatistics;

pub struct TopologyCorrectionPass<'a> {
    config: &'a ReimportConfig,
}

impl<'a> TopologyCorrectionPass<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    pub fn run(
        &self,
        network: &mut RoadNetwork,
        sink: &mut dyn PartitionSink,
    ) -> anyhow::Result<TopologyCorrectionStatistics> {
        let mut stats = TopologyCorrectionStatistics::default();

        stats.orphans_removed = self.remove_orphans(network);
        sink.commit_partition("topology:orphans", network.drain_journal())
            .context("committing orphan cleanup")?;

        self.merge_duplicates(network, &mut stats);
        sink.commit_partition("topology:merge", network.drain_journal())
            .context("committing duplicate node merge")?;

        self.reconcile_endpoints(network, &mut stats);
        sink.commit_partition("topology:endpoints", network.drain_journal())
            .context("committing endpoint reconciliation")?;

        info!(
            orphans = stats.orphans_removed,
            clusters = stats.clusters_found,
            merged = stats.nodes_merged,
            merge_skipped = stats.self_loop_merges_skipped,
            snapped = stats.nodes_snapped,
            fixed = stats.falsely_connected_edges_fixed,
            "topology correction finished"
        );
        Ok(stats)
    }

    /// Delete every node without incident edges.
    pub fn remove_orphans(&self, network: &mut RoadNetwork) -> usize {
        network
            .orphan_nodes()
            .into_iter()
            .filter(|id| network.remove_node(*id))
            .count()
    }

    /// Clusters of external-dataset nodes closer than `merge_radius`.
    ///
    /// Plain DBSCAN: a node with at least `merge_min_points` nodes (itself
    /// included) in its radius is a core node; clusters grow through core
    /// nodes only. Clusters come back sorted by their lowest node id.
    pub fn duplicate_clusters(&self, network: &RoadNetwork) -> Vec<Vec<NodeId>> {
        let nodes: Vec<(NodeId, Coord)> = network
            .nodes()
            .filter(|n| n.provenance == Provenance::ExternalDataset)
            .map(|n| (n.id, n.point))
            .collect();
        let tree: RTree<GeomWithData<[f64; 2], usize>> = RTree::bulk_load(
            nodes
                .iter()
                .enumerate()
                .map(|(i, (_, p))| GeomWithData::new([p.x, p.y], i))
                .collect(),
        );
        let radius_2 = self.config.merge_radius * self.config.merge_radius;
        let neighbours = |i: usize| -> Vec<usize> {
            let p = nodes[i].1;
            tree.locate_within_distance([p.x, p.y], radius_2)
                .map(|entry| entry.data)
                .collect()
        };

        let mut label: Vec<Option<usize>> = vec![None; nodes.len()];
        let mut clusters: Vec<Vec<usize>> = Vec::new();

        for i in 0..nodes.len() {
            if label[i].is_some() {
                continue;
            }
            let seeds = neighbours(i);
            if seeds.len() < self.config.merge_min_points {
                continue;
            }
            let cluster = clusters.len();
            clusters.push(Vec::new());
            let mut queue: VecDeque<usize> = VecDeque::from(seeds);
            label[i] = Some(cluster);
            clusters[cluster].push(i);

            while let Some(j) = queue.pop_front() {
                if label[j].is_some() {
                    continue;
                }
                label[j] = Some(cluster);
                clusters[cluster].push(j);
                let reach = neighbours(j);
                if reach.len() >= self.config.merge_min_points {
                    queue.extend(reach.into_iter().filter(|k| label[*k].is_none()));
                }
            }
        }

        let mut result: Vec<Vec<NodeId>> = clusters
            .into_iter()
            .map(|members| {
                let mut ids: Vec<NodeId> = members.into_iter().map(|i| nodes[i].0).collect();
                ids.sort_unstable();
                ids
            })
            .filter(|ids| ids.len() > 1)
            .collect();
        result.sort_by_key(|ids| ids[0]);
        result
    }

    /// Fold every cluster onto its best-connected node.
    pub fn merge_duplicates(&self, network: &mut RoadNetwork, stats: &mut TopologyCorrectionStatistics) {
        for cluster in self.duplicate_clusters(network) {
            stats.clusters_found += 1;
            let Some(survivor) = cluster
                .iter()
                .copied()
                .max_by_key(|id| (network.degree(*id), Reverse(*id)))
            else {
                continue;
            };
            let Some(target) = network.node(survivor).map(|n| n.point) else {
                continue;
            };

            for duplicate in cluster.into_iter().filter(|id| *id != survivor) {
                let incident = network.incident_edges(duplicate);
                let collapses = incident.iter().any(|e| {
                    network.edge(*e).is_some_and(|edge| {
                        let from = if edge.from == duplicate { survivor } else { edge.from };
                        let to = if edge.to == duplicate { survivor } else { edge.to };
                        from == to
                    })
                });
                if collapses {
                    debug!(node = %duplicate, %survivor, "merge would create a self-loop, skipped");
                    stats.self_loop_merges_skipped += 1;
                    continue;
                }

                for edge_id in incident {
                    repoint(network, edge_id, duplicate, survivor, target);
                }
                if network.remove_node(duplicate) {
                    stats.nodes_merged += 1;
                }
            }
        }
    }

    /// Make node positions and edge geometry ends agree again.
    ///
    /// A node whose incident ends disagree is moved onto the end closest to
    /// it; edges whose end is still off afterwards were falsely connected
    /// and get a node of their own (an existing one at that spot, or a new one).
    pub fn reconcile_endpoints(
        &self,
        network: &mut RoadNetwork,
        stats: &mut TopologyCorrectionStatistics,
    ) {
        let tolerance = self.config.snap_tolerance;
        let mut index = SpatialNodeIndex::from_nodes(network.nodes(), tolerance);
        let node_ids: Vec<NodeId> = network.nodes().map(|n| n.id).collect();

        for node_id in node_ids {
            let Some(point) = network.node(node_id).map(|n| n.point) else {
                continue;
            };
            let ends: Vec<(EdgeId, Coord)> = network
                .incident_edges(node_id)
                .into_iter()
                .filter_map(|e| network.edge(e))
                .filter(|edge| !edge.is_self_loop())
                .filter_map(|edge| edge.endpoint_coord(node_id).map(|c| (edge.id, c)))
                .collect();
            if ends
                .iter()
                .all(|(_, c)| coord_distance(*c, point) <= tolerance)
            {
                continue;
            }

            let Some(anchor) = ends
                .iter()
                .map(|(_, c)| *c)
                .min_by(|a, b| coord_distance(*a, point).total_cmp(&coord_distance(*b, point)))
            else {
                continue;
            };
            if anchor != point {
                network.move_node(node_id, anchor);
                index.relocate(node_id, point, anchor);
                stats.nodes_snapped += 1;
            }

            // Group the remaining misfits by the location they actually end at.
            let mut misfits: AHashMap<(u64, u64), (Coord, Vec<EdgeId>)> = AHashMap::new();
            for (edge_id, end) in ends {
                if coord_distance(end, anchor) > tolerance {
                    misfits
                        .entry((end.x.to_bits(), end.y.to_bits()))
                        .or_insert_with(|| (end, Vec::new()))
                        .1
                        .push(edge_id);
                }
            }
            let mut misfits: Vec<(Coord, Vec<EdgeId>)> = misfits.into_values().collect();
            misfits.sort_by_key(|(_, edges)| edges[0]);

            for (end, edges) in misfits {
                let replacement = index
                    .find_nearest(end)
                    .filter(|found| *found != node_id)
                    .filter(|found| {
                        edges.iter().all(|e| {
                            network
                                .edge(*e)
                                .and_then(|edge| edge.other_node(node_id))
                                .is_some_and(|other| other != *found)
                        })
                    });
                let replacement = match replacement {
                    Some(existing) => existing,
                    None => {
                        let created = network.add_node(end, Provenance::ExternalDataset);
                        if let Some(node) = network.node(created) {
                            index.insert(node);
                        }
                        stats.nodes_created += 1;
                        created
                    }
                };
                let Some(target) = network.node(replacement).map(|n| n.point) else {
                    continue;
                };
                for edge_id in edges {
                    repoint(network, edge_id, node_id, replacement, target);
                    stats.falsely_connected_edges_fixed += 1;
                }
            }
        }
    }
}

/// Move `edge_id`'s end at `from_node` over to `to_node` at `target`.
fn repoint(network: &mut RoadNetwork, edge_id: EdgeId, from_node: NodeId, to_node: NodeId, target: Coord) {
    let Some(mut edge) = network.edge(edge_id).cloned() else {
        return;
    };
    if edge.from == from_node {
        edge.from = to_node;
        if let Some(first) = edge.geometry.0.first_mut() {
            *first = target;
        }
    }
    if edge.to == from_node {
        edge.to = to_node;
        if let Some(last) = edge.geometry.0.last_mut() {
            *last = target;
        }
    }
    network.update_edge(edge);
}

/// Edges that violate the node/geometry contract: a missing endpoint node,
/// a self-loop, or a geometry end further than `tolerance` from its node.
pub fn count_topology_errors(network: &RoadNetwork, tolerance: f64) -> usize {
    network
        .edges()
        .filter(|edge| edge_topology_broken(network, edge, tolerance))
        .count()
}

fn edge_topology_broken(network: &RoadNetwork, edge: &Edge, tolerance: f64) -> bool {
    if edge.is_self_loop() {
        return true;
    }
    let (Some(from), Some(to)) = (network.node(edge.from), network.node(edge.to)) else {
        return true;
    };
    let (Some(first), Some(last)) = (edge.geometry.0.first(), edge.geometry.0.last()) else {
        return true;
    };
    coord_distance(*first, from.point) > tolerance || coord_distance(*last, to.point) > tolerance
}
