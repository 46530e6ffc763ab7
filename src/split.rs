// ===========================================================================
// Split detection and execution
// ===========================================================================
//
// An edge that disappeared (or moved its endpoints) may have been cut into a
// chain of shorter edges. Detection walks greedily from the old from-node to
// the old to-node over nearby edges; execution clips the old attributes onto
// every member of the chain.
// ===========================================================================

use ahash::{AHashMap, AHashSet};
use geo::LineString;
use itertools::Itertools;
use ordered_float::OrderedFloat;
use tracing::{debug, warn};

use crate::attributes::{EdgeAttributes, Interval};
use crate::config::ReimportConfig;
use crate::error::{ReimportError, Result};
use crate::geometry_utils::{distance_to_line, envelope, expand_rect, locate, within_buffer};
use crate::graph_types::{Edge, EdgeId, NodeId};
use crate::linear_projection::{LinearAttributeProjector, StationingDirection};
use crate::network::RoadNetwork;
use crate::statistics::ReimportStatistics;

/// One replacement edge of a split, in chain order.
#[derive(Debug, Clone, PartialEq)]
pub struct ChainMember {
    pub edge: EdgeId,
    /// Node where the chain enters this edge.
    pub entry: NodeId,
    /// Node where the chain leaves this edge.
    pub exit: NodeId,
    /// True when the edge's own `from` is the entry node.
    pub forward: bool,
    /// Stretch of the old geometry this edge replaces.
    pub window: Interval,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SplitChain {
    pub old_edge: EdgeId,
    pub members: Vec<ChainMember>,
}

impl SplitChain {
    pub fn contains(&self, edge: EdgeId) -> bool {
        self.members.iter().any(|m| m.edge == edge)
    }
}

#[derive(Debug, Clone)]
struct Candidate {
    id: EdgeId,
    from: NodeId,
    to: NodeId,
    score: f64,
    geometry: LineString,
}

pub struct SplitDetector<'a> {
    config: &'a ReimportConfig,
}

impl<'a> SplitDetector<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    /// Look for a chain of at least two edges that replaces `old`.
    ///
    /// `old` is the edge as it was before this pass. `stand_in`, when given,
    /// takes the place of the stored version of the same edge (a topological
    /// update that may itself be the first or last link of the chain).
    /// Edges in `excluded` never take part.
    pub fn detect(
        &self,
        network: &RoadNetwork,
        old: &Edge,
        stand_in: Option<&Edge>,
        excluded: &AHashSet<EdgeId>,
    ) -> Option<SplitChain> {
        if old.is_self_loop() {
            return None;
        }
        let candidates = self.candidates(network, old, stand_in, excluded)?;

        let mut adjacency: AHashMap<NodeId, Vec<usize>> = AHashMap::new();
        for (i, c) in candidates.iter().enumerate() {
            adjacency.entry(c.from).or_default().push(i);
            if c.to != c.from {
                adjacency.entry(c.to).or_default().push(i);
            }
        }

        let mut path: Vec<(usize, NodeId, NodeId)> = Vec::new();
        let mut visited_nodes: AHashSet<NodeId> = AHashSet::from_iter([old.from]);
        let mut used: AHashSet<usize> = AHashSet::new();
        let mut current = old.from;
        let mut previous: Option<usize> = None;

        while current != old.to {
            let best = adjacency.get(&current).and_then(|incident| {
                incident
                    .iter()
                    .copied()
                    .filter(|i| Some(*i) != previous)
                    .min_by_key(|i| (OrderedFloat(candidates[*i].score), candidates[*i].id))
            });
            let Some(best) = best else {
                debug!(old_edge = %old.id, node = %current, "split walk reached a dead end");
                return None;
            };
            if !used.insert(best) {
                debug!(old_edge = %old.id, "split walk revisited an edge");
                return None;
            }
            let candidate = &candidates[best];
            let next = if candidate.from == current {
                candidate.to
            } else {
                candidate.from
            };
            if !visited_nodes.insert(next) {
                debug!(old_edge = %old.id, node = %next, "split walk looped back");
                return None;
            }
            path.push((best, current, next));
            previous = Some(best);
            current = next;
        }

        if path.len() < 2 {
            return None;
        }

        // Chain nodes have to advance along the old geometry.
        let mut fractions = Vec::with_capacity(path.len() + 1);
        fractions.push(0.0);
        for (_, _, exit) in &path[..path.len() - 1] {
            let point = network.node(*exit)?.point;
            fractions.push(locate(&old.geometry, point)?.fraction);
        }
        fractions.push(1.0);
        if fractions.iter().tuple_windows().any(|(a, b)| b <= a) {
            debug!(old_edge = %old.id, ?fractions, "split chain does not advance along the old edge");
            return None;
        }

        for (i, _, _) in &path {
            if !within_buffer(&candidates[*i].geometry, &old.geometry, self.config.split_buffer) {
                debug!(old_edge = %old.id, member = %candidates[*i].id, "split member leaves the buffer");
                return None;
            }
        }

        let members = path
            .iter()
            .zip(fractions.iter().copied().tuple_windows())
            .map(|((i, entry, exit), (start, end))| ChainMember {
                edge: candidates[*i].id,
                entry: *entry,
                exit: *exit,
                forward: candidates[*i].from == *entry,
                window: Interval::new(start, end),
            })
            .collect();

        Some(SplitChain {
            old_edge: old.id,
            members,
        })
    }

    /// Edges with both endpoints inside the buffer around `old`.
    fn candidates(
        &self,
        network: &RoadNetwork,
        old: &Edge,
        stand_in: Option<&Edge>,
        excluded: &AHashSet<EdgeId>,
    ) -> Option<Vec<Candidate>> {
        let buffer = self.config.split_buffer;
        let area = expand_rect(envelope(&old.geometry)?, buffer);

        let mut edge_ids: Vec<EdgeId> = network
            .nodes_in(&area)
            .into_iter()
            .flat_map(|n| network.incident_edges(n.id))
            .collect();
        edge_ids.sort_unstable();
        edge_ids.dedup();

        let node_distance = |id: NodeId| {
            network
                .node(id)
                .map(|n| distance_to_line(&old.geometry, n.point))
                .unwrap_or(f64::INFINITY)
        };
        let to_candidate = |edge: &Edge| {
            let (d_from, d_to) = (node_distance(edge.from), node_distance(edge.to));
            (d_from <= buffer && d_to <= buffer && !edge.is_self_loop()).then(|| Candidate {
                id: edge.id,
                from: edge.from,
                to: edge.to,
                score: d_from + d_to,
                geometry: edge.geometry.clone(),
            })
        };

        let mut candidates: Vec<Candidate> = edge_ids
            .into_iter()
            .filter(|id| *id != old.id && !excluded.contains(id))
            .filter_map(|id| network.edge(id))
            .filter_map(to_candidate)
            .collect();
        if let Some(edge) = stand_in.filter(|e| e.id == old.id) {
            candidates.extend(to_candidate(edge));
        }
        Some(candidates)
    }
}

pub struct SplitExecutor<'a> {
    config: &'a ReimportConfig,
}

impl<'a> SplitExecutor<'a> {
    pub fn new(config: &'a ReimportConfig) -> Self {
        Self { config }
    }

    /// Clip the attributes of `old` onto every chain member.
    ///
    /// `old` is a snapshot of the edge before this pass; members are read
    /// from `network` in their current state. When `retire_old` is set and
    /// the old edge is not itself a member, it is deleted.
    pub fn execute(
        &self,
        network: &mut RoadNetwork,
        chain: &SplitChain,
        old: &Edge,
        retire_old: bool,
        stats: &mut ReimportStatistics,
    ) -> Result<()> {
        self.check_chain(chain, old)?;
        let projector = LinearAttributeProjector::new(self.config);

        for member in &chain.members {
            let Some(mut edge) = network.edge(member.edge).cloned() else {
                return Err(ReimportError::unrecoverable(
                    member.edge,
                    format!("split member of {} vanished before execution", old.id),
                ));
            };
            let direction = if member.forward {
                StationingDirection::Forward
            } else {
                StationingDirection::Reversed
            };

            let mut attributes = match projector.clip_attributes(
                &old.attributes,
                &old.geometry,
                &edge.geometry,
                member.window,
                direction,
            ) {
                Ok(attributes) => attributes,
                Err(e) if e.is_recoverable() => {
                    warn!(old_edge = %old.id, edge_id = %member.edge, error = %e, "clipping failed, member keeps default attributes");
                    record_recoverable(&e, stats);
                    EdgeAttributes {
                        name: old.attributes.name.clone(),
                        number: old.attributes.number.clone(),
                        ..Default::default()
                    }
                }
                Err(e) => return Err(e),
            };

            attributes.name = own_or_inherited(&edge.attributes.name, &old.attributes.name);
            attributes.number = own_or_inherited(&edge.attributes.number, &old.attributes.number);
            edge.attributes = attributes;
            network.update_edge(edge);
        }

        if retire_old && !chain.contains(old.id) && network.remove_edge(old.id).is_some() {
            stats.edges_deleted += 1;
        }
        stats.splits += 1;
        debug!(old_edge = %old.id, members = chain.members.len(), "executed split");
        Ok(())
    }

    /// The chain has to run from the old from-node to the old to-node
    /// without breaks.
    fn check_chain(&self, chain: &SplitChain, old: &Edge) -> Result<()> {
        let broken = |message: String| Err(ReimportError::unrecoverable(old.id, message));
        let (Some(first), Some(last)) = (chain.members.first(), chain.members.last()) else {
            return broken("empty split chain".into());
        };
        if first.entry != old.from || last.exit != old.to {
            return broken(format!(
                "split chain runs {}..{} but the edge runs {}..{}",
                first.entry, last.exit, old.from, old.to
            ));
        }
        for (a, b) in chain.members.iter().tuple_windows() {
            if a.exit != b.entry {
                return broken(format!(
                    "split chain breaks between {} and {}",
                    a.edge, b.edge
                ));
            }
        }
        Ok(())
    }
}

fn own_or_inherited(own: &Option<String>, inherited: &Option<String>) -> Option<String> {
    own.as_ref()
        .filter(|v| !v.trim().is_empty())
        .or(inherited.as_ref())
        .cloned()
}

/// Count a recovered projection failure that led to an attribute reset.
pub fn record_recoverable(error: &ReimportError, stats: &mut ReimportStatistics) {
    match error {
        ReimportError::StationingAmbiguous { .. } => stats.stationing_ambiguous += 1,
        ReimportError::ProjectionOrderReversed { .. } => stats.projection_order_reversed += 1,
        _ => {}
    }
    stats.attribute_resets += 1;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attributes::{
        AttributeGroup, AttributeGroupKind, GroupPayload, Segment, SegmentList, Sided, SurfaceType,
        TravelDirection,
    };
    use crate::graph_types::Provenance;
    use geo::{Coord, line_string};

    fn surface_edge_attributes(segments: Vec<Segment<SurfaceType>>) -> EdgeAttributes {
        let mut attributes = EdgeAttributes::from_payloads(Some("Feldweg".into()), None, &[]);
        attributes.groups[0] = AttributeGroup::Surface(Sided {
            left: SegmentList(segments.clone()),
            right: SegmentList(segments),
        });
        attributes
    }

    fn node_at(network: &mut RoadNetwork, c: Coord) -> NodeId {
        let existing = network.nodes().find(|n| n.point == c).map(|n| n.id);
        existing.unwrap_or_else(|| network.add_node(c, Provenance::ExternalDataset))
    }

    /// Old edge (0,0)-(100,0) plus the given replacement lines.
    fn network_with_chain(lines: &[LineString]) -> (RoadNetwork, Edge, Vec<EdgeId>) {
        let mut network = RoadNetwork::new();
        let a = node_at(&mut network, Coord { x: 0.0, y: 0.0 });
        let b = node_at(&mut network, Coord { x: 100.0, y: 0.0 });
        let old = network.add_edge(
            Some("OLD".into()),
            line_string![(x: 0.0, y: 0.0), (x: 100.0, y: 0.0)],
            a,
            b,
            Provenance::ExternalDataset,
            surface_edge_attributes(vec![
                Segment::new(0.0, 0.5, SurfaceType::Asphalt),
                Segment::new(0.5, 1.0, SurfaceType::Gravel),
            ]),
        );
        let mut ids = Vec::new();
        for (i, line) in lines.iter().enumerate() {
            let from = node_at(&mut network, line.0[0]);
            let to = node_at(&mut network, line.0[line.0.len() - 1]);
            ids.push(network.add_edge(
                Some(format!("N{i}")),
                line.clone(),
                from,
                to,
                Provenance::ExternalDataset,
                EdgeAttributes::default(),
            ));
        }
        let old = network.edge(old).unwrap().clone();
        network.drain_journal();
        (network, old, ids)
    }

    fn left_surfaces(network: &RoadNetwork, id: EdgeId) -> Vec<(f64, f64, SurfaceType)> {
        match network.edge(id).unwrap().attributes.group(AttributeGroupKind::Surface) {
            Some(AttributeGroup::Surface(sided)) => sided
                .left
                .0
                .iter()
                .map(|s| (s.interval.start, s.interval.end, s.payload))
                .collect(),
            _ => panic!("surface group missing"),
        }
    }

    #[test]
    fn test_two_piece_split_is_found_and_clipped() {
        let config = ReimportConfig::default();
        let (mut network, old, ids) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 40.0, y: 0.0)],
            line_string![(x: 40.0, y: 0.0), (x: 100.0, y: 0.0)],
        ]);

        let chain = SplitDetector::new(&config)
            .detect(&network, &old, None, &AHashSet::new())
            .expect("split expected");
        assert_eq!(chain.members.iter().map(|m| m.edge).collect::<Vec<_>>(), ids);
        assert!(chain.members.iter().all(|m| m.forward));

        let mut stats = ReimportStatistics::default();
        SplitExecutor::new(&config)
            .execute(&mut network, &chain, &old, true, &mut stats)
            .unwrap();

        assert!(network.edge(old.id).is_none());
        assert_eq!(stats.splits, 1);
        assert_eq!(stats.edges_deleted, 1);
        assert_eq!(left_surfaces(&network, ids[0]), vec![(0.0, 1.0, SurfaceType::Asphalt)]);
        assert_eq!(left_surfaces(&network, ids[1]), vec![(0.0, 1.0, SurfaceType::Gravel)]);
        assert_eq!(
            network.edge(ids[1]).unwrap().attributes.name.as_deref(),
            Some("Feldweg")
        );
    }

    #[test]
    fn test_backward_member_swaps_sides_and_flips_direction() {
        let config = ReimportConfig::default();
        let (mut network, mut old, ids) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 0.0)],
            line_string![(x: 100.0, y: 0.0), (x: 50.0, y: 0.0)],
        ]);
        old.attributes = EdgeAttributes::from_payloads(
            None,
            None,
            &[
                GroupPayload::Surface {
                    left: SurfaceType::Asphalt,
                    right: SurfaceType::Paving,
                },
                GroupPayload::TravelDirection {
                    left: TravelDirection::Forward,
                    right: TravelDirection::Forward,
                },
            ],
        );

        let chain = SplitDetector::new(&config)
            .detect(&network, &old, None, &AHashSet::new())
            .unwrap();
        assert_eq!(
            chain.members.iter().map(|m| m.forward).collect::<Vec<_>>(),
            vec![true, false]
        );

        let mut stats = ReimportStatistics::default();
        SplitExecutor::new(&config)
            .execute(&mut network, &chain, &old, true, &mut stats)
            .unwrap();

        assert_eq!(left_surfaces(&network, ids[0]), vec![(0.0, 1.0, SurfaceType::Asphalt)]);
        assert_eq!(left_surfaces(&network, ids[1]), vec![(0.0, 1.0, SurfaceType::Paving)]);
        let backward = network.edge(ids[1]).unwrap();
        let Some(AttributeGroup::TravelDirection(travel)) =
            backward.attributes.group(AttributeGroupKind::TravelDirection)
        else {
            panic!("travel direction group missing");
        };
        assert_eq!(travel.left.payloads(), vec![&TravelDirection::Backward]);
    }

    #[test]
    fn test_split_conserves_payload_sequence() {
        let config = ReimportConfig::default();
        let (mut network, mut old, ids) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 30.0, y: 0.0)],
            line_string![(x: 70.0, y: 0.0), (x: 30.0, y: 0.0)],
            line_string![(x: 70.0, y: 0.0), (x: 100.0, y: 0.0)],
        ]);
        old.attributes = surface_edge_attributes(vec![
            Segment::new(0.0, 0.3, SurfaceType::Asphalt),
            Segment::new(0.3, 0.5, SurfaceType::Concrete),
            Segment::new(0.5, 0.7, SurfaceType::Paving),
            Segment::new(0.7, 1.0, SurfaceType::Gravel),
        ]);

        let chain = SplitDetector::new(&config)
            .detect(&network, &old, None, &AHashSet::new())
            .unwrap();
        let mut stats = ReimportStatistics::default();
        SplitExecutor::new(&config)
            .execute(&mut network, &chain, &old, true, &mut stats)
            .unwrap();

        let mut sequence = Vec::new();
        for member in &chain.members {
            let mut payloads: Vec<SurfaceType> = if member.forward {
                left_surfaces(&network, member.edge)
                    .into_iter()
                    .map(|p| p.2)
                    .collect()
            } else {
                // Backward members see the old left side on their right.
                match network.edge(member.edge).unwrap().attributes.group(AttributeGroupKind::Surface) {
                    Some(AttributeGroup::Surface(sided)) => {
                        sided.right.0.iter().rev().map(|s| s.payload).collect()
                    }
                    _ => panic!("surface group missing"),
                }
            };
            sequence.append(&mut payloads);
        }
        assert_eq!(ids.len(), 3);
        assert_eq!(
            sequence,
            vec![
                SurfaceType::Asphalt,
                SurfaceType::Concrete,
                SurfaceType::Paving,
                SurfaceType::Gravel,
            ]
        );
    }

    #[test]
    fn test_detour_outside_buffer_is_not_a_split() {
        let config = ReimportConfig::default();
        let (network, old, _) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 60.0), (x: 50.0, y: 5.0)],
            line_string![(x: 50.0, y: 5.0), (x: 100.0, y: 0.0)],
        ]);
        assert!(
            SplitDetector::new(&config)
                .detect(&network, &old, None, &AHashSet::new())
                .is_none()
        );
    }

    #[test]
    fn test_excluded_edges_and_single_edges_do_not_split() {
        let config = ReimportConfig::default();
        let (network, old, ids) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 40.0, y: 0.0)],
            line_string![(x: 40.0, y: 0.0), (x: 100.0, y: 0.0)],
        ]);
        let detector = SplitDetector::new(&config);
        let excluded = AHashSet::from_iter([ids[1]]);
        assert!(detector.detect(&network, &old, None, &excluded).is_none());

        let (network, old, _) =
            network_with_chain(&[line_string![(x: 0.0, y: 0.0), (x: 50.0, y: 3.0), (x: 100.0, y: 0.0)]]);
        assert!(detector.detect(&network, &old, None, &AHashSet::new()).is_none());
    }

    #[test]
    fn test_broken_chain_is_unrecoverable() {
        let config = ReimportConfig::default();
        let (mut network, old, ids) = network_with_chain(&[
            line_string![(x: 0.0, y: 0.0), (x: 40.0, y: 0.0)],
            line_string![(x: 40.0, y: 0.0), (x: 100.0, y: 0.0)],
        ]);
        let mut chain = SplitDetector::new(&config)
            .detect(&network, &old, None, &AHashSet::new())
            .unwrap();
        chain.members.reverse();

        let mut stats = ReimportStatistics::default();
        let result = SplitExecutor::new(&config).execute(&mut network, &chain, &old, true, &mut stats);
        assert!(matches!(
            result,
            Err(ReimportError::UnrecoverableProjection { .. })
        ));
        assert!(network.edge(old.id).is_some());
        assert!(network.edge(ids[0]).is_some());
    }
}
