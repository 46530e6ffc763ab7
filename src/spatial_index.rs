// ===========================================================================
// Spatial Index for Nodes
// ===========================================================================
//
// Built per partition from the nodes around that partition's features and
// dropped afterwards; never persisted.
// ===========================================================================

use geo::Coord;
use rstar::RTree;
use rstar::primitives::GeomWithData;

use crate::graph_types::{Node, NodeId};

type IndexedNode = GeomWithData<[f64; 2], NodeId>;

pub struct SpatialNodeIndex {
    tree: RTree<IndexedNode>,
    snap_tolerance: f64,
}

impl SpatialNodeIndex {
    pub fn new(snap_tolerance: f64) -> Self {
        Self {
            tree: RTree::new(),
            snap_tolerance,
        }
    }

    pub fn from_nodes<'a>(nodes: impl IntoIterator<Item = &'a Node>, snap_tolerance: f64) -> Self {
        let entries: Vec<IndexedNode> = nodes
            .into_iter()
            .map(|n| GeomWithData::new([n.point.x, n.point.y], n.id))
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
            snap_tolerance,
        }
    }

    pub fn len(&self) -> usize {
        self.tree.size()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.size() == 0
    }

    pub fn insert(&mut self, node: &Node) {
        self.tree
            .insert(GeomWithData::new([node.point.x, node.point.y], node.id));
    }

    pub fn remove(&mut self, id: NodeId, point: Coord) -> bool {
        self.tree
            .remove(&GeomWithData::new([point.x, point.y], id))
            .is_some()
    }

    /// Move an indexed node to a new position.
    pub fn relocate(&mut self, id: NodeId, from: Coord, to: Coord) {
        if self.remove(id, from) {
            self.tree.insert(GeomWithData::new([to.x, to.y], id));
        }
    }

    /// Closest node within the snapping tolerance.
    pub fn find_nearest(&self, point: Coord) -> Option<NodeId> {
        self.find_nearest_within(point, self.snap_tolerance)
    }

    /// Closest node within `radius`; equal distances resolve to the lower id.
    pub fn find_nearest_within(&self, point: Coord, radius: f64) -> Option<NodeId> {
        let max_d2 = radius * radius;
        let mut best: Option<(f64, NodeId)> = None;
        for (entry, d2) in self
            .tree
            .nearest_neighbor_iter_with_distance_2(&[point.x, point.y])
        {
            if d2 > max_d2 {
                break;
            }
            match best {
                None => best = Some((d2, entry.data)),
                Some((best_d2, best_id)) => {
                    if d2 > best_d2 {
                        break;
                    }
                    if entry.data < best_id {
                        best = Some((d2, entry.data));
                    }
                }
            }
        }
        best.map(|(_, id)| id)
    }
}
