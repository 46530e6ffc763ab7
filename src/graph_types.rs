// ===========================================================================
// Arena-backed road network elements
// ===========================================================================
use geo::{Coord, LineString};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::attributes::EdgeAttributes;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u64);

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EdgeId(pub u64);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

impl fmt::Display for EdgeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "e{}", self.0)
    }
}

/// Where a node or edge came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    /// Imported from the external road dataset.
    ExternalDataset,
    /// Drawn or edited by a user; never touched by duplicate merging.
    UserEdited,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub point: Coord,
    pub provenance: Provenance,
}

/// An oriented polyline between two shared nodes.
///
/// `from` sits at the first coordinate of `geometry`, `to` at the last.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    /// Stable id of the feature in the external dataset.
    pub external_id: Option<String>,
    pub geometry: LineString,
    pub from: NodeId,
    pub to: NodeId,
    pub provenance: Provenance,
    pub attributes: EdgeAttributes,
}

impl Edge {
    /// The node on the other side of `node`, if `node` is an endpoint.
    pub fn other_node(&self, node: NodeId) -> Option<NodeId> {
        if self.from == node {
            Some(self.to)
        } else if self.to == node {
            Some(self.from)
        } else {
            None
        }
    }

    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }

    /// Coordinate of the geometry end that belongs to `node`.
    pub fn endpoint_coord(&self, node: NodeId) -> Option<Coord> {
        if self.from == node {
            self.geometry.0.first().copied()
        } else if self.to == node {
            self.geometry.0.last().copied()
        } else {
            None
        }
    }
}
