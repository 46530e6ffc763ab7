// ===========================================================================
// In-memory road network arena with a mutation journal
// ===========================================================================
use ahash::AHashMap;
use geo::{Coord, LineString, Rect};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::attributes::EdgeAttributes;
use crate::geometry_utils::rect_contains;
use crate::graph_types::{Edge, EdgeId, Node, NodeId, Provenance};

/// An intended change to the persisted graph, handed to the persistence
/// collaborator at each commit boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Mutation {
    CreateNode(Node),
    UpdateNode(Node),
    DeleteNode(NodeId),
    CreateEdge(Edge),
    UpdateEdge(Edge),
    DeleteEdge(EdgeId),
}

/// Nodes and edges keyed by opaque ids. Edges refer to nodes by id only.
#[derive(Debug, Default)]
pub struct RoadNetwork {
    nodes: BTreeMap<NodeId, Node>,
    edges: BTreeMap<EdgeId, Edge>,
    by_external_id: AHashMap<String, EdgeId>,
    incidence: AHashMap<NodeId, BTreeSet<EdgeId>>,
    next_node_id: u64,
    next_edge_id: u64,
    journal: Vec<Mutation>,
}

impl RoadNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a network from already persisted state. Nothing is journaled.
    pub fn load(nodes: Vec<Node>, edges: Vec<Edge>) -> anyhow::Result<Self> {
        let mut network = Self::new();
        for node in nodes {
            network.next_node_id = network.next_node_id.max(node.id.0 + 1);
            network.nodes.insert(node.id, node);
        }
        for edge in edges {
            for endpoint in [edge.from, edge.to] {
                if !network.nodes.contains_key(&endpoint) {
                    anyhow::bail!("edge {} references missing node {}", edge.id, endpoint);
                }
            }
            network.next_edge_id = network.next_edge_id.max(edge.id.0 + 1);
            network.index_edge(&edge);
            network.edges.insert(edge.id, edge);
        }
        Ok(network)
    }

    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(&id)
    }

    pub fn edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values()
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values()
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    pub fn edge_by_external_id(&self, external_id: &str) -> Option<&Edge> {
        self.by_external_id
            .get(external_id)
            .and_then(|id| self.edges.get(id))
    }

    /// Edges touching `node`, in id order.
    pub fn incident_edges(&self, node: NodeId) -> Vec<EdgeId> {
        self.incidence
            .get(&node)
            .map(|set| set.iter().copied().collect())
            .unwrap_or_default()
    }

    pub fn degree(&self, node: NodeId) -> usize {
        self.incidence.get(&node).map(|s| s.len()).unwrap_or(0)
    }

    pub fn nodes_in(&self, rect: &Rect) -> Vec<&Node> {
        self.nodes
            .values()
            .filter(|n| rect_contains(rect, n.point))
            .collect()
    }

    /// Nodes no edge references anymore.
    pub fn orphan_nodes(&self) -> Vec<NodeId> {
        self.nodes
            .keys()
            .filter(|id| self.degree(**id) == 0)
            .copied()
            .collect()
    }

    pub fn add_node(&mut self, point: Coord, provenance: Provenance) -> NodeId {
        let id = NodeId(self.next_node_id);
        self.next_node_id += 1;
        let node = Node {
            id,
            point,
            provenance,
        };
        self.journal.push(Mutation::CreateNode(node.clone()));
        self.nodes.insert(id, node);
        id
    }

    pub fn move_node(&mut self, id: NodeId, point: Coord) -> bool {
        let Some(node) = self.nodes.get_mut(&id) else {
            return false;
        };
        if node.point == point {
            return false;
        }
        node.point = point;
        self.journal.push(Mutation::UpdateNode(node.clone()));
        true
    }

    /// Remove a node. Refuses while any edge still references it.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        if self.degree(id) > 0 {
            return false;
        }
        if self.nodes.remove(&id).is_none() {
            return false;
        }
        self.incidence.remove(&id);
        self.journal.push(Mutation::DeleteNode(id));
        true
    }

    pub fn add_edge(
        &mut self,
        external_id: Option<String>,
        geometry: LineString,
        from: NodeId,
        to: NodeId,
        provenance: Provenance,
        attributes: EdgeAttributes,
    ) -> EdgeId {
        let id = EdgeId(self.next_edge_id);
        self.next_edge_id += 1;
        let edge = Edge {
            id,
            external_id,
            geometry,
            from,
            to,
            provenance,
            attributes,
        };
        self.index_edge(&edge);
        self.journal.push(Mutation::CreateEdge(edge.clone()));
        self.edges.insert(id, edge);
        id
    }

    /// Replace a stored edge. Only journals when something actually changed.
    pub fn update_edge(&mut self, edge: Edge) -> bool {
        let Some(existing) = self.edges.get(&edge.id) else {
            return false;
        };
        if *existing == edge {
            return false;
        }
        let existing = existing.clone();
        self.unindex_edge(&existing);
        self.index_edge(&edge);
        self.journal.push(Mutation::UpdateEdge(edge.clone()));
        self.edges.insert(edge.id, edge);
        true
    }

    pub fn remove_edge(&mut self, id: EdgeId) -> Option<Edge> {
        let edge = self.edges.remove(&id)?;
        self.unindex_edge(&edge);
        self.journal.push(Mutation::DeleteEdge(id));
        debug!(edge = %id, external_id = ?edge.external_id, "removed edge");
        Some(edge)
    }

    pub fn pending_mutations(&self) -> usize {
        self.journal.len()
    }

    pub fn drain_journal(&mut self) -> Vec<Mutation> {
        std::mem::take(&mut self.journal)
    }

    fn index_edge(&mut self, edge: &Edge) {
        self.incidence.entry(edge.from).or_default().insert(edge.id);
        self.incidence.entry(edge.to).or_default().insert(edge.id);
        if let Some(external_id) = &edge.external_id {
            self.by_external_id.insert(external_id.clone(), edge.id);
        }
    }

    fn unindex_edge(&mut self, edge: &Edge) {
        for endpoint in [edge.from, edge.to] {
            if let Some(set) = self.incidence.get_mut(&endpoint) {
                set.remove(&edge.id);
            }
        }
        if let Some(external_id) = &edge.external_id {
            if self.by_external_id.get(external_id) == Some(&edge.id) {
                self.by_external_id.remove(external_id);
            }
        }
    }
}
