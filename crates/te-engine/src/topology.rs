//! Graph Model
//!
//! Immutable topology snapshot (routers, prefixes, links with capacity and
//! cost) plus the mutable reservation overlay.

use crate::spf::CostGraph;
use ipnetwork::IpNetwork;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Dense node identifier, assigned at construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeId(pub u32);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}", self.0)
    }
}

/// Directed link `(from, to)`
pub type LinkKey = (NodeId, NodeId);

/// Node kind
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeKind {
    /// Router taking part in forwarding
    Router {
        /// IGP router id
        router_id: Ipv4Addr,
    },
    /// Destination/source subnet, only ever a leaf
    Prefix(IpNetwork),
}

/// Topology node
#[derive(Debug, Clone)]
pub struct Node {
    /// Identifier
    pub id: NodeId,
    /// Human-readable name
    pub name: String,
    /// Kind
    pub kind: NodeKind,
}

impl Node {
    /// Router check
    pub fn is_router(&self) -> bool {
        matches!(self.kind, NodeKind::Router { .. })
    }
}

/// Directed link with its reservation overlay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Link {
    /// Bandwidth (bps)
    pub capacity: u64,
    /// IGP weight
    pub cost: u32,
    /// Sum of the flows allocated across the link
    pub reserved: u64,
    /// Set while a fallback allocation keeps `reserved` above `capacity`
    pub oversubscribed: bool,
}

impl Link {
    fn new(capacity: u64, cost: u32) -> Self {
        Self {
            capacity,
            cost,
            reserved: 0,
            oversubscribed: false,
        }
    }

    /// Capacity left
    #[inline]
    pub fn spare(&self) -> u64 {
        self.capacity.saturating_sub(self.reserved)
    }
}

/// Point-in-time view of one router link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LinkUtilization {
    /// Tail router
    pub from: NodeId,
    /// Head router
    pub to: NodeId,
    /// Tail router name
    pub from_name: String,
    /// Head router name
    pub to_name: String,
    /// Link capacity
    pub capacity: u64,
    /// Reserved bandwidth, may exceed capacity after a fallback
    pub reserved: u64,
    /// Set while a fallback allocation holds the link above capacity
    pub oversubscribed: bool,
}

/// Topology construction errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum TopologyError {
    /// Name or prefix already present
    #[error("duplicate node: {0}")]
    DuplicateNode(String),
    /// No router by that name
    #[error("unknown router: {0}")]
    UnknownRouter(String),
    /// Link rejected
    #[error("invalid link {a} <-> {b}: {reason}")]
    InvalidLink {
        /// First router
        a: String,
        /// Second router
        b: String,
        /// What is wrong with it
        reason: String,
    },
    /// Prefix attachment rejected
    #[error("prefix {prefix} cannot attach to {router}: {reason}")]
    InvalidAttachment {
        /// Prefix
        prefix: IpNetwork,
        /// Router
        router: String,
        /// What is wrong with it
        reason: String,
    },
}

/// Reservation errors
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ReservationError {
    /// Path uses a link that is not in the topology
    #[error("link {0} -> {1} does not exist")]
    MissingLink(NodeId, NodeId),
    /// Strict reservation does not fit
    #[error("link {from} -> {to} has {spare} spare, {requested} requested")]
    InsufficientCapacity {
        /// Tail router
        from: NodeId,
        /// Head router
        to: NodeId,
        /// Spare capacity left
        spare: u64,
        /// Flow size
        requested: u64,
    },
    /// More released than reserved
    #[error("releasing {requested} from link {from} -> {to} holding only {reserved}")]
    Underflow {
        /// Tail router
        from: NodeId,
        /// Head router
        to: NodeId,
        /// Currently reserved
        reserved: u64,
        /// Flow size
        requested: u64,
    },
}

/// Incremental topology builder
#[derive(Debug, Default)]
pub struct TopologyBuilder {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    by_prefix: HashMap<IpNetwork, NodeId>,
    graph: DiGraphMap<NodeId, Link>,
}

impl TopologyBuilder {
    /// Empty builder
    pub fn new() -> Self {
        Self::default()
    }

    fn push_node(&mut self, name: String, kind: NodeKind) -> Result<NodeId, TopologyError> {
        if self.by_name.contains_key(&name) {
            return Err(TopologyError::DuplicateNode(name));
        }
        let id = NodeId(self.nodes.len() as u32);
        self.by_name.insert(name.clone(), id);
        self.graph.add_node(id);
        self.nodes.push(Node { id, name, kind });
        Ok(id)
    }

    fn router(&self, name: &str) -> Result<NodeId, TopologyError> {
        self.by_name
            .get(name)
            .copied()
            .filter(|id| self.nodes[id.0 as usize].is_router())
            .ok_or_else(|| TopologyError::UnknownRouter(name.to_string()))
    }

    /// Add a router
    pub fn add_router(&mut self, name: &str, router_id: Ipv4Addr) -> Result<NodeId, TopologyError> {
        self.push_node(name.to_string(), NodeKind::Router { router_id })
    }

    /// Add a bidirectional router link; each direction gets its own
    /// capacity counter.
    pub fn add_link(&mut self, a: &str, b: &str, capacity: u64, cost: u32) -> Result<(), TopologyError> {
        let invalid = |reason: &str| TopologyError::InvalidLink {
            a: a.to_string(),
            b: b.to_string(),
            reason: reason.to_string(),
        };
        let (u, v) = (self.router(a)?, self.router(b)?);
        if u == v {
            return Err(invalid("self loop"));
        }
        if capacity == 0 {
            return Err(invalid("zero capacity"));
        }
        if cost == 0 {
            return Err(invalid("zero cost"));
        }
        if self.graph.contains_edge(u, v) {
            return Err(invalid("duplicate link"));
        }
        self.graph.add_edge(u, v, Link::new(capacity, cost));
        self.graph.add_edge(v, u, Link::new(capacity, cost));
        Ok(())
    }

    /// Attach a prefix to a router. The prefix node is created on first
    /// attachment; attachment links are uncapacitated.
    pub fn attach_prefix(&mut self, prefix: IpNetwork, router: &str, cost: u32) -> Result<NodeId, TopologyError> {
        let prefix = crate::flow::normalize_prefix(prefix);
        let r = self.router(router)?;
        if cost == 0 {
            return Err(TopologyError::InvalidAttachment {
                prefix,
                router: router.to_string(),
                reason: "zero cost".into(),
            });
        }
        let p = match self.by_prefix.get(&prefix) {
            Some(p) => *p,
            None => {
                let p = self.push_node(prefix.to_string(), NodeKind::Prefix(prefix))?;
                self.by_prefix.insert(prefix, p);
                p
            }
        };
        if self.graph.contains_edge(r, p) {
            return Err(TopologyError::InvalidAttachment {
                prefix,
                router: router.to_string(),
                reason: "already attached".into(),
            });
        }
        self.graph.add_edge(r, p, Link::new(u64::MAX, cost));
        self.graph.add_edge(p, r, Link::new(u64::MAX, cost));
        Ok(p)
    }

    /// Freeze the node and link set
    pub fn build(self) -> Topology {
        Topology {
            nodes: self.nodes,
            by_name: self.by_name,
            by_prefix: self.by_prefix,
            graph: self.graph,
        }
    }
}

/// Network graph with reservation overlay
#[derive(Debug, Clone)]
pub struct Topology {
    nodes: Vec<Node>,
    by_name: HashMap<String, NodeId>,
    by_prefix: HashMap<IpNetwork, NodeId>,
    graph: DiGraphMap<NodeId, Link>,
}

impl Topology {
    /// Node lookup
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.0 as usize)
    }

    /// All nodes, in id order
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    /// Node name, `"?"` when unknown
    pub fn name(&self, id: NodeId) -> &str {
        self.node(id).map(|n| n.name.as_str()).unwrap_or("?")
    }

    /// Lookup by name
    pub fn node_by_name(&self, name: &str) -> Option<NodeId> {
        self.by_name.get(name).copied()
    }

    /// Node standing for a prefix
    pub fn prefix_node(&self, prefix: &IpNetwork) -> Option<NodeId> {
        self.by_prefix.get(prefix).copied()
    }

    /// Router check
    pub fn is_router(&self, id: NodeId) -> bool {
        self.node(id).map(Node::is_router).unwrap_or(false)
    }

    /// Router id of a router node
    pub fn router_id(&self, id: NodeId) -> Option<Ipv4Addr> {
        match self.node(id)?.kind {
            NodeKind::Router { router_id } => Some(router_id),
            NodeKind::Prefix(_) => None,
        }
    }

    /// Directed link lookup
    pub fn link(&self, from: NodeId, to: NodeId) -> Option<&Link> {
        self.graph.edge_weight(from, to)
    }

    /// Router-to-router links, sorted
    pub fn router_links(&self) -> Vec<(LinkKey, Link)> {
        let mut links: Vec<_> = self
            .graph
            .all_edges()
            .filter(|(u, v, _)| self.is_router(*u) && self.is_router(*v))
            .map(|(u, v, link)| ((u, v), *link))
            .collect();
        links.sort_by_key(|(key, _)| *key);
        links
    }

    /// Routers attached to a prefix, ordered by attachment cost then name
    pub fn attached_routers(&self, prefix_node: NodeId) -> Vec<(NodeId, u32)> {
        let mut routers: Vec<_> = self
            .graph
            .neighbors_directed(prefix_node, Direction::Incoming)
            .filter(|r| self.is_router(*r))
            .filter_map(|r| self.link(r, prefix_node).map(|l| (r, l.cost)))
            .collect();
        routers.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| self.name(a.0).cmp(self.name(b.0))));
        routers
    }

    /// Cost graph over every link
    pub fn full_graph(&self) -> CostGraph<'_> {
        CostGraph::new(self, |_| true)
    }

    /// Cost graph restricted to links whose spare capacity is at least `min`
    pub fn links_with_spare_capacity(&self, min: u64) -> CostGraph<'_> {
        CostGraph::new(self, |link| link.spare() >= min)
    }

    /// Router links that cannot take another `size`
    pub fn full_links(&self, size: u64) -> Vec<LinkKey> {
        self.router_links()
            .into_iter()
            .filter(|(_, link)| link.spare() < size)
            .map(|(key, _)| key)
            .collect()
    }

    pub(crate) fn graph(&self) -> &DiGraphMap<NodeId, Link> {
        &self.graph
    }

    fn check_links(&self, path: &[NodeId]) -> Result<(), ReservationError> {
        for hop in path.windows(2) {
            if !self.graph.contains_edge(hop[0], hop[1]) {
                return Err(ReservationError::MissingLink(hop[0], hop[1]));
            }
        }
        Ok(())
    }

    /// Reserve `size` on every link of `path`. Nothing changes unless every
    /// link has room.
    pub fn reserve(&mut self, path: &[NodeId], size: u64) -> Result<(), ReservationError> {
        self.check_links(path)?;
        for hop in path.windows(2) {
            let link = &self.graph[(hop[0], hop[1])];
            if link.spare() < size {
                return Err(ReservationError::InsufficientCapacity {
                    from: hop[0],
                    to: hop[1],
                    spare: link.spare(),
                    requested: size,
                });
            }
        }
        for hop in path.windows(2) {
            if let Some(link) = self.graph.edge_weight_mut(hop[0], hop[1]) {
                link.reserved += size;
            }
        }
        Ok(())
    }

    /// Reserve `size` regardless of capacity. Links pushed past capacity are
    /// marked `oversubscribed` and returned.
    pub fn reserve_oversubscribed(&mut self, path: &[NodeId], size: u64) -> Result<Vec<LinkKey>, ReservationError> {
        self.check_links(path)?;
        let mut over = Vec::new();
        for hop in path.windows(2) {
            if let Some(link) = self.graph.edge_weight_mut(hop[0], hop[1]) {
                link.reserved = link.reserved.saturating_add(size);
                if link.reserved > link.capacity {
                    link.oversubscribed = true;
                    over.push((hop[0], hop[1]));
                }
            }
        }
        Ok(over)
    }

    /// Return `size` on every link of `path`
    pub fn release(&mut self, path: &[NodeId], size: u64) -> Result<(), ReservationError> {
        self.check_links(path)?;
        for hop in path.windows(2) {
            let link = &self.graph[(hop[0], hop[1])];
            if link.reserved < size {
                return Err(ReservationError::Underflow {
                    from: hop[0],
                    to: hop[1],
                    reserved: link.reserved,
                    requested: size,
                });
            }
        }
        for hop in path.windows(2) {
            if let Some(link) = self.graph.edge_weight_mut(hop[0], hop[1]) {
                link.reserved -= size;
                if link.reserved <= link.capacity {
                    link.oversubscribed = false;
                }
            }
        }
        Ok(())
    }

    /// Utilization snapshot of router links
    pub fn utilization(&self) -> Vec<LinkUtilization> {
        self.router_links()
            .into_iter()
            .map(|((from, to), link)| LinkUtilization {
                from,
                to,
                from_name: self.name(from).to_string(),
                to_name: self.name(to).to_string(),
                capacity: link.capacity,
                reserved: link.reserved,
                oversubscribed: link.oversubscribed,
            })
            .collect()
    }

    /// Render a node sequence with names
    pub fn path_names(&self, path: &[NodeId]) -> Vec<String> {
        path.iter().map(|id| self.name(*id).to_string()).collect()
    }
}
