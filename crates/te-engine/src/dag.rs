//! Forwarding Graph Store
//!
//! One forwarding DAG per destination prefix, rooted at the prefix's egress
//! routers. Every router link in the DAG is tagged active or inactive, and
//! carries an `ongoing_flows` marker while flows to the prefix are allocated
//! across it.

use crate::southbound::{ForwardingEdge, ForwardingGraph};
use crate::topology::{LinkKey, NodeId, Topology};
use crate::{Result, TeError};
use ipnetwork::IpNetwork;
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use serde::Serialize;
use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::fmt;
use thiserror::Error;

/// Cap on ECMP path enumeration
pub const MAX_ACTIVE_PATHS: usize = 64;

/// Per-link DAG state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct LinkState {
    /// Link forwards traffic for the prefix
    pub active: bool,
    /// A flow to the prefix is allocated across the link
    pub ongoing_flows: bool,
}

/// Requested activation change of a single link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkToggle {
    /// Link
    pub link: LinkKey,
    /// Target state
    pub active: bool,
}

impl LinkToggle {
    /// Activate a link
    pub fn activate(link: LinkKey) -> Self {
        Self { link, active: true }
    }

    /// Deactivate a link
    pub fn deactivate(link: LinkKey) -> Self {
        Self { link, active: false }
    }
}

/// What a rejected mutation would have broken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DagViolation {
    /// Active links would form a forwarding loop
    Cycle,
    /// Node would keep receiving traffic with no way to the root
    BlackHole(NodeId),
}

impl fmt::Display for DagViolation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cycle => write!(f, "forwarding loop"),
            Self::BlackHole(node) => write!(f, "black hole at {node}"),
        }
    }
}

/// DAG errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DagError {
    /// Mutation rejected, DAG left untouched
    #[error("invalid DAG mutation for {prefix}: {violation}")]
    InvalidDagMutation {
        /// Destination prefix
        prefix: IpNetwork,
        /// Broken invariant
        violation: DagViolation,
    },
}

/// Forwarding DAG of one destination prefix
#[derive(Debug, Clone)]
pub struct ForwardingDag {
    prefix: IpNetwork,
    roots: BTreeSet<NodeId>,
    links: DiGraphMap<NodeId, LinkState>,
}

impl ForwardingDag {
    /// Default DAG: every router link on some least-cost path toward the
    /// prefix, all active.
    ///
    /// Every router attached to the prefix is a root, including the ones
    /// whose own least-cost route goes through a neighbour. Such a root
    /// forwards over its active links and only delivers locally once it
    /// has none left. A router that is a least-cost egress keeps no router
    /// links.
    pub fn seed(topology: &Topology, prefix: IpNetwork) -> Result<Self> {
        let dst = topology.prefix_node(&prefix).ok_or(TeError::UnknownPrefix(prefix))?;
        let graph = topology.full_graph();
        let dist = graph.distances_to(dst);

        let roots: BTreeSet<NodeId> =
            topology.attached_routers(dst).into_iter().map(|(id, _)| id).collect();
        let mut links = DiGraphMap::new();
        for node in topology.nodes().iter().filter(|n| n.is_router()) {
            let hops = graph.next_hops(node.id, dst, &dist);
            if hops.contains(&dst) {
                continue;
            }
            for hop in hops {
                links.add_edge(
                    node.id,
                    hop,
                    LinkState {
                        active: true,
                        ongoing_flows: false,
                    },
                );
            }
        }
        for root in &roots {
            links.add_node(*root);
        }
        Ok(Self { prefix, roots, links })
    }

    /// Destination prefix
    pub fn prefix(&self) -> IpNetwork {
        self.prefix
    }

    /// Egress routers
    pub fn roots(&self) -> &BTreeSet<NodeId> {
        &self.roots
    }

    /// State of a link, `None` when the link was never part of the DAG
    pub fn link_state(&self, from: NodeId, to: NodeId) -> Option<LinkState> {
        self.links.edge_weight(from, to).copied()
    }

    /// All links with their state, sorted
    pub fn links(&self) -> Vec<(LinkKey, LinkState)> {
        let mut links: Vec<_> = self.links.all_edges().map(|(u, v, s)| ((u, v), *s)).collect();
        links.sort_by_key(|(key, _)| *key);
        links
    }

    /// Outgoing active links of `node`
    pub fn active_edges(&self, node: NodeId) -> Vec<LinkKey> {
        if !self.links.contains_node(node) {
            return Vec::new();
        }
        let mut edges: Vec<_> = self
            .links
            .edges(node)
            .filter(|(_, _, s)| s.active)
            .map(|(u, v, _)| (u, v))
            .collect();
        edges.sort();
        edges
    }

    /// Incoming active links of `node`
    pub fn active_in_edges(&self, node: NodeId) -> Vec<LinkKey> {
        if !self.links.contains_node(node) {
            return Vec::new();
        }
        self.links
            .neighbors_directed(node, Direction::Incoming)
            .filter(|u| self.link_state(*u, node).map_or(false, |s| s.active))
            .map(|u| (u, node))
            .collect()
    }

    /// Apply a batch of activation changes atomically.
    ///
    /// The result must keep the active links acyclic, and every node with an
    /// active link or listed in `carrying` must still reach a root. Otherwise
    /// nothing changes and `InvalidDagMutation` is returned.
    pub fn set_links_active(&mut self, toggles: &[LinkToggle], carrying: &HashSet<NodeId>) -> std::result::Result<(), DagError> {
        let mut staged = self.links.clone();
        for toggle in toggles {
            let (u, v) = toggle.link;
            match staged.edge_weight_mut(u, v) {
                Some(state) => state.active = toggle.active,
                None if toggle.active => {
                    staged.add_edge(
                        u,
                        v,
                        LinkState {
                            active: true,
                            ongoing_flows: false,
                        },
                    );
                }
                None => {}
            }
        }

        if let Some(violation) = validate(&staged, &self.roots, carrying) {
            return Err(DagError::InvalidDagMutation {
                prefix: self.prefix,
                violation,
            });
        }
        self.links = staged;
        Ok(())
    }

    /// Flag or unflag the links of `path` as carrying flows to this prefix.
    /// Links outside the DAG are ignored.
    pub fn set_ongoing(&mut self, path: &[NodeId], ongoing: bool) {
        for hop in path.windows(2) {
            if let Some(state) = self.links.edge_weight_mut(hop[0], hop[1]) {
                state.ongoing_flows = ongoing;
            }
        }
    }

    /// Every simple path over active links from `ingress` to a root that
    /// delivers locally, in name-independent but stable (node id) order.
    pub fn active_paths(&self, ingress: NodeId) -> Vec<Vec<NodeId>> {
        let mut paths = Vec::new();
        let mut stack = vec![ingress];
        self.walk(ingress, &mut stack, &mut paths);
        paths
    }

    fn walk(&self, node: NodeId, stack: &mut Vec<NodeId>, paths: &mut Vec<Vec<NodeId>>) {
        if paths.len() >= MAX_ACTIVE_PATHS {
            return;
        }
        let edges = self.active_edges(node);
        if edges.is_empty() {
            if self.roots.contains(&node) {
                paths.push(stack.clone());
            }
            return;
        }
        for (_, next) in edges {
            if stack.contains(&next) {
                continue;
            }
            stack.push(next);
            self.walk(next, stack, paths);
            stack.pop();
        }
    }

    /// Active-only graph handed to the southbound
    pub fn active_graph(&self, topology: &Topology) -> ForwardingGraph {
        let edges = self
            .links()
            .into_iter()
            .filter(|(_, s)| s.active)
            .filter_map(|((u, v), _)| {
                Some(ForwardingEdge {
                    from: u,
                    to: v,
                    from_router_id: topology.router_id(u)?,
                    to_router_id: topology.router_id(v)?,
                })
            })
            .collect();
        ForwardingGraph {
            prefix: self.prefix,
            edges,
        }
    }

    /// Readable link listing for logs
    pub fn describe(&self, topology: &Topology) -> String {
        self.links()
            .into_iter()
            .map(|((u, v), s)| {
                format!(
                    "{}->{}{}{}",
                    topology.name(u),
                    topology.name(v),
                    if s.active { "" } else { " (inactive)" },
                    if s.ongoing_flows { " (ongoing)" } else { "" },
                )
            })
            .collect::<Vec<_>>()
            .join(", ")
    }
}

fn validate(links: &DiGraphMap<NodeId, LinkState>, roots: &BTreeSet<NodeId>, carrying: &HashSet<NodeId>) -> Option<DagViolation> {
    let mut active: DiGraphMap<NodeId, ()> = DiGraphMap::new();
    for (u, v, state) in links.all_edges() {
        if state.active {
            active.add_edge(u, v, ());
        }
    }
    if petgraph::algo::is_cyclic_directed(&active) {
        return Some(DagViolation::Cycle);
    }

    // reverse reachability from the roots
    let mut reached: HashSet<NodeId> = roots.iter().copied().collect();
    let mut queue: VecDeque<NodeId> = roots.iter().copied().collect();
    while let Some(v) = queue.pop_front() {
        if !active.contains_node(v) {
            continue;
        }
        for u in active.neighbors_directed(v, Direction::Incoming) {
            if reached.insert(u) {
                queue.push_back(u);
            }
        }
    }

    let mut stranded: Vec<NodeId> = active
        .nodes()
        .chain(carrying.iter().copied())
        .filter(|n| !reached.contains(n))
        .collect();
    stranded.sort();
    stranded.first().map(|n| DagViolation::BlackHole(*n))
}

/// Per-prefix DAG store, seeded lazily
#[derive(Debug, Default)]
pub struct ForwardingGraphStore {
    dags: HashMap<IpNetwork, ForwardingDag>,
}

impl ForwardingGraphStore {
    /// Empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Current DAG for `prefix`, seeded from the default shortest paths on
    /// first access
    pub fn get(&mut self, topology: &Topology, prefix: IpNetwork) -> Result<&mut ForwardingDag> {
        if !self.dags.contains_key(&prefix) {
            let dag = ForwardingDag::seed(topology, prefix)?;
            tracing::debug!(prefix = %prefix, dag = %dag.describe(topology), "Seeded default forwarding DAG");
            self.dags.insert(prefix, dag);
        }
        self.dags.get_mut(&prefix).ok_or(TeError::UnknownPrefix(prefix))
    }

    /// DAG if already seeded
    pub fn peek(&self, prefix: &IpNetwork) -> Option<&ForwardingDag> {
        self.dags.get(prefix)
    }

    /// Mutable DAG if already seeded
    pub fn peek_mut(&mut self, prefix: &IpNetwork) -> Option<&mut ForwardingDag> {
        self.dags.get_mut(prefix)
    }

    /// Replace a DAG after a successful southbound push
    pub fn replace(&mut self, dag: ForwardingDag) {
        self.dags.insert(dag.prefix(), dag);
    }

    /// Seeded prefixes
    pub fn prefixes(&self) -> Vec<IpNetwork> {
        let mut prefixes: Vec<_> = self.dags.keys().copied().collect();
        prefixes.sort();
        prefixes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyBuilder;
    use std::net::Ipv4Addr;

    /// ```text
    ///   r1 --- r2
    ///   |  \    |
    ///   r3 --- r4 -- d
    /// ```
    /// unit costs; d attached to r4
    fn square() -> Topology {
        let mut b = TopologyBuilder::new();
        for (i, name) in ["r1", "r2", "r3", "r4"].iter().enumerate() {
            b.add_router(name, Ipv4Addr::new(i as u8 + 1, 0, 0, 1)).unwrap();
        }
        b.add_link("r1", "r2", 10, 1).unwrap();
        b.add_link("r1", "r3", 10, 1).unwrap();
        b.add_link("r2", "r4", 10, 1).unwrap();
        b.add_link("r3", "r4", 10, 1).unwrap();
        b.add_link("r1", "r4", 10, 5).unwrap();
        b.attach_prefix("10.0.4.0/24".parse().unwrap(), "r4", 1).unwrap();
        b.build()
    }

    fn n(t: &Topology, name: &str) -> NodeId {
        t.node_by_name(name).unwrap()
    }

    fn prefix() -> IpNetwork {
        "10.0.4.0/24".parse().unwrap()
    }

    #[test]
    fn test_seed_is_shortest_path_dag() {
        let t = square();
        let dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let (r1, r2, r3, r4) = (n(&t, "r1"), n(&t, "r2"), n(&t, "r3"), n(&t, "r4"));

        assert_eq!(dag.active_edges(r3), vec![(r3, r4)]);
        assert_eq!(dag.roots().iter().copied().collect::<Vec<_>>(), vec![r4]);
        assert_eq!(dag.active_edges(r1), vec![(r1, r2), (r1, r3)]);
        assert_eq!(dag.active_edges(r2), vec![(r2, r4)]);
        assert!(dag.link_state(r1, r4).is_none());

        let paths = dag.active_paths(r1);
        assert_eq!(paths, vec![vec![r1, r2, r4], vec![r1, r3, r4]]);
        assert_eq!(dag.active_paths(r4), vec![vec![r4]]);
    }

    #[test]
    fn test_costlier_egress_is_a_root() {
        let mut b = TopologyBuilder::new();
        for (i, name) in ["r1", "r2", "r3", "r4"].iter().enumerate() {
            b.add_router(name, Ipv4Addr::new(i as u8 + 1, 0, 0, 1)).unwrap();
        }
        b.add_link("r1", "r2", 10, 1).unwrap();
        b.add_link("r1", "r3", 10, 1).unwrap();
        b.add_link("r2", "r4", 10, 1).unwrap();
        b.add_link("r3", "r4", 10, 1).unwrap();
        b.attach_prefix(prefix(), "r4", 1).unwrap();
        b.attach_prefix(prefix(), "r3", 5).unwrap();
        let t = b.build();
        let (r1, r3, r4) = (n(&t, "r1"), n(&t, "r3"), n(&t, "r4"));

        let mut dag = ForwardingDag::seed(&t, prefix()).unwrap();
        assert_eq!(dag.roots().iter().copied().collect::<Vec<_>>(), vec![r3, r4]);
        // r3 still forwards over the cheaper route
        assert_eq!(dag.active_paths(r3), vec![vec![r3, r4]]);

        let carrying: HashSet<_> = [r1, r3].into_iter().collect();
        dag.set_links_active(&[LinkToggle::deactivate((r3, r4))], &carrying).unwrap();
        assert_eq!(dag.active_paths(r3), vec![vec![r3]]);
        assert!(dag.active_paths(r1).contains(&vec![r1, r3]));
    }

    #[test]
    fn test_unknown_prefix() {
        let t = square();
        let err = ForwardingDag::seed(&t, "192.168.0.0/16".parse().unwrap()).unwrap_err();
        assert!(matches!(err, TeError::UnknownPrefix(_)));
    }

    #[test]
    fn test_batch_mutation_reroutes() {
        let t = square();
        let mut dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let (r1, r2, r3, r4) = (n(&t, "r1"), n(&t, "r2"), n(&t, "r3"), n(&t, "r4"));

        let carrying: HashSet<_> = [r1, r2, r4].into_iter().collect();
        dag.set_links_active(
            &[
                LinkToggle::deactivate((r1, r2)),
                LinkToggle::deactivate((r1, r3)),
                LinkToggle::activate((r1, r4)),
            ],
            &carrying,
        )
        .unwrap();

        assert_eq!(dag.active_paths(r1), vec![vec![r1, r4]]);
        assert!(dag.link_state(r1, r4).unwrap().active);
        // r2 still carries traffic and still reaches r4
        assert_eq!(dag.active_paths(r2), vec![vec![r2, r4]]);
        assert!(dag.active_edges(r3).contains(&(r3, r4)));
    }

    #[test]
    fn test_black_hole_rejected() {
        let t = square();
        let mut dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let (r1, r2, r4) = (n(&t, "r1"), n(&t, "r2"), n(&t, "r4"));
        let before = dag.links();

        let carrying: HashSet<_> = [r1, r2, r4].into_iter().collect();
        let err = dag
            .set_links_active(&[LinkToggle::deactivate((r2, r4))], &carrying)
            .unwrap_err();
        assert_eq!(
            err,
            DagError::InvalidDagMutation {
                prefix: prefix(),
                violation: DagViolation::BlackHole(r2),
            }
        );
        assert_eq!(dag.links(), before);
    }

    #[test]
    fn test_cycle_rejected() {
        let t = square();
        let mut dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let (r1, r2) = (n(&t, "r1"), n(&t, "r2"));

        let err = dag
            .set_links_active(&[LinkToggle::activate((r2, r1))], &HashSet::new())
            .unwrap_err();
        assert!(matches!(
            err,
            DagError::InvalidDagMutation {
                violation: DagViolation::Cycle,
                ..
            }
        ));
    }

    #[test]
    fn test_ongoing_marker() {
        let t = square();
        let mut dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let (r1, r2, r4) = (n(&t, "r1"), n(&t, "r2"), n(&t, "r4"));

        dag.set_ongoing(&[r1, r2, r4], true);
        assert!(dag.link_state(r1, r2).unwrap().ongoing_flows);
        assert!(dag.link_state(r2, r4).unwrap().ongoing_flows);
        dag.set_ongoing(&[r2, r4], false);
        assert!(!dag.link_state(r2, r4).unwrap().ongoing_flows);
    }

    #[test]
    fn test_active_graph_has_router_ids() {
        let t = square();
        let dag = ForwardingDag::seed(&t, prefix()).unwrap();
        let graph = dag.active_graph(&t);
        assert_eq!(graph.prefix, prefix());
        assert_eq!(graph.edges.len(), 4);
        assert!(graph.edges.iter().all(|e| e.to_router_id.octets()[3] == 1));
    }

    #[test]
    fn test_store_seeds_once() {
        let t = square();
        let mut store = ForwardingGraphStore::new();
        let (r1, r2) = (n(&t, "r1"), n(&t, "r2"));
        store
            .get(&t, prefix())
            .unwrap()
            .set_links_active(&[LinkToggle::deactivate((r1, r2))], &HashSet::new())
            .unwrap();
        assert!(!store.get(&t, prefix()).unwrap().link_state(r1, r2).unwrap().active);
        assert_eq!(store.prefixes(), vec![prefix()]);
    }
}
