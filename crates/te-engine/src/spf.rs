//! Shortest path computation
//!
//! Equal-cost ties are broken by node name: the forward walk always takes
//! the least-cost next hop whose name sorts first, which yields the
//! lexicographically smallest name sequence among all least-cost paths.

use crate::topology::{Link, NodeId, Topology};
use petgraph::graphmap::DiGraphMap;
use petgraph::Direction;
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use thiserror::Error;

/// Path computation errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PathError {
    /// Source and destination are disconnected in the given graph
    #[error("no path from {from} to {to}")]
    NoPathFound {
        /// Source node
        from: NodeId,
        /// Destination node
        to: NodeId,
    },
}

/// Cost-only view of (a subset of) the topology
#[derive(Debug, Clone)]
pub struct CostGraph<'a> {
    topology: &'a Topology,
    costs: DiGraphMap<NodeId, u32>,
}

impl<'a> CostGraph<'a> {
    pub(crate) fn new(topology: &'a Topology, keep: impl Fn(&Link) -> bool) -> Self {
        let mut costs = DiGraphMap::new();
        for node in topology.nodes() {
            costs.add_node(node.id);
        }
        for (u, v, link) in topology.graph().all_edges() {
            if keep(link) {
                costs.add_edge(u, v, link.cost);
            }
        }
        Self { topology, costs }
    }

    /// Link present in this view
    pub fn contains_link(&self, from: NodeId, to: NodeId) -> bool {
        self.costs.contains_edge(from, to)
    }

    /// Number of directed links in this view
    pub fn link_count(&self) -> usize {
        self.costs.edge_count()
    }

    /// Least cost from every node to `dst`. Prefix nodes other than `dst`
    /// get a distance but are never used as transit.
    pub fn distances_to(&self, dst: NodeId) -> HashMap<NodeId, u64> {
        let mut dist = HashMap::new();
        let mut heap = BinaryHeap::new();
        dist.insert(dst, 0u64);
        heap.push(Reverse((0u64, dst)));

        while let Some(Reverse((d, v))) = heap.pop() {
            if dist.get(&v).map_or(false, |&best| d > best) {
                continue;
            }
            if v != dst && !self.topology.is_router(v) {
                continue;
            }
            for u in self.costs.neighbors_directed(v, Direction::Incoming) {
                let Some(&w) = self.costs.edge_weight(u, v) else {
                    continue;
                };
                let nd = d + u64::from(w);
                if dist.get(&u).map_or(true, |&cur| nd < cur) {
                    dist.insert(u, nd);
                    heap.push(Reverse((nd, u)));
                }
            }
        }
        dist
    }

    /// Every next hop of `node` lying on a least-cost path to `dst`,
    /// ordered by name
    pub fn next_hops(&self, node: NodeId, dst: NodeId, dist: &HashMap<NodeId, u64>) -> Vec<NodeId> {
        let Some(&here) = dist.get(&node) else {
            return Vec::new();
        };
        let mut hops: Vec<NodeId> = self
            .costs
            .neighbors_directed(node, Direction::Outgoing)
            .filter(|v| *v == dst || self.topology.is_router(*v))
            .filter(|v| {
                match (dist.get(v), self.costs.edge_weight(node, *v)) {
                    (Some(&there), Some(&w)) => here == there + u64::from(w),
                    _ => false,
                }
            })
            .collect();
        hops.sort_by(|a, b| self.topology.name(*a).cmp(self.topology.name(*b)));
        hops
    }

    /// Least-cost path from `src` to `dst`, both endpoints included
    pub fn default_path(&self, src: NodeId, dst: NodeId) -> Result<Vec<NodeId>, PathError> {
        let no_path = PathError::NoPathFound { from: src, to: dst };
        let dist = self.distances_to(dst);
        if !dist.contains_key(&src) {
            return Err(no_path);
        }

        let mut path = vec![src];
        let mut cur = src;
        while cur != dst {
            let next = *self.next_hops(cur, dst, &dist).first().ok_or_else(|| no_path.clone())?;
            path.push(next);
            cur = next;
        }
        Ok(path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::TopologyBuilder;
    use std::net::Ipv4Addr;

    fn rid(n: u8) -> Ipv4Addr {
        Ipv4Addr::new(n, n, n, n)
    }

    /// ```text
    ///        r3
    ///     3 /  \ 3
    ///  s - r1 -- r2 - d
    ///        10
    /// ```
    fn triangle() -> Topology {
        let mut b = TopologyBuilder::new();
        for (i, name) in ["r1", "r2", "r3"].iter().enumerate() {
            b.add_router(name, rid(i as u8 + 1)).unwrap();
        }
        b.add_link("r1", "r2", 10, 10).unwrap();
        b.add_link("r1", "r3", 10, 3).unwrap();
        b.add_link("r3", "r2", 10, 3).unwrap();
        b.attach_prefix("10.0.1.0/24".parse().unwrap(), "r1", 1).unwrap();
        b.attach_prefix("10.0.2.0/24".parse().unwrap(), "r2", 1).unwrap();
        b.build()
    }

    fn names(t: &Topology, path: &[NodeId]) -> Vec<String> {
        t.path_names(path)
    }

    #[test]
    fn test_least_cost_path() {
        let t = triangle();
        let s = t.prefix_node(&"10.0.1.0/24".parse().unwrap()).unwrap();
        let d = t.prefix_node(&"10.0.2.0/24".parse().unwrap()).unwrap();
        let path = t.full_graph().default_path(s, d).unwrap();
        assert_eq!(names(&t, &path), ["10.0.1.0/24", "r1", "r3", "r2", "10.0.2.0/24"]);
    }

    #[test]
    fn test_filtered_graph_detours() {
        let mut t = triangle();
        let (r1, r3) = (t.node_by_name("r1").unwrap(), t.node_by_name("r3").unwrap());
        t.reserve(&[r1, r3], 8).unwrap();

        let s = t.prefix_node(&"10.0.1.0/24".parse().unwrap()).unwrap();
        let d = t.prefix_node(&"10.0.2.0/24".parse().unwrap()).unwrap();
        let view = t.links_with_spare_capacity(5);
        assert!(!view.contains_link(r1, r3));
        let path = view.default_path(s, d).unwrap();
        assert_eq!(names(&t, &path), ["10.0.1.0/24", "r1", "r2", "10.0.2.0/24"]);
    }

    #[test]
    fn test_no_path_found() {
        let mut t = triangle();
        let (r1, r2, r3) = (
            t.node_by_name("r1").unwrap(),
            t.node_by_name("r2").unwrap(),
            t.node_by_name("r3").unwrap(),
        );
        t.reserve(&[r1, r2], 8).unwrap();
        t.reserve(&[r1, r3], 8).unwrap();

        let s = t.prefix_node(&"10.0.1.0/24".parse().unwrap()).unwrap();
        let d = t.prefix_node(&"10.0.2.0/24".parse().unwrap()).unwrap();
        assert_eq!(
            t.links_with_spare_capacity(5).default_path(s, d),
            Err(PathError::NoPathFound { from: s, to: d })
        );
    }

    #[test]
    fn test_equal_cost_tie_broken_by_name() {
        // rb and ra are both one hop between r1 and r2 at equal cost
        let mut b = TopologyBuilder::new();
        b.add_router("r1", rid(1)).unwrap();
        b.add_router("rb", rid(2)).unwrap();
        b.add_router("ra", rid(3)).unwrap();
        b.add_router("r2", rid(4)).unwrap();
        b.add_link("r1", "rb", 10, 1).unwrap();
        b.add_link("r1", "ra", 10, 1).unwrap();
        b.add_link("rb", "r2", 10, 1).unwrap();
        b.add_link("ra", "r2", 10, 1).unwrap();
        b.attach_prefix("10.0.2.0/24".parse().unwrap(), "r2", 1).unwrap();
        let t = b.build();

        let r1 = t.node_by_name("r1").unwrap();
        let d = t.prefix_node(&"10.0.2.0/24".parse().unwrap()).unwrap();
        let graph = t.full_graph();
        let path = graph.default_path(r1, d).unwrap();
        assert_eq!(names(&t, &path), ["r1", "ra", "r2", "10.0.2.0/24"]);

        let dist = graph.distances_to(d);
        assert_eq!(names(&t, &graph.next_hops(r1, d, &dist)), ["ra", "rb"]);
    }

    #[test]
    fn test_prefix_is_never_transit() {
        // the only r1 -> r2 connection runs through a shared prefix
        let mut b = TopologyBuilder::new();
        b.add_router("r1", rid(1)).unwrap();
        b.add_router("r2", rid(2)).unwrap();
        let shared: ipnetwork::IpNetwork = "10.9.0.0/24".parse().unwrap();
        b.attach_prefix(shared, "r1", 1).unwrap();
        b.attach_prefix(shared, "r2", 1).unwrap();
        b.attach_prefix("10.0.2.0/24".parse().unwrap(), "r2", 1).unwrap();
        let t = b.build();

        let r1 = t.node_by_name("r1").unwrap();
        let d = t.prefix_node(&"10.0.2.0/24".parse().unwrap()).unwrap();
        assert!(t.full_graph().default_path(r1, d).is_err());
    }
}
