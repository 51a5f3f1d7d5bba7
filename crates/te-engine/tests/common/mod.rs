//! Shared fixtures for the engine integration tests
#![allow(dead_code)]

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::Mutex;
use std::net::Ipv4Addr;
use std::sync::Arc;
use te_engine::{ForwardingGraph, NodeId, SouthboundAdapter, SouthboundError, Topology, TopologyBuilder};

/// One call received by the southbound double
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SouthboundCall {
    Remove(IpNetwork),
    Install(ForwardingGraph),
    Refresh,
}

/// Southbound that records every call
#[derive(Debug, Default)]
pub struct RecordingSouthbound {
    calls: Mutex<Vec<SouthboundCall>>,
}

impl RecordingSouthbound {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<SouthboundCall> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl SouthboundAdapter for RecordingSouthbound {
    async fn remove_lies_for_prefix(&self, prefix: IpNetwork) -> Result<(), SouthboundError> {
        self.calls.lock().push(SouthboundCall::Remove(prefix));
        Ok(())
    }

    async fn install_forwarding_graph(&self, _prefix: IpNetwork, graph: ForwardingGraph) -> Result<(), SouthboundError> {
        self.calls.lock().push(SouthboundCall::Install(graph));
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SouthboundError> {
        self.calls.lock().push(SouthboundCall::Refresh);
        Ok(())
    }
}

pub fn net(s: &str) -> IpNetwork {
    s.parse().unwrap()
}

pub fn s1() -> IpNetwork {
    net("10.0.1.0/24")
}

pub fn s2() -> IpNetwork {
    net("10.0.5.0/24")
}

pub fn d1() -> IpNetwork {
    net("10.0.2.0/24")
}

pub fn d3() -> IpNetwork {
    net("10.0.3.0/24")
}

pub fn dx() -> IpNetwork {
    net("10.0.4.0/24")
}

pub fn dm() -> IpNetwork {
    net("10.0.6.0/24")
}

fn router(b: &mut TopologyBuilder, name: &str, last: u8) {
    b.add_router(name, Ipv4Addr::new(192, 0, 2, last)).unwrap();
}

/// r1-r2 direct, r1-r3-r2 detour; capacity 10, cost 1 everywhere.
/// s1 at r1, d1 at r2, d3 at r3.
pub fn triangle() -> Topology {
    let mut b = TopologyBuilder::new();
    router(&mut b, "r1", 1);
    router(&mut b, "r2", 2);
    router(&mut b, "r3", 3);
    b.add_link("r1", "r2", 10, 1).unwrap();
    b.add_link("r1", "r3", 10, 1).unwrap();
    b.add_link("r3", "r2", 10, 1).unwrap();
    b.attach_prefix(s1(), "r1", 1).unwrap();
    b.attach_prefix(d1(), "r2", 1).unwrap();
    b.attach_prefix(d3(), "r3", 1).unwrap();
    b.build()
}

/// r1 reaches r4 through r2 or r3 at equal cost, r2-r3 cross link;
/// capacity 10, cost 1 everywhere. s1 at r1, s2 at r2, d1 and dx at r4,
/// dm at r4 and, at cost 3, at r3.
pub fn diamond() -> Topology {
    let mut b = TopologyBuilder::new();
    router(&mut b, "r1", 1);
    router(&mut b, "r2", 2);
    router(&mut b, "r3", 3);
    router(&mut b, "r4", 4);
    b.add_link("r1", "r2", 10, 1).unwrap();
    b.add_link("r2", "r4", 10, 1).unwrap();
    b.add_link("r1", "r3", 10, 1).unwrap();
    b.add_link("r3", "r4", 10, 1).unwrap();
    b.add_link("r2", "r3", 10, 1).unwrap();
    b.attach_prefix(s1(), "r1", 1).unwrap();
    b.attach_prefix(s2(), "r2", 1).unwrap();
    b.attach_prefix(d1(), "r4", 1).unwrap();
    b.attach_prefix(dx(), "r4", 1).unwrap();
    b.attach_prefix(dm(), "r4", 1).unwrap();
    b.attach_prefix(dm(), "r3", 3).unwrap();
    b.build()
}

/// Triangle with capacity 10, cost 1. s1 at r1, s2 at r3, dx at r2, d1 at
/// r2 and, at cost 5, at r3.
pub fn multihomed() -> Topology {
    let mut b = TopologyBuilder::new();
    router(&mut b, "r1", 1);
    router(&mut b, "r2", 2);
    router(&mut b, "r3", 3);
    b.add_link("r1", "r2", 10, 1).unwrap();
    b.add_link("r1", "r3", 10, 1).unwrap();
    b.add_link("r3", "r2", 10, 1).unwrap();
    b.attach_prefix(s1(), "r1", 1).unwrap();
    b.attach_prefix(s2(), "r3", 1).unwrap();
    b.attach_prefix(dx(), "r2", 1).unwrap();
    b.attach_prefix(d1(), "r2", 1).unwrap();
    b.attach_prefix(d1(), "r3", 5).unwrap();
    b.build()
}

pub fn ids(topology: &Topology, names: &[&str]) -> Vec<NodeId> {
    names
        .iter()
        .map(|n| topology.node_by_name(n).unwrap())
        .collect()
}

/// (from, to) pairs of an installed graph
pub fn edges(graph: &ForwardingGraph) -> Vec<(NodeId, NodeId)> {
    let mut edges: Vec<_> = graph.edges.iter().map(|e| (e.from, e.to)).collect();
    edges.sort();
    edges
}
