//! Flow/Topology Source boundary

use crate::flow::{FlowId, FlowSpec};
use crate::topology::{NodeKind, Topology};
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::Ipv4Addr;

/// Event reported by the flow monitor
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FlowEvent {
    /// New flow observed
    Started(FlowSpec),
    /// Traffic of a flow ended, its capacity can be released
    Ended(FlowId),
    /// Release and allocate the flow again
    Reevaluate(FlowId),
}

/// Stream of flow events
#[async_trait]
pub trait FlowSource: Send {
    /// Next event, `None` once the source is closed
    async fn next_event(&mut self) -> Option<FlowEvent>;
}

/// Lookups used to make logs readable
pub trait NameResolver: Send + Sync {
    /// Router id of the router serving `prefix`
    fn resolve_prefix_to_router_id(&self, prefix: &IpNetwork) -> Option<Ipv4Addr>;

    /// Configured name of a router
    fn resolve_router_to_name(&self, router_id: Ipv4Addr) -> Option<String>;
}

/// Name directory derived from a topology
#[derive(Debug, Clone, Default)]
pub struct TopologyDirectory {
    prefixes: HashMap<IpNetwork, Ipv4Addr>,
    routers: HashMap<Ipv4Addr, String>,
}

impl TopologyDirectory {
    /// Snapshot the names of `topology`
    pub fn from_topology(topology: &Topology) -> Self {
        let mut dir = Self::default();
        for node in topology.nodes() {
            match &node.kind {
                NodeKind::Router { router_id } => {
                    dir.routers.insert(*router_id, node.name.clone());
                }
                NodeKind::Prefix(prefix) => {
                    let serving = topology
                        .attached_routers(node.id)
                        .first()
                        .and_then(|(r, _)| topology.router_id(*r));
                    if let Some(router_id) = serving {
                        dir.prefixes.insert(*prefix, router_id);
                    }
                }
            }
        }
        dir
    }
}

impl NameResolver for TopologyDirectory {
    fn resolve_prefix_to_router_id(&self, prefix: &IpNetwork) -> Option<Ipv4Addr> {
        self.prefixes.get(prefix).copied()
    }

    fn resolve_router_to_name(&self, router_id: Ipv4Addr) -> Option<String> {
        self.routers.get(&router_id).cloned()
    }
}
