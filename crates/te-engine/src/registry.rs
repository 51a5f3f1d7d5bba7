//! Flow Registry
//!
//! Allocation table keyed by destination prefix, with a per-link index to
//! answer "which flows cross this link".

use crate::dag::{ForwardingDag, ForwardingGraphStore};
use crate::flow::{FlowId, FlowSpec};
use crate::topology::{LinkKey, NodeId, Topology};
use crate::{Result, TeError};
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

/// How a reservation is committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Commitment {
    /// Every link must have room
    Strict,
    /// Over-subscription accepted, offending links get flagged
    Fallback,
}

/// A flow committed to a single path
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Allocation {
    /// The flow
    pub flow: FlowSpec,
    /// Router path the flow is committed to
    pub path: Vec<NodeId>,
    /// Links this allocation pushed above capacity
    pub oversubscribed: Vec<LinkKey>,
}

/// Bookkeeping of allocated flows
#[derive(Debug, Default)]
pub struct FlowRegistry {
    by_prefix: HashMap<IpNetwork, BTreeMap<FlowId, Allocation>>,
    by_link: HashMap<LinkKey, BTreeSet<FlowId>>,
    prefix_of: HashMap<FlowId, IpNetwork>,
}

impl FlowRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Routers where traffic from `src` enters: the cheapest attachments.
    pub fn ingress_routers(topology: &Topology, src: &IpNetwork) -> Result<Vec<NodeId>> {
        let node = topology.prefix_node(src).ok_or(TeError::UnknownPrefix(*src))?;
        let attached = topology.attached_routers(node);
        let Some(best) = attached.first().map(|(_, cost)| *cost) else {
            return Ok(Vec::new());
        };
        Ok(attached
            .into_iter()
            .take_while(|(_, cost)| *cost == best)
            .map(|(router, _)| router)
            .collect())
    }

    /// Distinct paths currently realised by `dag` for traffic from `src`.
    /// More than one means ECMP is in effect.
    pub fn active_paths(topology: &Topology, dag: &ForwardingDag, src: &IpNetwork) -> Result<Vec<Vec<NodeId>>> {
        let mut paths: Vec<Vec<NodeId>> = Vec::new();
        for ingress in Self::ingress_routers(topology, src)? {
            for path in dag.active_paths(ingress) {
                if !paths.contains(&path) {
                    paths.push(path);
                }
            }
        }
        Ok(paths)
    }

    /// True iff `size` fits on every link of every candidate path. No
    /// candidate means no admission.
    pub fn can_admit(topology: &Topology, size: u64, paths: &[Vec<NodeId>]) -> bool {
        if paths.is_empty() {
            return false;
        }
        let links: BTreeSet<LinkKey> = paths
            .iter()
            .flat_map(|p| p.windows(2).map(|hop| (hop[0], hop[1])))
            .collect();
        links.iter().all(|(u, v)| {
            topology
                .link(*u, *v)
                .map_or(false, |link| link.spare() >= size)
        })
    }

    /// Commit `flow` to the first of `paths`. A flow already on record is
    /// released first, so a flow never holds two allocations.
    pub fn record(
        &mut self,
        topology: &mut Topology,
        dags: &mut ForwardingGraphStore,
        flow: FlowSpec,
        paths: &[Vec<NodeId>],
        commitment: Commitment,
    ) -> Result<Allocation> {
        let path = paths.first().cloned().ok_or(TeError::Unroutable {
            src: flow.src,
            dst: flow.dst,
        })?;

        if self.prefix_of.contains_key(&flow.id) {
            self.release(topology, dags, flow.id)?;
        }

        let oversubscribed = match commitment {
            Commitment::Strict => {
                topology.reserve(&path, flow.size)?;
                Vec::new()
            }
            Commitment::Fallback => topology.reserve_oversubscribed(&path, flow.size)?,
        };

        if let Some(dag) = dags.peek_mut(&flow.dst) {
            dag.set_ongoing(&path, true);
        }
        for hop in path.windows(2) {
            self.by_link.entry((hop[0], hop[1])).or_default().insert(flow.id);
        }
        self.prefix_of.insert(flow.id, flow.dst);

        let allocation = Allocation {
            flow,
            path,
            oversubscribed,
        };
        self.by_prefix
            .entry(allocation.flow.dst)
            .or_default()
            .insert(allocation.flow.id, allocation.clone());
        Ok(allocation)
    }

    /// Free the capacity of a flow whose traffic ended
    pub fn release(&mut self, topology: &mut Topology, dags: &mut ForwardingGraphStore, id: FlowId) -> Result<Option<Allocation>> {
        let Some(prefix) = self.prefix_of.get(&id).copied() else {
            return Ok(None);
        };
        let Some(allocation) = self.by_prefix.get(&prefix).and_then(|flows| flows.get(&id)).cloned() else {
            return Ok(None);
        };

        topology.release(&allocation.path, allocation.flow.size)?;

        self.prefix_of.remove(&id);
        if let Some(flows) = self.by_prefix.get_mut(&prefix) {
            flows.remove(&id);
            if flows.is_empty() {
                self.by_prefix.remove(&prefix);
            }
        }
        for hop in allocation.path.windows(2) {
            let link = (hop[0], hop[1]);
            let still_used = match self.by_link.get_mut(&link) {
                Some(flows) => {
                    flows.remove(&id);
                    let used = flows.iter().any(|f| self.prefix_of.get(f) == Some(&prefix));
                    if flows.is_empty() {
                        self.by_link.remove(&link);
                    }
                    used
                }
                None => false,
            };
            if !still_used {
                if let Some(dag) = dags.peek_mut(&prefix) {
                    dag.set_ongoing(&[link.0, link.1], false);
                }
            }
        }
        Ok(Some(allocation))
    }

    /// Allocation of a flow
    pub fn allocation(&self, id: &FlowId) -> Option<&Allocation> {
        let prefix = self.prefix_of.get(id)?;
        self.by_prefix.get(prefix)?.get(id)
    }

    /// Allocations toward `prefix`
    pub fn allocations_for(&self, prefix: &IpNetwork) -> Vec<&Allocation> {
        self.by_prefix
            .get(prefix)
            .map(|flows| flows.values().collect())
            .unwrap_or_default()
    }

    /// Flows allocated across a link
    pub fn flows_on(&self, link: LinkKey) -> Vec<FlowId> {
        self.by_link
            .get(&link)
            .map(|flows| flows.iter().copied().collect())
            .unwrap_or_default()
    }

    /// Nodes on the path of some flow toward `prefix`
    pub fn carrying_nodes(&self, prefix: &IpNetwork) -> HashSet<NodeId> {
        self.allocations_for(prefix)
            .into_iter()
            .flat_map(|a| a.path.iter().copied())
            .collect()
    }

    /// Number of allocated flows
    pub fn len(&self) -> usize {
        self.prefix_of.len()
    }

    /// No flow allocated
    pub fn is_empty(&self) -> bool {
        self.prefix_of.is_empty()
    }
}
