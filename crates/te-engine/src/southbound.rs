//! Southbound Adapter boundary
//!
//! The route-injection mechanism lives outside this crate. The engine only
//! asks it to withdraw the lies of a prefix, install a forwarding graph and
//! refresh.

use crate::topology::NodeId;
use async_trait::async_trait;
use ipnetwork::IpNetwork;
use serde::Serialize;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Active link of a forwarding graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingEdge {
    /// Tail router
    pub from: NodeId,
    /// Head router
    pub to: NodeId,
    /// Router id of the tail
    pub from_router_id: Ipv4Addr,
    /// Router id of the head, the next hop to enforce
    pub to_router_id: Ipv4Addr,
}

/// Forwarding graph the southbound must realise for a prefix
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ForwardingGraph {
    /// Destination prefix
    pub prefix: IpNetwork,
    /// Active links
    pub edges: Vec<ForwardingEdge>,
}

/// Southbound failures
#[derive(Debug, Error)]
pub enum SouthboundError {
    /// Route injector cannot be reached
    #[error("southbound unreachable: {0}")]
    Unreachable(String),
    /// Route injector refused the graph
    #[error("route injection rejected for {prefix}: {reason}")]
    Rejected {
        /// Prefix being installed
        prefix: IpNetwork,
        /// Reason given by the injector
        reason: String,
    },
    /// Transport failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Route-injection collaborator
#[async_trait]
pub trait SouthboundAdapter: Send + Sync {
    /// Withdraw every lie previously injected for `prefix`
    async fn remove_lies_for_prefix(&self, prefix: IpNetwork) -> Result<(), SouthboundError>;

    /// Replace the forwarding graph to enforce for `prefix`
    async fn install_forwarding_graph(&self, prefix: IpNetwork, graph: ForwardingGraph) -> Result<(), SouthboundError>;

    /// Recompute and inject the lies for every installed graph. Called once
    /// after one or more installs.
    async fn refresh(&self) -> Result<(), SouthboundError>;
}
