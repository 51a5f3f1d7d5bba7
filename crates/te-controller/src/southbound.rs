//! Logging southbound
//!
//! Stand-in for the route-injection daemon: remembers the forwarding graph
//! requested per prefix and logs every call.

use async_trait::async_trait;
use ipnetwork::IpNetwork;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use te_engine::{ForwardingGraph, NameResolver, SouthboundAdapter, SouthboundError};
use tracing::{debug, info};

/// Southbound that records the requested forwarding state
pub struct LoggingSouthbound {
    installed: RwLock<BTreeMap<IpNetwork, ForwardingGraph>>,
    refreshes: AtomicU64,
    resolver: Option<Box<dyn NameResolver>>,
}

impl LoggingSouthbound {
    pub fn new() -> Self {
        Self {
            installed: RwLock::new(BTreeMap::new()),
            refreshes: AtomicU64::new(0),
            resolver: None,
        }
    }

    /// Log router names instead of router ids
    pub fn with_resolver(mut self, resolver: Box<dyn NameResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Graph currently requested for `prefix`
    pub fn installed(&self, prefix: &IpNetwork) -> Option<ForwardingGraph> {
        self.installed.read().get(prefix).cloned()
    }

    /// Prefixes with a forced graph
    pub fn prefixes(&self) -> Vec<IpNetwork> {
        self.installed.read().keys().copied().collect()
    }

    pub fn refresh_count(&self) -> u64 {
        self.refreshes.load(Ordering::Relaxed)
    }

    fn render(&self, graph: &ForwardingGraph) -> Vec<String> {
        let name = |rid: std::net::Ipv4Addr| {
            self.resolver
                .as_ref()
                .and_then(|r| r.resolve_router_to_name(rid))
                .unwrap_or_else(|| rid.to_string())
        };
        graph
            .edges
            .iter()
            .map(|e| format!("{}->{}", name(e.from_router_id), name(e.to_router_id)))
            .collect()
    }
}

impl Default for LoggingSouthbound {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl SouthboundAdapter for LoggingSouthbound {
    async fn remove_lies_for_prefix(&self, prefix: IpNetwork) -> Result<(), SouthboundError> {
        let removed = self.installed.write().remove(&prefix).is_some();
        info!(prefix = %prefix, removed, "Lies withdrawn");
        Ok(())
    }

    async fn install_forwarding_graph(&self, prefix: IpNetwork, graph: ForwardingGraph) -> Result<(), SouthboundError> {
        if graph.prefix != prefix {
            return Err(SouthboundError::Rejected {
                prefix,
                reason: format!("graph is for {}", graph.prefix),
            });
        }
        info!(prefix = %prefix, edges = ?self.render(&graph), "Forwarding graph installed");
        self.installed.write().insert(prefix, graph);
        Ok(())
    }

    async fn refresh(&self) -> Result<(), SouthboundError> {
        let count = self.refreshes.fetch_add(1, Ordering::Relaxed) + 1;
        let prefixes = self.installed.read().len();
        debug!(refresh = count, prefixes, "Lies refreshed");
        Ok(())
    }
}
