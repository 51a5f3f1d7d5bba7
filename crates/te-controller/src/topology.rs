//! Topology construction from configuration

use crate::config::{ConfigError, TopologyConfig};
use te_engine::{Topology, TopologyBuilder};
use tracing::info;

impl TopologyConfig {
    /// Build the engine topology. Rejects duplicate routers, links or
    /// attachments naming unknown routers, and zero capacity or cost.
    pub fn build(&self) -> Result<Topology, ConfigError> {
        let mut builder = TopologyBuilder::new();
        for router in &self.routers {
            builder.add_router(&router.name, router.router_id)?;
        }
        for link in &self.links {
            builder.add_link(&link.a, &link.b, link.capacity, link.cost)?;
        }
        for prefix in &self.prefixes {
            if prefix.attached.is_empty() {
                return Err(ConfigError::Invalid(format!("prefix {} is not attached", prefix.prefix)));
            }
            for attachment in &prefix.attached {
                builder.attach_prefix(prefix.prefix, &attachment.router, attachment.cost)?;
            }
        }

        let topology = builder.build();
        info!(
            routers = self.routers.len(),
            links = self.links.len(),
            prefixes = self.prefixes.len(),
            "Topology loaded"
        );
        Ok(topology)
    }
}
