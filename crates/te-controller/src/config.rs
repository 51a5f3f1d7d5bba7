//! Controller Configuration

use ipnetwork::{IpNetwork, Ipv4Network};
use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr};
use te_engine::TopologyError;
use thiserror::Error;

/// Default location of the configuration file
pub const DEFAULT_CONFIG_PATH: &str = "/etc/te-controller/controller.json";

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Controller configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControllerConfig {
    /// Flow feed listen address
    pub listen_addr: SocketAddr,
    /// Capacity of the event queue between feed and worker
    pub queue_size: usize,
    /// Log filter used when `RUST_LOG` is unset
    pub log_filter: String,
    /// Prometheus scrape endpoint, disabled when unset
    pub metrics_addr: Option<SocketAddr>,
    /// Network description
    pub topology: TopologyConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 7070)),
            queue_size: 1024,
            log_filter: "info".into(),
            metrics_addr: None,
            topology: TopologyConfig::demo(),
        }
    }
}

impl ControllerConfig {
    /// Load from file
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    /// Parse and validate
    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Save to file
    pub fn save(&self, path: &str) -> Result<(), ConfigError> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Checks that do not need a topology build
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_size == 0 {
            return Err(ConfigError::Invalid("queue_size must be positive".into()));
        }
        if self.topology.routers.is_empty() {
            return Err(ConfigError::Invalid("no routers configured".into()));
        }
        for prefix in &self.topology.prefixes {
            if prefix.attached.is_empty() {
                return Err(ConfigError::Invalid(format!("prefix {} is not attached", prefix.prefix)));
            }
        }
        Ok(())
    }
}

/// Routers, links and prefixes
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TopologyConfig {
    pub routers: Vec<RouterConfig>,
    pub links: Vec<LinkConfig>,
    pub prefixes: Vec<PrefixConfig>,
}

/// Router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    pub name: String,
    pub router_id: Ipv4Addr,
}

impl TopologyConfig {
    /// Three routers in a triangle, one prefix behind each
    pub fn demo() -> Self {
        let router = |name: &str, last: u8| RouterConfig {
            name: name.into(),
            router_id: Ipv4Addr::new(10, 255, 0, last),
        };
        let link = |a: &str, b: &str| LinkConfig {
            a: a.into(),
            b: b.into(),
            capacity: 1_000_000_000,
            cost: 1,
        };
        let prefixes = [([10, 0, 1, 0], "r1"), ([10, 0, 2, 0], "r2"), ([10, 0, 3, 0], "r3")]
            .into_iter()
            .filter_map(|(net, router)| {
                let prefix = Ipv4Network::new(Ipv4Addr::from(net), 24).ok()?;
                Some(PrefixConfig {
                    prefix: IpNetwork::V4(prefix),
                    attached: vec![AttachmentConfig {
                        router: router.into(),
                        cost: 1,
                    }],
                })
            })
            .collect();
        Self {
            routers: vec![router("r1", 1), router("r2", 2), router("r3", 3)],
            links: vec![link("r1", "r2"), link("r1", "r3"), link("r2", "r3")],
            prefixes,
        }
    }
}

/// Bidirectional link between two routers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LinkConfig {
    pub a: String,
    pub b: String,
    /// Bits per second, each direction
    pub capacity: u64,
    pub cost: u32,
}

/// Destination prefix and the routers announcing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrefixConfig {
    pub prefix: IpNetwork,
    pub attached: Vec<AttachmentConfig>,
}

/// Attachment of a prefix to a router
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttachmentConfig {
    pub router: String,
    pub cost: u32,
}
