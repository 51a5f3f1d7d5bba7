//! Flow identity and size

use ipnetwork::IpNetwork;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Flow identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct FlowId(pub Uuid);

impl FlowId {
    /// Fresh random identifier
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for FlowId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for FlowId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A newly observed flow between two prefixes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FlowSpec {
    /// Flow identifier
    pub id: FlowId,
    /// Source prefix
    pub src: IpNetwork,
    /// Destination prefix
    pub dst: IpNetwork,
    /// Estimated size (bits per second)
    pub size: u64,
}

impl FlowSpec {
    /// Create a flow with a fresh id. Host addresses are reduced to their
    /// network prefix.
    pub fn new(src: IpNetwork, dst: IpNetwork, size: u64) -> Self {
        Self {
            id: FlowId::new(),
            src: normalize_prefix(src),
            dst: normalize_prefix(dst),
            size,
        }
    }

    /// Override the identifier
    pub fn with_id(mut self, id: FlowId) -> Self {
        self.id = id;
        self
    }
}

/// Reduce `10.0.1.7/24` to `10.0.1.0/24`.
pub fn normalize_prefix(net: IpNetwork) -> IpNetwork {
    IpNetwork::new(net.network(), net.prefix()).unwrap_or(net)
}
