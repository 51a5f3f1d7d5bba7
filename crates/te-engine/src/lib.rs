//! Traffic Engineering Engine
//!
//! Congestion-aware flow allocation on top of a route-injection
//! ("fibbing") southbound.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      TRAFFIC ENGINEERING ENGINE                         │
//! │                                                                         │
//! │   Flow source ──► new flow ──► ┌──────────────────────────────────┐     │
//! │                                │        Allocation Engine         │     │
//! │                                │  Evaluating ─► Admitted          │     │
//! │                                │      │                           │     │
//! │                                │      └──────► Reallocating       │     │
//! │                                │                   │              │     │
//! │                                │               Committed          │     │
//! │                                └───┬──────────┬──────────┬────────┘     │
//! │                                    │          │          │              │
//! │  ┌─────────────────┐  ┌────────────▼───┐  ┌───▼────────┐ │              │
//! │  │   Graph Model   │  │ Forwarding DAG │  │    Flow    │ │              │
//! │  │ capacity, cost, │  │     store      │  │  registry  │ ▼              │
//! │  │   reservations  │  │ (per prefix)   │  │            │ Southbound     │
//! │  └─────────────────┘  └────────────────┘  └────────────┘ (lies)         │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]

pub mod dag;
pub mod engine;
pub mod flow;
pub mod registry;
pub mod source;
pub mod southbound;
pub mod spf;
pub mod stats;
pub mod topology;

pub use dag::{DagError, DagViolation, ForwardingDag, ForwardingGraphStore, LinkState, LinkToggle};
pub use engine::{AllocationEngine, AllocationOutcome, AllocationState, FallbackReason, FlowDecision};
pub use flow::{normalize_prefix, FlowId, FlowSpec};
pub use registry::{Allocation, Commitment, FlowRegistry};
pub use source::{FlowEvent, FlowSource, NameResolver, TopologyDirectory};
pub use southbound::{ForwardingEdge, ForwardingGraph, SouthboundAdapter, SouthboundError};
pub use spf::{CostGraph, PathError};
pub use stats::{EngineStats, StatsSnapshot};
pub use topology::{
    Link, LinkKey, LinkUtilization, Node, NodeId, NodeKind, ReservationError, Topology,
    TopologyBuilder, TopologyError,
};

use ipnetwork::IpNetwork;
use thiserror::Error;

/// Engine error types
#[derive(Debug, Error)]
pub enum TeError {
    /// Prefix has no node in the topology
    #[error("prefix {0} is not part of the topology")]
    UnknownPrefix(IpNetwork),

    /// Not even an over-subscribed route exists between the prefixes
    #[error("no route at all from {src} to {dst}")]
    Unroutable {
        /// Source prefix
        src: IpNetwork,
        /// Destination prefix
        dst: IpNetwork,
    },

    /// Reservation bookkeeping failed
    #[error("reservation error: {0}")]
    Reservation(#[from] ReservationError),

    /// Forwarding DAG rejected a mutation
    #[error(transparent)]
    Dag(#[from] DagError),

    /// Southbound adapter failure, propagated unchanged
    #[error("southbound error: {0}")]
    Southbound(#[from] SouthboundError),
}

/// Result type for the engine
pub type Result<T> = std::result::Result<T, TeError>;
