//! Engine statistics

use crate::engine::AllocationOutcome;
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

/// Allocation counters
#[derive(Debug, Default)]
pub struct EngineStats {
    /// Flows that fit their current paths
    pub flows_admitted: AtomicU64,
    /// Flows moved to a new path
    pub flows_rerouted: AtomicU64,
    /// Flows committed over capacity
    pub flows_fallback: AtomicU64,
    /// Flows whose capacity was given back
    pub flows_released: AtomicU64,
    /// Remove/install/refresh sequences sent
    pub southbound_pushes: AtomicU64,
    /// Cumulative allocation time (micros)
    pub allocation_micros: AtomicU64,
}

impl EngineStats {
    /// Count one committed flow
    pub fn record_commit(&self, outcome: &AllocationOutcome, elapsed: Duration) {
        let counter = match outcome {
            AllocationOutcome::Admitted => &self.flows_admitted,
            AllocationOutcome::Rerouted => &self.flows_rerouted,
            AllocationOutcome::Fallback(_) => &self.flows_fallback,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.allocation_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);

        metrics::counter!("te_flows_total", "outcome" => outcome.label()).increment(1);
        metrics::histogram!("te_allocation_seconds").record(elapsed.as_secs_f64());
    }

    /// Count one released flow
    pub fn record_release(&self) {
        self.flows_released.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("te_flows_released_total").increment(1);
    }

    /// Count one remove/install/refresh sequence
    pub fn record_push(&self) {
        self.southbound_pushes.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("te_southbound_pushes_total").increment(1);
    }

    /// Plain copy of the counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            flows_admitted: self.flows_admitted.load(Ordering::Relaxed),
            flows_rerouted: self.flows_rerouted.load(Ordering::Relaxed),
            flows_fallback: self.flows_fallback.load(Ordering::Relaxed),
            flows_released: self.flows_released.load(Ordering::Relaxed),
            southbound_pushes: self.southbound_pushes.load(Ordering::Relaxed),
            allocation_micros: self.allocation_micros.load(Ordering::Relaxed),
        }
    }
}

/// Counter values at a point in time
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    /// See [`EngineStats::flows_admitted`]
    pub flows_admitted: u64,
    /// See [`EngineStats::flows_rerouted`]
    pub flows_rerouted: u64,
    /// See [`EngineStats::flows_fallback`]
    pub flows_fallback: u64,
    /// See [`EngineStats::flows_released`]
    pub flows_released: u64,
    /// See [`EngineStats::southbound_pushes`]
    pub southbound_pushes: u64,
    /// Cumulative allocation time (micros)
    pub allocation_micros: u64,
}

impl StatsSnapshot {
    /// Committed flows of any outcome
    pub fn flows_committed(&self) -> u64 {
        self.flows_admitted + self.flows_rerouted + self.flows_fallback
    }
}
