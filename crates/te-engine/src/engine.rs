//! Allocation Engine
//!
//! Per flow: Evaluating → {Admitted | Reallocating} → Committed.
//!
//! A flow is admitted on the prefix's current active paths when it fits.
//! Otherwise the greedy algorithm looks for the least-cost path over links
//! that can still take the flow, rewrites the prefix's forwarding DAG around
//! it and pushes the result to the southbound. When no such path exists the
//! flow is committed to the current paths anyway: traffic is never dropped.

use crate::dag::{ForwardingDag, ForwardingGraphStore, LinkToggle};
use crate::flow::{FlowId, FlowSpec};
use crate::registry::{Allocation, Commitment, FlowRegistry};
use crate::source::{FlowEvent, NameResolver, TopologyDirectory};
use crate::southbound::SouthboundAdapter;
use crate::spf::PathError;
use crate::stats::{EngineStats, StatsSnapshot};
use crate::topology::{LinkKey, LinkUtilization, NodeId, Topology};
use crate::{Result, TeError};
use ipnetwork::IpNetwork;
use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Allocation state of one flow event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationState {
    /// Checking the current active paths
    Evaluating,
    /// Fits as is
    Admitted,
    /// Greedy search for a new path
    Reallocating,
    /// Recorded in the registry
    Committed,
}

impl AllocationState {
    /// Legal transitions
    pub fn can_advance_to(&self, next: AllocationState) -> bool {
        matches!(
            (self, next),
            (Self::Evaluating, Self::Admitted)
                | (Self::Evaluating, Self::Reallocating)
                | (Self::Admitted, Self::Committed)
                | (Self::Reallocating, Self::Committed)
        )
    }

    /// Log name
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Evaluating => "evaluating",
            Self::Admitted => "admitted",
            Self::Reallocating => "reallocating",
            Self::Committed => "committed",
        }
    }
}

/// Why a flow ended up over-subscribing its current paths
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FallbackReason {
    /// No congestion-free path exists
    NoPathFound,
    /// The rerouting DAG would have broken forwarding
    InvalidDagMutation,
}

/// How a flow got committed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationOutcome {
    /// Fits on the current active paths
    Admitted,
    /// Moved to a new congestion-free path
    Rerouted,
    /// Kept on the current paths despite congestion
    Fallback(FallbackReason),
}

impl AllocationOutcome {
    /// Metric label
    pub fn label(&self) -> &'static str {
        match self {
            Self::Admitted => "admitted",
            Self::Rerouted => "rerouted",
            Self::Fallback(_) => "fallback",
        }
    }
}

/// Result of allocating one flow
#[derive(Debug, Clone)]
pub struct FlowDecision {
    /// Flow
    pub flow: FlowId,
    /// How it got committed
    pub outcome: AllocationOutcome,
    /// Committed router path
    pub path: Vec<NodeId>,
    /// Active paths found while evaluating
    pub active_paths: usize,
    /// States walked through
    pub states: Vec<AllocationState>,
    /// Full links left active because flows to the same prefix cross them
    pub pinned_links: Vec<LinkKey>,
    /// Links the allocation pushed above capacity
    pub oversubscribed: Vec<LinkKey>,
    /// Time spent allocating
    pub elapsed: Duration,
}

struct EngineState {
    topology: Topology,
    dags: ForwardingGraphStore,
    registry: FlowRegistry,
}

struct Trace {
    flow: FlowId,
    states: Vec<AllocationState>,
}

impl Trace {
    fn new(flow: FlowId) -> Self {
        Self {
            flow,
            states: vec![AllocationState::Evaluating],
        }
    }

    fn advance(&mut self, next: AllocationState) {
        let current = self.states.last().copied().unwrap_or(AllocationState::Evaluating);
        debug_assert!(current.can_advance_to(next), "{current:?} -> {next:?}");
        debug!(flow = %self.flow, from = current.as_str(), to = next.as_str(), "Allocation state");
        self.states.push(next);
    }
}

struct MutationPlan {
    toggles: Vec<LinkToggle>,
    pinned: Vec<LinkKey>,
}

/// Flow allocation engine.
///
/// Owns the topology, the forwarding DAGs and the flow registry. Every event
/// runs to completion, southbound calls included, under one lock.
pub struct AllocationEngine {
    state: Mutex<EngineState>,
    southbound: Arc<dyn SouthboundAdapter>,
    resolver: Arc<dyn NameResolver>,
    stats: Arc<EngineStats>,
}

impl AllocationEngine {
    /// Create an engine over `topology`
    pub fn new(topology: Topology, southbound: Arc<dyn SouthboundAdapter>) -> Self {
        let resolver = Arc::new(TopologyDirectory::from_topology(&topology));
        Self {
            state: Mutex::new(EngineState {
                topology,
                dags: ForwardingGraphStore::new(),
                registry: FlowRegistry::new(),
            }),
            southbound,
            resolver,
            stats: Arc::new(EngineStats::default()),
        }
    }

    /// Use another name resolver for logs
    pub fn with_resolver(mut self, resolver: Arc<dyn NameResolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Shared statistics
    pub fn stats(&self) -> Arc<EngineStats> {
        self.stats.clone()
    }

    /// Dispatch a source event
    pub async fn handle(&self, event: FlowEvent) -> Result<Option<FlowDecision>> {
        match event {
            FlowEvent::Started(flow) => self.on_new_flow(flow).await.map(Some),
            FlowEvent::Ended(id) => self.on_flow_ended(id).await.map(|_| None),
            FlowEvent::Reevaluate(id) => self.reevaluate(id).await,
        }
    }

    /// Allocate a newly observed flow
    pub async fn on_new_flow(&self, flow: FlowSpec) -> Result<FlowDecision> {
        let mut state = self.state.lock().await;
        self.allocate(&mut state, flow).await
    }

    /// Release the capacity of a flow whose traffic ended
    pub async fn on_flow_ended(&self, id: FlowId) -> Result<Option<Allocation>> {
        let mut state = self.state.lock().await;
        let EngineState {
            topology,
            dags,
            registry,
        } = &mut *state;

        let released = registry.release(topology, dags, id)?;
        match &released {
            Some(allocation) => {
                self.stats.record_release();
                info!(
                    flow = %id,
                    path = %self.readable(topology, &allocation.path),
                    size = allocation.flow.size,
                    "Flow ended, capacity released"
                );
            }
            None => warn!(flow = %id, "End of unknown flow ignored"),
        }
        Ok(released)
    }

    /// Release a flow and run it through allocation again
    pub async fn reevaluate(&self, id: FlowId) -> Result<Option<FlowDecision>> {
        let mut state = self.state.lock().await;
        let Some(flow) = state.registry.allocation(&id).map(|a| a.flow.clone()) else {
            warn!(flow = %id, "Re-evaluation of unknown flow ignored");
            return Ok(None);
        };
        self.allocate(&mut state, flow).await.map(Some)
    }

    /// Link utilization snapshot
    pub async fn utilization(&self) -> Vec<LinkUtilization> {
        self.state.lock().await.topology.utilization()
    }

    /// Current allocation of a flow
    pub async fn allocation(&self, id: FlowId) -> Option<Allocation> {
        self.state.lock().await.registry.allocation(&id).cloned()
    }

    /// Allocations toward a prefix
    pub async fn allocations_for(&self, prefix: IpNetwork) -> Vec<Allocation> {
        self.state
            .lock()
            .await
            .registry
            .allocations_for(&prefix)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Forwarding DAG of a prefix, if seeded
    pub async fn forwarding_dag(&self, prefix: IpNetwork) -> Option<ForwardingDag> {
        self.state.lock().await.dags.peek(&prefix).cloned()
    }

    /// Node lookup by name
    pub async fn node_id(&self, name: &str) -> Option<NodeId> {
        self.state.lock().await.topology.node_by_name(name)
    }

    /// Stop the engine and hand back the final counters
    pub fn shutdown(self) -> StatsSnapshot {
        let state = self.state.into_inner();
        let stats = self.stats.snapshot();
        info!(
            flows = state.registry.len(),
            prefixes = state.dags.prefixes().len(),
            committed = stats.flows_committed(),
            "Allocation engine stopped"
        );
        stats
    }

    async fn allocate(&self, state: &mut EngineState, flow: FlowSpec) -> Result<FlowDecision> {
        let started = Instant::now();
        let mut trace = Trace::new(flow.id);
        let EngineState {
            topology,
            dags,
            registry,
        } = state;

        if flow.src == flow.dst {
            return Err(TeError::Unroutable {
                src: flow.src,
                dst: flow.dst,
            });
        }
        let src = topology.prefix_node(&flow.src).ok_or(TeError::UnknownPrefix(flow.src))?;
        let dst = topology.prefix_node(&flow.dst).ok_or(TeError::UnknownPrefix(flow.dst))?;

        // a re-evaluated flow must not compete with its own reservation
        if registry.allocation(&flow.id).is_some() {
            registry.release(topology, dags, flow.id)?;
        }

        let dag = dags.get(topology, flow.dst)?;
        let current = FlowRegistry::active_paths(topology, dag, &flow.src)?;
        info!(
            flow = %flow.id,
            src = %flow.src,
            dst = %self.readable_prefix(&flow.dst),
            size = flow.size,
            paths = ?current.iter().map(|p| self.readable(topology, p)).collect::<Vec<_>>(),
            "Evaluating flow"
        );
        match current.len() {
            0 => warn!(flow = %flow.id, dst = %flow.dst, "No active path for prefix"),
            1 => debug!(flow = %flow.id, "ECMP is not active"),
            n => info!(flow = %flow.id, paths = n, "ECMP is active"),
        }
        let active_paths = current.len();

        let (outcome, allocation, pinned_links) = if FlowRegistry::can_admit(topology, flow.size, &current) {
            trace.advance(AllocationState::Admitted);
            let allocation = registry.record(topology, dags, flow, &current, Commitment::Strict)?;
            (AllocationOutcome::Admitted, allocation, Vec::new())
        } else {
            trace.advance(AllocationState::Reallocating);
            info!(flow = %flow.id, "Flow does not fit current paths, greedy reallocation started");
            self.reallocate(topology, dags, registry, flow, src, dst, current).await?
        };

        trace.advance(AllocationState::Committed);
        let elapsed = started.elapsed();
        self.stats.record_commit(&outcome, elapsed);
        info!(
            flow = %allocation.flow.id,
            outcome = outcome.label(),
            path = %self.readable(topology, &allocation.path),
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Flow committed"
        );

        Ok(FlowDecision {
            flow: allocation.flow.id,
            outcome,
            path: allocation.path,
            active_paths,
            states: trace.states,
            pinned_links,
            oversubscribed: allocation.oversubscribed,
            elapsed,
        })
    }

    #[allow(clippy::too_many_arguments)]
    async fn reallocate(
        &self,
        topology: &mut Topology,
        dags: &mut ForwardingGraphStore,
        registry: &mut FlowRegistry,
        flow: FlowSpec,
        src: NodeId,
        dst: NodeId,
        initial: Vec<Vec<NodeId>>,
    ) -> Result<(AllocationOutcome, Allocation, Vec<LinkKey>)> {
        let found = topology.links_with_spare_capacity(flow.size).default_path(src, dst);
        let path = match found {
            Ok(full) => routers_only(topology, &full),
            Err(PathError::NoPathFound { .. }) => {
                info!(flow = %flow.id, "No congestion-free path, keeping current paths");
                let allocation = self.fall_back(topology, dags, registry, flow, src, dst, initial).await?;
                return Ok((AllocationOutcome::Fallback(FallbackReason::NoPathFound), allocation, Vec::new()));
            }
        };
        info!(flow = %flow.id, path = %self.readable(topology, &path), "Found path that can take the flow");

        let carrying = registry.carrying_nodes(&flow.dst);
        let dag = dags.get(topology, flow.dst)?;
        debug!(prefix = %flow.dst, dag = %dag.describe(topology), "Initial DAG");

        let plan = plan_mutation(topology, dag, &path, flow.size, &carrying);
        for (u, v) in &plan.pinned {
            warn!(
                prefix = %flow.dst,
                link = %format!("{}->{}", topology.name(*u), topology.name(*v)),
                "Full link still carries flows to this prefix, longer prefix fibbing needed"
            );
        }

        let mut staged = dag.clone();
        if let Err(err) = staged.set_links_active(&plan.toggles, &carrying) {
            warn!(flow = %flow.id, error = %err, "Forwarding DAG mutation rejected, keeping current paths");
            let allocation = self.fall_back(topology, dags, registry, flow, src, dst, initial).await?;
            return Ok((
                AllocationOutcome::Fallback(FallbackReason::InvalidDagMutation),
                allocation,
                plan.pinned,
            ));
        }
        debug!(prefix = %flow.dst, dag = %staged.describe(topology), "Final DAG");

        self.push(topology, &staged).await?;
        dags.replace(staged);

        let allocation = registry.record(topology, dags, flow, &[path], Commitment::Strict)?;
        Ok((AllocationOutcome::Rerouted, allocation, plan.pinned))
    }

    #[allow(clippy::too_many_arguments)]
    async fn fall_back(
        &self,
        topology: &mut Topology,
        dags: &mut ForwardingGraphStore,
        registry: &mut FlowRegistry,
        flow: FlowSpec,
        src: NodeId,
        dst: NodeId,
        initial: Vec<Vec<NodeId>>,
    ) -> Result<Allocation> {
        let paths = if initial.is_empty() {
            let full = topology
                .full_graph()
                .default_path(src, dst)
                .map_err(|_| TeError::Unroutable {
                    src: flow.src,
                    dst: flow.dst,
                })?;
            let path = routers_only(topology, &full);
            self.open_ingress(topology, dags, registry, &flow, &path).await?;
            vec![path]
        } else {
            initial
        };

        let allocation = registry.record(topology, dags, flow, &paths, Commitment::Fallback)?;
        if !allocation.oversubscribed.is_empty() {
            warn!(
                flow = %allocation.flow.id,
                links = ?allocation
                    .oversubscribed
                    .iter()
                    .map(|(u, v)| format!("{}->{}", topology.name(*u), topology.name(*v)))
                    .collect::<Vec<_>>(),
                "Fallback allocation over-subscribes links"
            );
        }
        Ok(allocation)
    }

    /// Give an ingress without any active path a way out along `path`, so
    /// that the fallback flow is not black-holed.
    async fn open_ingress(
        &self,
        topology: &Topology,
        dags: &mut ForwardingGraphStore,
        registry: &FlowRegistry,
        flow: &FlowSpec,
        path: &[NodeId],
    ) -> Result<()> {
        let carrying = registry.carrying_nodes(&flow.dst);
        let dag = dags.get(topology, flow.dst)?;
        let (path_links, off) = steer(dag, path);
        let toggles: Vec<_> = off
            .into_iter()
            .map(LinkToggle::deactivate)
            .chain(path_links.into_iter().map(LinkToggle::activate))
            .collect();

        let mut staged = dag.clone();
        if let Err(err) = staged.set_links_active(&toggles, &carrying) {
            warn!(flow = %flow.id, error = %err, "Cannot open the default path, flow has no active route");
            return Ok(());
        }
        self.push(topology, &staged).await?;
        dags.replace(staged);
        info!(flow = %flow.id, path = %self.readable(topology, path), "Default path activated for ingress");
        Ok(())
    }

    async fn push(&self, topology: &Topology, dag: &ForwardingDag) -> Result<()> {
        let prefix = dag.prefix();
        let graph = dag.active_graph(topology);
        self.southbound.remove_lies_for_prefix(prefix).await?;
        self.southbound.install_forwarding_graph(prefix, graph).await?;
        self.southbound.refresh().await?;
        self.stats.record_push();
        info!(prefix = %prefix, "Forced forwarding DAG in southbound");
        Ok(())
    }

    fn readable(&self, topology: &Topology, path: &[NodeId]) -> String {
        path.iter()
            .map(|n| {
                topology
                    .router_id(*n)
                    .and_then(|rid| self.resolver.resolve_router_to_name(rid))
                    .unwrap_or_else(|| topology.name(*n).to_string())
            })
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    fn readable_prefix(&self, prefix: &IpNetwork) -> String {
        match self
            .resolver
            .resolve_prefix_to_router_id(prefix)
            .and_then(|rid| self.resolver.resolve_router_to_name(rid))
        {
            Some(router) => format!("{prefix} (via {router})"),
            None => prefix.to_string(),
        }
    }
}

fn routers_only(topology: &Topology, path: &[NodeId]) -> Vec<NodeId> {
    path.iter().copied().filter(|n| topology.is_router(*n)).collect()
}

/// Links of `path`, and the other active exits of its nodes
fn steer(dag: &ForwardingDag, path: &[NodeId]) -> (BTreeSet<LinkKey>, BTreeSet<LinkKey>) {
    let path_links: BTreeSet<LinkKey> = path.windows(2).map(|hop| (hop[0], hop[1])).collect();
    let off = path
        .iter()
        .flat_map(|node| dag.active_edges(*node))
        .filter(|link| !path_links.contains(link))
        .collect();
    (path_links, off)
}

/// Links to flip so that `path` becomes the only way out of its nodes.
///
/// Full links elsewhere in the DAG are switched off as well, except those
/// still crossed by flows to the same prefix (pinned) and those that are the
/// last exit of a node that keeps receiving traffic.
fn plan_mutation(
    topology: &Topology,
    dag: &ForwardingDag,
    path: &[NodeId],
    size: u64,
    carrying: &HashSet<NodeId>,
) -> MutationPlan {
    let (path_links, mut off) = steer(dag, path);

    let mut pinned = Vec::new();
    for link in topology.full_links(size) {
        let Some(state) = dag.link_state(link.0, link.1) else {
            continue;
        };
        if !state.active || path_links.contains(&link) || off.contains(&link) {
            continue;
        }
        if state.ongoing_flows {
            pinned.push(link);
            continue;
        }

        let tail = link.0;
        let other_exit = dag
            .active_edges(tail)
            .iter()
            .any(|l| *l != link && !off.contains(l));
        let fed = carrying.contains(&tail)
            || path_links.iter().any(|(_, v)| *v == tail)
            || dag.active_in_edges(tail).iter().any(|l| !off.contains(l));
        if other_exit || !fed {
            off.insert(link);
        } else {
            debug!(
                link = %format!("{}->{}", topology.name(link.0), topology.name(link.1)),
                "Full link kept, last exit of a node still receiving traffic"
            );
        }
    }

    let toggles = off
        .into_iter()
        .map(LinkToggle::deactivate)
        .chain(path_links.into_iter().map(LinkToggle::activate))
        .collect();
    MutationPlan { toggles, pinned }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::southbound::{ForwardingGraph, SouthboundError};
    use crate::topology::TopologyBuilder;
    use async_trait::async_trait;
    use std::net::Ipv4Addr;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingSouthbound {
        installs: AtomicUsize,
        refreshes: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl SouthboundAdapter for CountingSouthbound {
        async fn remove_lies_for_prefix(&self, _prefix: IpNetwork) -> std::result::Result<(), SouthboundError> {
            Ok(())
        }

        async fn install_forwarding_graph(&self, prefix: IpNetwork, _graph: ForwardingGraph) -> std::result::Result<(), SouthboundError> {
            if self.fail {
                return Err(SouthboundError::Rejected {
                    prefix,
                    reason: "test".into(),
                });
            }
            self.installs.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn refresh(&self) -> std::result::Result<(), SouthboundError> {
            self.refreshes.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn s1() -> IpNetwork {
        "10.0.1.0/24".parse().unwrap()
    }

    fn d1() -> IpNetwork {
        "10.0.2.0/24".parse().unwrap()
    }

    /// s1 at r1, d1 at r2; r1-r2 direct (cost 1) or through r3 (cost 2)
    fn topology() -> Topology {
        let mut b = TopologyBuilder::new();
        b.add_router("r1", Ipv4Addr::new(1, 1, 1, 1)).unwrap();
        b.add_router("r2", Ipv4Addr::new(2, 2, 2, 2)).unwrap();
        b.add_router("r3", Ipv4Addr::new(3, 3, 3, 3)).unwrap();
        b.add_link("r1", "r2", 10, 1).unwrap();
        b.add_link("r1", "r3", 10, 1).unwrap();
        b.add_link("r3", "r2", 10, 1).unwrap();
        b.attach_prefix(s1(), "r1", 1).unwrap();
        b.attach_prefix(d1(), "r2", 1).unwrap();
        b.build()
    }

    fn node(t: &Topology, name: &str) -> NodeId {
        t.node_by_name(name).unwrap()
    }

    fn engine(southbound: Arc<CountingSouthbound>) -> AllocationEngine {
        AllocationEngine::new(topology(), southbound)
    }

    #[test]
    fn test_state_transitions() {
        use AllocationState::*;
        assert!(Evaluating.can_advance_to(Admitted));
        assert!(Evaluating.can_advance_to(Reallocating));
        assert!(Reallocating.can_advance_to(Committed));
        assert!(!Evaluating.can_advance_to(Committed));
        assert!(!Committed.can_advance_to(Evaluating));
    }

    #[tokio::test]
    async fn test_admitted_flow() {
        let sb = Arc::new(CountingSouthbound::default());
        let engine = engine(sb.clone());

        let decision = engine.on_new_flow(FlowSpec::new(s1(), d1(), 4)).await.unwrap();
        assert_eq!(decision.outcome, AllocationOutcome::Admitted);
        assert_eq!(
            decision.states,
            vec![AllocationState::Evaluating, AllocationState::Admitted, AllocationState::Committed]
        );
        assert_eq!(decision.path.len(), 2);
        assert_eq!(sb.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_ended_flow_releases_capacity() {
        let engine = engine(Arc::new(CountingSouthbound::default()));
        let decision = engine.on_new_flow(FlowSpec::new(s1(), d1(), 4)).await.unwrap();

        let released = engine.on_flow_ended(decision.flow).await.unwrap();
        assert!(released.is_some());
        assert!(engine.utilization().await.iter().all(|l| l.reserved == 0));
        assert!(engine.on_flow_ended(decision.flow).await.unwrap().is_none());
        assert_eq!(engine.stats().snapshot().flows_released, 1);
    }

    #[tokio::test]
    async fn test_reevaluation_replaces_allocation() {
        let sb = Arc::new(CountingSouthbound::default());
        let engine = engine(sb.clone());

        let big = engine.on_new_flow(FlowSpec::new(s1(), d1(), 8)).await.unwrap();
        let moved = engine.on_new_flow(FlowSpec::new(s1(), d1(), 5)).await.unwrap();
        assert_eq!(moved.outcome, AllocationOutcome::Rerouted);
        assert_eq!(moved.path.len(), 3);

        engine.on_flow_ended(big.flow).await.unwrap();
        let again = engine
            .handle(FlowEvent::Reevaluate(moved.flow))
            .await
            .unwrap()
            .unwrap();
        // the DAG now only offers the detour, which still fits
        assert_eq!(again.outcome, AllocationOutcome::Admitted);
        assert_eq!(again.path, moved.path);

        let reserved: u64 = engine.utilization().await.iter().map(|l| l.reserved).sum();
        assert_eq!(reserved, 10);
        assert_eq!(engine.allocations_for(d1()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_prefix() {
        let engine = engine(Arc::new(CountingSouthbound::default()));
        let err = engine
            .on_new_flow(FlowSpec::new(s1(), "192.168.0.0/24".parse().unwrap(), 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TeError::UnknownPrefix(_)));

        let err = engine.on_new_flow(FlowSpec::new(s1(), s1(), 1)).await.unwrap_err();
        assert!(matches!(err, TeError::Unroutable { .. }));
    }

    #[tokio::test]
    async fn test_southbound_failure_propagates() {
        let sb = Arc::new(CountingSouthbound {
            fail: true,
            ..Default::default()
        });
        let engine = engine(sb);

        engine.on_new_flow(FlowSpec::new(s1(), d1(), 8)).await.unwrap();
        let before = engine.forwarding_dag(d1()).await.unwrap().links();

        let err = engine.on_new_flow(FlowSpec::new(s1(), d1(), 5)).await.unwrap_err();
        assert!(matches!(err, TeError::Southbound(_)));
        assert_eq!(engine.forwarding_dag(d1()).await.unwrap().links(), before);
        assert_eq!(engine.allocations_for(d1()).await.len(), 1);
    }

    #[tokio::test]
    async fn test_rejected_mutation_keeps_dag_and_southbound() {
        // r4 hangs off r2 and carries a flow to d1 without any active exit
        let mut b = TopologyBuilder::new();
        for (i, name) in ["r1", "r2", "r3", "r4"].iter().enumerate() {
            b.add_router(name, Ipv4Addr::new(i as u8 + 1, 0, 0, 1)).unwrap();
        }
        b.add_link("r1", "r2", 10, 1).unwrap();
        b.add_link("r1", "r3", 10, 1).unwrap();
        b.add_link("r3", "r2", 10, 1).unwrap();
        b.add_link("r4", "r2", 10, 1).unwrap();
        b.attach_prefix(s1(), "r1", 1).unwrap();
        b.attach_prefix(d1(), "r2", 1).unwrap();
        let t = b.build();
        let (r1, r2, r4) = (node(&t, "r1"), node(&t, "r2"), node(&t, "r4"));

        let sb = Arc::new(CountingSouthbound::default());
        let engine = AllocationEngine::new(t, sb.clone());
        {
            let mut state = engine.state.lock().await;
            let EngineState {
                topology,
                dags,
                registry,
            } = &mut *state;
            dags.get(topology, d1())
                .unwrap()
                .set_links_active(&[LinkToggle::deactivate((r4, r2))], &HashSet::new())
                .unwrap();
            registry
                .record(topology, dags, FlowSpec::new(s1(), d1(), 1), &[vec![r4, r2]], Commitment::Fallback)
                .unwrap();
        }

        engine.on_new_flow(FlowSpec::new(s1(), d1(), 8)).await.unwrap();
        let before = engine.forwarding_dag(d1()).await.unwrap().links();

        let decision = engine.on_new_flow(FlowSpec::new(s1(), d1(), 5)).await.unwrap();
        assert_eq!(decision.outcome, AllocationOutcome::Fallback(FallbackReason::InvalidDagMutation));
        assert_eq!(decision.path, vec![r1, r2]);
        assert_eq!(decision.oversubscribed, vec![(r1, r2)]);
        assert_eq!(engine.forwarding_dag(d1()).await.unwrap().links(), before);
        assert_eq!(sb.installs.load(Ordering::SeqCst), 0);
        assert_eq!(sb.refreshes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_fallback_without_active_path_opens_ingress() {
        let sb = Arc::new(CountingSouthbound::default());
        let engine = engine(sb.clone());
        let (r1, r2) = (engine.node_id("r1").await.unwrap(), engine.node_id("r2").await.unwrap());
        {
            let mut state = engine.state.lock().await;
            let EngineState { topology, dags, .. } = &mut *state;
            dags.get(topology, d1())
                .unwrap()
                .set_links_active(&[LinkToggle::deactivate((r1, r2))], &HashSet::new())
                .unwrap();
        }

        // larger than any link, so no congestion-free path exists
        let decision = engine.on_new_flow(FlowSpec::new(s1(), d1(), 11)).await.unwrap();
        assert_eq!(decision.outcome, AllocationOutcome::Fallback(FallbackReason::NoPathFound));
        assert_eq!(decision.active_paths, 0);
        assert_eq!(decision.path, vec![r1, r2]);
        assert_eq!(
            engine.forwarding_dag(d1()).await.unwrap().active_paths(r1),
            vec![vec![r1, r2]]
        );
        assert_eq!(sb.refreshes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_shutdown_reports_counters() {
        let engine = engine(Arc::new(CountingSouthbound::default()));
        engine.on_new_flow(FlowSpec::new(s1(), d1(), 1)).await.unwrap();
        assert_eq!(engine.shutdown().flows_admitted, 1);
    }
}
