//! Top-level context, plus the leader-election gate.
//!
//! Bundles every subsystem behind one handle passed to both binaries and
//! every spawned task, rather than reaching for ambient globals. This is
//! the concrete form of the design note: "Global state... encapsulate in
//! an explicit top-level context."

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::config::TopologySchedulerConfig;
use crate::controller::ControllerAdapter;
use crate::metrics::MetricsCollector;
use crate::monitor::DomainMonitor;
use crate::node::NodeCache;
use crate::placement::{PlacementEngine, StrategyBounds};
use crate::recovery::RecoveryEngine;
use crate::scorer::{Scorer, ScoringWeights};
use crate::topology::TopologyCache;

/// Whether this process currently holds the leader-election lease. The
/// lease itself is implemented by the external collaborator; this gate is
/// what the core's background loops check before doing leader-only work.
#[derive(Default)]
pub struct LeaderState {
    is_leader: AtomicBool,
}

impl LeaderState {
    pub fn new(is_leader: bool) -> Self {
        Self {
            is_leader: AtomicBool::new(is_leader),
        }
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Acquire)
    }

    /// Transition to leader. Callers should follow this with a full
    /// reconcile to rebuild caches from scratch, per the design note.
    pub fn become_leader(&self) {
        self.is_leader.store(true, Ordering::Release);
    }

    /// Transition away from leadership; background loops must stop
    /// applying mutations after observing this.
    pub fn step_down(&self) {
        self.is_leader.store(false, Ordering::Release);
    }
}

/// Owns `Arc`s to every subsystem and is itself wrapped in an `Arc` and
/// shared across every spawned task in both binaries.
pub struct SchedulerContext {
    pub config: TopologySchedulerConfig,
    pub node_cache: Arc<NodeCache>,
    pub topology_cache: Arc<TopologyCache>,
    pub metrics: Arc<MetricsCollector>,
    pub scorer: Arc<Scorer>,
    pub placement_engine: Arc<PlacementEngine>,
    pub recovery_engine: Arc<RecoveryEngine>,
    pub controller_adapter: Arc<ControllerAdapter>,
    pub domain_monitor: Arc<DomainMonitor>,
    pub leader_state: Arc<LeaderState>,
}

impl SchedulerContext {
    /// Build every subsystem from a single configuration, wiring each in
    /// dependency order: node cache, topology cache, metrics, scorer,
    /// placement engine, recovery engine, controller adapter, domain
    /// monitor.
    pub fn new(config: TopologySchedulerConfig) -> crate::error::Result<Self> {
        let node_cache = Arc::new(NodeCache::new());
        let topology_cache = Arc::new(TopologyCache::new());
        let metrics = Arc::new(MetricsCollector::new()?);

        let weights: ScoringWeights = config.weights.into();
        let scorer = Arc::new(Scorer::with_weights(node_cache.clone(), topology_cache.clone(), weights));

        let bounds: StrategyBounds = config.strategy_bounds.into();
        let placement_engine = Arc::new(PlacementEngine::new(
            node_cache.clone(),
            topology_cache.clone(),
            scorer.clone(),
            metrics.clone(),
            bounds,
        ));

        let recovery_engine = Arc::new(RecoveryEngine::new(
            node_cache.clone(),
            topology_cache.clone(),
            placement_engine.clone(),
            config.recovery_coalesce(),
        ));

        let controller_adapter = Arc::new(ControllerAdapter::new(
            node_cache.clone(),
            topology_cache.clone(),
            scorer.clone(),
            placement_engine.clone(),
            bounds,
            config.gpus_per_node,
        ));

        let domain_monitor = Arc::new(DomainMonitor::new(node_cache.clone(), topology_cache.clone(), metrics.clone()));

        Ok(Self {
            config,
            node_cache,
            topology_cache,
            metrics,
            scorer,
            placement_engine,
            recovery_engine,
            controller_adapter,
            domain_monitor,
            leader_state: Arc::new(LeaderState::new(true)),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn context_builds_with_default_config() {
        let ctx = SchedulerContext::new(TopologySchedulerConfig::default()).unwrap();
        assert!(ctx.leader_state.is_leader());
        assert!(ctx.node_cache.list_nodes().is_empty());
    }

    #[test]
    fn leader_state_transitions() {
        let state = LeaderState::new(false);
        assert!(!state.is_leader());
        state.become_leader();
        assert!(state.is_leader());
        state.step_down();
        assert!(!state.is_leader());
    }
}
