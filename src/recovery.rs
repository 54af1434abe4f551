//! Recovery engine.
//!
//! On node loss, replays placement for every GPU workload that was
//! running on the failed node, GPU-bearing ones first, falling back from
//! the original domain to its spine-adjacent neighbours to an
//! unrestricted cluster-wide placement. Non-GPU workloads are handed to
//! an external scheduler; only the fact of rescheduling is recorded here,
//! with no "find any node" search attempted on their behalf.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::Result;
use crate::node::NodeCache;
use crate::placement::PlacementEngine;
use crate::topology::TopologyCache;
use crate::workload::{priority_sort_key, GpuRequirement, WorkloadSpec};

/// Default window within which duplicate node-delete events for the same
/// node are coalesced into a single recovery run.
pub const DEFAULT_COALESCE_WINDOW: Duration = Duration::from_secs(30);

/// Outcome of recovering one workload.
#[derive(Debug, Clone)]
pub enum RecoveryOutcome {
    /// Re-placed successfully; names the strategy tier that succeeded.
    Recovered { workload: String, tier: &'static str },
    /// Exhausted every fallback.
    Unrecoverable { workload: String, reason: String },
    /// A non-GPU workload, dispatched to the external scheduler.
    DelegatedNonGpu { workload: String },
}

/// A workload observed running on a node at the moment it failed.
#[derive(Debug, Clone)]
pub struct DisplacedWorkload {
    pub spec: WorkloadSpec,
    pub gpu_requirement: Option<GpuRequirement>,
}

/// Recovers workloads displaced by node loss, preserving topology
/// locality where possible. Recovery is process-wide serialized by a
/// single lock, and is at-most-once per node name within the coalesce
/// window.
pub struct RecoveryEngine {
    node_cache: Arc<NodeCache>,
    topology_cache: Arc<TopologyCache>,
    placement_engine: Arc<PlacementEngine>,
    recovery_lock: Mutex<()>,
    coalesce_window: Duration,
    recent: Mutex<HashMap<String, Instant>>,
}

impl RecoveryEngine {
    pub fn new(
        node_cache: Arc<NodeCache>,
        topology_cache: Arc<TopologyCache>,
        placement_engine: Arc<PlacementEngine>,
        coalesce_window: Duration,
    ) -> Self {
        Self {
            node_cache,
            topology_cache,
            placement_engine,
            recovery_lock: Mutex::new(()),
            coalesce_window,
            recent: Mutex::new(HashMap::new()),
        }
    }

    /// Returns `true` if this node-delete event falls within the coalesce
    /// window of a previously-handled delete for the same node, meaning
    /// the caller should treat it as a duplicate and skip recovery.
    fn is_duplicate(&self, node_name: &str, now: Instant) -> bool {
        let mut recent = self.recent.lock();
        if let Some(&last) = recent.get(node_name) {
            if now.duration_since(last) < self.coalesce_window {
                return true;
            }
        }
        recent.insert(node_name.to_string(), now);
        false
    }

    /// Handle a node-delete event carrying the workloads that were
    /// running on it. Duplicate delete events for the same node within
    /// the coalesce window are coalesced into a no-op.
    pub fn handle_node_failure(
        &self,
        node_name: &str,
        workloads: Vec<DisplacedWorkload>,
    ) -> Result<Vec<RecoveryOutcome>> {
        let now = Instant::now();
        if self.is_duplicate(node_name, now) {
            info!(node = node_name, "duplicate node-delete coalesced, skipping recovery");
            return Ok(Vec::new());
        }

        let _guard = self.recovery_lock.lock();

        let original_domain = self.topology_cache.get_domain_for_node(node_name);

        let (mut gpu, mut non_gpu): (Vec<DisplacedWorkload>, Vec<DisplacedWorkload>) =
            (Vec::new(), Vec::new());
        for w in workloads {
            if w.gpu_requirement.is_some() {
                gpu.push(w);
            } else {
                non_gpu.push(w);
            }
        }

        gpu.sort_by_key(|w| priority_sort_key(w.gpu_requirement.as_ref().unwrap()));
        non_gpu.sort_by(|a, b| b.spec.priority.unwrap_or(i32::MIN).cmp(&a.spec.priority.unwrap_or(i32::MIN)));

        let mut outcomes = Vec::new();
        for workload in &gpu {
            let req = workload.gpu_requirement.as_ref().unwrap();
            outcomes.push(self.recover_gpu_workload(&workload.spec.name, req, node_name, original_domain.as_deref()));
        }

        for workload in &non_gpu {
            info!(workload = %workload.spec.name, "non-GPU workload delegated to external scheduler");
            outcomes.push(RecoveryOutcome::DelegatedNonGpu {
                workload: workload.spec.name.clone(),
            });
        }

        // Release caches' knowledge of the failed node. The recovery lock
        // is held throughout this call but never together with the
        // placement engine's commit lock: each `recover_gpu_workload` call
        // above invokes `PlacementEngine::place`, which acquires and
        // releases its own mutex independently.
        self.topology_cache.detach_node(node_name)?;
        let _ = self.node_cache.remove_node(node_name);

        Ok(outcomes)
    }

    fn recover_gpu_workload(
        &self,
        workload_name: &str,
        req: &GpuRequirement,
        failed_node: &str,
        original_domain: Option<&str>,
    ) -> RecoveryOutcome {
        let excluded = vec![failed_node.to_string()];

        if let Some(domain) = original_domain {
            if let Ok(result) = self.place_restricted_to(&[domain.to_string()], req, &excluded) {
                info!(workload = workload_name, domain, strategy = result.strategy.as_str(), "recovered in original domain");
                return RecoveryOutcome::Recovered { workload: workload_name.to_string(), tier: "same_domain" };
            }

            let adjacent = self.topology_cache.get_adjacent_domains(domain);
            if !adjacent.is_empty() {
                if let Ok(result) = self.place_restricted_to(&adjacent, req, &excluded) {
                    info!(workload = workload_name, strategy = result.strategy.as_str(), "recovered in adjacent domain");
                    return RecoveryOutcome::Recovered { workload: workload_name.to_string(), tier: "adjacent_domain" };
                }
            }
        }

        match self.placement_engine.place(req, &excluded) {
            Ok(result) => {
                info!(workload = workload_name, strategy = result.strategy.as_str(), "recovered cluster-wide");
                RecoveryOutcome::Recovered { workload: workload_name.to_string(), tier: "cluster_wide" }
            }
            Err(e) => {
                warn!(workload = workload_name, error = %e, "recovery exhausted all fallbacks");
                RecoveryOutcome::Unrecoverable {
                    workload: workload_name.to_string(),
                    reason: e.to_string(),
                }
            }
        }
    }

    /// Place a requirement restricted to the given domain set by
    /// excluding every node outside it, plus the caller-supplied exclusions.
    fn place_restricted_to(
        &self,
        allowed_domains: &[String],
        req: &GpuRequirement,
        base_excluded: &[String],
    ) -> Result<crate::placement::PlacementResult> {
        let mut excluded = base_excluded.to_vec();
        for domain in self.topology_cache.get_all_domains() {
            if allowed_domains.contains(&domain.name) {
                continue;
            }
            excluded.extend(domain.members.iter().cloned());
        }
        self.placement_engine.place(req, &excluded)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::MetricsCollector;
    use crate::node::NodeDescriptor;
    use crate::placement::StrategyBounds;
    use crate::scorer::Scorer;
    use crate::topology::{Domain, DomainKind};

    fn metrics() -> Arc<MetricsCollector> {
        Arc::new(MetricsCollector::new().unwrap())
    }

    fn node(name: &str, total_gpus: u32) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            total_gpus,
            model: "A100".to_string(),
            gpu_memory: vec![80 * 1024; total_gpus as usize],
            network_bandwidth_gbps: 200,
            healthy: true,
        }
    }

    fn workload(name: &str, gpus: u32, priority: i32) -> DisplacedWorkload {
        DisplacedWorkload {
            spec: WorkloadSpec {
                name: name.to_string(),
                containers: vec![],
                priority: Some(priority),
                locality_hint: None,
            },
            gpu_requirement: Some(GpuRequirement {
                total_gpus: gpus,
                nodes_needed: (gpus + 3) / 4,
                priority: Some(priority),
                locality_hint: None,
            }),
        }
    }

    fn setup_scenario_5() -> (Arc<NodeCache>, Arc<TopologyCache>, Arc<PlacementEngine>) {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(node("a", 4)).unwrap();
        nc.add_node(node("b", 4)).unwrap();
        nc.add_node(node("x", 4)).unwrap();
        nc.add_node(node("y", 4)).unwrap();
        nc.set_allocation("a", 4).unwrap();

        tc.add_domain(Domain::new("L1", DomainKind::Leaf)).unwrap();
        tc.add_domain(Domain::new("L3", DomainKind::Leaf)).unwrap();
        tc.attach_node("L1", "a").unwrap();
        tc.attach_node("L1", "b").unwrap();
        tc.attach_node("L3", "x").unwrap();
        tc.attach_node("L3", "y").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let scorer = Arc::new(Scorer::new(nc.clone(), tc.clone()));
        let placement = Arc::new(PlacementEngine::new(nc.clone(), tc.clone(), scorer, metrics(), StrategyBounds::default()));
        (nc, tc, placement)
    }

    #[test]
    fn scenario_5_recovers_via_adjacent_or_cluster_wide_fallback() {
        let (nc, tc, placement) = setup_scenario_5();
        let recovery = RecoveryEngine::new(nc, tc.clone(), placement.clone(), DEFAULT_COALESCE_WINDOW);

        let outcomes = recovery
            .handle_node_failure("a", vec![workload("p1", 4, 500)])
            .unwrap();
        assert_eq!(outcomes.len(), 1);
        assert!(matches!(outcomes[0], RecoveryOutcome::Recovered { .. }));
    }

    #[test]
    fn scenario_6_priority_ordered_recovery_leaves_lower_priority_unrecoverable() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(node("a", 4)).unwrap();
        nc.add_node(node("b", 4)).unwrap();
        tc.add_domain(Domain::new("L1", DomainKind::Leaf)).unwrap();
        tc.attach_node("L1", "a").unwrap();
        tc.attach_node("L1", "b").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let scorer = Arc::new(Scorer::new(nc.clone(), tc.clone()));
        let placement = Arc::new(PlacementEngine::new(nc.clone(), tc.clone(), scorer, metrics(), StrategyBounds::default()));
        let recovery = RecoveryEngine::new(nc.clone(), tc.clone(), placement, DEFAULT_COALESCE_WINDOW);

        // node "a" failed; only "b" (4 free GPUs) remains for two 4-GPU
        // workloads competing by priority.
        let outcomes = recovery
            .handle_node_failure("a", vec![workload("p2", 4, 10), workload("p1", 4, 1000)])
            .unwrap();

        assert_eq!(outcomes.len(), 2);
        assert!(matches!(outcomes[0], RecoveryOutcome::Recovered { .. }));
        assert!(matches!(outcomes[1], RecoveryOutcome::Unrecoverable { .. }));
    }

    #[test]
    fn duplicate_delete_within_window_is_coalesced() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(node("a", 4)).unwrap();
        tc.add_domain(Domain::new("L1", DomainKind::Leaf)).unwrap();
        tc.attach_node("L1", "a").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let scorer = Arc::new(Scorer::new(nc.clone(), tc.clone()));
        let placement = Arc::new(PlacementEngine::new(nc.clone(), tc.clone(), scorer, metrics(), StrategyBounds::default()));
        let recovery = RecoveryEngine::new(nc.clone(), tc.clone(), placement, Duration::from_secs(30));

        let first = recovery.handle_node_failure("a", vec![]).unwrap();
        assert_eq!(first.len(), 0);
        let second = recovery.handle_node_failure("a", vec![workload("p1", 1, 1)]).unwrap();
        assert_eq!(second.len(), 0, "second delete within the window must be a no-op");
    }
}
