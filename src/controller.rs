//! Controller adapter.
//!
//! Two responsibilities: (1) a `Filter`/`Score` façade consumed at high
//! frequency by the orchestrator's extension points, reading only the
//! topology cache and never mutating it; (2) translation of external
//! watch events into node-cache/topology-cache mutations, including a
//! periodic full-reconcile path for resync.

use std::collections::HashSet;
use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::config::DomainConfigResource;
use crate::error::{Error, Result};
use crate::node::{NodeCache, NodeDescriptor};
use crate::placement::{PlacementEngine, Strategy, StrategyBounds};
use crate::scorer::Scorer;
use crate::topology::{Domain, DomainKind, TopologyCache};
use crate::workload::{GpuRequirement, WorkloadSpec};

/// Reason a `Filter` call rejected a node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RejectReason {
    NotAGpuWorkload,
    NodeUnknown,
    DomainUnknown,
    InsufficientDomainCapacity,
}

/// Result of `Filter`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterDecision {
    Pass,
    Reject(RejectReason),
}

/// The façade exposed to the orchestrator's filter/score extension
/// points. Implementors must perform lock-free reads only — no mutation
/// of the caches is permitted from these calls.
pub trait FilterScore {
    fn filter(&self, workload: &WorkloadSpec, node_name: &str) -> FilterDecision;
    fn score(&self, workload: &WorkloadSpec, node_name: &str) -> u32;
}

/// A translated external watch event, consumed from a bounded channel per
/// stream. The actual orchestrator watch client is out of scope; this
/// enum and the adapter's handling of it are the core's side of that
/// boundary.
#[derive(Debug, Clone)]
pub enum WatchEvent {
    NodeAdded(NodeDescriptor),
    NodeUpdated(NodeDescriptor),
    NodeDeleted(String),
    DomainAdded(DomainConfigResource),
    DomainUpdated(DomainConfigResource),
    DomainDeleted(String),
    /// Synthetic full-state event emitted by a periodic resync.
    Resync {
        nodes: Vec<NodeDescriptor>,
        domains: Vec<DomainConfigResource>,
    },
}

/// Translates watch events into cache mutations and exposes the
/// filter/score façade. Owns no lock beyond what `NodeCache`/
/// `TopologyCache` already provide internally.
pub struct ControllerAdapter {
    node_cache: Arc<NodeCache>,
    topology_cache: Arc<TopologyCache>,
    scorer: Arc<Scorer>,
    placement_engine: Arc<PlacementEngine>,
    bounds: StrategyBounds,
    gpus_per_node: u32,
}

impl ControllerAdapter {
    pub fn new(
        node_cache: Arc<NodeCache>,
        topology_cache: Arc<TopologyCache>,
        scorer: Arc<Scorer>,
        placement_engine: Arc<PlacementEngine>,
        bounds: StrategyBounds,
        gpus_per_node: u32,
    ) -> Self {
        Self {
            node_cache,
            topology_cache,
            scorer,
            placement_engine,
            bounds,
            gpus_per_node,
        }
    }

    /// Apply one watch event to the caches. Cache-level errors
    /// (`NotFound`/`AlreadyExists`) are logged and the event is skipped,
    /// per the propagation policy.
    pub fn apply_event(&self, event: WatchEvent) {
        match event {
            WatchEvent::NodeAdded(descriptor) => {
                let name = descriptor.name.clone();
                if let Err(e) = self.node_cache.add_node(descriptor) {
                    warn!(node = %name, error = %e, "skipping NodeAdded event");
                } else {
                    debug!(node = %name, "node added");
                }
            }
            WatchEvent::NodeUpdated(descriptor) => {
                let name = descriptor.name.clone();
                if let Err(e) = self.node_cache.update_node(descriptor) {
                    warn!(node = %name, error = %e, "skipping NodeUpdated event");
                } else {
                    debug!(node = %name, "node updated");
                    if let Some(domain) = self.topology_cache.get_domain_for_node(&name) {
                        self.topology_cache.sync_domain_gpus(&domain, &self.node_cache);
                    }
                }
            }
            WatchEvent::NodeDeleted(name) => {
                let domain = self.topology_cache.get_domain_for_node(&name);
                if let Err(e) = self.topology_cache.detach_node(&name) {
                    warn!(node = %name, error = %e, "failed to detach node on delete");
                }
                if let Err(e) = self.node_cache.remove_node(&name) {
                    warn!(node = %name, error = %e, "skipping NodeDeleted event");
                } else if let Some(domain) = domain {
                    self.topology_cache.sync_domain_gpus(&domain, &self.node_cache);
                    info!(node = %name, domain, "node removed");
                }
            }
            WatchEvent::DomainAdded(config) => self.apply_domain_config(config, false),
            WatchEvent::DomainUpdated(config) => self.apply_domain_config(config, true),
            WatchEvent::DomainDeleted(name) => {
                if let Some(domain) = self.topology_cache.get_domain(&name) {
                    for node_name in domain.members.clone() {
                        let _ = self.topology_cache.detach_node(&node_name);
                    }
                }
                if let Err(e) = self.topology_cache.remove_domain(&name) {
                    warn!(domain = %name, error = %e, "skipping DomainDeleted event");
                } else {
                    info!(domain = %name, "domain removed");
                }
            }
            WatchEvent::Resync { nodes, domains } => self.reconcile(nodes, domains),
        }
    }

    fn apply_domain_config(&self, config: DomainConfigResource, is_update: bool) {
        let kind = config.kind;
        let name = config.name.clone();

        if !is_update {
            let mut domain = Domain::new(name.clone(), kind);
            domain.parent = config.parent.clone();
            domain.bandwidth_gbps = config.bandwidth_gbps;
            domain.latency_us = config.latency_us;
            if let Err(e) = self.topology_cache.add_domain(domain) {
                warn!(domain = %name, error = %e, "skipping DomainAdded event");
                return;
            }
        } else {
            let existing = match self.topology_cache.get_domain(&name) {
                Some(d) => d,
                None => {
                    warn!(domain = %name, "skipping DomainUpdated event for unknown domain");
                    return;
                }
            };
            let mut updated = existing;
            updated.kind = kind;
            updated.parent = config.parent.clone();
            updated.bandwidth_gbps = config.bandwidth_gbps;
            updated.latency_us = config.latency_us;
            if let Err(e) = self.topology_cache.update_domain(updated) {
                warn!(domain = %name, error = %e, "skipping DomainUpdated event");
                return;
            }
        }

        for member in &config.member_nodes {
            if let Err(e) = self.topology_cache.attach_node(&name, member) {
                debug!(node = %member, domain = %name, error = %e, "attach skipped");
            }
        }
        for adjacent in &config.adjacent_domains {
            if let Err(e) = self.topology_cache.set_spine_adjacency(&name, adjacent) {
                debug!(a = %name, b = %adjacent, error = %e, "adjacency skipped");
            }
        }
        self.topology_cache.sync_domain_gpus(&name, &self.node_cache);
    }

    /// Diff the external listing against the local cache and apply the
    /// delta. Run on a fixed interval (default 30s) to recover from any
    /// dropped or overflowed watch events.
    pub fn reconcile(&self, nodes: Vec<NodeDescriptor>, domains: Vec<DomainConfigResource>) {
        let known_nodes: HashSet<String> = self.node_cache.list_nodes().iter().map(|n| n.name.clone()).collect();
        let incoming_nodes: HashSet<String> = nodes.iter().map(|n| n.name.clone()).collect();

        for node in nodes {
            if known_nodes.contains(&node.name) {
                let _ = self.node_cache.update_node(node);
            } else {
                let _ = self.node_cache.add_node(node);
            }
        }
        for stale in known_nodes.difference(&incoming_nodes) {
            let _ = self.topology_cache.detach_node(stale);
            let _ = self.node_cache.remove_node(stale);
        }

        let known_domains: HashSet<String> = self.topology_cache.get_all_domains().iter().map(|d| d.name.clone()).collect();
        let incoming_domains: HashSet<String> = domains.iter().map(|d| d.name.clone()).collect();

        for config in domains {
            let is_update = known_domains.contains(&config.name);
            self.apply_domain_config(config, is_update);
        }
        for stale in known_domains.difference(&incoming_domains) {
            if let Some(domain) = self.topology_cache.get_domain(stale) {
                for node_name in domain.members.clone() {
                    let _ = self.topology_cache.detach_node(&node_name);
                }
            }
            let _ = self.topology_cache.remove_domain(stale);
        }

        self.topology_cache.sync_all_domain_gpus(&self.node_cache);
        info!(nodes = incoming_nodes.len(), domains = incoming_domains.len(), "full reconcile applied");
    }

    fn requirement_for(&self, workload: &WorkloadSpec) -> Option<GpuRequirement> {
        GpuRequirement::from_workload(workload, self.gpus_per_node)
    }

    /// Entry point for a workload placement request arriving through this
    /// adapter (spec §2's "workload placement requests arrive at F through
    /// H"), as opposed to the per-node `filter`/`score` façade below.
    /// Derives the requirement, then places it against the default 5s
    /// deadline.
    pub fn schedule_workload(&self, workload: &WorkloadSpec) -> Result<crate::placement::PlacementResult> {
        let req = self
            .requirement_for(workload)
            .ok_or_else(|| Error::InvalidArgument(format!("{} is not a GPU workload", workload.name)))?;
        self.placement_engine
            .place_with_deadline(&req, &[], crate::placement::DEFAULT_PLACEMENT_DEADLINE)
    }
}

impl FilterScore for ControllerAdapter {
    fn filter(&self, workload: &WorkloadSpec, node_name: &str) -> FilterDecision {
        let Some(req) = self.requirement_for(workload) else {
            return FilterDecision::Reject(RejectReason::NotAGpuWorkload);
        };
        if self.node_cache.get_node(node_name).is_none() {
            return FilterDecision::Reject(RejectReason::NodeUnknown);
        }
        let Some(domain_name) = self.topology_cache.get_domain_for_node(node_name) else {
            return FilterDecision::Reject(RejectReason::DomainUnknown);
        };
        let Some(domain) = self.topology_cache.get_domain(&domain_name) else {
            return FilterDecision::Reject(RejectReason::DomainUnknown);
        };

        let strategy = Strategy::select(req.nodes_needed, &self.bounds);
        let domain_free: u32 = domain
            .members
            .iter()
            .filter_map(|n| self.node_cache.free_gpus(n))
            .sum();

        let satisfiable = match strategy {
            Strategy::SingleDomain | Strategy::CompleteDomain => domain_free >= req.total_gpus,
            Strategy::AdjacentDomains => {
                let adjacent_free: u32 = self
                    .topology_cache
                    .get_adjacent_domains(&domain_name)
                    .iter()
                    .filter_map(|d| self.topology_cache.get_domain(d))
                    .flat_map(|d| d.members)
                    .filter_map(|n| self.node_cache.free_gpus(&n))
                    .sum();
                domain_free > 0 && domain_free + adjacent_free >= req.total_gpus
            }
            Strategy::MultipleDomains => {
                let cluster_free: u32 = self
                    .topology_cache
                    .get_all_domains()
                    .iter()
                    .flat_map(|d| d.members.clone())
                    .filter_map(|n| self.node_cache.free_gpus(&n))
                    .sum();
                cluster_free >= req.total_gpus
            }
        };

        if satisfiable {
            FilterDecision::Pass
        } else {
            FilterDecision::Reject(RejectReason::InsufficientDomainCapacity)
        }
    }

    fn score(&self, workload: &WorkloadSpec, node_name: &str) -> u32 {
        let Some(req) = self.requirement_for(workload) else {
            return 0;
        };
        let Some(domain_name) = self.topology_cache.get_domain_for_node(node_name) else {
            return 0;
        };
        (self.scorer.score(&domain_name, &req, &[]) * 100.0).round().clamp(0.0, 100.0) as u32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn descriptor(name: &str, total_gpus: u32) -> NodeDescriptor {
        NodeDescriptor {
            name: name.to_string(),
            total_gpus,
            model: "A100".to_string(),
            gpu_memory: vec![80 * 1024; total_gpus as usize],
            network_bandwidth_gbps: 200,
            healthy: true,
        }
    }

    fn gpu_workload(gpus: u64) -> WorkloadSpec {
        let mut limits = HashMap::new();
        limits.insert("nvidia.com/gpu".to_string(), gpus);
        WorkloadSpec {
            name: "w".to_string(),
            containers: vec![limits],
            priority: None,
            locality_hint: None,
        }
    }

    fn adapter_with(nc: Arc<NodeCache>, tc: Arc<TopologyCache>) -> ControllerAdapter {
        let scorer = Arc::new(Scorer::new(nc.clone(), tc.clone()));
        let metrics = Arc::new(crate::metrics::MetricsCollector::new().unwrap());
        let placement = Arc::new(PlacementEngine::new(nc.clone(), tc.clone(), scorer.clone(), metrics, StrategyBounds::default()));
        ControllerAdapter::new(nc, tc, scorer, placement, StrategyBounds::default(), 4)
    }

    #[test]
    fn filter_rejects_non_gpu_workload() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(descriptor("a", 4)).unwrap();
        let adapter = adapter_with(nc, tc);
        let workload = WorkloadSpec {
            name: "w".to_string(),
            containers: vec![],
            priority: None,
            locality_hint: None,
        };
        assert_eq!(adapter.filter(&workload, "a"), FilterDecision::Reject(RejectReason::NotAGpuWorkload));
    }

    #[test]
    fn filter_passes_when_domain_has_capacity() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(descriptor("a", 4)).unwrap();
        tc.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        tc.attach_node("d1", "a").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let adapter = adapter_with(nc, tc);
        assert_eq!(adapter.filter(&gpu_workload(2), "a"), FilterDecision::Pass);
    }

    #[test]
    fn score_is_scaled_to_0_100() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(descriptor("a", 4)).unwrap();
        tc.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        tc.attach_node("d1", "a").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let adapter = adapter_with(nc, tc);
        let value = adapter.score(&gpu_workload(2), "a");
        assert!(value <= 100);
    }

    #[test]
    fn reconcile_removes_nodes_absent_from_listing() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        let adapter = adapter_with(nc.clone(), tc.clone());
        adapter.apply_event(WatchEvent::NodeAdded(descriptor("a", 4)));
        assert!(nc.get_node("a").is_some());

        adapter.reconcile(vec![], vec![]);
        assert!(nc.get_node("a").is_none());
    }

    #[test]
    fn domain_added_event_attaches_members_and_syncs_gpu_counts() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        let adapter = adapter_with(nc.clone(), tc.clone());
        adapter.apply_event(WatchEvent::NodeAdded(descriptor("a", 4)));
        adapter.apply_event(WatchEvent::DomainAdded(DomainConfigResource {
            name: "d1".to_string(),
            kind: DomainKind::Leaf,
            member_nodes: vec!["a".to_string()],
            parent: None,
            bandwidth_gbps: 100,
            latency_us: 5,
            adjacent_domains: vec![],
        }));
        let domain = tc.get_domain("d1").unwrap();
        assert_eq!(domain.total_gpus, 4);
        assert_eq!(domain.members.len(), 1);
    }

    #[test]
    fn schedule_workload_commits_a_placement() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(descriptor("a", 4)).unwrap();
        tc.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        tc.attach_node("d1", "a").unwrap();
        tc.sync_all_domain_gpus(&nc);

        let adapter = adapter_with(nc.clone(), tc);
        let result = adapter.schedule_workload(&gpu_workload(2)).unwrap();
        assert_eq!(result.nodes, vec!["a".to_string()]);
        assert_eq!(nc.get_allocation("a").unwrap(), 2);
    }

    #[test]
    fn schedule_workload_rejects_non_gpu_workload() {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        let adapter = adapter_with(nc, tc);
        let workload = WorkloadSpec {
            name: "w".to_string(),
            containers: vec![],
            priority: None,
            locality_hint: None,
        };
        assert!(matches!(adapter.schedule_workload(&workload), Err(Error::InvalidArgument(_))));
    }
}
