//! Domain monitor.
//!
//! Periodically recomputes per-domain utilization, fragmentation, and
//! health, publishing the results to the metrics collector and caching
//! them for the scorer. Fragmentation is computed per node: a domain's
//! fragmentation is the fraction of its member nodes whose allocation is
//! strictly between zero and that node's total GPU count. This does not
//! replicate the aggregate domain-wide shortcut some topology schedulers
//! use, which conflates per-node and per-domain accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use tracing::{debug, info};

use crate::metrics::MetricsCollector;
use crate::node::NodeCache;
use crate::topology::TopologyCache;

/// Snapshot of one domain's recomputed health signals.
#[derive(Debug, Clone, Copy, Default)]
pub struct DomainHealth {
    pub utilization: f64,
    pub fragmentation: f64,
    pub health: f64,
}

/// Cache of the latest per-domain health snapshots, read by the scorer.
pub struct DomainMonitor {
    node_cache: Arc<NodeCache>,
    topology_cache: Arc<TopologyCache>,
    metrics: Arc<MetricsCollector>,
    snapshots: RwLock<HashMap<String, DomainHealth>>,
}

impl DomainMonitor {
    pub fn new(
        node_cache: Arc<NodeCache>,
        topology_cache: Arc<TopologyCache>,
        metrics: Arc<MetricsCollector>,
    ) -> Self {
        Self {
            node_cache,
            topology_cache,
            metrics,
            snapshots: RwLock::new(HashMap::new()),
        }
    }

    /// Recompute every domain's health signals and publish them as gauges.
    pub fn tick(&self) {
        let domains = self.topology_cache.get_all_domains();
        let mut snapshots = self.snapshots.write();
        for domain in &domains {
            let health = self.compute_domain_health(&domain.name, &domain.members);
            self.metrics.set_domain_utilization(&domain.name, health.utilization);
            self.metrics.set_gpu_utilization(&domain.name, health.utilization);
            self.metrics.set_domain_fragmentation(&domain.name, health.fragmentation);
            snapshots.insert(domain.name.clone(), health);
            debug!(
                domain = %domain.name,
                utilization = health.utilization,
                fragmentation = health.fragmentation,
                health = health.health,
                "domain monitor tick"
            );
        }
        info!(domains = domains.len(), "domain monitor tick complete");
    }

    fn compute_domain_health(
        &self,
        domain_name: &str,
        members: &std::collections::HashSet<String>,
    ) -> DomainHealth {
        if members.is_empty() {
            return DomainHealth::default();
        }

        let mut total_gpus = 0u32;
        let mut used_gpus = 0u32;
        let mut partial = 0u32;
        let mut healthy_count = 0u32;

        for node_name in members {
            let Some(descriptor) = self.node_cache.get_node(node_name) else {
                continue;
            };
            let allocation = self.node_cache.get_allocation(node_name).unwrap_or(0);
            total_gpus += descriptor.total_gpus;
            used_gpus += allocation;
            if allocation > 0 && allocation < descriptor.total_gpus {
                partial += 1;
            }
            if descriptor.healthy {
                healthy_count += 1;
            }
            self.metrics
                .set_node_allocation(node_name, domain_name, allocation as f64);
            self.metrics.set_node_health(
                node_name,
                domain_name,
                if descriptor.healthy { 1.0 } else { 0.0 },
            );
        }

        let utilization = if total_gpus == 0 {
            0.0
        } else {
            used_gpus as f64 / total_gpus as f64
        };
        let fragmentation = partial as f64 / members.len() as f64;
        let health = healthy_count as f64 / members.len() as f64;

        DomainHealth {
            utilization,
            fragmentation,
            health,
        }
    }

    /// Latest cached snapshot for a domain, or a zeroed snapshot if unseen.
    pub fn snapshot(&self, domain_name: &str) -> DomainHealth {
        self.snapshots.read().get(domain_name).copied().unwrap_or_default()
    }
}

/// Default tick interval for the domain monitor, per the configuration
/// defaults (`monitorInterval = 15s`).
pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(15);
