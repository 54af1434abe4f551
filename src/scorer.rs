//! Scorer.
//!
//! A pure weighted function over resource availability, topology
//! alignment, utilization, and historical success, plus per-domain EMA
//! state for the historical-success factor (updated by the placement
//! engine's commit step, not by the scorer itself).

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::node::NodeCache;
use crate::topology::TopologyCache;
use crate::workload::GpuRequirement;

/// Weights for the four scoring factors. Must each lie in [0, 1]; the
/// crate does not enforce that they sum to 1, matching the source's
/// unchecked configuration surface.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct ScoringWeights {
    pub resource: f64,
    pub topology: f64,
    pub utilization: f64,
    pub historical: f64,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            resource: 0.4,
            topology: 0.3,
            utilization: 0.2,
            historical: 0.1,
        }
    }
}

/// EMA smoothing factor for `historicalSuccess`.
const HISTORY_ALPHA: f64 = 0.1;
/// Initial value for a domain never scored before.
const HISTORY_INIT: f64 = 0.5;

fn clamp01(v: f64) -> f64 {
    v.clamp(0.0, 1.0)
}

/// Scores domains for a GPU requirement and tracks each domain's EMA of
/// placement success.
pub struct Scorer {
    node_cache: Arc<NodeCache>,
    topology_cache: Arc<TopologyCache>,
    weights: RwLock<ScoringWeights>,
    historical_success: RwLock<HashMap<String, f64>>,
}

impl Scorer {
    pub fn new(node_cache: Arc<NodeCache>, topology_cache: Arc<TopologyCache>) -> Self {
        Self {
            node_cache,
            topology_cache,
            weights: RwLock::new(ScoringWeights::default()),
            historical_success: RwLock::new(HashMap::new()),
        }
    }

    pub fn with_weights(
        node_cache: Arc<NodeCache>,
        topology_cache: Arc<TopologyCache>,
        weights: ScoringWeights,
    ) -> Self {
        Self {
            node_cache,
            topology_cache,
            weights: RwLock::new(weights),
            historical_success: RwLock::new(HashMap::new()),
        }
    }

    /// Free GPUs summed across a domain's member nodes, excluding any node
    /// named in `excluded_nodes` — callers pass the same exclusion list
    /// `PlacementEngine` uses for its own free-capacity count, so a node
    /// mid-eviction (e.g. a failed node still attached to its domain
    /// during recovery) never inflates the score of a domain selection
    /// will not actually draw capacity from.
    fn free_gpus(&self, domain_name: &str, excluded_nodes: &[String]) -> u32 {
        let Some(domain) = self.topology_cache.get_domain(domain_name) else {
            return 0;
        };
        domain
            .members
            .iter()
            .filter(|n| !excluded_nodes.iter().any(|e| e == *n))
            .filter_map(|n| self.node_cache.free_gpus(n))
            .sum()
    }

    fn resource_availability(&self, domain_name: &str, req: &GpuRequirement, excluded_nodes: &[String]) -> f64 {
        if req.total_gpus == 0 {
            return 0.0;
        }
        clamp01(self.free_gpus(domain_name, excluded_nodes) as f64 / req.total_gpus as f64)
    }

    /// Minimum number of domains, starting from `domain_name` and expanding
    /// outward by spine distance, whose cumulative free node count covers
    /// `nodes_needed`. Domains are considered in ascending distance order,
    /// ties broken by ascending name for determinism.
    fn min_domains_needed(&self, domain_name: &str, nodes_needed: u32, excluded_nodes: &[String]) -> u32 {
        let domains = self.topology_cache.get_all_domains();
        let mut by_name: HashMap<String, _> = HashMap::new();
        for d in &domains {
            by_name.insert(d.name.clone(), d);
        }

        let mut ordered: Vec<(u32, String)> = Vec::new();
        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(domain_name.to_string());
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((domain_name.to_string(), 0));
        while let Some((current, dist)) = queue.pop_front() {
            ordered.push((dist, current.clone()));
            for neighbor in self.topology_cache.get_adjacent_domains(&current) {
                if visited.insert(neighbor.clone()) {
                    queue.push_back((neighbor, dist + 1));
                }
            }
        }
        ordered.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut covered = 0u32;
        let mut domains_used = 0u32;
        for (_, name) in ordered {
            let Some(domain) = by_name.get(&name) else { continue };
            let free_nodes = domain
                .members
                .iter()
                .filter(|n| !excluded_nodes.iter().any(|e| e == *n))
                .filter(|n| self.node_cache.free_gpus(n).unwrap_or(0) > 0)
                .count() as u32;
            if free_nodes == 0 {
                continue;
            }
            covered += free_nodes;
            domains_used += 1;
            if covered >= nodes_needed {
                break;
            }
        }
        domains_used.max(1)
    }

    fn topology_alignment(&self, domain_name: &str, req: &GpuRequirement, excluded_nodes: &[String]) -> f64 {
        let domain_nodes = self
            .topology_cache
            .get_domain(domain_name)
            .map(|d| d.members.iter().filter(|n| !excluded_nodes.iter().any(|e| e == *n)).count() as u32)
            .unwrap_or(0);
        let domain_free_gpus = self.free_gpus(domain_name, excluded_nodes);

        if domain_nodes >= req.nodes_needed && domain_free_gpus >= req.total_gpus {
            return 1.0;
        }
        let min_domains = self.min_domains_needed(domain_name, req.nodes_needed, excluded_nodes);
        clamp01(1.0 / (1.0 + min_domains as f64))
    }

    fn utilization(&self, domain_name: &str, excluded_nodes: &[String]) -> f64 {
        let Some(domain) = self.topology_cache.get_domain(domain_name) else {
            return 0.0;
        };
        if domain.total_gpus == 0 {
            return 0.0;
        }
        let members = domain.members.iter().filter(|n| !excluded_nodes.iter().any(|e| e == *n));
        let used: u32 = members
            .clone()
            .filter_map(|n| self.node_cache.get_allocation(n).ok())
            .sum();
        let total: u32 = members
            .filter_map(|n| self.node_cache.get_node(n).map(|d| d.total_gpus))
            .sum();
        if total == 0 {
            0.0
        } else {
            clamp01(used as f64 / total as f64)
        }
    }

    /// EMA of past placement successes in a domain; 0.5 if never observed.
    pub fn historical_success(&self, domain_name: &str) -> f64 {
        self.historical_success
            .read()
            .get(domain_name)
            .copied()
            .unwrap_or(HISTORY_INIT)
    }

    /// Update a domain's EMA after a placement attempt resolves.
    pub fn record_outcome(&self, domain_name: &str, success: bool) {
        let mut history = self.historical_success.write();
        let prior = history.get(domain_name).copied().unwrap_or(HISTORY_INIT);
        let observed = if success { 1.0 } else { 0.0 };
        let updated = HISTORY_ALPHA * observed + (1.0 - HISTORY_ALPHA) * prior;
        history.insert(domain_name.to_string(), updated);
    }

    /// Score a domain for a requirement using the weighted sum of the four
    /// clamped factors. The result lies in [0, 1] when the weights do.
    /// `excluded_nodes` must be the same list the caller used to compute
    /// the domain's free capacity — nodes mid-eviction (e.g. a failed node
    /// still attached to its domain during recovery) are excluded from
    /// every sub-score the same way they are excluded from selection.
    pub fn score(&self, domain_name: &str, req: &GpuRequirement, excluded_nodes: &[String]) -> f64 {
        let weights = *self.weights.read();
        let resource = clamp01(self.resource_availability(domain_name, req, excluded_nodes));
        let topology = clamp01(self.topology_alignment(domain_name, req, excluded_nodes));
        let util_factor = clamp01(1.0 - self.utilization(domain_name, excluded_nodes));
        let history = clamp01(self.historical_success(domain_name));

        weights.resource * resource
            + weights.topology * topology
            + weights.utilization * util_factor
            + weights.historical * history
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node::NodeDescriptor;
    use crate::topology::{Domain, DomainKind};

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

    fn setup() -> (Arc<NodeCache>, Arc<TopologyCache>) {
        let nc = Arc::new(NodeCache::new());
        let tc = Arc::new(TopologyCache::new());
        nc.add_node(node("a", 4)).unwrap();
        nc.add_node(node("b", 4)).unwrap();
        tc.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        tc.attach_node("d1", "a").unwrap();
        tc.attach_node("d1", "b").unwrap();
        (nc, tc)
    }

    #[test]
    fn score_is_in_unit_range() {
        let (nc, tc) = setup();
        let scorer = Scorer::new(nc, tc);
        let req = GpuRequirement {
            total_gpus: 6,
            nodes_needed: 2,
            priority: None,
            locality_hint: None,
        };
        let score = scorer.score("d1", &req, &[]);
        assert!((0.0..=1.0).contains(&score));
    }

    #[test]
    fn score_excludes_the_given_nodes_from_every_sub_score() {
        let (nc, tc) = setup();
        nc.set_allocation("b", 4).unwrap();
        let scorer = Scorer::new(nc, tc);
        let req = GpuRequirement {
            total_gpus: 4,
            nodes_needed: 1,
            priority: None,
            locality_hint: None,
        };
        // "b" is fully allocated already, so excluding it changes nothing.
        let score_without_exclusion = scorer.score("d1", &req, &[]);
        let score_excluding_b = scorer.score("d1", &req, &["b".to_string()]);
        assert_eq!(score_without_exclusion, score_excluding_b);
        // "a" holds the only free capacity, so excluding it must lower the score.
        let score_excluding_a = scorer.score("d1", &req, &["a".to_string()]);
        assert!(score_excluding_a < score_without_exclusion);
    }

    #[test]
    fn historical_success_starts_at_one_half() {
        let (nc, tc) = setup();
        let scorer = Scorer::new(nc, tc);
        assert_eq!(scorer.historical_success("d1"), 0.5);
    }

    #[test]
    fn record_outcome_moves_ema_toward_observation() {
        let (nc, tc) = setup();
        let scorer = Scorer::new(nc, tc);
        scorer.record_outcome("d1", true);
        let updated = scorer.historical_success("d1");
        assert!(updated > 0.5);
        assert!((updated - (0.1 * 1.0 + 0.9 * 0.5)).abs() < 1e-9);
    }

    #[test]
    fn topology_alignment_is_one_when_domain_alone_suffices() {
        let (nc, tc) = setup();
        let scorer = Scorer::new(nc, tc);
        let req = GpuRequirement {
            total_gpus: 8,
            nodes_needed: 2,
            priority: None,
            locality_hint: None,
        };
        assert_eq!(scorer.topology_alignment("d1", &req, &[]), 1.0);
    }
}
