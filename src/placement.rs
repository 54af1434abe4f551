//! Placement engine.
//!
//! Strategy selection, node selection within/across domains, and commit of
//! allocations to the node and topology caches. Strategies are a closed
//! set of four variants dispatched from one function rather than an open
//! trait hierarchy, since a fifth strategy is a deliberate, explicit
//! change to this table, not a plugin.

use std::cmp::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{info, warn};

use crate::error::{Error, Result};
use crate::metrics::MetricsCollector;
use crate::node::NodeCache;
use crate::scorer::Scorer;
use crate::topology::TopologyCache;
use crate::workload::GpuRequirement;

/// Default deadline for a placement request originating from a workload,
/// per spec §5. Recovery's internal sub-placements are not subject to
/// this deadline — recovery completes the current workload before
/// checking cancellation again.
pub const DEFAULT_PLACEMENT_DEADLINE: Duration = Duration::from_secs(5);

/// Strategy bounds; defaults match the scheduler's default configuration.
#[derive(Debug, Clone, Copy)]
pub struct StrategyBounds {
    pub single_domain_max: u32,
    pub complete_domain: u32,
    pub adjacent_max: u32,
}

impl Default for StrategyBounds {
    fn default() -> Self {
        Self {
            single_domain_max: 2,
            complete_domain: 4,
            adjacent_max: 8,
        }
    }
}

/// The closed set of placement strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    SingleDomain,
    CompleteDomain,
    AdjacentDomains,
    MultipleDomains,
}

impl Strategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Strategy::SingleDomain => "SingleDomain",
            Strategy::CompleteDomain => "CompleteDomain",
            Strategy::AdjacentDomains => "AdjacentDomains",
            Strategy::MultipleDomains => "MultipleDomains",
        }
    }

    /// Select a strategy from `nodesNeeded` per the bounds table. `= 4`
    /// (the `CompleteDomain` size) takes priority over `<= single_domain_max`
    /// when both would apply, matching the tie-break that CompleteDomain
    /// wins when `nodesNeeded` equals the domain size.
    pub fn select(nodes_needed: u32, bounds: &StrategyBounds) -> Strategy {
        if nodes_needed == bounds.complete_domain {
            Strategy::CompleteDomain
        } else if nodes_needed <= bounds.single_domain_max {
            Strategy::SingleDomain
        } else if nodes_needed <= bounds.adjacent_max {
            Strategy::AdjacentDomains
        } else {
            Strategy::MultipleDomains
        }
    }
}

/// Result of a successful placement.
#[derive(Debug, Clone)]
pub struct PlacementResult {
    /// Correlation id for this decision, surfaced in logs and to the
    /// workload annotation the caller sets.
    pub id: uuid::Uuid,
    pub nodes: Vec<String>,
    pub strategy: Strategy,
    pub score: f64,
    pub domains: Vec<String>,
}

/// Free GPUs and name for a node, used for descending-free-GPUs,
/// ascending-name tie-break sorts throughout this module.
#[derive(Debug, Clone)]
struct NodeCandidate {
    name: String,
    free: u32,
}

fn sort_candidates(candidates: &mut [NodeCandidate]) {
    candidates.sort_by(|a, b| b.free.cmp(&a.free).then_with(|| a.name.cmp(&b.name)));
}

/// Domains eligible for a requirement, paired with their score, sorted by
/// descending score, then descending free GPUs, then ascending name.
struct ScoredDomain {
    name: String,
    score: f64,
    free_gpus: u32,
}

fn sort_scored_domains(domains: &mut [ScoredDomain]) {
    domains.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| b.free_gpus.cmp(&a.free_gpus))
            .then_with(|| a.name.cmp(&b.name))
    });
}

/// Commits allocations and exposes the four placement strategies, globally
/// serialized by a single mutex covering "read topology + commit
/// allocation".
pub struct PlacementEngine {
    node_cache: Arc<NodeCache>,
    topology_cache: Arc<TopologyCache>,
    scorer: Arc<Scorer>,
    metrics: Arc<MetricsCollector>,
    bounds: StrategyBounds,
    commit_lock: Mutex<()>,
}

impl PlacementEngine {
    pub fn new(
        node_cache: Arc<NodeCache>,
        topology_cache: Arc<TopologyCache>,
        scorer: Arc<Scorer>,
        metrics: Arc<MetricsCollector>,
        bounds: StrategyBounds,
    ) -> Self {
        Self {
            node_cache,
            topology_cache,
            scorer,
            metrics,
            bounds,
            commit_lock: Mutex::new(()),
        }
    }

    /// Place a workload's GPU requirement, excluding the given node names
    /// from consideration (used by recovery to exclude a failed node).
    /// Unbounded: callers that need the default 5s request deadline should
    /// use [`Self::place_with_deadline`] instead.
    pub fn place(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Result<PlacementResult> {
        self.place_inner(req, excluded_nodes, None)
    }

    /// Place a workload's GPU requirement with a deadline. If the deadline
    /// has already elapsed by the time selection would commit, no
    /// allocation is mutated and `DeadlineExceeded` is returned — matching
    /// spec §5's "partial selection state is discarded (no commit has
    /// occurred yet)".
    pub fn place_with_deadline(
        &self,
        req: &GpuRequirement,
        excluded_nodes: &[String],
        deadline: Duration,
    ) -> Result<PlacementResult> {
        self.place_inner(req, excluded_nodes, Some(Instant::now() + deadline))
    }

    fn place_inner(
        &self,
        req: &GpuRequirement,
        excluded_nodes: &[String],
        deadline: Option<Instant>,
    ) -> Result<PlacementResult> {
        if req.nodes_needed == 0 {
            return Err(Error::InvalidArgument("nodesNeeded must be > 0".to_string()));
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }

        let _guard = self.commit_lock.lock();

        if deadline.is_some_and(|d| Instant::now() >= d) {
            return Err(Error::DeadlineExceeded);
        }

        let strategy = Strategy::select(req.nodes_needed, &self.bounds);
        let started = Instant::now();
        self.metrics.inc_attempt(strategy.as_str());

        let result = match strategy {
            Strategy::SingleDomain => self.place_single_domain(req, excluded_nodes),
            Strategy::CompleteDomain => self
                .place_complete_domain(req, excluded_nodes)
                .or_else(|_| self.place_single_domain(req, excluded_nodes)),
            Strategy::AdjacentDomains => self.place_adjacent_domains(req, excluded_nodes),
            Strategy::MultipleDomains => self.place_multiple_domains(req, excluded_nodes),
        };

        let outcome = match result {
            Ok(mut placement) => {
                if deadline.is_some_and(|d| Instant::now() >= d) {
                    warn!(strategy = strategy.as_str(), "deadline exceeded before commit, discarding selection");
                    Err(Error::DeadlineExceeded)
                } else {
                    match self.commit(&placement, req) {
                        Ok(()) => {
                            for domain in &placement.domains {
                                self.scorer.record_outcome(domain, true);
                            }
                            placement.strategy = strategy;
                            info!(
                                strategy = strategy.as_str(),
                                nodes = ?placement.nodes,
                                score = placement.score,
                                "placement committed"
                            );
                            Ok(placement)
                        }
                        Err(e) => Err(e),
                    }
                }
            }
            Err(e) => Err(e),
        };

        self.metrics.observe_latency(strategy.as_str(), started.elapsed().as_secs_f64());
        match outcome {
            Ok(placement) => {
                self.metrics.inc_success(strategy.as_str());
                self.metrics.observe_score(strategy.as_str(), placement.score);
                self.metrics.inc_decision(strategy.as_str(), "success");
                Ok(placement)
            }
            Err(e) => {
                self.metrics.inc_decision(strategy.as_str(), e.kind_tag());
                if matches!(e, Error::Internal(_)) {
                    self.metrics.inc_error("internal");
                    tracing::error!(
                        strategy = strategy.as_str(),
                        error = %e,
                        nodes = ?self.node_cache.list_nodes(),
                        domains = ?self.topology_cache.get_all_domains(),
                        "internal invariant violation during placement"
                    );
                } else {
                    warn!(strategy = strategy.as_str(), error = %e, "placement failed");
                }
                Err(e)
            }
        }
    }

    fn candidates_for_domain(&self, domain_name: &str, excluded_nodes: &[String]) -> Vec<NodeCandidate> {
        let Some(domain) = self.topology_cache.get_domain(domain_name) else {
            return Vec::new();
        };
        domain
            .members
            .iter()
            .filter(|n| !excluded_nodes.iter().any(|e| e == *n))
            .filter_map(|n| self.node_cache.free_gpus(n).map(|free| NodeCandidate { name: n.clone(), free }))
            .collect()
    }

    fn domain_free_gpus(&self, domain_name: &str, excluded_nodes: &[String]) -> u32 {
        self.candidates_for_domain(domain_name, excluded_nodes)
            .iter()
            .map(|c| c.free)
            .sum()
    }

    /// Select nodes greedily by descending free GPUs until `total_gpus` is
    /// satisfied, consuming at most `nodes_needed` nodes.
    fn select_nodes_for_gpus(
        &self,
        mut candidates: Vec<NodeCandidate>,
        total_gpus: u32,
        nodes_needed: u32,
    ) -> Vec<String> {
        sort_candidates(&mut candidates);
        let mut selected = Vec::new();
        let mut remaining = total_gpus;
        for candidate in candidates {
            if selected.len() as u32 >= nodes_needed || remaining == 0 {
                break;
            }
            selected.push(candidate.name);
            remaining = remaining.saturating_sub(candidate.free);
        }
        selected
    }

    fn eligible_domains(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Vec<ScoredDomain> {
        let mut scored = Vec::new();
        for domain in self.topology_cache.get_all_domains() {
            let free = self.domain_free_gpus(&domain.name, excluded_nodes);
            if free == 0 {
                continue;
            }
            let score = self.scorer.score(&domain.name, req, excluded_nodes);
            scored.push(ScoredDomain {
                name: domain.name,
                score,
                free_gpus: free,
            });
        }
        sort_scored_domains(&mut scored);
        scored
    }

    fn place_single_domain(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Result<PlacementResult> {
        let domains: Vec<ScoredDomain> = self
            .eligible_domains(req, excluded_nodes)
            .into_iter()
            .filter(|d| d.free_gpus >= req.total_gpus)
            .collect();

        let chosen = domains
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unschedulable("no domain has enough free GPUs".to_string()))?;

        let candidates = self.candidates_for_domain(&chosen.name, excluded_nodes);
        let nodes = self.select_nodes_for_gpus(candidates, req.total_gpus, req.nodes_needed);
        if nodes.is_empty() {
            return Err(Error::Unschedulable("no nodes selected in chosen domain".to_string()));
        }

        Ok(PlacementResult {
            id: uuid::Uuid::new_v4(),
            nodes,
            strategy: Strategy::SingleDomain,
            score: chosen.score,
            domains: vec![chosen.name],
        })
    }

    fn place_complete_domain(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Result<PlacementResult> {
        let free_domains = self.topology_cache.free_domains();
        let mut scored: Vec<ScoredDomain> = free_domains
            .into_iter()
            .filter(|d| d.members.len() as u32 >= req.nodes_needed)
            .filter(|d| self.domain_free_gpus(&d.name, excluded_nodes) >= req.total_gpus)
            .map(|d| {
                let free_gpus = self.domain_free_gpus(&d.name, excluded_nodes);
                let score = self.scorer.score(&d.name, req, excluded_nodes);
                ScoredDomain {
                    name: d.name,
                    score,
                    free_gpus,
                }
            })
            .collect();
        sort_scored_domains(&mut scored);

        let chosen = scored
            .into_iter()
            .next()
            .ok_or_else(|| Error::Unschedulable("no fully free domain available".to_string()))?;

        let mut candidates = self.candidates_for_domain(&chosen.name, excluded_nodes);
        sort_candidates(&mut candidates);
        let nodes: Vec<String> = candidates
            .into_iter()
            .take(req.nodes_needed as usize)
            .map(|c| c.name)
            .collect();

        Ok(PlacementResult {
            id: uuid::Uuid::new_v4(),
            nodes,
            strategy: Strategy::CompleteDomain,
            score: chosen.score,
            domains: vec![chosen.name],
        })
    }

    fn place_adjacent_domains(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Result<PlacementResult> {
        let primary_candidates: Vec<ScoredDomain> = self
            .eligible_domains(req, excluded_nodes)
            .into_iter()
            .filter(|d| d.free_gpus > 0)
            .collect();

        for primary in primary_candidates {
            let primary_nodes_cands = self.candidates_for_domain(&primary.name, excluded_nodes);
            let mut sorted_primary = primary_nodes_cands.clone();
            sort_candidates(&mut sorted_primary);

            let primary_take = sorted_primary
                .iter()
                .take(req.nodes_needed as usize)
                .cloned()
                .collect::<Vec<_>>();
            let primary_gpus: u32 = primary_take.iter().map(|c| c.free).sum();
            let nodes_from_primary = primary_take.len() as u32;

            if nodes_from_primary >= req.nodes_needed && primary_gpus >= req.total_gpus {
                return Ok(PlacementResult {
                    id: uuid::Uuid::new_v4(),
                    nodes: primary_take.into_iter().map(|c| c.name).collect(),
                    strategy: Strategy::AdjacentDomains,
                    score: primary.score,
                    domains: vec![primary.name],
                });
            }

            let remaining_gpus = req.total_gpus.saturating_sub(primary_gpus);
            let remaining_nodes = req.nodes_needed.saturating_sub(nodes_from_primary);
            if remaining_nodes == 0 {
                continue;
            }

            let mut neighbor_scored: Vec<ScoredDomain> = self
                .topology_cache
                .get_adjacent_domains(&primary.name)
                .into_iter()
                .filter_map(|name| {
                    let free = self.domain_free_gpus(&name, excluded_nodes);
                    if free == 0 {
                        return None;
                    }
                    let score = self.scorer.score(&name, req, excluded_nodes);
                    Some(ScoredDomain { name, score, free_gpus: free })
                })
                .filter(|d| d.free_gpus >= remaining_gpus)
                .collect();
            sort_scored_domains(&mut neighbor_scored);

            if let Some(neighbor) = neighbor_scored.into_iter().next() {
                let neighbor_candidates = self.candidates_for_domain(&neighbor.name, excluded_nodes);
                let neighbor_nodes = self.select_nodes_for_gpus(neighbor_candidates, remaining_gpus, remaining_nodes);
                if neighbor_nodes.len() as u32 == remaining_nodes {
                    let mut nodes: Vec<String> = primary_take.into_iter().map(|c| c.name).collect();
                    nodes.extend(neighbor_nodes);
                    let combined_score = (primary.score + neighbor.score) / 2.0;
                    return Ok(PlacementResult {
                        id: uuid::Uuid::new_v4(),
                        nodes,
                        strategy: Strategy::AdjacentDomains,
                        score: combined_score,
                        domains: vec![primary.name, neighbor.name],
                    });
                }
            }
        }

        Err(Error::Unschedulable("no adjacent-domain pair satisfies the requirement".to_string()))
    }

    fn place_multiple_domains(&self, req: &GpuRequirement, excluded_nodes: &[String]) -> Result<PlacementResult> {
        let scored = self.eligible_domains(req, excluded_nodes);
        let total_free: u32 = scored.iter().map(|d| d.free_gpus).sum();
        if total_free < req.total_gpus {
            return Err(Error::Unschedulable("cluster-wide free capacity insufficient".to_string()));
        }

        let mut nodes = Vec::new();
        let mut domains_touched = Vec::new();
        let mut remaining_gpus = req.total_gpus;
        let mut weighted_score = 0.0;
        let mut score_weight = 0.0;

        for domain in &scored {
            if remaining_gpus == 0 || nodes.len() as u32 >= req.nodes_needed {
                break;
            }
            let mut candidates = self.candidates_for_domain(&domain.name, excluded_nodes);
            sort_candidates(&mut candidates);
            let mut touched_this_domain = false;
            for candidate in candidates {
                if remaining_gpus == 0 || nodes.len() as u32 >= req.nodes_needed {
                    break;
                }
                remaining_gpus = remaining_gpus.saturating_sub(candidate.free);
                nodes.push(candidate.name);
                touched_this_domain = true;
            }
            if touched_this_domain {
                domains_touched.push(domain.name.clone());
                weighted_score += domain.score;
                score_weight += 1.0;
            }
        }

        if remaining_gpus > 0 || nodes.is_empty() {
            return Err(Error::Unschedulable("could not assemble enough nodes across domains".to_string()));
        }

        Ok(PlacementResult {
            id: uuid::Uuid::new_v4(),
            nodes,
            strategy: Strategy::MultipleDomains,
            score: if score_weight > 0.0 { weighted_score / score_weight } else { 0.0 },
            domains: domains_touched,
        })
    }

    /// Commit a placement's allocations. Increments each selected node's
    /// allocation by its per-node share of `req.total_gpus`, capped at the
    /// node's total GPU count. Rolls back all prior increments on partial
    /// failure.
    fn commit(&self, placement: &PlacementResult, req: &GpuRequirement) -> Result<()> {
        let mut committed: Vec<(String, u32)> = Vec::new();
        let mut remaining = req.total_gpus;

        for node_name in &placement.nodes {
            if remaining == 0 {
                break;
            }
            let free = self.node_cache.free_gpus(node_name).unwrap_or(0);
            let share = remaining.min(free);
            let current = self.node_cache.get_allocation(node_name);
            match current.and_then(|c| self.node_cache.set_allocation(node_name, c + share)) {
                Ok(()) => {
                    committed.push((node_name.clone(), share));
                    remaining = remaining.saturating_sub(share);
                }
                Err(e) => {
                    self.rollback(&committed);
                    return Err(e);
                }
            }
        }

        if remaining > 0 {
            self.rollback(&committed);
            return Err(Error::Internal(format!(
                "commit left {} GPUs unassigned for placement {:?}",
                remaining, placement.nodes
            )));
        }
        for domain in &placement.domains {
            self.topology_cache.sync_domain_gpus(domain, &self.node_cache);
        }
        Ok(())
    }

    fn rollback(&self, committed: &[(String, u32)]) {
        for (node_name, share) in committed {
            if let Ok(current) = self.node_cache.get_allocation(node_name) {
                let _ = self.node_cache.set_allocation(node_name, current.saturating_sub(*share));
            }
        }
        self.topology_cache.sync_all_domain_gpus(&self.node_cache);
    }
}
