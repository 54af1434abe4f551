//! Topology cache for leaf/spine domain membership and adjacency.
//!
//! Tracks domains (leaf or spine), their node membership, the reverse
//! node-to-domain index, and the spine adjacency graph. Distances between
//! domains are computed on demand via BFS rather than memoized, since the
//! graph is small and changes whenever a spine link flaps.

use std::collections::{HashMap, HashSet, VecDeque};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Whether a domain sits at the leaf (rack) or spine (aggregation) layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DomainKind {
    Leaf,
    Spine,
}

/// A topology domain: a leaf rack or a spine aggregation point.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Domain {
    pub name: String,
    pub kind: DomainKind,
    pub members: HashSet<String>,
    pub total_gpus: u32,
    pub used_gpus: u32,
    pub bandwidth_gbps: u32,
    pub latency_us: u32,
    pub parent: Option<String>,
    pub children: HashSet<String>,
}

impl Domain {
    /// Construct a new, empty domain.
    pub fn new(name: impl Into<String>, kind: DomainKind) -> Self {
        Self {
            name: name.into(),
            kind,
            members: HashSet::new(),
            total_gpus: 0,
            used_gpus: 0,
            bandwidth_gbps: 0,
            latency_us: 0,
            parent: None,
            children: HashSet::new(),
        }
    }
}

/// Distance between two domains, expressed as the number of spine hops.
/// `Unreachable` is the BFS sentinel when no path exists.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainDistance {
    Hops(u32),
    Unreachable,
}

/// Thread-safe topology cache.
pub struct TopologyCache {
    domains: RwLock<HashMap<String, Domain>>,
    domain_for_node: RwLock<HashMap<String, String>>,
    /// Symmetric, irreflexive spine adjacency: `a` adjacent to `b` implies
    /// `b` adjacent to `a`, and no domain is adjacent to itself.
    spine_adjacency: RwLock<HashMap<String, HashSet<String>>>,
}

impl Default for TopologyCache {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyCache {
    pub fn new() -> Self {
        Self {
            domains: RwLock::new(HashMap::new()),
            domain_for_node: RwLock::new(HashMap::new()),
            spine_adjacency: RwLock::new(HashMap::new()),
        }
    }

    /// Register a new domain. Fails with `AlreadyExists` if the name is known.
    pub fn add_domain(&self, domain: Domain) -> Result<()> {
        let mut domains = self.domains.write();
        if domains.contains_key(&domain.name) {
            return Err(Error::AlreadyExists(domain.name));
        }
        self.spine_adjacency
            .write()
            .entry(domain.name.clone())
            .or_insert_with(HashSet::new);
        domains.insert(domain.name.clone(), domain);
        Ok(())
    }

    /// Replace a domain's metadata wholesale, preserving `members` unless
    /// the caller's `domain.members` differs (used by `attach`/`detach`
    /// instead for membership changes).
    pub fn update_domain(&self, domain: Domain) -> Result<()> {
        let mut domains = self.domains.write();
        if !domains.contains_key(&domain.name) {
            return Err(Error::NotFound(domain.name));
        }
        domains.insert(domain.name.clone(), domain);
        Ok(())
    }

    /// Remove a domain. Fails with `NotFound`, or with `InvalidArgument` if
    /// the domain still has member nodes (callers must detach them first).
    pub fn remove_domain(&self, name: &str) -> Result<Domain> {
        let mut domains = self.domains.write();
        let domain = domains.get(name).ok_or_else(|| Error::NotFound(name.to_string()))?;
        if !domain.members.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "domain {} still has {} member nodes",
                name,
                domain.members.len()
            )));
        }
        let removed = domains.remove(name).unwrap();
        drop(domains);

        let mut adjacency = self.spine_adjacency.write();
        if let Some(neighbors) = adjacency.remove(name) {
            for neighbor in neighbors {
                if let Some(set) = adjacency.get_mut(&neighbor) {
                    set.remove(name);
                }
            }
        }
        Ok(removed)
    }

    /// Attach a node to a domain. Fails with `AlreadyExists` if the node is
    /// already attached to a different domain — a node belongs to at most
    /// one domain at a time.
    pub fn attach_node(&self, domain_name: &str, node_name: &str) -> Result<()> {
        let mut domain_for_node = self.domain_for_node.write();
        if let Some(existing) = domain_for_node.get(node_name) {
            if existing != domain_name {
                return Err(Error::AlreadyExists(format!(
                    "node {} already attached to domain {}",
                    node_name, existing
                )));
            }
            return Ok(());
        }
        let mut domains = self.domains.write();
        let domain = domains
            .get_mut(domain_name)
            .ok_or_else(|| Error::NotFound(domain_name.to_string()))?;
        domain.members.insert(node_name.to_string());
        domain_for_node.insert(node_name.to_string(), domain_name.to_string());
        Ok(())
    }

    /// Detach a node from whatever domain it belongs to. No-op if unattached.
    pub fn detach_node(&self, node_name: &str) -> Result<()> {
        let mut domain_for_node = self.domain_for_node.write();
        if let Some(domain_name) = domain_for_node.remove(node_name) {
            if let Some(domain) = self.domains.write().get_mut(&domain_name) {
                domain.members.remove(node_name);
            }
        }
        Ok(())
    }

    /// Declare a symmetric spine adjacency between two distinct domains.
    /// Fails with `InvalidArgument` for a self-loop.
    pub fn set_spine_adjacency(&self, a: &str, b: &str) -> Result<()> {
        if a == b {
            return Err(Error::InvalidArgument("a domain cannot be adjacent to itself".into()));
        }
        let domains = self.domains.read();
        if !domains.contains_key(a) {
            return Err(Error::NotFound(a.to_string()));
        }
        if !domains.contains_key(b) {
            return Err(Error::NotFound(b.to_string()));
        }
        drop(domains);

        let mut adjacency = self.spine_adjacency.write();
        adjacency.entry(a.to_string()).or_insert_with(HashSet::new).insert(b.to_string());
        adjacency.entry(b.to_string()).or_insert_with(HashSet::new).insert(a.to_string());
        Ok(())
    }

    /// Remove a spine adjacency edge in both directions. No-op if absent.
    pub fn clear_spine_adjacency(&self, a: &str, b: &str) {
        let mut adjacency = self.spine_adjacency.write();
        if let Some(set) = adjacency.get_mut(a) {
            set.remove(b);
        }
        if let Some(set) = adjacency.get_mut(b) {
            set.remove(a);
        }
    }

    /// Which domain a node currently belongs to, if any.
    pub fn get_domain_for_node(&self, node_name: &str) -> Option<String> {
        self.domain_for_node.read().get(node_name).cloned()
    }

    /// Domains directly spine-adjacent to the given domain.
    pub fn get_adjacent_domains(&self, name: &str) -> Vec<String> {
        self.spine_adjacency
            .read()
            .get(name)
            .map(|set| set.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Snapshot of every domain.
    pub fn get_all_domains(&self) -> Vec<Domain> {
        self.domains.read().values().cloned().collect()
    }

    /// Fetch a single domain's current snapshot.
    pub fn get_domain(&self, name: &str) -> Option<Domain> {
        self.domains.read().get(name).cloned()
    }

    /// Domains with at least one free GPU.
    pub fn free_domains(&self) -> Vec<Domain> {
        self.domains
            .read()
            .values()
            .filter(|d| d.used_gpus < d.total_gpus)
            .cloned()
            .collect()
    }

    /// Recompute `total_gpus`/`used_gpus` for one domain from the node
    /// cache's current descriptors and allocations. Callers invoke this
    /// after any membership or allocation change the caller is aware of;
    /// the domain monitor also keeps these in sync on its tick.
    pub fn sync_domain_gpus(&self, domain_name: &str, node_cache: &crate::node::NodeCache) {
        let mut domains = self.domains.write();
        let Some(domain) = domains.get_mut(domain_name) else {
            return;
        };
        let mut total = 0u32;
        let mut used = 0u32;
        for node_name in &domain.members {
            if let Some(descriptor) = node_cache.get_node(node_name) {
                total += descriptor.total_gpus;
                used += node_cache.get_allocation(node_name).unwrap_or(0);
            }
        }
        domain.total_gpus = total;
        domain.used_gpus = used;
    }

    /// Recompute `total_gpus`/`used_gpus` for every domain.
    pub fn sync_all_domain_gpus(&self, node_cache: &crate::node::NodeCache) {
        let names: Vec<String> = self.domains.read().keys().cloned().collect();
        for name in names {
            self.sync_domain_gpus(&name, node_cache);
        }
    }

    /// Number of spine hops between two domains via BFS over the adjacency
    /// graph. A domain is distance 0 from itself. `Unreachable` if no path
    /// connects them.
    pub fn domain_distance(&self, from: &str, to: &str) -> DomainDistance {
        if from == to {
            return DomainDistance::Hops(0);
        }
        let adjacency = self.spine_adjacency.read();
        if !adjacency.contains_key(from) {
            return DomainDistance::Unreachable;
        }

        let mut visited: HashSet<String> = HashSet::new();
        visited.insert(from.to_string());
        let mut queue: VecDeque<(String, u32)> = VecDeque::new();
        queue.push_back((from.to_string(), 0));

        while let Some((current, dist)) = queue.pop_front() {
            let Some(neighbors) = adjacency.get(&current) else {
                continue;
            };
            for neighbor in neighbors {
                if neighbor == to {
                    return DomainDistance::Hops(dist + 1);
                }
                if visited.insert(neighbor.clone()) {
                    queue.push_back((neighbor.clone(), dist + 1));
                }
            }
        }
        DomainDistance::Unreachable
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn attach_twice_to_same_domain_is_idempotent() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.attach_node("d1", "n1").unwrap();
        cache.attach_node("d1", "n1").unwrap();
        assert_eq!(cache.get_domain("d1").unwrap().members.len(), 1);
    }

    #[test]
    fn attach_to_second_domain_fails() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.add_domain(Domain::new("d2", DomainKind::Leaf)).unwrap();
        cache.attach_node("d1", "n1").unwrap();
        let err = cache.attach_node("d2", "n1").unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn remove_domain_with_members_fails() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.attach_node("d1", "n1").unwrap();
        assert!(matches!(cache.remove_domain("d1"), Err(Error::InvalidArgument(_))));
    }

    #[test]
    fn spine_adjacency_is_symmetric_and_irreflexive() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.add_domain(Domain::new("d2", DomainKind::Leaf)).unwrap();
        assert!(matches!(
            cache.set_spine_adjacency("d1", "d1"),
            Err(Error::InvalidArgument(_))
        ));
        cache.set_spine_adjacency("d1", "d2").unwrap();
        assert!(cache.get_adjacent_domains("d1").contains(&"d2".to_string()));
        assert!(cache.get_adjacent_domains("d2").contains(&"d1".to_string()));
    }

    #[test]
    fn distance_bfs_finds_shortest_multi_hop_path() {
        let cache = TopologyCache::new();
        for name in ["d1", "d2", "d3"] {
            cache.add_domain(Domain::new(name, DomainKind::Leaf)).unwrap();
        }
        cache.set_spine_adjacency("d1", "d2").unwrap();
        cache.set_spine_adjacency("d2", "d3").unwrap();
        assert_eq!(cache.domain_distance("d1", "d1"), DomainDistance::Hops(0));
        assert_eq!(cache.domain_distance("d1", "d2"), DomainDistance::Hops(1));
        assert_eq!(cache.domain_distance("d1", "d3"), DomainDistance::Hops(2));
    }

    #[test]
    fn distance_unreachable_when_disconnected() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.add_domain(Domain::new("d2", DomainKind::Leaf)).unwrap();
        assert_eq!(cache.domain_distance("d1", "d2"), DomainDistance::Unreachable);
    }

    #[test]
    fn detach_then_reattach_elsewhere_succeeds() {
        let cache = TopologyCache::new();
        cache.add_domain(Domain::new("d1", DomainKind::Leaf)).unwrap();
        cache.add_domain(Domain::new("d2", DomainKind::Leaf)).unwrap();
        cache.attach_node("d1", "n1").unwrap();
        cache.detach_node("n1").unwrap();
        cache.attach_node("d2", "n1").unwrap();
        assert_eq!(cache.get_domain_for_node("n1"), Some("d2".to_string()));
    }
}
