//! Node cache.
//!
//! Maps node name to its descriptor and current GPU allocation count, with
//! per-node last-update timestamps. Allocation is stored alongside the
//! descriptor, not inside it, since it is mutated far more often.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Static description of a compute node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node name.
    pub name: String,
    /// Total GPUs physically present.
    pub total_gpus: u32,
    /// Type/model tag (e.g. "A100-80GB").
    pub model: String,
    /// Per-GPU memory in bytes, one entry per physical device.
    pub gpu_memory: Vec<u64>,
    /// Network bandwidth attribute, in Gbps.
    pub network_bandwidth_gbps: u32,
    /// True iff the node carries a ready condition.
    pub healthy: bool,
}

/// A node descriptor plus the bookkeeping the cache maintains for it.
#[derive(Debug, Clone)]
struct NodeEntry {
    descriptor: NodeDescriptor,
    allocation: u32,
    last_update: DateTime<Utc>,
}

/// Thread-safe node cache. Reads do not block other reads; writers serialize.
pub struct NodeCache {
    nodes: RwLock<HashMap<String, NodeEntry>>,
}

impl Default for NodeCache {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeCache {
    /// Create an empty node cache.
    pub fn new() -> Self {
        Self {
            nodes: RwLock::new(HashMap::new()),
        }
    }

    /// Add a new node. Fails with `AlreadyExists` if the name is known.
    /// Allocation starts at 0.
    pub fn add_node(&self, descriptor: NodeDescriptor) -> Result<()> {
        let mut nodes = self.nodes.write();
        if nodes.contains_key(&descriptor.name) {
            return Err(Error::AlreadyExists(descriptor.name));
        }
        let entry = NodeEntry {
            descriptor,
            allocation: 0,
            last_update: Utc::now(),
        };
        nodes.insert(entry.descriptor.name.clone(), entry);
        Ok(())
    }

    /// Upsert descriptor fields; preserves allocation.
    pub fn update_node(&self, descriptor: NodeDescriptor) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(&descriptor.name) {
            Some(entry) => {
                entry.descriptor = descriptor;
                entry.last_update = Utc::now();
                Ok(())
            }
            None => {
                let entry = NodeEntry {
                    descriptor,
                    allocation: 0,
                    last_update: Utc::now(),
                };
                nodes.insert(entry.descriptor.name.clone(), entry);
                Ok(())
            }
        }
    }

    /// Remove a node, returning its last known descriptor and allocation.
    /// Fails with `NotFound`.
    pub fn remove_node(&self, name: &str) -> Result<(NodeDescriptor, u32)> {
        let mut nodes = self.nodes.write();
        match nodes.remove(name) {
            Some(entry) => Ok((entry.descriptor, entry.allocation)),
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Fetch a node's descriptor.
    pub fn get_node(&self, name: &str) -> Option<NodeDescriptor> {
        self.nodes.read().get(name).map(|e| e.descriptor.clone())
    }

    /// List all node descriptors.
    pub fn list_nodes(&self) -> Vec<NodeDescriptor> {
        self.nodes.read().values().map(|e| e.descriptor.clone()).collect()
    }

    /// Set a node's allocation. Fails with `NotFound`; fails with
    /// `InvalidArgument` if `count` is negative in spirit (i.e. would
    /// underflow) or exceeds `total_gpus`.
    pub fn set_allocation(&self, name: &str, count: u32) -> Result<()> {
        let mut nodes = self.nodes.write();
        match nodes.get_mut(name) {
            Some(entry) => {
                if count > entry.descriptor.total_gpus {
                    return Err(Error::InvalidArgument(format!(
                        "allocation {} exceeds total GPUs {} on node {}",
                        count, entry.descriptor.total_gpus, name
                    )));
                }
                entry.allocation = count;
                entry.last_update = Utc::now();
                Ok(())
            }
            None => Err(Error::NotFound(name.to_string())),
        }
    }

    /// Read a node's current allocation.
    pub fn get_allocation(&self, name: &str) -> Result<u32> {
        self.nodes
            .read()
            .get(name)
            .map(|e| e.allocation)
            .ok_or_else(|| Error::NotFound(name.to_string()))
    }

    /// Free GPU count on a node (`total_gpus - allocation`), or `None` if
    /// the node is unknown.
    pub fn free_gpus(&self, name: &str) -> Option<u32> {
        self.nodes
            .read()
            .get(name)
            .map(|e| e.descriptor.total_gpus.saturating_sub(e.allocation))
    }

    /// Last-update timestamp for a node, or `None` if unknown.
    pub fn last_update(&self, name: &str) -> Option<DateTime<Utc>> {
        self.nodes.read().get(name).map(|e| e.last_update)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

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

    #[test]
    fn add_then_remove_restores_prior_state() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        let (descriptor, allocation) = cache.remove_node("a").unwrap();
        assert_eq!(descriptor.name, "a");
        assert_eq!(allocation, 0);
        assert!(cache.get_node("a").is_none());
    }

    #[test]
    fn add_node_twice_fails_already_exists() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        let err = cache.add_node(node("a", 4)).unwrap_err();
        assert!(matches!(err, Error::AlreadyExists(_)));
    }

    #[test]
    fn remove_unknown_node_fails_not_found() {
        let cache = NodeCache::new();
        assert!(matches!(cache.remove_node("missing"), Err(Error::NotFound(_))));
    }

    #[test]
    fn set_allocation_rejects_overflow() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        let err = cache.set_allocation("a", 5).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
        assert_eq!(cache.get_allocation("a").unwrap(), 0);
    }

    #[test]
    fn set_allocation_idempotent() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        cache.set_allocation("a", 2).unwrap();
        cache.set_allocation("a", 2).unwrap();
        assert_eq!(cache.get_allocation("a").unwrap(), 2);
    }

    #[test]
    fn update_node_preserves_allocation() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        cache.set_allocation("a", 3).unwrap();
        let mut updated = node("a", 4);
        updated.healthy = false;
        cache.update_node(updated).unwrap();
        assert_eq!(cache.get_allocation("a").unwrap(), 3);
        assert!(!cache.get_node("a").unwrap().healthy);
    }

    #[test]
    fn free_gpus_reflects_allocation() {
        let cache = NodeCache::new();
        cache.add_node(node("a", 4)).unwrap();
        cache.set_allocation("a", 1).unwrap();
        assert_eq!(cache.free_gpus("a"), Some(3));
    }

    proptest::proptest! {
        /// Universal invariant I2: for any sequence of `set_allocation`
        /// calls, every accepted value stays within `[0, total_gpus]`, and
        /// rejected values never change the stored allocation.
        #[test]
        fn set_allocation_never_escapes_bounds(total_gpus in 1u32..16, attempts in proptest::collection::vec(0u32..32, 1..20)) {
            let cache = NodeCache::new();
            cache.add_node(node("a", total_gpus)).unwrap();

            for attempt in attempts {
                let before = cache.get_allocation("a").unwrap();
                match cache.set_allocation("a", attempt) {
                    Ok(()) => {
                        let after = cache.get_allocation("a").unwrap();
                        assert!(after <= total_gpus);
                        assert_eq!(after, attempt);
                    }
                    Err(Error::InvalidArgument(_)) => {
                        assert!(attempt > total_gpus);
                        assert_eq!(cache.get_allocation("a").unwrap(), before);
                    }
                    Err(other) => panic!("unexpected error: {other:?}"),
                }
                assert_eq!(cache.free_gpus("a").unwrap(), total_gpus - cache.get_allocation("a").unwrap());
            }
        }
    }
}
