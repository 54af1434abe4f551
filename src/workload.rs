//! Workload extraction.
//!
//! The orchestrator's actual Pod type is out of scope; this module defines
//! a minimal stand-in and the extraction logic that derives a GPU
//! requirement from it, matching the source's `requiresGPU`/
//! `getGPURequirements` helpers.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// The conventional resource key under which GPU counts are requested.
pub const GPU_RESOURCE_KEY: &str = "nvidia.com/gpu";

/// Default GPUs per node used to derive `nodesNeeded` when not overridden
/// by configuration.
pub const DEFAULT_GPUS_PER_NODE: u32 = 4;

/// Affinity/anti-affinity hint carried by a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LocalityHint {
    pub preferred_domains: Vec<String>,
    pub avoid_domains: Vec<String>,
}

/// Minimal workload descriptor: a stand-in for a Pod spec.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkloadSpec {
    pub name: String,
    /// Per-container resource limits, keyed by resource name.
    pub containers: Vec<HashMap<String, u64>>,
    /// Higher is scheduled earlier; absent is treated as lowest.
    pub priority: Option<i32>,
    pub locality_hint: Option<LocalityHint>,
}

/// A derived GPU requirement for a workload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuRequirement {
    pub total_gpus: u32,
    pub nodes_needed: u32,
    pub priority: Option<i32>,
    pub locality_hint: Option<LocalityHint>,
}

impl GpuRequirement {
    /// Derive a requirement from a workload, or `None` if it is not a GPU
    /// workload (the summed GPU resource quantity across containers is
    /// zero).
    pub fn from_workload(workload: &WorkloadSpec, gpus_per_node: u32) -> Option<Self> {
        let total_gpus: u64 = workload
            .containers
            .iter()
            .filter_map(|limits| limits.get(GPU_RESOURCE_KEY))
            .sum();
        if total_gpus == 0 {
            return None;
        }
        let total_gpus = total_gpus as u32;
        let per_node = gpus_per_node.max(1);
        let nodes_needed = (total_gpus + per_node - 1) / per_node;

        Some(Self {
            total_gpus,
            nodes_needed,
            priority: workload.priority,
            locality_hint: workload.locality_hint.clone(),
        })
    }
}

/// Sort key for priority-ordered processing: higher priority first, then
/// descending GPU count, matching the recovery engine's ordering rule.
/// Absent priority sorts last.
pub fn priority_sort_key(req: &GpuRequirement) -> (std::cmp::Reverse<i32>, std::cmp::Reverse<u32>) {
    let priority = req.priority.unwrap_or(i32::MIN);
    (std::cmp::Reverse(priority), std::cmp::Reverse(req.total_gpus))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn container(gpus: u64) -> HashMap<String, u64> {
        let mut map = HashMap::new();
        map.insert(GPU_RESOURCE_KEY.to_string(), gpus);
        map
    }

    #[test]
    fn zero_gpu_workload_yields_none() {
        let workload = WorkloadSpec {
            name: "w".to_string(),
            containers: vec![container(0)],
            priority: None,
            locality_hint: None,
        };
        assert!(GpuRequirement::from_workload(&workload, DEFAULT_GPUS_PER_NODE).is_none());
    }

    #[test]
    fn sums_across_containers_and_rounds_up_nodes_needed() {
        let workload = WorkloadSpec {
            name: "w".to_string(),
            containers: vec![container(3), container(3)],
            priority: Some(5),
            locality_hint: None,
        };
        let req = GpuRequirement::from_workload(&workload, 4).unwrap();
        assert_eq!(req.total_gpus, 6);
        assert_eq!(req.nodes_needed, 2);
        assert_eq!(req.priority, Some(5));
    }

    #[test]
    fn missing_priority_sorts_last() {
        let with_priority = GpuRequirement {
            total_gpus: 1,
            nodes_needed: 1,
            priority: Some(10),
            locality_hint: None,
        };
        let without_priority = GpuRequirement {
            total_gpus: 1,
            nodes_needed: 1,
            priority: None,
            locality_hint: None,
        };
        let mut reqs = vec![without_priority.clone(), with_priority.clone()];
        reqs.sort_by_key(priority_sort_key);
        assert_eq!(reqs[0].priority, Some(10));
        assert_eq!(reqs[1].priority, None);
    }
}
