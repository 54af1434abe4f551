//! Configuration resources.
//!
//! Typed representations of the `TopologySchedulerConfig` and
//! `DomainConfig` custom resources. The wire format is irrelevant to the
//! core (the orchestrator API client owns the CRD machinery); this crate
//! treats both as plain serde structs loaded from YAML, following the
//! configuration-loading convention used elsewhere in the workspace.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::placement::StrategyBounds;
use crate::scorer::ScoringWeights;
use crate::topology::DomainKind;
use crate::workload::DEFAULT_GPUS_PER_NODE;

/// Strategy threshold bounds, as carried on `TopologySchedulerConfig`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct StrategyBoundsConfig {
    pub single_domain_max: u32,
    pub complete_domain: u32,
    pub adjacent_max: u32,
}

impl Default for StrategyBoundsConfig {
    fn default() -> Self {
        let defaults = StrategyBounds::default();
        Self {
            single_domain_max: defaults.single_domain_max,
            complete_domain: defaults.complete_domain,
            adjacent_max: defaults.adjacent_max,
        }
    }
}

impl From<StrategyBoundsConfig> for StrategyBounds {
    fn from(c: StrategyBoundsConfig) -> Self {
        Self {
            single_domain_max: c.single_domain_max,
            complete_domain: c.complete_domain,
            adjacent_max: c.adjacent_max,
        }
    }
}

/// Scorer weights, as carried on `TopologySchedulerConfig`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WeightsConfig {
    pub resource: f64,
    pub topology: f64,
    pub utilization: f64,
    pub historical: f64,
}

impl Default for WeightsConfig {
    fn default() -> Self {
        let defaults = ScoringWeights::default();
        Self {
            resource: defaults.resource,
            topology: defaults.topology,
            utilization: defaults.utilization,
            historical: defaults.historical,
        }
    }
}

impl From<WeightsConfig> for ScoringWeights {
    fn from(c: WeightsConfig) -> Self {
        Self {
            resource: c.resource,
            topology: c.topology,
            utilization: c.utilization,
            historical: c.historical,
        }
    }
}

fn default_gpus_per_node() -> u32 {
    DEFAULT_GPUS_PER_NODE
}

fn default_monitor_interval_secs() -> u64 {
    15
}

fn default_recovery_coalesce_secs() -> u64 {
    30
}

/// `TopologySchedulerConfig`: the scheduler's own tunables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopologySchedulerConfig {
    #[serde(default = "default_gpus_per_node")]
    pub gpus_per_node: u32,
    #[serde(default)]
    pub strategy_bounds: StrategyBoundsConfig,
    #[serde(default)]
    pub weights: WeightsConfig,
    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,
    #[serde(default = "default_recovery_coalesce_secs")]
    pub recovery_coalesce_secs: u64,
}

impl Default for TopologySchedulerConfig {
    fn default() -> Self {
        Self {
            gpus_per_node: default_gpus_per_node(),
            strategy_bounds: StrategyBoundsConfig::default(),
            weights: WeightsConfig::default(),
            monitor_interval_secs: default_monitor_interval_secs(),
            recovery_coalesce_secs: default_recovery_coalesce_secs(),
        }
    }
}

impl TopologySchedulerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_secs(self.monitor_interval_secs)
    }

    pub fn recovery_coalesce(&self) -> Duration {
        Duration::from_secs(self.recovery_coalesce_secs)
    }

    /// Load from a YAML or JSON file on disk, dispatching on extension
    /// (`.json` parses as JSON; anything else as YAML, the more common
    /// format for this kind of resource).
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("reading {}: {}", path.display(), e)))?;
        if path.extension().and_then(|e| e.to_str()) == Some("json") {
            serde_json::from_str(&data).map_err(|e| Error::Internal(format!("parsing {}: {}", path.display(), e)))
        } else {
            serde_yaml::from_str(&data).map_err(|e| Error::Internal(format!("parsing {}: {}", path.display(), e)))
        }
    }
}

/// `DomainConfig`: one leaf or spine domain's static topology description.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfigResource {
    pub name: String,
    pub kind: DomainKind,
    #[serde(default)]
    pub member_nodes: Vec<String>,
    #[serde(default)]
    pub parent: Option<String>,
    #[serde(default)]
    pub bandwidth_gbps: u32,
    #[serde(default)]
    pub latency_us: u32,
    #[serde(default)]
    pub adjacent_domains: Vec<String>,
}

impl DomainConfigResource {
    /// Load a list of domain configs from a YAML file on disk.
    pub fn load_all(path: impl AsRef<Path>) -> Result<Vec<Self>> {
        let path = path.as_ref();
        let data = std::fs::read_to_string(path)
            .map_err(|e| Error::Internal(format!("reading {}: {}", path.display(), e)))?;
        serde_yaml::from_str(&data)
            .map_err(|e| Error::Internal(format!("parsing {}: {}", path.display(), e)))
    }
}
