//! Metrics collector.
//!
//! Registers the counter/gauge/histogram surface consumed by the topology
//! cache, domain monitor, scorer, and placement engine, and serves it at
//! `/metrics` through an `axum` router.

use std::sync::Arc;

use axum::{routing::get, Router};
use prometheus::{
    CounterVec, Encoder, GaugeVec, HistogramVec, Opts, Registry, TextEncoder,
};

use crate::error::{Error, Result};

/// Holds every registered metric and the registry they're bound to.
pub struct MetricsCollector {
    registry: Registry,

    scheduling_latency: HistogramVec,
    placement_scores: HistogramVec,

    scheduling_attempts: CounterVec,
    scheduling_success: CounterVec,
    scheduling_errors: CounterVec,
    placement_decisions: CounterVec,

    domain_utilization: GaugeVec,
    gpu_utilization: GaugeVec,
    domain_fragmentation: GaugeVec,
    node_gpu_allocated: GaugeVec,
    node_health_status: GaugeVec,
}

impl MetricsCollector {
    /// Build and register every metric against a fresh registry.
    pub fn new() -> Result<Self> {
        let registry = Registry::new();

        let scheduling_latency = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "topology_scheduler_latency_seconds",
                "Latency of a scheduling decision, by strategy",
            )
            .buckets(prometheus::exponential_buckets(0.001, 2.0, 12).unwrap()),
            &["strategy"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let placement_scores = HistogramVec::new(
            prometheus::HistogramOpts::new(
                "topology_placement_scores",
                "Distribution of placement scores, by strategy",
            )
            .buckets(prometheus::linear_buckets(0.0, 0.1, 11).unwrap()),
            &["strategy"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let scheduling_attempts = CounterVec::new(
            Opts::new("topology_scheduler_attempts_total", "Scheduling attempts, by strategy"),
            &["strategy"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let scheduling_success = CounterVec::new(
            Opts::new("topology_scheduler_success_total", "Successful placements, by strategy"),
            &["strategy"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let scheduling_errors = CounterVec::new(
            Opts::new("topology_scheduler_errors_total", "Scheduler errors, by type"),
            &["type"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let placement_decisions = CounterVec::new(
            Opts::new(
                "topology_placement_decisions_total",
                "Placement decisions, by strategy and result",
            ),
            &["strategy", "result"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let domain_utilization = GaugeVec::new(
            Opts::new("topology_domain_utilization_ratio", "Domain GPU utilization ratio"),
            &["domain"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let gpu_utilization = GaugeVec::new(
            Opts::new("topology_gpu_utilization_ratio", "Domain GPU utilization ratio"),
            &["domain"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let domain_fragmentation = GaugeVec::new(
            Opts::new("topology_domain_fragmentation_ratio", "Domain fragmentation ratio"),
            &["domain"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let node_gpu_allocated = GaugeVec::new(
            Opts::new("topology_node_gpu_allocated", "GPUs currently allocated on a node"),
            &["node", "domain"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        let node_health_status = GaugeVec::new(
            Opts::new("topology_node_health_status", "Node health status, 1 = healthy"),
            &["node", "domain"],
        )
        .map_err(|e| Error::Internal(e.to_string()))?;

        for collector in [
            Box::new(scheduling_latency.clone()) as Box<dyn prometheus::core::Collector>,
            Box::new(placement_scores.clone()),
            Box::new(scheduling_attempts.clone()),
            Box::new(scheduling_success.clone()),
            Box::new(scheduling_errors.clone()),
            Box::new(placement_decisions.clone()),
            Box::new(domain_utilization.clone()),
            Box::new(gpu_utilization.clone()),
            Box::new(domain_fragmentation.clone()),
            Box::new(node_gpu_allocated.clone()),
            Box::new(node_health_status.clone()),
        ] {
            registry
                .register(collector)
                .map_err(|e| Error::Internal(e.to_string()))?;
        }

        Ok(Self {
            registry,
            scheduling_latency,
            placement_scores,
            scheduling_attempts,
            scheduling_success,
            scheduling_errors,
            placement_decisions,
            domain_utilization,
            gpu_utilization,
            domain_fragmentation,
            node_gpu_allocated,
            node_health_status,
        })
    }

    pub fn observe_latency(&self, strategy: &str, seconds: f64) {
        self.scheduling_latency.with_label_values(&[strategy]).observe(seconds);
    }

    pub fn observe_score(&self, strategy: &str, score: f64) {
        self.placement_scores.with_label_values(&[strategy]).observe(score);
    }

    pub fn inc_attempt(&self, strategy: &str) {
        self.scheduling_attempts.with_label_values(&[strategy]).inc();
    }

    pub fn inc_success(&self, strategy: &str) {
        self.scheduling_success.with_label_values(&[strategy]).inc();
    }

    pub fn inc_error(&self, error_type: &str) {
        self.scheduling_errors.with_label_values(&[error_type]).inc();
    }

    pub fn inc_decision(&self, strategy: &str, result: &str) {
        self.placement_decisions.with_label_values(&[strategy, result]).inc();
    }

    pub fn set_domain_utilization(&self, domain: &str, value: f64) {
        self.domain_utilization.with_label_values(&[domain]).set(value);
    }

    pub fn set_gpu_utilization(&self, domain: &str, value: f64) {
        self.gpu_utilization.with_label_values(&[domain]).set(value);
    }

    pub fn set_domain_fragmentation(&self, domain: &str, value: f64) {
        self.domain_fragmentation.with_label_values(&[domain]).set(value);
    }

    pub fn set_node_allocation(&self, node: &str, domain: &str, value: f64) {
        self.node_gpu_allocated.with_label_values(&[node, domain]).set(value);
    }

    pub fn set_node_health(&self, node: &str, domain: &str, value: f64) {
        self.node_health_status.with_label_values(&[node, domain]).set(value);
    }

    /// Encode the registry in Prometheus text exposition format.
    pub fn gather(&self) -> Result<String> {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| Error::Internal(e.to_string()))?;
        String::from_utf8(buffer).map_err(|e| Error::Internal(e.to_string()))
    }
}

async fn metrics_handler(
    axum::extract::State(metrics): axum::extract::State<Arc<MetricsCollector>>,
) -> Result<String, (axum::http::StatusCode, String)> {
    metrics
        .gather()
        .map_err(|e| (axum::http::StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}

/// The `/metrics` router, served on port 8080 per the external interface.
pub fn router(metrics: Arc<MetricsCollector>) -> Router {
    Router::new().route("/metrics", get(metrics_handler)).with_state(metrics)
}
