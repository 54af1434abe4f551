//! `topology-controller` binary.
//!
//! Watches `TopologySchedulerConfig` and `DomainConfig` resources (via an
//! external collaborator not implemented in this crate) and translates
//! their events into topology-cache mutations through the controller
//! adapter. Also serves `/metrics`.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::mpsc;
use tracing::{info, warn};

use topology_scheduler::cli::ControllerArgs;
use topology_scheduler::config::TopologySchedulerConfig;
use topology_scheduler::context::SchedulerContext;
use topology_scheduler::controller::WatchEvent;
use topology_scheduler::metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = ControllerArgs::parse();
    info!(kubeconfig = %args.kubeconfig, master = %args.master, "starting topology controller");

    let ctx = match SchedulerContext::new(TopologySchedulerConfig::default()) {
        Ok(ctx) => Arc::new(ctx),
        Err(e) => {
            eprintln!("fatal: failed to build controller context: {e}");
            std::process::exit(1);
        }
    };
    ctx.leader_state.become_leader();

    let metrics_router = metrics::router(ctx.metrics.clone());
    let metrics_listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    let metrics_task = tokio::spawn(async move {
        if let Err(e) = axum::serve(metrics_listener, metrics_router).await {
            warn!(error = %e, "metrics server exited");
        }
    });

    // `node_events`/`domain_events` stand in for the per-stream watch
    // channels: one event-processing task per watch stream. The external
    // watch client feeds these in a real deployment.
    let (node_events, mut node_rx) = mpsc::channel::<WatchEvent>(1024);
    let (domain_events, mut domain_rx) = mpsc::channel::<WatchEvent>(1024);

    let node_ctx = ctx.clone();
    let node_task = tokio::spawn(async move {
        while let Some(event) = node_rx.recv().await {
            if node_ctx.leader_state.is_leader() {
                node_ctx.controller_adapter.apply_event(event);
            }
        }
    });

    let domain_ctx = ctx.clone();
    let domain_task = tokio::spawn(async move {
        while let Some(event) = domain_rx.recv().await {
            if domain_ctx.leader_state.is_leader() {
                domain_ctx.controller_adapter.apply_event(event);
            }
        }
    });
    drop(node_events);
    drop(domain_events);

    info!("controller ready");

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("shutdown signal received");
        }
    }

    metrics_task.abort();
    node_task.abort();
    domain_task.abort();
    Ok(())
}
