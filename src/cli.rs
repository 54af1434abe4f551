//! CLI surface.
//!
//! `clap`-derived argument parsing for the two binaries. Flags match the
//! external interface table verbatim; any flag not listed here is
//! rejected by `clap`'s default behavior.

use clap::Parser;

/// Arguments shared by `topology-scheduler` and `topology-controller`.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct ControllerArgs {
    /// Path to a kubeconfig. Only required if out-of-cluster.
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    /// The address of the orchestrator API server. Overrides any value
    /// in kubeconfig. Only required if out-of-cluster.
    #[arg(long, default_value = "")]
    pub master: String,
}

/// Arguments for `topology-scheduler`.
#[derive(Debug, Parser)]
#[command(author, version, about)]
pub struct SchedulerArgs {
    #[arg(long, default_value = "")]
    pub kubeconfig: String,

    #[arg(long, default_value = "")]
    pub master: String,

    /// Identifier this scheduler reports to the orchestrator.
    #[arg(long, default_value = "topology-aware-scheduler")]
    pub scheduler_name: String,

    /// Enable the lease-based leader election.
    #[arg(long, default_value_t = true)]
    pub leader_elect: bool,

    /// Name of the election lease lock object.
    #[arg(long, default_value = "topology-scheduler")]
    pub lock_object_name: String,

    /// Namespace of the election lease lock object.
    #[arg(long, default_value = "kube-system")]
    pub lock_object_namespace: String,
}
