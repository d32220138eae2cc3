use std::{net::SocketAddr, time::Duration};

use clap::{Parser, ValueEnum};

use crate::controllers::controller::ReconcileConfig;

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, ValueEnum)]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

/// Fleet extension manager - deploys registered extensions to fleet members
#[derive(Parser, Clone, Debug)]
#[command(name = "fleet-extension-manager", version, about, long_about = None)]
pub struct ControllerConfig {
    /// Print the CRD manifests and exit
    #[arg(long)]
    pub crd: bool,

    /// Identity of this fleet, injected into rendered charts
    #[arg(long, env = "FLEET_IDENTITY", default_value = "")]
    pub fleet_identity: String,

    /// Only handle deployment bindings targeting this member
    #[arg(long, env = "MEMBER_NAME")]
    pub member_name: Option<String>,

    /// Namespace on members receiving artifact secrets and managed artifacts
    #[arg(long, env = "ARTIFACT_NAMESPACE", default_value = "fleet-system")]
    pub artifact_namespace: String,

    #[arg(long, env = "MEMBER_WORKERS", default_value_t = 5)]
    pub member_workers: usize,

    #[arg(long, env = "REGISTRATION_WORKERS", default_value_t = 5)]
    pub registration_workers: usize,

    #[arg(long, env = "BINDING_WORKERS", default_value_t = 5)]
    pub binding_workers: usize,

    /// Interval between periodic member resyncs
    #[arg(long, env = "MEMBER_RESYNC_SECS", default_value_t = 30)]
    pub member_resync_secs: u64,

    #[arg(long, env = "BACKUP_POLL_SECS", default_value_t = 5)]
    pub backup_poll_secs: u64,

    /// How long one pass waits for a backup bucket to disappear
    #[arg(long, env = "BACKUP_TIMEOUT_SECS", default_value_t = 30)]
    pub backup_timeout_secs: u64,

    /// Interval at which shutdown checks for drained queues
    #[arg(long, env = "SHUTDOWN_POLL_SECS", default_value_t = 5)]
    pub shutdown_poll_secs: u64,

    #[arg(long, env = "LOG_FORMAT", value_enum, default_value_t = LogFormat::Compact)]
    pub log_format: LogFormat,

    #[arg(long, env = "METRICS_ADDR", default_value = "0.0.0.0:8443")]
    pub metrics_addr: SocketAddr,
}

impl ControllerConfig {
    pub fn reconcile_config(&self) -> ReconcileConfig {
        ReconcileConfig {
            fleet_identity: self.fleet_identity.clone(),
            artifact_namespace: self.artifact_namespace.clone(),
            member_resync: Duration::from_secs(self.member_resync_secs),
            backup_poll_interval: Duration::from_secs(self.backup_poll_secs),
            backup_timeout: Duration::from_secs(self.backup_timeout_secs),
        }
    }

    pub fn shutdown_poll(&self) -> Duration {
        Duration::from_secs(self.shutdown_poll_secs)
    }
}
