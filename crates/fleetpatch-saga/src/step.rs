//! Step vocabulary — the named remote operations and their journal keys.

use std::fmt;

use serde::{Deserialize, Serialize};

/// One remote operation the saga can invoke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKind {
    SendApprovalRequest,
    FetchCredentials,
    GetClusterHosts,
    CheckHostPreconditions,
    RunPreDowntimeScripts,
    SetMaintenanceMode,
    StopServices,
    WaitForWorkloadDrain,
    RunPreUpdateScripts,
    PerformUpdate,
    StartServices,
    RunPostUpdateScripts,
    CheckServiceHealth,
    SendSuccessNotification,
    SendFailureAlert,
    SendFinalNotification,
}

impl StepKind {
    /// Every step kind, in rollout order.
    pub const ALL: [StepKind; 16] = [
        StepKind::SendApprovalRequest,
        StepKind::FetchCredentials,
        StepKind::GetClusterHosts,
        StepKind::CheckHostPreconditions,
        StepKind::RunPreDowntimeScripts,
        StepKind::SetMaintenanceMode,
        StepKind::StopServices,
        StepKind::WaitForWorkloadDrain,
        StepKind::RunPreUpdateScripts,
        StepKind::PerformUpdate,
        StepKind::StartServices,
        StepKind::RunPostUpdateScripts,
        StepKind::CheckServiceHealth,
        StepKind::SendSuccessNotification,
        StepKind::SendFailureAlert,
        StepKind::SendFinalNotification,
    ];

    /// Stable snake_case name, used in journal keys and config sections.
    pub fn name(self) -> &'static str {
        match self {
            StepKind::SendApprovalRequest => "send_approval_request",
            StepKind::FetchCredentials => "fetch_credentials",
            StepKind::GetClusterHosts => "get_cluster_hosts",
            StepKind::CheckHostPreconditions => "check_host_preconditions",
            StepKind::RunPreDowntimeScripts => "run_pre_downtime_scripts",
            StepKind::SetMaintenanceMode => "set_maintenance_mode",
            StepKind::StopServices => "stop_services",
            StepKind::WaitForWorkloadDrain => "wait_for_workload_drain",
            StepKind::RunPreUpdateScripts => "run_pre_update_scripts",
            StepKind::PerformUpdate => "perform_update",
            StepKind::StartServices => "start_services",
            StepKind::RunPostUpdateScripts => "run_post_update_scripts",
            StepKind::CheckServiceHealth => "check_service_health",
            StepKind::SendSuccessNotification => "send_success_notification",
            StepKind::SendFailureAlert => "send_failure_alert",
            StepKind::SendFinalNotification => "send_final_notification",
        }
    }

    /// Look up a step kind by its snake_case name.
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|k| k.name() == name)
    }
}

impl fmt::Display for StepKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Where a step runs: campaign-wide, inside a cluster, or on one host.
///
/// Positions are part of the scope so that a cluster listed twice in the
/// target list, or a hostname returned twice by discovery, gets distinct
/// journal keys.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StepScope {
    Campaign,
    Cluster {
        position: usize,
        cluster: String,
    },
    Host {
        cluster_position: usize,
        cluster: String,
        position: usize,
        host: String,
    },
}

impl StepScope {
    pub fn cluster(position: usize, cluster: &str) -> Self {
        Self::Cluster {
            position,
            cluster: cluster.to_string(),
        }
    }

    /// Scope of a host inside this cluster scope.
    ///
    /// Only meaningful on a `Cluster` scope; other scopes yield a host scope
    /// at cluster position 0.
    pub fn host(&self, position: usize, host: &str) -> Self {
        let (cluster_position, cluster) = match self {
            Self::Cluster { position, cluster } => (*position, cluster.clone()),
            Self::Host {
                cluster_position,
                cluster,
                ..
            } => (*cluster_position, cluster.clone()),
            Self::Campaign => (0, String::new()),
        };
        Self::Host {
            cluster_position,
            cluster,
            position,
            host: host.to_string(),
        }
    }

    /// Path prefix for journal keys (empty for the campaign scope).
    pub fn path(&self) -> String {
        match self {
            Self::Campaign => String::new(),
            Self::Cluster { position, cluster } => format!("clusters/{position}:{cluster}"),
            Self::Host {
                cluster_position,
                cluster,
                position,
                host,
            } => format!("clusters/{cluster_position}:{cluster}/hosts/{position}:{host}"),
        }
    }

    /// Journal key of `kind` run in this scope.
    pub fn key(&self, kind: StepKind) -> StepKey {
        self.key_for(kind.name())
    }

    /// Journal key of an arbitrary marker in this scope.
    pub fn key_for(&self, leaf: &str) -> StepKey {
        match self {
            Self::Campaign => StepKey(leaf.to_string()),
            _ => StepKey(format!("{}/{leaf}", self.path())),
        }
    }
}

/// Campaign-unique key of one step invocation in the journal.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct StepKey(String);

impl StepKey {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}
