//! Domain types for the campaign journal.
//!
//! These types represent the persisted state of a patch campaign: the
//! operator's request, the campaign's lifecycle status, journaled step
//! outcomes, and the final per-cluster/per-host report. All types are
//! serializable to/from JSON for storage in redb tables.

use serde::{Deserialize, Serialize};

/// Unique identifier for a campaign.
pub type CampaignId = String;

// ── Campaign ──────────────────────────────────────────────────────

/// One fleet patch rollout request, as submitted by an operator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignSpec {
    /// Clusters to patch, in the order given. Duplicates are kept.
    pub target_clusters: Vec<String>,
    /// Number of hosts per cluster patched before the rest.
    #[serde(default)]
    pub pilot_host_count: u32,
    #[serde(default)]
    pub approver_emails: Vec<String>,
    pub requester_email: String,
    pub update_command: String,
    #[serde(default)]
    pub service_list: Vec<String>,
    #[serde(default)]
    pub pre_update_scripts: Vec<String>,
    #[serde(default)]
    pub post_update_scripts: Vec<String>,
    /// Where the shared credentials are fetched from.
    #[serde(default)]
    pub secret: SecretRef,
}

/// Reference to the secret store holding the fleet credentials.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SecretRef {
    pub vault_address: String,
    pub secret_path_prefix: String,
}

impl Default for SecretRef {
    fn default() -> Self {
        Self {
            vault_address: "https://vault.example.com:8200".to_string(),
            secret_path_prefix: "fleet/patch".to_string(),
        }
    }
}

/// Lifecycle status of a campaign.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CampaignStatus {
    Created,
    AwaitingApproval,
    FetchingCredentials,
    ProcessingClusters,
    /// Every cluster finished without a host failure.
    Completed,
    /// Fan-out finished but at least one cluster reported a failure.
    CompletedWithFailures,
    ApprovalTimedOut,
    /// A campaign-level step (credentials) failed.
    Failed,
    /// Aborted by an operator.
    Terminated,
}

impl CampaignStatus {
    /// Whether the campaign can no longer make progress.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Completed
                | Self::CompletedWithFailures
                | Self::ApprovalTimedOut
                | Self::Failed
                | Self::Terminated
        )
    }

    /// Whether the terminal state counts as a successful campaign.
    pub fn is_success(self) -> bool {
        self == Self::Completed
    }
}

/// Persisted state of one campaign.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignRecord {
    pub id: CampaignId,
    pub spec: CampaignSpec,
    pub status: CampaignStatus,
    /// Set by the approval signal. Never reset once true.
    pub approved: bool,
    /// Absolute approval deadline (unix millis), fixed when the gate opens.
    pub approval_deadline_ms: Option<u64>,
    /// Final report, present once fan-out has finished.
    pub report: Option<CampaignReport>,
    /// Reason for a `Failed`, `ApprovalTimedOut` or `Terminated` status.
    pub failure: Option<String>,
    /// Unix timestamp (seconds) when the campaign was created.
    pub created_at: u64,
    /// Unix timestamp (seconds) of the last status change.
    pub updated_at: u64,
}

impl CampaignRecord {
    /// A fresh record in the `Created` state.
    pub fn new(id: &str, spec: CampaignSpec, now: u64) -> Self {
        Self {
            id: id.to_string(),
            spec,
            status: CampaignStatus::Created,
            approved: false,
            approval_deadline_ms: None,
            report: None,
            failure: None,
            created_at: now,
            updated_at: now,
        }
    }
}

// ── Steps ─────────────────────────────────────────────────────────

/// How a journaled step ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    /// Every attempt allowed by the retry policy failed.
    Exhausted,
    /// A failure marked non-retryable cut the attempts short.
    NonRetryable,
    /// The operation rejected its input; never retried.
    HardFault,
}

/// Write-ahead log entry for one step invocation.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepRecord {
    /// Operation name, e.g. `perform_update`.
    pub step: String,
    pub status: StepStatus,
    /// JSON output of a completed step.
    pub output: Option<serde_json::Value>,
    /// Last error of a failed step.
    pub error: Option<String>,
    pub attempts: u32,
    /// Unix timestamp (millis) when the outcome was recorded.
    pub recorded_at: u64,
}

// ── Reports ───────────────────────────────────────────────────────

/// Terminal outcome of one host's rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum HostOutcome {
    Succeeded,
    /// Preconditions not met; the host was skipped without patching.
    Ineligible,
    /// A step failed and the host's remaining steps were abandoned.
    Failed { step: String, error: String },
}

/// Per-host result inside a cluster report.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HostReport {
    pub host: String,
    pub outcome: HostOutcome,
    /// Steps completed for this host, in execution order.
    pub steps: Vec<String>,
}

/// Aggregate status of one cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    Succeeded,
    Failed,
}

/// Result of one cluster rollout.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterReport {
    pub cluster: String,
    /// Position of the cluster in the campaign's target list.
    pub position: usize,
    pub status: ClusterStatus,
    pub hosts: Vec<HostReport>,
    /// Hosts never started because an earlier group failed.
    pub skipped_hosts: Vec<String>,
    /// First failure observed in the cluster, if any.
    pub first_failure: Option<String>,
}

/// Result of the whole campaign fan-out.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CampaignReport {
    pub clusters: Vec<ClusterReport>,
    pub final_notification_sent: bool,
}

impl CampaignReport {
    /// Whether any cluster reported a failure.
    pub fn has_failures(&self) -> bool {
        self.clusters
            .iter()
            .any(|c| c.status == ClusterStatus::Failed)
    }

    /// Count hosts per outcome: (succeeded, ineligible, failed).
    pub fn host_counts(&self) -> (usize, usize, usize) {
        let mut counts = (0, 0, 0);
        for host in self.clusters.iter().flat_map(|c| &c.hosts) {
            match host.outcome {
                HostOutcome::Succeeded => counts.0 += 1,
                HostOutcome::Ineligible => counts.1 += 1,
                HostOutcome::Failed { .. } => counts.2 += 1,
            }
        }
        counts
    }
}
