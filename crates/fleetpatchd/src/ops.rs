//! Simulated remote operations.
//!
//! Stands in for the real fleet: every call sleeps for a jittered latency
//! and then succeeds, except where the `[simulation]` section injects
//! faults. Faults are keyed on the attempt number so retries recover.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashSet;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use async_trait::async_trait;
use fleetpatch_saga::StepKind;
use fleetpatch_saga::ops::*;
use tracing::{debug, info};

use crate::config::{SimulationConfig, parse_duration};

const UPDATE_CHUNKS: u32 = 4;

pub struct SimulatedOps {
    hosts_per_cluster: u32,
    latency: Duration,
    ineligible: HashSet<String>,
    flaky_clusters: HashSet<String>,
    flaky_hosts: HashSet<String>,
    broken_hosts: HashSet<String>,
}

impl SimulatedOps {
    pub fn new(config: &SimulationConfig) -> anyhow::Result<Self> {
        let latency = parse_duration(&config.latency).ok_or_else(|| {
            anyhow::anyhow!("simulation.latency: invalid duration {:?}", config.latency)
        })?;
        Ok(Self {
            hosts_per_cluster: config.hosts_per_cluster,
            latency,
            ineligible: config.ineligible_hosts.iter().cloned().collect(),
            flaky_clusters: config.flaky_clusters.iter().cloned().collect(),
            flaky_hosts: config.flaky_hosts.iter().cloned().collect(),
            broken_hosts: config.broken_hosts.iter().cloned().collect(),
        })
    }

    /// Latency between 50% and 150% of the base, stable per call site.
    fn jitter(&self, step: StepKind, target: &str, attempt: u32) -> Duration {
        let mut hasher = DefaultHasher::new();
        (step.name(), target, attempt).hash(&mut hasher);
        let factor = 0.5 + (hasher.finish() % 1000) as f64 / 1000.0;
        self.latency.mul_f64(factor)
    }

    async fn simulate(&self, step: StepKind, target: &str, ctx: &AttemptContext) {
        let delay = self.jitter(step, target, ctx.attempt);
        debug!(%step, target, attempt = ctx.attempt, ?delay, "simulating remote call");
        tokio::time::sleep(delay).await;
    }
}

#[async_trait]
impl RemoteOps for SimulatedOps {
    async fn send_approval_request(
        &self,
        ctx: AttemptContext,
        req: ApprovalRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::SendApprovalRequest, &req.campaign_id, &ctx)
            .await;
        info!(
            campaign = %req.campaign_id,
            approvers = ?req.approver_emails,
            clusters = ?req.target_clusters,
            "approval request sent"
        );
        Ok(())
    }

    async fn fetch_credentials(
        &self,
        ctx: AttemptContext,
        req: CredentialRequest,
    ) -> OpResult<Credentials> {
        self.simulate(StepKind::FetchCredentials, &req.secret_path_prefix, &ctx)
            .await;
        Ok(Credentials {
            address: req.vault_address,
            token: format!("sim-{}", req.secret_path_prefix.replace('/', "-")),
        })
    }

    async fn get_cluster_hosts(
        &self,
        ctx: AttemptContext,
        req: ClusterHostsRequest,
    ) -> OpResult<ClusterHosts> {
        self.simulate(StepKind::GetClusterHosts, &req.cluster, &ctx)
            .await;
        if ctx.attempt == 1 && self.flaky_clusters.contains(&req.cluster) {
            return Err(OpError::transient(
                "InventoryUnavailable",
                format!("inventory for {} did not answer", req.cluster),
            ));
        }
        let hostnames = (1..=self.hosts_per_cluster)
            .map(|i| format!("{}_host{i}", req.cluster))
            .collect();
        Ok(ClusterHosts { hostnames })
    }

    async fn check_host_preconditions(
        &self,
        ctx: AttemptContext,
        target: HostTarget,
    ) -> OpResult<PreconditionReport> {
        self.simulate(StepKind::CheckHostPreconditions, &target.hostname, &ctx)
            .await;
        if self.ineligible.contains(&target.hostname) {
            return Ok(PreconditionReport {
                preconditions_met: false,
                reason: Some("host is pinned by a change freeze".to_string()),
            });
        }
        Ok(PreconditionReport {
            preconditions_met: true,
            reason: None,
        })
    }

    async fn run_pre_downtime_scripts(
        &self,
        ctx: AttemptContext,
        target: HostTarget,
    ) -> OpResult<()> {
        self.simulate(StepKind::RunPreDowntimeScripts, &target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn set_maintenance_mode(&self, ctx: AttemptContext, target: HostTarget) -> OpResult<()> {
        self.simulate(StepKind::SetMaintenanceMode, &target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn stop_services(&self, ctx: AttemptContext, req: ServiceRequest) -> OpResult<()> {
        self.simulate(StepKind::StopServices, &req.target.hostname, &ctx)
            .await;
        debug!(host = %req.target.hostname, services = ?req.services, "services stopped");
        Ok(())
    }

    async fn wait_for_workload_drain(
        &self,
        ctx: AttemptContext,
        target: HostTarget,
    ) -> OpResult<()> {
        self.simulate(StepKind::WaitForWorkloadDrain, &target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn run_pre_update_scripts(
        &self,
        ctx: AttemptContext,
        req: ScriptRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::RunPreUpdateScripts, &req.target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn perform_update(&self, ctx: AttemptContext, req: UpdateRequest) -> OpResult<()> {
        let host = req.target.hostname.as_str();
        if self.broken_hosts.contains(host) {
            self.simulate(StepKind::PerformUpdate, host, &ctx).await;
            return Err(OpError::non_retryable(
                "PackageConflict",
                format!("{}: dependency resolution failed", req.update_command),
            ));
        }

        // Resume after the last chunk a previous attempt reported.
        let start = ctx
            .last_heartbeat_details
            .as_deref()
            .and_then(|d| d.split('/').next())
            .and_then(|n| n.parse::<u32>().ok())
            .unwrap_or(0);
        let chunk = self.jitter(StepKind::PerformUpdate, host, ctx.attempt) / UPDATE_CHUNKS;
        for done in start..UPDATE_CHUNKS {
            ctx.heartbeat.beat();
            tokio::time::sleep(chunk).await;
            ctx.heartbeat.record(format!("{}/{UPDATE_CHUNKS}", done + 1));
        }
        debug!(host, command = %req.update_command, resumed_from = start, "update applied");
        Ok(())
    }

    async fn start_services(&self, ctx: AttemptContext, req: ServiceRequest) -> OpResult<()> {
        self.simulate(StepKind::StartServices, &req.target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn run_post_update_scripts(
        &self,
        ctx: AttemptContext,
        req: ScriptRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::RunPostUpdateScripts, &req.target.hostname, &ctx)
            .await;
        Ok(())
    }

    async fn check_service_health(
        &self,
        ctx: AttemptContext,
        req: ServiceRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::CheckServiceHealth, &req.target.hostname, &ctx)
            .await;
        if ctx.attempt == 1 && self.flaky_hosts.contains(&req.target.hostname) {
            return Err(OpError::transient(
                "ServiceWarmingUp",
                format!("{} services not yet healthy", req.target.hostname),
            ));
        }
        Ok(())
    }

    async fn send_success_notification(
        &self,
        ctx: AttemptContext,
        req: NotificationRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::SendSuccessNotification, &req.hostname, &ctx)
            .await;
        info!(host = %req.hostname, to = %req.requester_email, "host patched notification sent");
        Ok(())
    }

    async fn send_failure_alert(&self, ctx: AttemptContext, req: AlertRequest) -> OpResult<()> {
        self.simulate(StepKind::SendFailureAlert, &req.hostname, &ctx)
            .await;
        info!(
            host = %req.hostname,
            to = %req.requester_email,
            details = %req.failure_details,
            "failure alert sent"
        );
        Ok(())
    }

    async fn send_final_notification(
        &self,
        ctx: AttemptContext,
        req: FinalNotificationRequest,
    ) -> OpResult<()> {
        self.simulate(StepKind::SendFinalNotification, &req.campaign_id, &ctx)
            .await;
        info!(campaign = %req.campaign_id, summary = %req.summary, "final notification sent");
        Ok(())
    }
}
