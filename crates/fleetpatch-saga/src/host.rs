//! Host rollout state machine.
//!
//! One host moves through a fixed sequence of phases. The precondition check
//! decides between patching and skipping; every later step either advances
//! the phase or aborts the host. A host's outcome is assigned exactly once.
//!
//! ```text
//! Start ─► PreconditionsChecked ─┬─► Ineligible            (alert, skip)
//!                                └─► DowntimePrepared ─► … ─► HealthVerified ─► Succeeded
//!                                          │                        │
//!                                          └──── any failure ───────┴─► Aborted (alert)
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use fleetpatch_state::{HostOutcome, HostReport};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::context::SagaContext;
use crate::error::{StepError, StepResult};
use crate::ops::{
    AlertRequest, AttemptContext, HostTarget, NotificationRequest, OpError, OpResult,
    PreconditionReport, ScriptRequest, ServiceRequest, UpdateRequest,
};
use crate::progress::Milestone;
use crate::step::{StepKind, StepScope};

/// Where a host is in its rollout.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HostPhase {
    Start,
    PreconditionsChecked,
    Ineligible,
    DowntimePrepared,
    MaintenanceSet,
    ServicesStopped,
    WorkloadDrained,
    PreUpdateReady,
    Updated,
    ServicesStarted,
    PostUpdateDone,
    HealthVerified,
    Succeeded,
    Aborted,
}

impl HostPhase {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Ineligible | Self::Succeeded | Self::Aborted)
    }
}

/// The patch steps after the precondition check, with the phase each one
/// leads to.
pub const PATCH_SEQUENCE: [(StepKind, HostPhase); 9] = [
    (StepKind::RunPreDowntimeScripts, HostPhase::DowntimePrepared),
    (StepKind::SetMaintenanceMode, HostPhase::MaintenanceSet),
    (StepKind::StopServices, HostPhase::ServicesStopped),
    (StepKind::WaitForWorkloadDrain, HostPhase::WorkloadDrained),
    (StepKind::RunPreUpdateScripts, HostPhase::PreUpdateReady),
    (StepKind::PerformUpdate, HostPhase::Updated),
    (StepKind::StartServices, HostPhase::ServicesStarted),
    (StepKind::RunPostUpdateScripts, HostPhase::PostUpdateDone),
    (StepKind::CheckServiceHealth, HostPhase::HealthVerified),
];

/// Per-host rollout state.
#[derive(Debug, Clone)]
pub struct HostTask {
    hostname: String,
    phase: HostPhase,
    steps: Vec<String>,
    outcome: Option<HostOutcome>,
}

impl HostTask {
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_string(),
            phase: HostPhase::Start,
            steps: Vec::new(),
            outcome: None,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn phase(&self) -> HostPhase {
        self.phase
    }

    pub fn outcome(&self) -> Option<&HostOutcome> {
        self.outcome.as_ref()
    }

    fn advance(&mut self, step: StepKind, phase: HostPhase) {
        self.steps.push(step.name().to_string());
        self.phase = phase;
    }

    /// Assign the terminal outcome. Returns false if one was already set.
    pub fn conclude(&mut self, phase: HostPhase, outcome: HostOutcome) -> bool {
        if self.outcome.is_some() {
            return false;
        }
        self.phase = phase;
        self.outcome = Some(outcome);
        true
    }

    pub fn report(&self) -> HostReport {
        HostReport {
            host: self.hostname.clone(),
            outcome: self.outcome.clone().unwrap_or(HostOutcome::Failed {
                step: String::new(),
                error: "rollout did not finish".to_string(),
            }),
            steps: self.steps.clone(),
        }
    }
}

/// A host that was aborted by a failed step.
#[derive(Debug, Error)]
#[error("host {host} aborted at {step}: {source}")]
pub struct HostFailure {
    pub host: String,
    pub step: String,
    pub report: HostReport,
    pub source: StepError,
}

type OpFuture = Pin<Box<dyn Future<Output = OpResult<()>> + Send>>;

/// Drives one host through its rollout.
pub struct HostRollout {
    ctx: Arc<SagaContext>,
    cluster: String,
    scope: StepScope,
    task: HostTask,
}

impl HostRollout {
    /// `cluster_scope` is the scope of the owning cluster; `position` is the
    /// host's index in the discovered host list.
    pub fn new(
        ctx: Arc<SagaContext>,
        cluster: &str,
        cluster_scope: &StepScope,
        position: usize,
        hostname: &str,
    ) -> Self {
        Self {
            ctx,
            cluster: cluster.to_string(),
            scope: cluster_scope.host(position, hostname),
            task: HostTask::new(hostname),
        }
    }

    pub async fn run(mut self) -> Result<HostReport, HostFailure> {
        let host = self.task.hostname().to_string();
        info!(campaign = %self.ctx.campaign_id(), cluster = %self.cluster, %host, "host rollout started");
        let target = self.ctx.target(&host);

        let key = self.scope.key(StepKind::CheckHostPreconditions);
        let ops = self.ctx.ops.clone();
        let host_target = target.clone();
        let checked: StepResult<PreconditionReport> = self
            .ctx
            .executor
            .execute(&key, StepKind::CheckHostPreconditions, move |attempt| {
                let ops = ops.clone();
                let host_target = host_target.clone();
                async move { ops.check_host_preconditions(attempt, host_target).await }
            })
            .await;
        let preconditions = match checked {
            Ok(report) => report,
            Err(error) => return self.abort(StepKind::CheckHostPreconditions, error).await,
        };
        self.task
            .advance(StepKind::CheckHostPreconditions, HostPhase::PreconditionsChecked);

        if !preconditions.preconditions_met {
            let reason = preconditions
                .reason
                .unwrap_or_else(|| "preconditions not met".to_string());
            info!(campaign = %self.ctx.campaign_id(), cluster = %self.cluster, %host, %reason, "host ineligible, skipping");
            self.alert(format!("host ineligible: {reason}")).await;
            self.task.conclude(HostPhase::Ineligible, HostOutcome::Ineligible);
            return Ok(self.finish());
        }

        for (kind, phase) in PATCH_SEQUENCE {
            let key = self.scope.key(kind);
            let result: StepResult<()> = self
                .ctx
                .executor
                .execute(&key, kind, self.patch_op(kind, target.clone()))
                .await;
            if let Err(error) = result {
                return self.abort(kind, error).await;
            }
            self.task.advance(kind, phase);
            debug!(%host, step = %kind, phase = ?phase, "host step done");
        }

        self.notify_success().await;
        self.task.conclude(HostPhase::Succeeded, HostOutcome::Succeeded);
        info!(campaign = %self.ctx.campaign_id(), cluster = %self.cluster, %host, "host patched");
        Ok(self.finish())
    }

    /// Build the per-attempt invocation of a patch step.
    fn patch_op(
        &self,
        kind: StepKind,
        target: HostTarget,
    ) -> impl Fn(AttemptContext) -> OpFuture + Send + Sync + 'static {
        let ops = self.ctx.ops.clone();
        let spec = self.ctx.spec.clone();
        move |attempt| {
            let ops = ops.clone();
            let spec = spec.clone();
            let target = target.clone();
            Box::pin(async move {
                match kind {
                    StepKind::RunPreDowntimeScripts => {
                        ops.run_pre_downtime_scripts(attempt, target).await
                    }
                    StepKind::SetMaintenanceMode => ops.set_maintenance_mode(attempt, target).await,
                    StepKind::StopServices => {
                        let req = ServiceRequest {
                            target,
                            services: spec.service_list.clone(),
                        };
                        ops.stop_services(attempt, req).await
                    }
                    StepKind::WaitForWorkloadDrain => {
                        ops.wait_for_workload_drain(attempt, target).await
                    }
                    StepKind::RunPreUpdateScripts => {
                        let req = ScriptRequest {
                            target,
                            scripts: spec.pre_update_scripts.clone(),
                        };
                        ops.run_pre_update_scripts(attempt, req).await
                    }
                    StepKind::PerformUpdate => {
                        let req = UpdateRequest {
                            target,
                            update_command: spec.update_command.clone(),
                        };
                        ops.perform_update(attempt, req).await
                    }
                    StepKind::StartServices => {
                        let req = ServiceRequest {
                            target,
                            services: spec.service_list.clone(),
                        };
                        ops.start_services(attempt, req).await
                    }
                    StepKind::RunPostUpdateScripts => {
                        let req = ScriptRequest {
                            target,
                            scripts: spec.post_update_scripts.clone(),
                        };
                        ops.run_post_update_scripts(attempt, req).await
                    }
                    StepKind::CheckServiceHealth => {
                        let req = ServiceRequest {
                            target,
                            services: spec.service_list.clone(),
                        };
                        ops.check_service_health(attempt, req).await
                    }
                    other => Err(OpError::invalid_input(format!(
                        "{other} is not a host patch step"
                    ))),
                }
            }) as OpFuture
        }
    }

    async fn abort(mut self, kind: StepKind, error: StepError) -> Result<HostReport, HostFailure> {
        let host = self.task.hostname().to_string();
        let outcome = HostOutcome::Failed {
            step: kind.name().to_string(),
            error: error.to_string(),
        };

        if error.is_terminated() {
            self.task.conclude(HostPhase::Aborted, outcome);
        } else {
            warn!(
                campaign = %self.ctx.campaign_id(),
                cluster = %self.cluster,
                %host,
                step = %kind,
                %error,
                "host step failed, aborting host"
            );
            self.alert(format!("{kind} failed: {error}")).await;
            self.task.conclude(HostPhase::Aborted, outcome);
            self.emit_finished();
        }

        Err(HostFailure {
            host,
            step: kind.name().to_string(),
            report: self.task.report(),
            source: error,
        })
    }

    fn finish(self) -> HostReport {
        self.emit_finished();
        self.task.report()
    }

    fn emit_finished(&self) {
        if let Some(outcome) = self.task.outcome() {
            self.ctx.emit(Milestone::HostFinished {
                scope: self.scope.path(),
                host: self.task.hostname().to_string(),
                outcome: outcome.clone(),
            });
        }
    }

    /// Send the host's failure alert. Delivery failures are logged only.
    async fn alert(&self, failure_details: String) {
        let key = self.scope.key(StepKind::SendFailureAlert);
        let ops = self.ctx.ops.clone();
        let req = AlertRequest {
            hostname: self.task.hostname().to_string(),
            requester_email: self.ctx.spec.requester_email.clone(),
            failure_details,
        };
        let sent: StepResult<()> = self
            .ctx
            .executor
            .execute(&key, StepKind::SendFailureAlert, move |attempt| {
                let ops = ops.clone();
                let req = req.clone();
                async move { ops.send_failure_alert(attempt, req).await }
            })
            .await;
        if let Err(error) = sent {
            warn!(host = %self.task.hostname(), %error, "failure alert not delivered");
        }
    }

    async fn notify_success(&self) {
        let key = self.scope.key(StepKind::SendSuccessNotification);
        let ops = self.ctx.ops.clone();
        let req = NotificationRequest {
            hostname: self.task.hostname().to_string(),
            requester_email: self.ctx.spec.requester_email.clone(),
        };
        let sent: StepResult<()> = self
            .ctx
            .executor
            .execute(&key, StepKind::SendSuccessNotification, move |attempt| {
                let ops = ops.clone();
                let req = req.clone();
                async move { ops.send_success_notification(attempt, req).await }
            })
            .await;
        if let Err(error) = sent {
            warn!(host = %self.task.hostname(), %error, "success notification not delivered");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{FakeOps, harness};

    #[test]
    fn outcome_is_assigned_once() {
        let mut task = HostTask::new("h1");
        assert!(task.conclude(HostPhase::Succeeded, HostOutcome::Succeeded));
        assert!(!task.conclude(HostPhase::Ineligible, HostOutcome::Ineligible));
        assert_eq!(task.phase(), HostPhase::Succeeded);
        assert_eq!(task.report().outcome, HostOutcome::Succeeded);
    }

    #[test]
    fn terminal_phases() {
        assert!(HostPhase::Aborted.is_terminal());
        assert!(HostPhase::Ineligible.is_terminal());
        assert!(!HostPhase::Updated.is_terminal());
    }

    #[tokio::test(start_paused = true)]
    async fn healthy_host_runs_every_step_in_order() {
        let ops = Arc::new(FakeOps::new(5));
        let (ctx, mut milestones) = harness(ops.clone());
        let scope = StepScope::cluster(0, "c1");

        let report = HostRollout::new(ctx, "c1", &scope, 0, "c1_host1")
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, HostOutcome::Succeeded);
        let expected: Vec<&str> = std::iter::once(StepKind::CheckHostPreconditions)
            .chain(PATCH_SEQUENCE.iter().map(|(k, _)| *k))
            .map(StepKind::name)
            .collect();
        assert_eq!(report.steps, expected);
        assert_eq!(ops.count(StepKind::SendSuccessNotification, "c1_host1"), 1);
        assert_eq!(ops.count(StepKind::SendFailureAlert, "c1_host1"), 0);

        let milestone = milestones.recv().await.unwrap();
        assert_eq!(milestone.entry(), "host_succeeded:c1_host1");
    }

    #[tokio::test(start_paused = true)]
    async fn ineligible_host_is_alerted_and_skipped() {
        let ops = Arc::new(FakeOps::new(5).ineligible("c1_host3"));
        let (ctx, mut milestones) = harness(ops.clone());
        let scope = StepScope::cluster(0, "c1");

        let report = HostRollout::new(ctx, "c1", &scope, 2, "c1_host3")
            .run()
            .await
            .unwrap();

        assert_eq!(report.outcome, HostOutcome::Ineligible);
        assert_eq!(report.steps, vec!["check_host_preconditions"]);
        assert_eq!(ops.count(StepKind::SendFailureAlert, "c1_host3"), 1);
        assert_eq!(ops.count(StepKind::RunPreDowntimeScripts, "c1_host3"), 0);
        assert_eq!(milestones.recv().await.unwrap().entry(), "host_ineligible:c1_host3");
    }

    #[tokio::test(start_paused = true)]
    async fn failed_step_alerts_once_and_stops() {
        let ops = Arc::new(FakeOps::new(5).failing(StepKind::StopServices, "c1_host2", u32::MAX));
        let (ctx, _milestones) = harness(ops.clone());
        let scope = StepScope::cluster(0, "c1");

        let failure = HostRollout::new(ctx, "c1", &scope, 1, "c1_host2")
            .run()
            .await
            .unwrap_err();

        assert_eq!(failure.step, "stop_services");
        assert!(matches!(failure.source, StepError::Failed(ref f) if f.attempts_made == 3));
        assert!(matches!(failure.report.outcome, HostOutcome::Failed { ref step, .. } if step == "stop_services"));
        assert_eq!(ops.count(StepKind::StopServices, "c1_host2"), 3);
        assert_eq!(ops.count(StepKind::SendFailureAlert, "c1_host2"), 1);
        assert_eq!(ops.count(StepKind::WaitForWorkloadDrain, "c1_host2"), 0);
        assert_eq!(ops.count(StepKind::SendSuccessNotification, "c1_host2"), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn alert_failure_keeps_original_error() {
        let ops = Arc::new(
            FakeOps::new(5)
                .failing(StepKind::PerformUpdate, "h1", u32::MAX)
                .failing(StepKind::SendFailureAlert, "h1", u32::MAX),
        );
        let (ctx, _milestones) = harness(ops.clone());
        let scope = StepScope::cluster(0, "c1");

        let failure = HostRollout::new(ctx, "c1", &scope, 0, "h1")
            .run()
            .await
            .unwrap_err();
        assert_eq!(failure.step, "perform_update");
        assert!(matches!(failure.report.outcome, HostOutcome::Failed { ref step, .. } if step == "perform_update"));
    }

    #[tokio::test(start_paused = true)]
    async fn flaky_health_check_recovers() {
        let ops = Arc::new(FakeOps::new(5).failing(StepKind::CheckServiceHealth, "h1", 4));
        let (ctx, _milestones) = harness(ops.clone());
        let scope = StepScope::cluster(0, "c1");

        let report = HostRollout::new(ctx, "c1", &scope, 0, "h1")
            .run()
            .await
            .unwrap();
        assert_eq!(report.outcome, HostOutcome::Succeeded);
        assert_eq!(ops.count(StepKind::CheckServiceHealth, "h1"), 5);
    }
}
