//! Campaign saga — the top-level state machine of one patch campaign.
//!
//! # Architecture
//!
//! ```text
//! Created ─► AwaitingApproval ──(approve)──► FetchingCredentials ─► ProcessingClusters ─► Completed
//!                  │                                  │                    │             CompletedWithFailures
//!                  └──(deadline)──► ApprovalTimedOut  └──► Failed          │
//!                                                                          ▼
//!                                      ClusterRollout × N ──► HostRollout × M (pilot, then remaining)
//!                                               │
//!                                               └── milestones (mpsc) ──► campaign task ──► ProgressLog
//! ```
//!
//! The campaign task is the only writer of the progress log and of the
//! campaign record's status. Every remote step is journaled, so running the
//! saga again for an unfinished campaign replays completed steps instead of
//! repeating their side effects.

use std::sync::Arc;
use std::time::Duration;

use fleetpatch_state::{
    CampaignReport, CampaignSpec, CampaignStatus, ClusterReport, ClusterStatus, JournalStore,
    StateError,
};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::cluster::ClusterRollout;
use crate::context::SagaContext;
use crate::error::{SagaError, SagaResult, StepResult};
use crate::executor::StepExecutor;
use crate::ops::{
    ApprovalRequest, CredentialRequest, Credentials, FinalNotificationRequest, RemoteOps,
};
use crate::policy::SagaSettings;
use crate::progress::{Milestone, ProgressWriter};
use crate::signal::{ApprovalGate, TerminationSignal};
use crate::step::{StepKind, StepScope};

/// One run of a campaign, from approval to final notification.
pub struct CampaignSaga {
    id: String,
    journal: JournalStore,
    ops: Arc<dyn RemoteOps>,
    approval_timeout: Duration,
    gate: ApprovalGate,
    progress: ProgressWriter,
    termination: TerminationSignal,
    executor: StepExecutor,
}

impl CampaignSaga {
    pub fn new(
        id: &str,
        journal: JournalStore,
        ops: Arc<dyn RemoteOps>,
        settings: &SagaSettings,
        gate: ApprovalGate,
        progress: ProgressWriter,
        termination: TerminationSignal,
    ) -> Self {
        let executor = StepExecutor::new(
            id,
            journal.clone(),
            settings.policies.clone(),
            termination.clone(),
        );
        Self {
            id: id.to_string(),
            journal,
            ops,
            approval_timeout: settings.approval_timeout,
            gate,
            progress,
            termination,
            executor,
        }
    }

    /// Drive the campaign to a terminal status.
    ///
    /// The terminal status and, on success, the report are persisted before
    /// this returns.
    pub async fn run(self) -> SagaResult<CampaignReport> {
        let termination = self.termination.clone();
        let result = tokio::select! {
            result = self.drive() => result,
            reason = termination.terminated() => Err(SagaError::Terminated { reason }),
        };

        if let Err(error) = &result {
            let status = match error {
                SagaError::ApprovalTimedOut { .. } => CampaignStatus::ApprovalTimedOut,
                SagaError::Terminated { .. } => CampaignStatus::Terminated,
                SagaError::Credentials(_) | SagaError::Journal(_) => CampaignStatus::Failed,
            };
            warn!(campaign = %self.id, ?status, %error, "campaign did not complete");
            let failure = error.to_string();
            let recorded = self.journal.update_campaign(&self.id, |record| {
                record.status = status;
                record.failure = Some(failure);
                record.updated_at = crate::epoch_secs();
            });
            if let Err(e) = recorded {
                warn!(campaign = %self.id, error = %e, "failed to record campaign failure");
            }
        }
        result
    }

    async fn drive(&self) -> SagaResult<CampaignReport> {
        let record = self
            .journal
            .get_campaign(&self.id)?
            .ok_or_else(|| StateError::CampaignNotFound(self.id.clone()))?;
        let spec = Arc::new(record.spec);

        // ── Approval ───────────────────────────────────────────────
        self.transition(CampaignStatus::AwaitingApproval)?;
        let request = ApprovalRequest {
            campaign_id: self.id.clone(),
            target_clusters: spec.target_clusters.clone(),
            approver_emails: spec.approver_emails.clone(),
            requester_email: spec.requester_email.clone(),
        };
        let ops = self.ops.clone();
        let requested: StepResult<()> = self
            .executor
            .execute(
                &StepScope::Campaign.key(StepKind::SendApprovalRequest),
                StepKind::SendApprovalRequest,
                move |attempt| {
                    let ops = ops.clone();
                    let request = request.clone();
                    async move { ops.send_approval_request(attempt, request).await }
                },
            )
            .await;
        match requested {
            Ok(()) => {}
            Err(error) if error.is_terminated() => return Err(self.terminated()),
            Err(error) => warn!(campaign = %self.id, %error, "approval request not delivered"),
        }
        self.progress.append(&Milestone::ApprovalRequested)?;

        // The journal flag covers approvals that landed before this run's
        // latch existed.
        if !(record.approved || self.gate.is_approved()) {
            let now = crate::epoch_millis();
            let deadline = match record.approval_deadline_ms {
                Some(deadline) => deadline,
                None => {
                    let deadline = now + self.approval_timeout.as_millis() as u64;
                    self.journal.update_campaign(&self.id, |r| {
                        r.approval_deadline_ms = Some(deadline);
                    })?;
                    deadline
                }
            };
            let window = Duration::from_millis(deadline.saturating_sub(now));
            info!(campaign = %self.id, window_ms = window.as_millis() as u64, "waiting for approval");
            if self.gate.wait(window).await.is_err() {
                return Err(SagaError::ApprovalTimedOut {
                    timeout_secs: self.approval_timeout.as_secs(),
                });
            }
        }
        info!(campaign = %self.id, "campaign approved");
        self.progress.append(&Milestone::ApprovalReceived)?;

        // ── Credentials ────────────────────────────────────────────
        self.transition(CampaignStatus::FetchingCredentials)?;
        let credentials = self.fetch_credentials(&spec).await?;
        self.progress.append(&Milestone::CredentialsFetched)?;

        // ── Fan-out ────────────────────────────────────────────────
        self.transition(CampaignStatus::ProcessingClusters)?;
        let clusters = self.process_clusters(&spec, credentials).await?;

        // ── Final notification ─────────────────────────────────────
        let mut report = CampaignReport {
            clusters,
            final_notification_sent: false,
        };
        let (succeeded, ineligible, failed) = report.host_counts();
        let request = FinalNotificationRequest {
            campaign_id: self.id.clone(),
            requester_email: spec.requester_email.clone(),
            summary: format!(
                "{} cluster(s): {succeeded} host(s) patched, {ineligible} ineligible, {failed} failed",
                report.clusters.len()
            ),
        };
        let ops = self.ops.clone();
        let notified: StepResult<()> = self
            .executor
            .execute(
                &StepScope::Campaign.key(StepKind::SendFinalNotification),
                StepKind::SendFinalNotification,
                move |attempt| {
                    let ops = ops.clone();
                    let request = request.clone();
                    async move { ops.send_final_notification(attempt, request).await }
                },
            )
            .await;
        match notified {
            Ok(()) => {
                report.final_notification_sent = true;
                self.progress.append(&Milestone::FinalNotificationSent)?;
            }
            Err(error) if error.is_terminated() => return Err(self.terminated()),
            Err(error) => warn!(campaign = %self.id, %error, "final notification not delivered"),
        }

        let status = if report.has_failures() {
            CampaignStatus::CompletedWithFailures
        } else {
            CampaignStatus::Completed
        };
        let stored = report.clone();
        self.journal.update_campaign(&self.id, |record| {
            record.status = status;
            record.report = Some(stored);
            record.updated_at = crate::epoch_secs();
        })?;
        info!(campaign = %self.id, ?status, succeeded, ineligible, failed, "campaign finished");
        Ok(report)
    }

    async fn fetch_credentials(&self, spec: &CampaignSpec) -> SagaResult<Credentials> {
        let request = CredentialRequest {
            vault_address: spec.secret.vault_address.clone(),
            secret_path_prefix: spec.secret.secret_path_prefix.clone(),
        };
        let ops = self.ops.clone();
        let fetched: StepResult<Credentials> = self
            .executor
            .execute(
                &StepScope::Campaign.key(StepKind::FetchCredentials),
                StepKind::FetchCredentials,
                move |attempt| {
                    let ops = ops.clone();
                    let request = request.clone();
                    async move { ops.fetch_credentials(attempt, request).await }
                },
            )
            .await;
        match fetched {
            Ok(credentials) => {
                info!(campaign = %self.id, address = %credentials.address, "credentials fetched");
                Ok(credentials)
            }
            Err(error) if error.is_terminated() => Err(self.terminated()),
            Err(error) => Err(SagaError::Credentials(error)),
        }
    }

    /// Run every target cluster concurrently, appending their milestones as
    /// they arrive, and return the reports in target-list order.
    async fn process_clusters(
        &self,
        spec: &Arc<CampaignSpec>,
        credentials: Credentials,
    ) -> SagaResult<Vec<ClusterReport>> {
        let (tx, mut milestones) = mpsc::unbounded_channel();
        let ctx = Arc::new(SagaContext::new(
            self.executor.clone(),
            self.ops.clone(),
            spec.clone(),
            Arc::new(credentials),
            tx,
        ));

        let mut set = JoinSet::new();
        for (position, cluster) in spec.target_clusters.iter().enumerate() {
            set.spawn(ClusterRollout::new(ctx.clone(), position, cluster).run());
        }
        drop(ctx);

        while let Some(milestone) = milestones.recv().await {
            self.progress.append(&milestone)?;
        }

        let mut slots: Vec<Option<ClusterReport>> = vec![None; spec.target_clusters.len()];
        while let Some(joined) = set.join_next().await {
            match joined {
                Ok(report) => {
                    let position = report.position;
                    if let Some(slot) = slots.get_mut(position) {
                        *slot = Some(report);
                    }
                }
                Err(e) => warn!(campaign = %self.id, error = %e, "cluster task panicked"),
            }
        }

        Ok(slots
            .into_iter()
            .zip(&spec.target_clusters)
            .enumerate()
            .map(|(position, (slot, cluster))| {
                slot.unwrap_or_else(|| ClusterReport {
                    cluster: cluster.clone(),
                    position,
                    status: ClusterStatus::Failed,
                    hosts: Vec::new(),
                    skipped_hosts: Vec::new(),
                    first_failure: Some("cluster task panicked".to_string()),
                })
            })
            .collect())
    }

    fn transition(&self, status: CampaignStatus) -> SagaResult<()> {
        self.journal.update_campaign(&self.id, |record| {
            record.status = status;
            record.updated_at = crate::epoch_secs();
        })?;
        info!(campaign = %self.id, ?status, "campaign status changed");
        Ok(())
    }

    fn terminated(&self) -> SagaError {
        SagaError::Terminated {
            reason: self.termination.reason().unwrap_or_default(),
        }
    }
}
