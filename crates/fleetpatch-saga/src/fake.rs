//! In-memory `RemoteOps` used by unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use fleetpatch_state::{CampaignSpec, JournalStore, SecretRef};
use tokio::sync::mpsc;

use crate::context::SagaContext;
use crate::executor::StepExecutor;
use crate::ops::*;
use crate::policy::StepPolicies;
use crate::progress::Milestone;
use crate::signal::TerminationSignal;
use crate::step::StepKind;

/// Records every call as `(step, target)` and fails on request.
#[derive(Default)]
pub(crate) struct FakeOps {
    hosts_per_cluster: usize,
    ineligible: HashSet<String>,
    failures: Mutex<HashMap<(StepKind, String), u32>>,
    calls: Mutex<Vec<(StepKind, String)>>,
}

impl FakeOps {
    pub(crate) fn new(hosts_per_cluster: usize) -> Self {
        Self {
            hosts_per_cluster,
            ..Self::default()
        }
    }

    pub(crate) fn ineligible(mut self, host: &str) -> Self {
        self.ineligible.insert(host.to_string());
        self
    }

    /// Fail the next `times` calls of `step` against `target` with a transient error.
    pub(crate) fn failing(self, step: StepKind, target: &str, times: u32) -> Self {
        self.failures
            .lock()
            .unwrap()
            .insert((step, target.to_string()), times);
        self
    }

    pub(crate) fn count(&self, step: StepKind, target: &str) -> usize {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, t)| *s == step && t == target)
            .count()
    }

    pub(crate) fn calls_of(&self, step: StepKind) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _)| *s == step)
            .map(|(_, t)| t.clone())
            .collect()
    }

    fn invoke(&self, step: StepKind, target: &str) -> OpResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push((step, target.to_string()));
        let mut failures = self.failures.lock().unwrap();
        match failures.get_mut(&(step, target.to_string())) {
            Some(remaining) if *remaining > 0 => {
                *remaining -= 1;
                Err(OpError::transient("Scripted", format!("{step} failed on {target}")))
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl RemoteOps for FakeOps {
    async fn send_approval_request(&self, _: AttemptContext, _: ApprovalRequest) -> OpResult<()> {
        self.invoke(StepKind::SendApprovalRequest, "campaign")
    }

    async fn fetch_credentials(
        &self,
        _: AttemptContext,
        req: CredentialRequest,
    ) -> OpResult<Credentials> {
        self.invoke(StepKind::FetchCredentials, "campaign")?;
        Ok(Credentials {
            address: req.vault_address,
            token: "token".to_string(),
        })
    }

    async fn get_cluster_hosts(
        &self,
        _: AttemptContext,
        req: ClusterHostsRequest,
    ) -> OpResult<ClusterHosts> {
        self.invoke(StepKind::GetClusterHosts, &req.cluster)?;
        Ok(ClusterHosts {
            hostnames: (1..=self.hosts_per_cluster)
                .map(|i| format!("{}_host{i}", req.cluster))
                .collect(),
        })
    }

    async fn check_host_preconditions(
        &self,
        _: AttemptContext,
        target: HostTarget,
    ) -> OpResult<PreconditionReport> {
        self.invoke(StepKind::CheckHostPreconditions, &target.hostname)?;
        Ok(PreconditionReport {
            preconditions_met: !self.ineligible.contains(&target.hostname),
            reason: None,
        })
    }

    async fn run_pre_downtime_scripts(&self, _: AttemptContext, t: HostTarget) -> OpResult<()> {
        self.invoke(StepKind::RunPreDowntimeScripts, &t.hostname)
    }

    async fn set_maintenance_mode(&self, _: AttemptContext, t: HostTarget) -> OpResult<()> {
        self.invoke(StepKind::SetMaintenanceMode, &t.hostname)
    }

    async fn stop_services(&self, _: AttemptContext, req: ServiceRequest) -> OpResult<()> {
        self.invoke(StepKind::StopServices, &req.target.hostname)
    }

    async fn wait_for_workload_drain(&self, _: AttemptContext, t: HostTarget) -> OpResult<()> {
        self.invoke(StepKind::WaitForWorkloadDrain, &t.hostname)
    }

    async fn run_pre_update_scripts(&self, _: AttemptContext, req: ScriptRequest) -> OpResult<()> {
        self.invoke(StepKind::RunPreUpdateScripts, &req.target.hostname)
    }

    async fn perform_update(&self, _: AttemptContext, req: UpdateRequest) -> OpResult<()> {
        self.invoke(StepKind::PerformUpdate, &req.target.hostname)
    }

    async fn start_services(&self, _: AttemptContext, req: ServiceRequest) -> OpResult<()> {
        self.invoke(StepKind::StartServices, &req.target.hostname)
    }

    async fn run_post_update_scripts(&self, _: AttemptContext, req: ScriptRequest) -> OpResult<()> {
        self.invoke(StepKind::RunPostUpdateScripts, &req.target.hostname)
    }

    async fn check_service_health(&self, _: AttemptContext, req: ServiceRequest) -> OpResult<()> {
        self.invoke(StepKind::CheckServiceHealth, &req.target.hostname)
    }

    async fn send_success_notification(
        &self,
        _: AttemptContext,
        req: NotificationRequest,
    ) -> OpResult<()> {
        self.invoke(StepKind::SendSuccessNotification, &req.hostname)
    }

    async fn send_failure_alert(&self, _: AttemptContext, req: AlertRequest) -> OpResult<()> {
        self.invoke(StepKind::SendFailureAlert, &req.hostname)
    }

    async fn send_final_notification(
        &self,
        _: AttemptContext,
        _: FinalNotificationRequest,
    ) -> OpResult<()> {
        self.invoke(StepKind::SendFinalNotification, "campaign")
    }
}

pub(crate) fn spec(clusters: &[&str], pilot: u32) -> CampaignSpec {
    CampaignSpec {
        target_clusters: clusters.iter().map(|c| c.to_string()).collect(),
        pilot_host_count: pilot,
        approver_emails: vec!["approver@example.com".to_string()],
        requester_email: "requester@example.com".to_string(),
        update_command: "apt-get upgrade -y".to_string(),
        service_list: vec!["nginx".to_string()],
        pre_update_scripts: Vec::new(),
        post_update_scripts: Vec::new(),
        secret: SecretRef::default(),
    }
}

/// A fan-out context over a fresh in-memory journal.
pub(crate) fn harness(
    ops: Arc<FakeOps>,
) -> (Arc<SagaContext>, mpsc::UnboundedReceiver<Milestone>) {
    let journal = JournalStore::open_in_memory().unwrap();
    let executor = StepExecutor::new(
        "camp-test",
        journal,
        StepPolicies::new(),
        TerminationSignal::never(),
    );
    let (tx, rx) = mpsc::unbounded_channel();
    let ctx = SagaContext::new(
        executor,
        ops,
        Arc::new(spec(&["c1"], 2)),
        Arc::new(Credentials {
            address: "https://vault".to_string(),
            token: "token".to_string(),
        }),
        tx,
    );
    (Arc::new(ctx), rx)
}
