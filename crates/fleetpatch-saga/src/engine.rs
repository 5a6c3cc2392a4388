//! Campaign engine — starts, signals, queries and resumes campaigns.
//!
//! The engine owns one slot per campaign it has launched in this process.
//! A slot holds the writer halves of the campaign's control channels
//! (approval latch, termination) and the reader halves of its progress log
//! and outcome. The journal remains the source of truth: campaigns that are
//! not in a slot are answered from their persisted record.

use std::collections::HashMap;
use std::sync::Arc;

use fleetpatch_state::{
    CampaignRecord, CampaignReport, CampaignSpec, CampaignStatus, JournalStore, KEY_SEP,
};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock, watch};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::campaign::CampaignSaga;
use crate::error::{EngineError, EngineResult};
use crate::ops::RemoteOps;
use crate::policy::SagaSettings;
use crate::progress::{ProgressLog, ProgressWriter};
use crate::signal::{ApprovalLatch, TerminationHandle, approval_latch, termination};

/// What to do when a start request reuses the id of a campaign in flight.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IdReusePolicy {
    /// Refuse the new campaign.
    #[default]
    RejectDuplicate,
    /// Terminate the running campaign, wait for it to stop, then replace it.
    TerminateIfRunning,
}

/// A request to start a campaign.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRequest {
    /// Caller-chosen campaign id. A random one is generated when absent.
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub reuse_policy: IdReusePolicy,
    #[serde(flatten)]
    pub spec: CampaignSpec,
}

impl StartRequest {
    pub fn new(spec: CampaignSpec) -> Self {
        Self {
            id: None,
            reuse_policy: IdReusePolicy::default(),
            spec,
        }
    }

    pub fn with_id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn with_reuse_policy(mut self, policy: IdReusePolicy) -> Self {
        self.reuse_policy = policy;
        self
    }
}

/// Terminal outcome of a campaign.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CampaignOutcome {
    pub id: String,
    pub status: CampaignStatus,
    pub report: Option<CampaignReport>,
    pub failure: Option<String>,
}

impl From<&CampaignRecord> for CampaignOutcome {
    fn from(record: &CampaignRecord) -> Self {
        Self {
            id: record.id.clone(),
            status: record.status,
            report: record.report.clone(),
            failure: record.failure.clone(),
        }
    }
}

/// Handle to a launched campaign.
#[derive(Debug, Clone)]
pub struct CampaignHandle {
    id: String,
    progress: ProgressLog,
    outcome: watch::Receiver<Option<CampaignOutcome>>,
}

impl CampaignHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current progress log snapshot.
    pub fn progress(&self) -> Vec<String> {
        self.progress.snapshot()
    }

    /// Wait for the campaign to reach a terminal status.
    pub async fn wait(&self) -> CampaignOutcome {
        await_outcome(&self.id, self.outcome.clone()).await
    }
}

/// In-memory state of a launched campaign.
struct CampaignSlot {
    latch: ApprovalLatch,
    termination: TerminationHandle,
    progress: ProgressLog,
    outcome: watch::Receiver<Option<CampaignOutcome>>,
}

impl CampaignSlot {
    fn is_running(&self) -> bool {
        self.outcome.borrow().is_none()
    }
}

/// Runs campaigns against a journal and a set of remote operations.
#[derive(Clone)]
pub struct CampaignEngine {
    journal: JournalStore,
    ops: Arc<dyn RemoteOps>,
    settings: SagaSettings,
    /// Launched campaigns: campaign_id → slot.
    slots: Arc<RwLock<HashMap<String, CampaignSlot>>>,
    /// Serializes start requests so id checks and launches don't interleave.
    starts: Arc<Mutex<()>>,
}

impl CampaignEngine {
    pub fn new(journal: JournalStore, ops: Arc<dyn RemoteOps>, settings: SagaSettings) -> Self {
        Self {
            journal,
            ops,
            settings,
            slots: Arc::new(RwLock::new(HashMap::new())),
            starts: Arc::new(Mutex::new(())),
        }
    }

    pub fn journal(&self) -> &JournalStore {
        &self.journal
    }

    /// Start a campaign.
    ///
    /// A finished campaign's id can always be reused; its history is purged
    /// first. Reusing the id of a campaign in flight is governed by the
    /// request's [`IdReusePolicy`].
    pub async fn start(&self, request: StartRequest) -> EngineResult<CampaignHandle> {
        validate_spec(&request.spec)?;
        let id = match request.id {
            Some(id) => {
                validate_id(&id)?;
                id
            }
            None => Uuid::new_v4().to_string(),
        };

        let _guard = self.starts.lock().await;

        let running = {
            let slots = self.slots.read().await;
            match slots.get(&id) {
                Some(slot) if slot.is_running() => {
                    if request.reuse_policy == IdReusePolicy::TerminateIfRunning {
                        slot.termination.terminate("replaced by a new campaign with the same id");
                    }
                    Some(slot.outcome.clone())
                }
                _ => None,
            }
        };

        if let Some(outcome) = running {
            if request.reuse_policy == IdReusePolicy::RejectDuplicate {
                return Err(EngineError::AlreadyRunning(id));
            }
            info!(campaign = %id, "terminating running campaign for replacement");
            await_outcome(&id, outcome).await;
        } else if let Some(existing) = self.journal.get_campaign(&id)? {
            if !existing.status.is_terminal() {
                // Persisted but not launched here, e.g. not yet resumed.
                if request.reuse_policy == IdReusePolicy::RejectDuplicate {
                    return Err(EngineError::AlreadyRunning(id));
                }
                self.mark_terminated(&id, "replaced by a new campaign with the same id")?;
            }
        }

        if self.journal.get_campaign(&id)?.is_some() {
            let removed = self.journal.purge_campaign(&id)?;
            debug!(campaign = %id, removed, "purged previous campaign history");
        }

        let record = CampaignRecord::new(&id, request.spec, crate::epoch_secs());
        self.journal.put_campaign(&record)?;
        info!(
            campaign = %id,
            clusters = record.spec.target_clusters.len(),
            pilot = record.spec.pilot_host_count,
            "campaign started"
        );
        self.launch(record).await
    }

    /// Deliver the approval signal. Returns false if it was already approved.
    pub async fn approve(&self, id: &str) -> EngineResult<bool> {
        let record = self
            .journal
            .get_campaign(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))?;
        if record.status.is_terminal() {
            return Err(EngineError::NotRunning(id.to_string()));
        }

        let changed = self.journal.set_approved(id).map_err(|e| {
            if e.is_not_found() {
                EngineError::NotFound(id.to_string())
            } else {
                EngineError::State(e)
            }
        })?;
        if let Some(slot) = self.slots.read().await.get(id) {
            slot.latch.approve();
        }
        if changed {
            info!(campaign = %id, "approval received");
        }
        Ok(changed)
    }

    /// Progress log of a running or finished campaign.
    pub async fn progress(&self, id: &str) -> EngineResult<Vec<String>> {
        if let Some(slot) = self.slots.read().await.get(id) {
            return Ok(slot.progress.snapshot());
        }
        if self.journal.get_campaign(id)?.is_none() {
            return Err(EngineError::NotFound(id.to_string()));
        }
        Ok(self.journal.list_progress(id)?)
    }

    /// Persisted record of a campaign.
    pub async fn status(&self, id: &str) -> EngineResult<CampaignRecord> {
        self.journal
            .get_campaign(id)?
            .ok_or_else(|| EngineError::NotFound(id.to_string()))
    }

    pub async fn list(&self) -> EngineResult<Vec<CampaignRecord>> {
        Ok(self.journal.list_campaigns()?)
    }

    /// Terminal outcome if the campaign has finished, without waiting.
    pub async fn outcome(&self, id: &str) -> EngineResult<Option<CampaignOutcome>> {
        let record = self.status(id).await?;
        Ok(record
            .status
            .is_terminal()
            .then(|| CampaignOutcome::from(&record)))
    }

    /// Wait for a campaign to reach a terminal status.
    pub async fn wait(&self, id: &str) -> EngineResult<CampaignOutcome> {
        let outcome = self
            .slots
            .read()
            .await
            .get(id)
            .map(|slot| slot.outcome.clone());
        if let Some(outcome) = outcome {
            return Ok(await_outcome(id, outcome).await);
        }

        let record = self.status(id).await?;
        if record.status.is_terminal() {
            Ok(CampaignOutcome::from(&record))
        } else {
            Err(EngineError::NotRunning(id.to_string()))
        }
    }

    /// Abort a running campaign. Remote operations already dispatched keep
    /// running; nothing further is started.
    pub async fn terminate(&self, id: &str, reason: &str) -> EngineResult<()> {
        {
            let slots = self.slots.read().await;
            if let Some(slot) = slots.get(id) {
                if !slot.is_running() {
                    return Err(EngineError::NotRunning(id.to_string()));
                }
                slot.termination.terminate(reason);
                info!(campaign = %id, %reason, "termination requested");
                return Ok(());
            }
        }

        let record = self.status(id).await?;
        if record.status.is_terminal() {
            return Err(EngineError::NotRunning(id.to_string()));
        }
        self.mark_terminated(id, reason)
    }

    /// Relaunch every unfinished campaign in the journal. Journaled steps are
    /// replayed, not re-executed.
    pub async fn resume_incomplete(&self) -> EngineResult<Vec<String>> {
        let _guard = self.starts.lock().await;
        let mut resumed = Vec::new();
        for record in self.journal.list_campaigns()? {
            if record.status.is_terminal() || self.slots.read().await.contains_key(&record.id) {
                continue;
            }
            info!(campaign = %record.id, status = ?record.status, "resuming campaign");
            let id = record.id.clone();
            self.launch(record).await?;
            resumed.push(id);
        }
        Ok(resumed)
    }

    async fn launch(&self, record: CampaignRecord) -> EngineResult<CampaignHandle> {
        let id = record.id.clone();
        let (latch, gate) = approval_latch(record.approved);
        let (terminator, signal) = termination();
        let (writer, progress) = ProgressWriter::open(&id, self.journal.clone())?;
        let (outcome_tx, outcome_rx) = watch::channel(None);

        let saga = CampaignSaga::new(
            &id,
            self.journal.clone(),
            self.ops.clone(),
            &self.settings,
            gate,
            writer,
            signal,
        );

        self.slots.write().await.insert(
            id.clone(),
            CampaignSlot {
                latch,
                termination: terminator,
                progress: progress.clone(),
                outcome: outcome_rx.clone(),
            },
        );

        let journal = self.journal.clone();
        let task_id = id.clone();
        tokio::spawn(async move {
            let result = saga.run().await;
            let outcome = match journal.get_campaign(&task_id) {
                Ok(Some(record)) if record.status.is_terminal() => CampaignOutcome::from(&record),
                other => {
                    if let Err(e) = other {
                        warn!(campaign = %task_id, error = %e, "failed to read final campaign record");
                    }
                    match result {
                        Ok(report) => CampaignOutcome {
                            id: task_id.clone(),
                            status: if report.has_failures() {
                                CampaignStatus::CompletedWithFailures
                            } else {
                                CampaignStatus::Completed
                            },
                            report: Some(report),
                            failure: None,
                        },
                        Err(error) => CampaignOutcome {
                            id: task_id.clone(),
                            status: CampaignStatus::Failed,
                            report: None,
                            failure: Some(error.to_string()),
                        },
                    }
                }
            };
            info!(campaign = %task_id, status = ?outcome.status, "campaign finished");
            outcome_tx.send_replace(Some(outcome));
        });

        Ok(CampaignHandle {
            id,
            progress,
            outcome: outcome_rx,
        })
    }

    fn mark_terminated(&self, id: &str, reason: &str) -> EngineResult<()> {
        self.journal.update_campaign(id, |record| {
            record.status = CampaignStatus::Terminated;
            record.failure = Some(format!("campaign terminated: {reason}"));
            record.updated_at = crate::epoch_secs();
        })?;
        info!(campaign = %id, %reason, "campaign marked terminated");
        Ok(())
    }
}

async fn await_outcome(
    id: &str,
    mut outcome: watch::Receiver<Option<CampaignOutcome>>,
) -> CampaignOutcome {
    let finished = match outcome.wait_for(|o| o.is_some()).await {
        Ok(outcome) => outcome.clone(),
        Err(_) => None,
    };
    finished.unwrap_or_else(|| CampaignOutcome {
        id: id.to_string(),
        status: CampaignStatus::Failed,
        report: None,
        failure: Some("campaign task ended without an outcome".to_string()),
    })
}

fn validate_spec(spec: &CampaignSpec) -> EngineResult<()> {
    if spec.target_clusters.is_empty() {
        return Err(EngineError::InvalidSpec(
            "target_clusters must not be empty".to_string(),
        ));
    }
    if spec.target_clusters.iter().any(|c| c.trim().is_empty()) {
        return Err(EngineError::InvalidSpec(
            "cluster names must not be blank".to_string(),
        ));
    }
    if spec.update_command.trim().is_empty() {
        return Err(EngineError::InvalidSpec(
            "update_command must not be empty".to_string(),
        ));
    }
    Ok(())
}

fn validate_id(id: &str) -> EngineResult<()> {
    if id.trim().is_empty() {
        return Err(EngineError::InvalidSpec("campaign id must not be empty".to_string()));
    }
    if id.contains(KEY_SEP) {
        return Err(EngineError::InvalidSpec(format!(
            "campaign id must not contain '{KEY_SEP}'"
        )));
    }
    Ok(())
}
