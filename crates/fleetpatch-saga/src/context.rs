//! Shared state handed to every cluster and host task of a campaign.

use std::sync::Arc;

use fleetpatch_state::CampaignSpec;
use tokio::sync::mpsc;

use crate::executor::StepExecutor;
use crate::ops::{Credentials, HostTarget, RemoteOps};
use crate::progress::Milestone;

/// Everything a fan-out task needs, cheap to share behind an `Arc`.
///
/// Dropping the last context closes the milestone channel, which is how the
/// campaign task learns that every cluster and host task has finished.
pub struct SagaContext {
    pub executor: StepExecutor,
    pub ops: Arc<dyn RemoteOps>,
    pub spec: Arc<CampaignSpec>,
    pub credentials: Arc<Credentials>,
    milestones: mpsc::UnboundedSender<Milestone>,
}

impl SagaContext {
    pub fn new(
        executor: StepExecutor,
        ops: Arc<dyn RemoteOps>,
        spec: Arc<CampaignSpec>,
        credentials: Arc<Credentials>,
        milestones: mpsc::UnboundedSender<Milestone>,
    ) -> Self {
        Self {
            executor,
            ops,
            spec,
            credentials,
            milestones,
        }
    }

    pub fn campaign_id(&self) -> &str {
        self.executor.campaign_id()
    }

    /// Hand a milestone to the campaign task. Dropped if the campaign has
    /// stopped listening.
    pub fn emit(&self, milestone: Milestone) {
        let _ = self.milestones.send(milestone);
    }

    pub fn target(&self, hostname: &str) -> HostTarget {
        HostTarget {
            hostname: hostname.to_string(),
            credentials: self.credentials.clone(),
        }
    }
}
