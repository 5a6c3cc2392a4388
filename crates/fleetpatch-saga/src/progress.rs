//! Campaign progress log.
//!
//! Milestones are produced anywhere in the saga (cluster and host tasks send
//! them over a channel) but appended by the campaign task alone. Each append
//! is journaled under a milestone key, so replaying a campaign after a
//! restart does not duplicate entries, and then published through a `watch`
//! snapshot for readers.

use fleetpatch_state::{HostOutcome, JournalStore, StateResult};
use tokio::sync::watch;
use tracing::debug;

/// A progress-worthy event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Milestone {
    ApprovalRequested,
    ApprovalReceived,
    CredentialsFetched,
    PilotGroupDone { scope: String, cluster: String },
    RemainingGroupDone { scope: String, cluster: String },
    HostFinished {
        scope: String,
        host: String,
        outcome: HostOutcome,
    },
    FinalNotificationSent,
}

impl Milestone {
    /// Campaign-unique identity of this milestone.
    pub fn key(&self) -> String {
        match self {
            Milestone::ApprovalRequested => "approval_requested".to_string(),
            Milestone::ApprovalReceived => "approval_received".to_string(),
            Milestone::CredentialsFetched => "credentials_fetched".to_string(),
            Milestone::PilotGroupDone { scope, .. } => format!("{scope}/pilot_group_done"),
            Milestone::RemainingGroupDone { scope, .. } => format!("{scope}/remaining_group_done"),
            Milestone::HostFinished { scope, .. } => format!("{scope}/finished"),
            Milestone::FinalNotificationSent => "final_notification_sent".to_string(),
        }
    }

    /// The entry shown in the progress log.
    pub fn entry(&self) -> String {
        match self {
            Milestone::ApprovalRequested => "approval_requested".to_string(),
            Milestone::ApprovalReceived => "approval_received".to_string(),
            Milestone::CredentialsFetched => "credentials_fetched".to_string(),
            Milestone::PilotGroupDone { cluster, .. } => format!("pilot_group_done:{cluster}"),
            Milestone::RemainingGroupDone { cluster, .. } => {
                format!("remaining_group_done:{cluster}")
            }
            Milestone::HostFinished { host, outcome, .. } => match outcome {
                HostOutcome::Succeeded => format!("host_succeeded:{host}"),
                HostOutcome::Ineligible => format!("host_ineligible:{host}"),
                HostOutcome::Failed { .. } => format!("host_failed:{host}"),
            },
            Milestone::FinalNotificationSent => "final_notification_sent".to_string(),
        }
    }
}

/// Read side of a campaign's progress log.
#[derive(Debug, Clone)]
pub struct ProgressLog {
    rx: watch::Receiver<Vec<String>>,
}

impl ProgressLog {
    /// The log as of now. Entries appended later are not included.
    pub fn snapshot(&self) -> Vec<String> {
        self.rx.borrow().clone()
    }
}

/// Write side of a campaign's progress log. Owned by the campaign task.
pub struct ProgressWriter {
    campaign_id: String,
    journal: JournalStore,
    tx: watch::Sender<Vec<String>>,
}

impl ProgressWriter {
    /// Open the log for `campaign_id`, seeded with whatever the journal holds.
    pub fn open(campaign_id: &str, journal: JournalStore) -> StateResult<(Self, ProgressLog)> {
        let existing = journal.list_progress(campaign_id)?;
        let (tx, rx) = watch::channel(existing);
        Ok((
            Self {
                campaign_id: campaign_id.to_string(),
                journal,
                tx,
            },
            ProgressLog { rx },
        ))
    }

    /// Another reader of this log.
    pub fn subscribe(&self) -> ProgressLog {
        ProgressLog {
            rx: self.tx.subscribe(),
        }
    }

    /// Append `milestone` unless it was already recorded.
    pub fn append(&self, milestone: &Milestone) -> StateResult<bool> {
        let entry = milestone.entry();
        let appended = self
            .journal
            .append_progress(&self.campaign_id, &milestone.key(), &entry)?;
        if appended {
            self.tx.send_modify(|log| log.push(entry));
        } else {
            debug!(campaign = %self.campaign_id, milestone = %milestone.key(), "milestone already recorded");
        }
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_and_keys() {
        let pilot = Milestone::PilotGroupDone {
            scope: "clusters/0:c1".to_string(),
            cluster: "c1".to_string(),
        };
        assert_eq!(pilot.entry(), "pilot_group_done:c1");
        assert_eq!(pilot.key(), "clusters/0:c1/pilot_group_done");

        let failed = Milestone::HostFinished {
            scope: "clusters/0:c1/hosts/0:c1_host1".to_string(),
            host: "c1_host1".to_string(),
            outcome: HostOutcome::Failed {
                step: "perform_update".to_string(),
                error: "boom".to_string(),
            },
        };
        assert_eq!(failed.entry(), "host_failed:c1_host1");
    }

    #[test]
    fn append_publishes_snapshot() {
        let journal = JournalStore::open_in_memory().unwrap();
        let (writer, log) = ProgressWriter::open("camp", journal).unwrap();
        assert!(log.snapshot().is_empty());

        writer.append(&Milestone::ApprovalRequested).unwrap();
        let before = log.snapshot();
        writer.append(&Milestone::ApprovalReceived).unwrap();

        assert_eq!(before, vec!["approval_requested"]);
        assert_eq!(log.snapshot(), vec!["approval_requested", "approval_received"]);
        assert_eq!(writer.subscribe().snapshot().len(), 2);
    }

    #[test]
    fn duplicate_milestone_is_ignored() {
        let journal = JournalStore::open_in_memory().unwrap();
        let (writer, log) = ProgressWriter::open("camp", journal).unwrap();
        assert!(writer.append(&Milestone::CredentialsFetched).unwrap());
        assert!(!writer.append(&Milestone::CredentialsFetched).unwrap());
        assert_eq!(log.snapshot(), vec!["credentials_fetched"]);
    }

    #[test]
    fn reopened_log_keeps_history() {
        let journal = JournalStore::open_in_memory().unwrap();
        {
            let (writer, _log) = ProgressWriter::open("camp", journal.clone()).unwrap();
            writer.append(&Milestone::ApprovalRequested).unwrap();
        }
        let (writer, log) = ProgressWriter::open("camp", journal).unwrap();
        assert_eq!(log.snapshot(), vec!["approval_requested"]);
        assert!(!writer.append(&Milestone::ApprovalRequested).unwrap());
        assert_eq!(log.snapshot().len(), 1);
    }
}
