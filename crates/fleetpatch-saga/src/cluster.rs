//! Cluster rollout coordinator.
//!
//! A cluster is patched in two groups: a pilot group of the first
//! `pilot_host_count` discovered hosts, then everyone else. Hosts within a
//! group run concurrently and every host runs to completion regardless of
//! its siblings. If any pilot host fails, the remaining group never starts.

use std::collections::HashMap;
use std::sync::Arc;

use fleetpatch_state::{ClusterReport, ClusterStatus, HostOutcome, HostReport};
use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::context::SagaContext;
use crate::error::StepResult;
use crate::host::HostRollout;
use crate::ops::{ClusterHosts, ClusterHostsRequest};
use crate::progress::Milestone;
use crate::step::{StepKind, StepScope};

/// Split discovered hosts into the pilot group and the remaining group.
///
/// A pilot count at or above the host count puts every host in the pilot
/// group and leaves the remaining group empty.
pub fn partition(hosts: &[String], pilot_host_count: u32) -> (&[String], &[String]) {
    let split = (pilot_host_count as usize).min(hosts.len());
    hosts.split_at(split)
}

/// Outcome of one host group.
struct GroupResult {
    reports: Vec<HostReport>,
    first_failure: Option<String>,
}

/// Drives one cluster through discovery and its two host groups.
pub struct ClusterRollout {
    ctx: Arc<SagaContext>,
    cluster: String,
    scope: StepScope,
}

impl ClusterRollout {
    /// `position` is the cluster's index in the campaign's target list.
    pub fn new(ctx: Arc<SagaContext>, position: usize, cluster: &str) -> Self {
        Self {
            ctx,
            cluster: cluster.to_string(),
            scope: StepScope::cluster(position, cluster),
        }
    }

    pub async fn run(self) -> ClusterReport {
        let position = match self.scope {
            StepScope::Cluster { position, .. } => position,
            _ => 0,
        };
        let mut report = ClusterReport {
            cluster: self.cluster.clone(),
            position,
            status: ClusterStatus::Succeeded,
            hosts: Vec::new(),
            skipped_hosts: Vec::new(),
            first_failure: None,
        };

        let hosts = match self.discover().await {
            Ok(found) => found.hostnames,
            Err(error) => {
                warn!(campaign = %self.ctx.campaign_id(), cluster = %self.cluster, %error, "host discovery failed");
                report.status = ClusterStatus::Failed;
                report.first_failure = Some(error.to_string());
                return report;
            }
        };

        let (pilot, remaining) = partition(&hosts, self.ctx.spec.pilot_host_count);
        info!(
            campaign = %self.ctx.campaign_id(),
            cluster = %self.cluster,
            hosts = hosts.len(),
            pilot = pilot.len(),
            remaining = remaining.len(),
            "cluster rollout started"
        );

        let pilot_result = self.run_group(pilot, 0).await;
        report.hosts.extend(pilot_result.reports);
        self.ctx.emit(Milestone::PilotGroupDone {
            scope: self.scope.path(),
            cluster: self.cluster.clone(),
        });

        if let Some(failure) = pilot_result.first_failure {
            warn!(
                campaign = %self.ctx.campaign_id(),
                cluster = %self.cluster,
                skipped = remaining.len(),
                %failure,
                "pilot group failed, remaining hosts skipped"
            );
            report.status = ClusterStatus::Failed;
            report.first_failure = Some(failure);
            report.skipped_hosts = remaining.to_vec();
            return report;
        }

        let remaining_result = self.run_group(remaining, pilot.len()).await;
        report.hosts.extend(remaining_result.reports);
        self.ctx.emit(Milestone::RemainingGroupDone {
            scope: self.scope.path(),
            cluster: self.cluster.clone(),
        });

        if let Some(failure) = remaining_result.first_failure {
            report.status = ClusterStatus::Failed;
            report.first_failure = Some(failure);
        }
        info!(
            campaign = %self.ctx.campaign_id(),
            cluster = %self.cluster,
            status = ?report.status,
            "cluster rollout finished"
        );
        report
    }

    async fn discover(&self) -> StepResult<ClusterHosts> {
        let key = self.scope.key(StepKind::GetClusterHosts);
        let ops = self.ctx.ops.clone();
        let cluster = self.cluster.clone();
        self.ctx
            .executor
            .execute(&key, StepKind::GetClusterHosts, move |attempt| {
                let ops = ops.clone();
                let req = ClusterHostsRequest {
                    cluster: cluster.clone(),
                };
                async move { ops.get_cluster_hosts(attempt, req).await }
            })
            .await
    }

    /// Run `hosts` concurrently and wait for all of them. `offset` is the
    /// position of the group's first host in the discovered list.
    async fn run_group(&self, hosts: &[String], offset: usize) -> GroupResult {
        let mut set = JoinSet::new();
        let mut positions = HashMap::new();
        for (i, host) in hosts.iter().enumerate() {
            let rollout =
                HostRollout::new(self.ctx.clone(), &self.cluster, &self.scope, offset + i, host);
            let handle = set.spawn(rollout.run());
            positions.insert(handle.id(), i);
        }

        let mut slots: Vec<Option<HostReport>> = vec![None; hosts.len()];
        let mut failures: Vec<Option<String>> = vec![None; hosts.len()];
        while let Some(joined) = set.join_next_with_id().await {
            match joined {
                Ok((id, Ok(report))) => {
                    if let Some(&i) = positions.get(&id) {
                        slots[i] = Some(report);
                    }
                }
                Ok((id, Err(failure))) => {
                    if let Some(&i) = positions.get(&id) {
                        failures[i] = Some(failure.to_string());
                        slots[i] = Some(failure.report);
                    }
                }
                Err(e) => {
                    warn!(cluster = %self.cluster, error = %e, "host task panicked");
                    if let Some(&i) = positions.get(&e.id()) {
                        failures[i] = Some(format!("host task panicked: {e}"));
                    }
                }
            }
        }

        // Reported in host order, not completion order.
        let first_failure = failures.into_iter().flatten().next();
        let reports = slots
            .into_iter()
            .zip(hosts)
            .map(|(slot, host)| {
                slot.unwrap_or_else(|| HostReport {
                    host: host.clone(),
                    outcome: HostOutcome::Failed {
                        step: String::new(),
                        error: "host task panicked".to_string(),
                    },
                    steps: Vec::new(),
                })
            })
            .collect();
        GroupResult {
            reports,
            first_failure,
        }
    }
}
