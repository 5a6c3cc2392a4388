//! Remote operations capability.
//!
//! The saga never talks to hosts, vaults or mail relays itself. It calls a
//! [`RemoteOps`] implementation, one method per step, and interprets the
//! returned [`OpError`] class to decide between retrying and giving up.
//!
//! # Architecture
//!
//! ```text
//! StepExecutor ──► attempt task ──► RemoteOps::perform_update(ctx, req)
//!       ▲                                   │
//!       └──────── Heartbeat (watch) ◄───────┘
//! ```

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;

// ── Failures ───────────────────────────────────────────────────

/// How the executor should treat a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureClass {
    /// Retry according to the step's policy.
    Transient,
    /// Give up immediately.
    NonRetryable,
    /// The step was handed malformed input; give up immediately.
    InvalidInput,
}

/// Failure reported by a remote operation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{error_type}: {message}")]
pub struct OpError {
    pub class: FailureClass,
    /// Short machine-readable category, matched against a policy's
    /// non-retryable error types.
    pub error_type: String,
    pub message: String,
}

impl OpError {
    pub fn transient(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::Transient,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn non_retryable(error_type: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::NonRetryable,
            error_type: error_type.into(),
            message: message.into(),
        }
    }

    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self {
            class: FailureClass::InvalidInput,
            error_type: "InvalidInput".to_string(),
            message: message.into(),
        }
    }
}

pub type OpResult<T> = Result<T, OpError>;

// ── Attempt context ────────────────────────────────────────────

/// Latest liveness report from a running attempt.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HeartbeatState {
    pub beats: u64,
    pub details: Option<String>,
}

/// Handle a long-running operation uses to report liveness.
#[derive(Debug, Clone)]
pub struct Heartbeat {
    tx: Arc<watch::Sender<HeartbeatState>>,
}

impl Heartbeat {
    /// Create a heartbeat handle and the receiver the executor watches.
    pub fn channel() -> (Self, watch::Receiver<HeartbeatState>) {
        let (tx, rx) = watch::channel(HeartbeatState::default());
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Report liveness without changing the recorded details.
    pub fn beat(&self) {
        self.tx.send_modify(|state| state.beats += 1);
    }

    /// Report liveness along with progress details. The details are handed
    /// to the next attempt if this one fails.
    pub fn record(&self, details: impl Into<String>) {
        let details = details.into();
        self.tx.send_modify(|state| {
            state.beats += 1;
            state.details = Some(details);
        });
    }
}

/// Everything an operation learns about the attempt it is running in.
#[derive(Debug, Clone)]
pub struct AttemptContext {
    /// 1-based attempt number.
    pub attempt: u32,
    pub heartbeat: Heartbeat,
    /// Details from the last heartbeat of the previous attempt, if any.
    pub last_heartbeat_details: Option<String>,
}

impl AttemptContext {
    /// A detached context for calling an operation outside the executor.
    pub fn detached(attempt: u32) -> Self {
        let (heartbeat, _rx) = Heartbeat::channel();
        Self {
            attempt,
            heartbeat,
            last_heartbeat_details: None,
        }
    }
}

// ── Inputs and outputs ─────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApprovalRequest {
    pub campaign_id: String,
    pub target_clusters: Vec<String>,
    pub approver_emails: Vec<String>,
    pub requester_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CredentialRequest {
    pub vault_address: String,
    pub secret_path_prefix: String,
}

/// Credentials fetched once per campaign and shared by every host task.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub address: String,
    pub token: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("address", &self.address)
            .field("token", &"<redacted>")
            .finish()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHostsRequest {
    pub cluster: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterHosts {
    pub hostnames: Vec<String>,
}

/// A host together with the credentials used to reach it.
#[derive(Debug, Clone)]
pub struct HostTarget {
    pub hostname: String,
    pub credentials: Arc<Credentials>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PreconditionReport {
    pub preconditions_met: bool,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceRequest {
    pub target: HostTarget,
    pub services: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct ScriptRequest {
    pub target: HostTarget,
    pub scripts: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct UpdateRequest {
    pub target: HostTarget,
    pub update_command: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationRequest {
    pub hostname: String,
    pub requester_email: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlertRequest {
    pub hostname: String,
    pub requester_email: String,
    pub failure_details: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FinalNotificationRequest {
    pub campaign_id: String,
    pub requester_email: String,
    pub summary: String,
}

// ── Capability ─────────────────────────────────────────────────

/// The remote operations a campaign performs.
///
/// Implementations must tolerate being invoked more than once for the same
/// logical step: attempts abandoned on timeout keep running detached, and
/// their eventual results are discarded.
#[async_trait]
pub trait RemoteOps: Send + Sync + 'static {
    async fn send_approval_request(&self, ctx: AttemptContext, req: ApprovalRequest)
    -> OpResult<()>;

    async fn fetch_credentials(
        &self,
        ctx: AttemptContext,
        req: CredentialRequest,
    ) -> OpResult<Credentials>;

    async fn get_cluster_hosts(
        &self,
        ctx: AttemptContext,
        req: ClusterHostsRequest,
    ) -> OpResult<ClusterHosts>;

    async fn check_host_preconditions(
        &self,
        ctx: AttemptContext,
        target: HostTarget,
    ) -> OpResult<PreconditionReport>;

    async fn run_pre_downtime_scripts(&self, ctx: AttemptContext, target: HostTarget)
    -> OpResult<()>;

    async fn set_maintenance_mode(&self, ctx: AttemptContext, target: HostTarget) -> OpResult<()>;

    async fn stop_services(&self, ctx: AttemptContext, req: ServiceRequest) -> OpResult<()>;

    async fn wait_for_workload_drain(&self, ctx: AttemptContext, target: HostTarget)
    -> OpResult<()>;

    async fn run_pre_update_scripts(&self, ctx: AttemptContext, req: ScriptRequest)
    -> OpResult<()>;

    async fn perform_update(&self, ctx: AttemptContext, req: UpdateRequest) -> OpResult<()>;

    async fn start_services(&self, ctx: AttemptContext, req: ServiceRequest) -> OpResult<()>;

    async fn run_post_update_scripts(&self, ctx: AttemptContext, req: ScriptRequest)
    -> OpResult<()>;

    async fn check_service_health(&self, ctx: AttemptContext, req: ServiceRequest)
    -> OpResult<()>;

    async fn send_success_notification(
        &self,
        ctx: AttemptContext,
        req: NotificationRequest,
    ) -> OpResult<()>;

    async fn send_failure_alert(&self, ctx: AttemptContext, req: AlertRequest) -> OpResult<()>;

    async fn send_final_notification(
        &self,
        ctx: AttemptContext,
        req: FinalNotificationRequest,
    ) -> OpResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_redacts_token() {
        let creds = Credentials {
            address: "https://vault.internal".to_string(),
            token: "s.secret".to_string(),
        };
        let rendered = format!("{creds:?}");
        assert!(rendered.contains("vault.internal"));
        assert!(!rendered.contains("s.secret"));
    }

    #[test]
    fn heartbeat_records_details() {
        let (heartbeat, rx) = Heartbeat::channel();
        heartbeat.beat();
        heartbeat.record("50%");
        let state = rx.borrow().clone();
        assert_eq!(state.beats, 2);
        assert_eq!(state.details.as_deref(), Some("50%"));
    }

    #[test]
    fn heartbeat_survives_dropped_receiver() {
        let ctx = AttemptContext::detached(1);
        ctx.heartbeat.record("still fine");
    }

    #[test]
    fn op_error_display() {
        let err = OpError::transient("HostUnreachable", "no route to c1_host1");
        assert_eq!(err.to_string(), "HostUnreachable: no route to c1_host1");
        assert_eq!(OpError::invalid_input("x").class, FailureClass::InvalidInput);
    }
}
