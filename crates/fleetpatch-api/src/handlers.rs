//! REST API handlers.
//!
//! Each handler calls one `CampaignEngine` operation and returns a JSON
//! response in the common envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use fleetpatch_saga::{EngineError, StartRequest};
use fleetpatch_state::CampaignStatus;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(Serialize)]
struct ApiResponse<T: Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: Serialize> ApiResponse<T> {
    fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

fn engine_error(e: EngineError) -> Response {
    let status = match &e {
        EngineError::NotFound(_) => StatusCode::NOT_FOUND,
        EngineError::AlreadyRunning(_) | EngineError::NotRunning(_) => StatusCode::CONFLICT,
        EngineError::InvalidSpec(_) => StatusCode::BAD_REQUEST,
        EngineError::State(_) => {
            warn!(error = %e, "campaign engine storage error");
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    error_response(&e.to_string(), status).into_response()
}

/// Short form of a campaign for listings and acknowledgements.
#[derive(Debug, Serialize, Deserialize)]
pub struct CampaignSummary {
    pub id: String,
    pub status: CampaignStatus,
    pub approved: bool,
    pub target_clusters: Vec<String>,
    pub created_at: u64,
}

impl From<&fleetpatch_state::CampaignRecord> for CampaignSummary {
    fn from(r: &fleetpatch_state::CampaignRecord) -> Self {
        Self {
            id: r.id.clone(),
            status: r.status,
            approved: r.approved,
            target_clusters: r.spec.target_clusters.clone(),
            created_at: r.created_at,
        }
    }
}

// ── Campaigns ──────────────────────────────────────────────────

/// GET /api/v1/campaigns
pub async fn list_campaigns(State(state): State<ApiState>) -> impl IntoResponse {
    match state.engine.list().await {
        Ok(records) => {
            let summaries: Vec<CampaignSummary> = records.iter().map(CampaignSummary::from).collect();
            ApiResponse::ok(summaries).into_response()
        }
        Err(e) => engine_error(e),
    }
}

/// POST /api/v1/campaigns
pub async fn create_campaign(
    State(state): State<ApiState>,
    Json(request): Json<StartRequest>,
) -> impl IntoResponse {
    let handle = match state.engine.start(request).await {
        Ok(handle) => handle,
        Err(e) => return engine_error(e),
    };
    match state.engine.status(handle.id()).await {
        Ok(record) => (
            StatusCode::CREATED,
            ApiResponse::ok(CampaignSummary::from(&record)),
        )
            .into_response(),
        Err(e) => engine_error(e),
    }
}

/// GET /api/v1/campaigns/{id}
pub async fn get_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.status(&id).await {
        Ok(record) => ApiResponse::ok(record).into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Signals ────────────────────────────────────────────────────

/// POST /api/v1/campaigns/{id}/approve
pub async fn approve_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.approve(&id).await {
        Ok(changed) => ApiResponse::ok(serde_json::json!({
            "id": id,
            "approved": true,
            "changed": changed,
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

/// Terminate request body.
#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub reason: Option<String>,
}

/// POST /api/v1/campaigns/{id}/terminate
pub async fn terminate_campaign(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    body: Option<Json<TerminateRequest>>,
) -> impl IntoResponse {
    // A bare POST without a JSON body uses the default reason.
    let reason = body
        .and_then(|Json(req)| req.reason)
        .unwrap_or_else(|| "terminated by operator".to_string());
    match state.engine.terminate(&id, &reason).await {
        Ok(()) => ApiResponse::ok(serde_json::json!({
            "id": id,
            "status": "terminating",
            "reason": reason,
        }))
        .into_response(),
        Err(e) => engine_error(e),
    }
}

// ── Queries ────────────────────────────────────────────────────

/// GET /api/v1/campaigns/{id}/progress
pub async fn get_progress(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.engine.progress(&id).await {
        Ok(entries) => ApiResponse::ok(entries).into_response(),
        Err(e) => engine_error(e),
    }
}

/// Query parameters for the result endpoint.
#[derive(Debug, Default, Deserialize)]
pub struct ResultQuery {
    /// Block until the campaign finishes.
    #[serde(default)]
    pub wait: bool,
}

/// GET /api/v1/campaigns/{id}/result
///
/// Returns 200 with the outcome once the campaign is terminal, or 202 with
/// the current status while it is still running and `wait` is not set.
pub async fn get_result(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(query): Query<ResultQuery>,
) -> impl IntoResponse {
    if query.wait {
        return match state.engine.wait(&id).await {
            Ok(outcome) => ApiResponse::ok(outcome).into_response(),
            Err(e) => engine_error(e),
        };
    }

    match state.engine.outcome(&id).await {
        Ok(Some(outcome)) => ApiResponse::ok(outcome).into_response(),
        Ok(None) => match state.engine.status(&id).await {
            Ok(record) => (
                StatusCode::ACCEPTED,
                ApiResponse::ok(CampaignSummary::from(&record)),
            )
                .into_response(),
            Err(e) => engine_error(e),
        },
        Err(e) => engine_error(e),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use async_trait::async_trait;
    use axum::body::to_bytes;
    use fleetpatch_saga::ops::*;
    use fleetpatch_saga::{CampaignEngine, SagaSettings};
    use fleetpatch_state::{CampaignSpec, JournalStore, SecretRef};

    use super::*;

    /// Remote operations that succeed immediately.
    struct InstantOps;

    #[async_trait]
    impl RemoteOps for InstantOps {
        async fn send_approval_request(&self, _: AttemptContext, _: ApprovalRequest) -> OpResult<()> {
            Ok(())
        }
        async fn fetch_credentials(
            &self,
            _: AttemptContext,
            req: CredentialRequest,
        ) -> OpResult<Credentials> {
            Ok(Credentials {
                address: req.vault_address,
                token: "t".to_string(),
            })
        }
        async fn get_cluster_hosts(
            &self,
            _: AttemptContext,
            req: ClusterHostsRequest,
        ) -> OpResult<ClusterHosts> {
            Ok(ClusterHosts {
                hostnames: vec![format!("{}_host1", req.cluster), format!("{}_host2", req.cluster)],
            })
        }
        async fn check_host_preconditions(
            &self,
            _: AttemptContext,
            _: HostTarget,
        ) -> OpResult<PreconditionReport> {
            Ok(PreconditionReport {
                preconditions_met: true,
                reason: None,
            })
        }
        async fn run_pre_downtime_scripts(&self, _: AttemptContext, _: HostTarget) -> OpResult<()> {
            Ok(())
        }
        async fn set_maintenance_mode(&self, _: AttemptContext, _: HostTarget) -> OpResult<()> {
            Ok(())
        }
        async fn stop_services(&self, _: AttemptContext, _: ServiceRequest) -> OpResult<()> {
            Ok(())
        }
        async fn wait_for_workload_drain(&self, _: AttemptContext, _: HostTarget) -> OpResult<()> {
            Ok(())
        }
        async fn run_pre_update_scripts(&self, _: AttemptContext, _: ScriptRequest) -> OpResult<()> {
            Ok(())
        }
        async fn perform_update(&self, _: AttemptContext, _: UpdateRequest) -> OpResult<()> {
            Ok(())
        }
        async fn start_services(&self, _: AttemptContext, _: ServiceRequest) -> OpResult<()> {
            Ok(())
        }
        async fn run_post_update_scripts(&self, _: AttemptContext, _: ScriptRequest) -> OpResult<()> {
            Ok(())
        }
        async fn check_service_health(&self, _: AttemptContext, _: ServiceRequest) -> OpResult<()> {
            Ok(())
        }
        async fn send_success_notification(
            &self,
            _: AttemptContext,
            _: NotificationRequest,
        ) -> OpResult<()> {
            Ok(())
        }
        async fn send_failure_alert(&self, _: AttemptContext, _: AlertRequest) -> OpResult<()> {
            Ok(())
        }
        async fn send_final_notification(
            &self,
            _: AttemptContext,
            _: FinalNotificationRequest,
        ) -> OpResult<()> {
            Ok(())
        }
    }

    fn test_state() -> ApiState {
        let engine = CampaignEngine::new(
            JournalStore::open_in_memory().unwrap(),
            Arc::new(InstantOps),
            SagaSettings::default(),
        );
        ApiState { engine }
    }

    fn test_request(id: &str) -> StartRequest {
        StartRequest::new(CampaignSpec {
            target_clusters: vec!["c1".to_string()],
            pilot_host_count: 1,
            approver_emails: vec!["approver@example.com".to_string()],
            requester_email: "requester@example.com".to_string(),
            update_command: "yum update -y".to_string(),
            service_list: vec!["nginx".to_string()],
            pre_update_scripts: Vec::new(),
            post_update_scripts: Vec::new(),
            secret: SecretRef::default(),
        })
        .with_id(id)
    }

    async fn body_json(resp: Response) -> serde_json::Value {
        let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn list_campaigns_empty() {
        let state = test_state();
        let resp = list_campaigns(State(state)).await.into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"], serde_json::json!([]));
    }

    #[tokio::test]
    async fn create_and_get_campaign() {
        let state = test_state();
        let resp = create_campaign(State(state.clone()), Json(test_request("camp-a")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CREATED);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["id"], "camp-a");

        let resp = get_campaign(State(state), Path("camp-a".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn duplicate_campaign_conflicts() {
        let state = test_state();
        create_campaign(State(state.clone()), Json(test_request("dup")))
            .await
            .into_response();
        let resp = create_campaign(State(state), Json(test_request("dup")))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }

    #[tokio::test]
    async fn invalid_campaign_is_bad_request() {
        let state = test_state();
        let mut request = test_request("bad");
        request.spec.target_clusters.clear();
        let resp = create_campaign(State(state), Json(request))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn unknown_campaign_is_not_found() {
        let state = test_state();
        let resp = get_campaign(State(state.clone()), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);

        let resp = approve_campaign(State(state), Path("nope".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn result_is_pending_until_approved() {
        let state = test_state();
        create_campaign(State(state.clone()), Json(test_request("pending")))
            .await
            .into_response();

        let resp = get_result(
            State(state.clone()),
            Path("pending".to_string()),
            Query(ResultQuery::default()),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::ACCEPTED);

        let resp = approve_campaign(State(state.clone()), Path("pending".to_string()))
            .await
            .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = get_result(
            State(state),
            Path("pending".to_string()),
            Query(ResultQuery { wait: true }),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);
        let body = body_json(resp).await;
        assert_eq!(body["data"]["status"], "completed");
    }

    #[tokio::test]
    async fn terminate_then_terminate_again_conflicts() {
        let state = test_state();
        create_campaign(State(state.clone()), Json(test_request("stop")))
            .await
            .into_response();

        let resp = terminate_campaign(
            State(state.clone()),
            Path("stop".to_string()),
            None,
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::OK);

        state.engine.wait("stop").await.unwrap();
        let resp = terminate_campaign(
            State(state),
            Path("stop".to_string()),
            Some(Json(TerminateRequest::default())),
        )
        .await
        .into_response();
        assert_eq!(resp.status(), StatusCode::CONFLICT);
    }
}
