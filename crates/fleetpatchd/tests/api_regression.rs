//! API regression tests.
//!
//! Drives the daemon's router against the simulated fleet: starts
//! campaigns over HTTP, approves them, reads progress and results, and
//! reopens an on-disk journal.

use std::sync::Arc;
use std::time::Duration;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use fleetpatch_api::build_router;
use fleetpatch_saga::{CampaignEngine, SagaSettings};
use fleetpatch_state::JournalStore;
use fleetpatchd::config::{FleetpatchConfig, SimulationConfig};
use fleetpatchd::ops::SimulatedOps;
use serde_json::{Value, json};
use tower::ServiceExt;

fn simulation() -> SimulationConfig {
    SimulationConfig {
        hosts_per_cluster: 3,
        latency: "20ms".to_string(),
        ..SimulationConfig::default()
    }
}

fn test_router(journal: JournalStore, sim: SimulationConfig) -> Router {
    let ops = SimulatedOps::new(&sim).unwrap();
    let engine = CampaignEngine::new(journal, Arc::new(ops), SagaSettings::default());
    build_router(engine)
}

fn campaign_body(id: &str) -> Value {
    json!({
        "id": id,
        "target_clusters": ["c1", "c2"],
        "pilot_host_count": 1,
        "approver_emails": ["approver@example.com"],
        "requester_email": "requester@example.com",
        "update_command": "yum update -y",
        "service_list": ["nginx"],
    })
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[tokio::test]
async fn api_list_campaigns_empty() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());
    let (status, body) = send(&router, "GET", "/api/v1/campaigns", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"], json!([]));
}

#[tokio::test(start_paused = true)]
async fn api_campaign_lifecycle() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());

    let (status, body) = send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("patch-1"))).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["id"], "patch-1");

    let (status, _) = send(&router, "GET", "/api/v1/campaigns/patch-1/result", None).await;
    assert_eq!(status, StatusCode::ACCEPTED);

    let (status, body) = send(&router, "POST", "/api/v1/campaigns/patch-1/approve", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["approved"], true);

    let (status, body) = send(&router, "GET", "/api/v1/campaigns/patch-1/result?wait=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");
    let clusters = body["data"]["report"]["clusters"].as_array().unwrap();
    assert_eq!(clusters.len(), 2);

    let (status, body) = send(&router, "GET", "/api/v1/campaigns/patch-1/progress", None).await;
    assert_eq!(status, StatusCode::OK);
    let entries: Vec<String> = serde_json::from_value(body["data"].clone()).unwrap();
    assert_eq!(entries.first().map(String::as_str), Some("approval_requested"));
    assert_eq!(entries.last().map(String::as_str), Some("final_notification_sent"));
    assert!(entries.contains(&"pilot_group_done:c1".to_string()));
    assert!(entries.contains(&"remaining_group_done:c2".to_string()));
    assert_eq!(entries.iter().filter(|e| e.starts_with("host_succeeded:")).count(), 6);
}

#[tokio::test(start_paused = true)]
async fn api_flaky_fleet_recovers_and_broken_host_is_reported() {
    let sim = SimulationConfig {
        flaky_clusters: vec!["c1".to_string()],
        flaky_hosts: vec!["c2_host2".to_string()],
        ineligible_hosts: vec!["c2_host3".to_string()],
        broken_hosts: vec!["c1_host2".to_string()],
        ..simulation()
    };
    let router = test_router(JournalStore::open_in_memory().unwrap(), sim);

    send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("patch-2"))).await;
    send(&router, "POST", "/api/v1/campaigns/patch-2/approve", None).await;

    let (status, body) = send(&router, "GET", "/api/v1/campaigns/patch-2/result?wait=true", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed_with_failures");

    let (_, body) = send(&router, "GET", "/api/v1/campaigns/patch-2/progress", None).await;
    let entries: Vec<String> = serde_json::from_value(body["data"].clone()).unwrap();
    assert!(entries.contains(&"host_failed:c1_host2".to_string()));
    assert!(entries.contains(&"host_succeeded:c2_host2".to_string()));
    assert!(entries.contains(&"host_ineligible:c2_host3".to_string()));
    assert_eq!(entries.last().map(String::as_str), Some("final_notification_sent"));
}

#[tokio::test(start_paused = true)]
async fn api_duplicate_running_campaign_conflicts() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());

    let (status, _) = send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("dup"))).await;
    assert_eq!(status, StatusCode::CREATED);
    let (status, body) = send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("dup"))).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["success"], false);

    let mut replace = campaign_body("dup");
    replace["reuse_policy"] = json!("terminate_if_running");
    let (status, _) = send(&router, "POST", "/api/v1/campaigns", Some(replace)).await;
    assert_eq!(status, StatusCode::CREATED);
}

#[tokio::test]
async fn api_rejects_empty_target_list() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());
    let mut body = campaign_body("empty");
    body["target_clusters"] = json!([]);
    let (status, body) = send(&router, "POST", "/api/v1/campaigns", Some(body)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("invalid campaign"));
}

#[tokio::test(start_paused = true)]
async fn api_terminate_running_campaign() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());
    send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("stop-me"))).await;

    let (status, _) = send(
        &router,
        "POST",
        "/api/v1/campaigns/stop-me/terminate",
        Some(json!({"reason": "change window closed"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (_, body) = send(&router, "GET", "/api/v1/campaigns/stop-me/result?wait=true", None).await;
    assert_eq!(body["data"]["status"], "terminated");
    assert!(
        body["data"]["failure"]
            .as_str()
            .unwrap()
            .contains("change window closed")
    );
}

#[tokio::test(start_paused = true)]
async fn api_terminate_without_body_uses_default_reason() {
    let router = test_router(JournalStore::open_in_memory().unwrap(), simulation());
    send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("bare"))).await;

    let (status, body) = send(&router, "POST", "/api/v1/campaigns/bare/terminate", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["reason"], "terminated by operator");

    let (_, body) = send(&router, "GET", "/api/v1/campaigns/bare/result?wait=true", None).await;
    assert_eq!(body["data"]["status"], "terminated");
    assert!(
        body["data"]["failure"]
            .as_str()
            .unwrap()
            .contains("terminated by operator")
    );
}

#[tokio::test(start_paused = true)]
async fn api_finished_campaign_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("fleetpatch.redb");

    {
        let router = test_router(JournalStore::open(&db_path).unwrap(), simulation());
        send(&router, "POST", "/api/v1/campaigns", Some(campaign_body("durable"))).await;
        send(&router, "POST", "/api/v1/campaigns/durable/approve", None).await;
        let (_, body) = send(&router, "GET", "/api/v1/campaigns/durable/result?wait=true", None).await;
        assert_eq!(body["data"]["status"], "completed");
    }
    // Let the finished campaign task release its journal handle.
    tokio::time::sleep(Duration::from_millis(50)).await;

    let router = test_router(JournalStore::open(&db_path).unwrap(), simulation());
    let (status, body) = send(&router, "GET", "/api/v1/campaigns/durable/result", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "completed");

    let (_, body) = send(&router, "GET", "/api/v1/campaigns/durable/progress", None).await;
    let entries: Vec<String> = serde_json::from_value(body["data"].clone()).unwrap();
    assert_eq!(entries.last().map(String::as_str), Some("final_notification_sent"));
}

#[test]
fn sample_config_parses() {
    let path = concat!(env!("CARGO_MANIFEST_DIR"), "/../../demos/fleetpatch.toml");
    let config = FleetpatchConfig::from_file(std::path::Path::new(path)).unwrap();
    config.saga_settings().unwrap();
    SimulatedOps::new(&config.simulation).unwrap();
}
