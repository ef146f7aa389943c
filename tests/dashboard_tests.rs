use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::{Duration, Utc};
use http_body_util::BodyExt;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower::ServiceExt;
use uuid::Uuid;

use codeimport_worker::dashboard::{router, DashboardState};
use codeimport_worker::machine::{Machine, OfflineReason};

fn test_state(machine: Machine) -> DashboardState {
    DashboardState {
        machine: Arc::new(RwLock::new(machine)),
        active_jobs: Arc::new(RwLock::new(HashMap::new())),
    }
}

async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
    let response = app
        .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
        .await
        .unwrap();
    let status = response.status();
    let body = response.into_body().collect().await.unwrap().to_bytes();
    (status, serde_json::from_slice(&body).unwrap())
}

#[tokio::test]
async fn test_machine_endpoint_reports_state() {
    let mut machine = Machine::new("importer-1", 4);
    machine.set_online();
    assert!(machine.reserve_slot());
    let state = test_state(machine);

    let (status, json) = get_json(router(state), "/api/machine").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["hostname"], "importer-1");
    assert_eq!(json["state"], "ONLINE");
    assert_eq!(json["accepting_jobs"], true);
    assert_eq!(json["running_jobs"], 1);
    assert_eq!(json["capacity"], 4);
    assert!(json["heartbeat"].is_null());
    assert_eq!(json["recent_events"][0]["kind"], "online");
}

#[tokio::test]
async fn test_machine_endpoint_includes_transition_details() {
    let mut machine = Machine::new("importer-2", 1);
    machine.set_online();
    machine.set_quiescing("operator", "disk swap").unwrap();
    machine.set_offline(OfflineReason::Quiesced);
    let state = test_state(machine);

    let (_, json) = get_json(router(state), "/api/machine").await;

    assert_eq!(json["state"], "OFFLINE");
    assert_eq!(json["accepting_jobs"], false);
    let events = json["recent_events"].as_array().unwrap();
    assert_eq!(events.len(), 3);
    assert_eq!(events[1]["kind"], "quiesce");
    assert_eq!(events[1]["requested_by"], "operator");
    assert_eq!(events[1]["message"], "disk swap");
    assert_eq!(events[2]["kind"], "offline");
    assert_eq!(events[2]["reason"], "Quiesced");
}

#[tokio::test]
async fn test_machine_endpoint_limits_event_history() {
    let mut machine = Machine::new("importer-3", 1);
    for _ in 0..30 {
        machine.set_online();
        machine.set_offline(OfflineReason::Stopped);
    }
    let state = test_state(machine);

    let (_, json) = get_json(router(state), "/api/machine").await;

    let events = json["recent_events"].as_array().unwrap();
    assert_eq!(events.len(), 20);
    assert_eq!(events[19]["kind"], "offline");
}

#[tokio::test]
async fn test_jobs_endpoint_sorted_by_start() {
    let state = test_state(Machine::new("importer-4", 2));
    let older = Uuid::new_v4();
    let newer = Uuid::new_v4();
    {
        let mut active = state.active_jobs.write().await;
        active.insert(newer, Utc::now());
        active.insert(older, Utc::now() - Duration::minutes(5));
    }

    let (status, json) = get_json(router(state), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    let jobs = json.as_array().unwrap();
    assert_eq!(jobs.len(), 2);
    assert_eq!(jobs[0]["job_id"], older.to_string());
    assert_eq!(jobs[1]["job_id"], newer.to_string());
}

#[tokio::test]
async fn test_jobs_endpoint_empty() {
    let state = test_state(Machine::new("importer-5", 2));

    let (status, json) = get_json(router(state), "/api/jobs").await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json, Value::Array(vec![]));
}

#[tokio::test]
async fn test_unknown_route_is_not_found() {
    let state = test_state(Machine::new("importer-6", 2));

    let response = router(state)
        .oneshot(
            Request::builder()
                .uri("/api/nope")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
