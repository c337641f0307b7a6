//! Integration tests for the API server.

use std::sync::{Arc, OnceLock};
use std::time::Duration;

use api::config::Config;
use api::routes::sagas::AppState;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::SagaId;
use metrics_exporter_prometheus::PrometheusHandle;
use saga::InMemoryTransport;
use serde_json::{Value, json};
use tower::ServiceExt;

static METRICS_HANDLE: OnceLock<PrometheusHandle> = OnceLock::new();

fn get_metrics_handle() -> PrometheusHandle {
    METRICS_HANDLE
        .get_or_init(|| {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            builder
                .install_recorder()
                .expect("failed to install Prometheus recorder")
        })
        .clone()
}

fn setup() -> (axum::Router, Arc<AppState>, InMemoryTransport) {
    let transport = InMemoryTransport::new();
    let state = api::create_state(&Config::default(), Arc::new(transport.clone()));
    let app = api::create_app(state.clone(), get_metrics_handle());
    (app, state, transport)
}

async fn send(app: &axum::Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let body = axum::body::to_bytes(response.into_body(), usize::MAX)
        .await
        .unwrap();
    let json = if body.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&body).unwrap_or(Value::Null)
    };
    (status, json)
}

fn get(uri: &str) -> Request<Body> {
    Request::builder().uri(uri).body(Body::empty()).unwrap()
}

fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_string(&body).unwrap()))
        .unwrap()
}

async fn submit_and_wait(app: &axum::Router, state: &AppState, uri: &str, body: Value) -> String {
    let (status, json) = send(app, post_json(uri, body)).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let id = json["saga_id"].as_str().unwrap().to_string();
    let saga_id: SagaId = id.parse().unwrap();
    state
        .orchestrator
        .await_terminal(saga_id, Duration::from_secs(10))
        .await
        .unwrap();
    id
}

#[tokio::test]
async fn test_health_check() {
    let (app, _, _) = setup();

    let (status, json) = send(&app, get("/health")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["status"], "ok");
    assert_eq!(json["sagas_retained"], 0);
}

#[tokio::test]
async fn test_submit_entry_returns_accepted() {
    let (app, _, _) = setup();

    let (status, json) = send(
        &app,
        post_json(
            "/sagas/entry",
            json!({ "license_plate": "34ABC123", "user_id": "user-42", "is_favorite": true }),
        ),
    )
    .await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(json["status"], "in_progress");
    assert_eq!(json["message"], "Vehicle entry saga started");
    assert!(json["saga_id"].as_str().unwrap().parse::<SagaId>().is_ok());
}

#[tokio::test]
async fn test_entry_runs_to_completion() {
    let (app, state, _) = setup();

    let id = submit_and_wait(
        &app,
        &state,
        "/sagas/entry",
        json!({ "license_plate": "34ABC123", "user_id": "user-42" }),
    )
    .await;
    let (status, json) = send(&app, get(&format!("/sagas/{id}"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["saga_id"], id.as_str());
    assert_eq!(json["status"], "completed");
    assert_eq!(json["description"], "Vehicle entry for 34ABC123");
    assert_eq!(json["current_step_index"], 6);
    assert_eq!(json["steps"].as_array().unwrap().len(), 6);
    assert_eq!(json["telemetry"]["compensation_steps_executed"], 0);
    assert_eq!(json["telemetry"]["fallback_mechanisms_used"], json!([]));
}

#[tokio::test]
async fn test_failed_step_error_is_visible() {
    let (app, state, transport) = setup();
    transport.fail("parking_record_service", "create_entry_record");

    let id = submit_and_wait(&app, &state, "/sagas/entry", json!({ "license_plate": "06XYZ999" })).await;
    let (_, json) = send(&app, get(&format!("/sagas/{id}"))).await;

    assert_eq!(json["status"], "failed");
    let steps = json["steps"].as_array().unwrap();
    let create = steps
        .iter()
        .find(|s| s["step_id"] == "create_entry_record")
        .unwrap();
    assert_eq!(create["status"], "failed");
    assert!(create["error"].as_str().unwrap().contains("status 500"));
    let allocate = steps
        .iter()
        .find(|s| s["step_id"] == "allocate_parking_space")
        .unwrap();
    assert_eq!(allocate["status"], "compensated");
}

#[tokio::test]
async fn test_exit_and_payment_submissions() {
    let (app, state, _) = setup();

    let exit = submit_and_wait(&app, &state, "/sagas/exit", json!({ "license_plate": "34ABC123" })).await;
    let payment = submit_and_wait(
        &app,
        &state,
        "/sagas/payment",
        json!({ "license_plate": "34ABC123", "payment_method": "debit_card" }),
    )
    .await;

    let (_, exit_json) = send(&app, get(&format!("/sagas/{exit}"))).await;
    assert_eq!(exit_json["template"], "vehicle_exit");
    assert_eq!(exit_json["status"], "completed");

    let (_, payment_json) = send(&app, get(&format!("/sagas/{payment}"))).await;
    assert_eq!(payment_json["template"], "payment");
    assert_eq!(payment_json["description"], "Parking payment for 34ABC123");
}

#[tokio::test]
async fn test_empty_license_plate_is_rejected() {
    let (app, state, _) = setup();

    let (status, json) = send(&app, post_json("/sagas/entry", json!({ "license_plate": "" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("license_plate"));

    let (status, _) = send(&app, post_json("/sagas/exit", json!({ "user_id": "user-42" }))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    assert!(state.orchestrator.list().await.is_empty());
}

#[tokio::test]
async fn test_get_nonexistent_saga() {
    let (app, _, _) = setup();

    let (status, json) = send(&app, get(&format!("/sagas/{}", SagaId::new()))).await;

    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(json["error"].as_str().unwrap().contains("not found"));
}

#[tokio::test]
async fn test_invalid_saga_id_format() {
    let (app, _, _) = setup();

    let (status, json) = send(&app, get("/sagas/not-a-uuid")).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(json["error"].as_str().unwrap().contains("Invalid ID format"));
}

#[tokio::test]
async fn test_list_sagas() {
    let (app, state, _) = setup();
    submit_and_wait(&app, &state, "/sagas/entry", json!({ "license_plate": "34ABC123" })).await;
    submit_and_wait(&app, &state, "/sagas/exit", json!({ "license_plate": "06XYZ999" })).await;

    let (status, json) = send(&app, get("/sagas")).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["total"], 2);
    let sagas = json["sagas"].as_array().unwrap();
    assert_eq!(sagas[0]["description"], "Vehicle entry for 34ABC123");
    assert_eq!(sagas[1]["description"], "Vehicle exit for 06XYZ999");
    assert!(sagas.iter().all(|s| s["status"] == "completed"));
}

#[tokio::test]
async fn test_saga_events() {
    let (app, state, _) = setup();
    let id = submit_and_wait(&app, &state, "/sagas/payment", json!({ "license_plate": "34ABC123" })).await;

    let (status, json) = send(&app, get(&format!("/sagas/{id}/events"))).await;

    assert_eq!(status, StatusCode::OK);
    let events = json.as_array().unwrap();
    assert_eq!(events.first().unwrap()["event_type"], "SagaStarted");
    assert_eq!(events.last().unwrap()["event_type"], "SagaCompleted");
    assert_eq!(events[0]["event"]["data"]["template"], "payment");
}

#[tokio::test]
async fn test_cleanup_removes_finished_sagas() {
    let (app, state, _) = setup();
    submit_and_wait(&app, &state, "/sagas/entry", json!({ "license_plate": "34ABC123" })).await;

    let (status, json) = send(&app, post_json("/sagas/cleanup", json!({}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(json["removed_count"], 0);

    let (_, json) = send(&app, post_json("/sagas/cleanup?max_age_hours=0", json!({}))).await;
    assert_eq!(json["removed_count"], 1);

    let (_, json) = send(&app, get("/sagas")).await;
    assert_eq!(json["total"], 0);
}

#[tokio::test]
async fn test_circuit_breakers() {
    let (app, state, _) = setup();
    submit_and_wait(&app, &state, "/sagas/entry", json!({ "license_plate": "34ABC123" })).await;

    let (status, json) = send(&app, get("/circuit-breakers")).await;

    assert_eq!(status, StatusCode::OK);
    let parking = json
        .as_array()
        .unwrap()
        .iter()
        .find(|c| c["service"] == "parking_service")
        .unwrap()
        .clone();
    assert_eq!(parking["state"], "closed");
    assert_eq!(parking["failure_count"], 0);
}

#[tokio::test]
async fn test_metrics_endpoint() {
    let (app, state, _) = setup();
    submit_and_wait(&app, &state, "/sagas/entry", json!({ "license_plate": "34ABC123" })).await;

    let response = app.oneshot(get("/metrics")).await.unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers()["content-type"].to_str().unwrap().to_string();
    assert!(content_type.starts_with("text/plain"));
}
