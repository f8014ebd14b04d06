// HTTP tests for the control API
// Requests go straight to the router; no server or worker is started, so
// runs stay where their first decision left them.

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Method, Request, StatusCode};
use axum::Router;
use http_body_util::BodyExt;
use keel_control_plane::ServerConfig;
use keel_durable::builtin::SequenceWorkflow;
use keel_durable::engine::{ExecutorConfig, WorkflowExecutor, WorkflowRegistry};
use keel_durable::persistence::InMemoryWorkflowEventStore;
use keel_durable::queue::InMemoryTaskQueue;
use keel_durable::reliability::TransientRetryConfig;
use keel_durable::schedule::{InMemoryScheduleStore, ScheduleManager};
use keel_durable::{ControlApi, ControlConfig};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app() -> Router {
    let executor = WorkflowExecutor::new(
        Arc::new(InMemoryWorkflowEventStore::new()),
        Arc::new(InMemoryTaskQueue::new()),
        WorkflowRegistry::new().with::<SequenceWorkflow>(),
        ExecutorConfig::default().with_transient_retry(TransientRetryConfig::disabled()),
    );
    let schedules = ScheduleManager::new(Arc::new(InMemoryScheduleStore::new()));
    let control = Arc::new(ControlApi::new(
        Arc::new(executor),
        Arc::new(schedules),
        ControlConfig::default(),
    ));
    keel_control_plane::app(control, &ServerConfig::default())
}

async fn call(app: &Router, method: Method, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let request = Request::builder().method(method).uri(uri);
    let request = match body {
        Some(body) => request
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => request.body(Body::empty()).unwrap(),
    };

    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap()
    };
    (status, value)
}

#[test_log::test(tokio::test)]
async fn test_workflow_lifecycle_over_http() {
    let app = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/workflows/workflows",
        Some(json!({
            "workflowType": "sequence",
            "workflowId": "order-1",
            "input": { "steps": ["reserve", "charge"] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["success"], true);
    assert_eq!(body["message"], "Workflow started successfully");
    assert_eq!(body["data"]["workflowId"], "order-1");
    let run_id = body["data"]["runId"].as_str().unwrap().to_string();

    let (status, body) = call(&app, Method::GET, "/api/v1/workflows/workflows/running", None).await;
    assert_eq!(status, StatusCode::OK);
    let running = body["data"].as_array().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0]["workflowId"], "order-1");
    assert_eq!(running[0]["status"], "RUNNING");
    assert_eq!(running[0]["activityCount"], 1);

    // No runId: the single open run is cancelled
    let (status, body) = call(
        &app,
        Method::DELETE,
        "/api/v1/workflows/workflows/order-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Workflow cancelled successfully");
    assert_eq!(body["data"], "order-1");

    let (status, body) = call(
        &app,
        Method::GET,
        &format!("/api/v1/workflows/workflows/order-1?runId={}", run_id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["runId"], run_id.as_str());
    assert_eq!(body["data"]["status"], "CANCELLED");
    assert_eq!(body["data"]["cancelReason"], "Cancelled via API");

    let (_, body) = call(&app, Method::GET, "/api/v1/workflows/workflows/running", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[test_log::test(tokio::test)]
async fn test_workflow_errors_use_the_envelope() {
    let app = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/workflows/workflows",
        Some(json!({ "workflowType": "unregistered" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .starts_with("Failed to start workflow"));

    let (status, body) = call(
        &app,
        Method::GET,
        "/api/v1/workflows/workflows/running?maxResults=0",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (status, body) = call(
        &app,
        Method::DELETE,
        "/api/v1/workflows/workflows/nobody",
        Some(json!({ "reason": "cleanup" })),
    )
    .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(body.get("data").is_none());
}

#[test_log::test(tokio::test)]
async fn test_malformed_cancellation_body_is_rejected() {
    let app = app();
    let (status, _) = call(
        &app,
        Method::POST,
        "/api/v1/workflows/workflows",
        Some(json!({
            "workflowType": "sequence",
            "workflowId": "order-2",
            "input": { "steps": ["reserve"] }
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);

    let (status, body) = call(
        &app,
        Method::DELETE,
        "/api/v1/workflows/workflows/order-2",
        Some(json!({ "runId": "not-a-uuid", "reason": "typo" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);

    let (_, body) = call(&app, Method::GET, "/api/v1/workflows/workflows/order-2", None).await;
    assert_eq!(body["data"]["status"], "RUNNING");
    assert!(body["data"].get("cancelReason").is_none());
}

#[test_log::test(tokio::test)]
async fn test_schedule_actions_over_http() {
    let app = app();

    let (status, body) = call(
        &app,
        Method::POST,
        "/api/v1/workflows/schedules",
        Some(json!({
            "scheduleId": "nightly",
            "workflowType": "sequence",
            "input": { "steps": ["report"] },
            "intervalMs": 60000
        })),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["scheduleId"], "nightly");
    assert_eq!(body["data"]["status"], "ACTIVE");
    assert_eq!(body["data"]["intervalMs"], 60000);

    let action = "/api/v1/workflows/schedules/nightly/action";
    for _ in 0..2 {
        let (status, body) = call(
            &app,
            Method::POST,
            action,
            Some(json!({ "action": "pause", "reason": "maintenance" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["message"], "Schedule paused successfully");
        assert_eq!(body["data"], "nightly");
    }

    let (status, body) = call(
        &app,
        Method::POST,
        action,
        Some(json!({ "action": "DELETE_TYPO" })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"], "Invalid action. Supported: CANCEL, PAUSE, UNPAUSE");

    let (status, body) = call(&app, Method::GET, "/api/v1/workflows/schedules/nightly", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "PAUSED");

    let (status, body) = call(&app, Method::POST, action, Some(json!({ "action": "CANCEL" }))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["message"], "Schedule cancelled successfully");

    let (status, body) = call(&app, Method::POST, action, Some(json!({ "action": "CANCEL" }))).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(
        body["error"],
        "Failed to perform action: schedule not found: nightly"
    );

    let (_, body) = call(&app, Method::GET, "/api/v1/workflows/schedules", None).await;
    assert!(body["data"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_health_and_openapi_document() {
    let app = app();

    let (status, body) = call(&app, Method::GET, "/health", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");

    let (status, body) = call(&app, Method::GET, "/api-doc/openapi.json", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]
        .get("/api/v1/workflows/schedules/{schedule_id}/action")
        .is_some());
}
