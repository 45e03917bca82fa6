// HTTP route tests for the graduation API
// Run with: cargo test -p graduation-control-plane --test api_test
// Uses the in-memory store and a recording runner; workflows run only when a test calls the executor

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
    Router,
};
use chrono::Utc;
use graduation_control_plane::build_router;
use graduation_control_plane::config::StoreKind;
use graduation_core::{LaunchMode, ProvisionError, StepKind, Subject, Workflow, WorkflowStatus};
use graduation_durable::testing::{draft_subject, RecordingRunner, ScriptedProvisioners};
use graduation_durable::{InMemoryWorkflowStore, Orchestrator, StepExecutor};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tower::ServiceExt;
use uuid::Uuid;

struct TestApp {
    app: Router,
    runner: Arc<RecordingRunner>,
    provisioners: Arc<ScriptedProvisioners>,
    executor: StepExecutor,
}

fn test_app(subjects: Vec<Subject>) -> TestApp {
    let store = Arc::new(InMemoryWorkflowStore::with_subjects(subjects));
    let provisioners = Arc::new(ScriptedProvisioners::new());
    let executor = StepExecutor::new(store.clone(), provisioners.bind());
    let runner = Arc::new(RecordingRunner::new());
    let orchestrator = Arc::new(Orchestrator::new(store, runner.clone()));

    TestApp {
        app: build_router(orchestrator, StoreKind::InMemory),
        runner,
        provisioners,
        executor,
    }
}

async fn send(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
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
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn create_body(subject: &Subject, key: &str) -> Value {
    json!({
        "subject_id": subject.id,
        "requester_id": subject.owner_id,
        "idempotency_key": key,
    })
}

#[tokio::test]
async fn test_health() {
    let t = test_app(vec![]);

    let (status, body) = send(&t.app, "GET", "/health", None).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["store"], "inmemory");
}

#[tokio::test]
async fn test_create_then_duplicate_key() {
    let subject = draft_subject(LaunchMode::Standard);
    let t = test_app(vec![subject.clone()]);

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&subject, "atlas-1")),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    let created: Workflow = serde_json::from_value(body).unwrap();
    assert_eq!(created.status, WorkflowStatus::Pending);
    assert_eq!(created.subject_id, subject.id);

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&subject, "atlas-1")),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["id"], json!(created.id));

    // Only the first request submitted work
    assert_eq!(t.runner.submitted(), vec![created.id]);
}

#[tokio::test]
async fn test_create_error_statuses() {
    let draft = draft_subject(LaunchMode::Standard);
    let mut graduated = draft_subject(LaunchMode::Standard);
    graduated.graduated_at = Some(Utc::now());
    let t = test_app(vec![draft.clone(), graduated.clone()]);

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&draft, "   ")),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("idempotency key is required"));

    let unknown = Subject::draft(Uuid::now_v7(), "Ghost");
    let (status, _) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&unknown, "ghost-1")),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&graduated, "again-1")),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already provisioned"));

    assert!(t.runner.submitted().is_empty());
}

#[tokio::test]
async fn test_create_without_idempotency_key() {
    let subject = draft_subject(LaunchMode::Standard);
    let t = test_app(vec![subject.clone()]);

    let (status, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(json!({
            "subject_id": subject.id,
            "requester_id": subject.owner_id,
        })),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"]
        .as_str()
        .unwrap()
        .contains("idempotency key is required"));

    // Other malformed bodies are still rejected by the extractor
    let (status, _) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(json!({ "idempotency_key": "atlas-1" })),
    )
    .await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    assert!(t.runner.submitted().is_empty());
}

#[tokio::test]
async fn test_get_graduation() {
    let subject = draft_subject(LaunchMode::Standard);
    let t = test_app(vec![subject.clone()]);

    let (_, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&subject, "atlas-1")),
    )
    .await;
    let id = body["id"].as_str().unwrap().to_string();

    let (status, body) = send(&t.app, "GET", &format!("/v1/graduations/{id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["idempotency_key"], "atlas-1");

    let (status, body) = send(
        &t.app,
        "GET",
        &format!("/v1/graduations/{}", Uuid::now_v7()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert!(body["error"].as_str().unwrap().contains("workflow not found"));

    let (status, _) = send(&t.app, "GET", "/v1/graduations/not-a-uuid", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_list_graduations() {
    let subject = draft_subject(LaunchMode::Standard);
    let t = test_app(vec![subject.clone()]);

    for key in ["atlas-1", "atlas-2"] {
        let (status, _) = send(
            &t.app,
            "POST",
            "/v1/graduations",
            Some(create_body(&subject, key)),
        )
        .await;
        assert_eq!(status, StatusCode::ACCEPTED);
    }

    let (status, body) = send(
        &t.app,
        "GET",
        &format!("/v1/graduations?subject_id={}", subject.id),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let data = body["data"].as_array().unwrap();
    assert_eq!(data.len(), 2);
    assert_eq!(data[0]["idempotency_key"], "atlas-2");

    let (status, body) = send(
        &t.app,
        "GET",
        "/v1/graduations?idempotency_key=atlas-1",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    let (status, body) = send(&t.app, "GET", "/v1/graduations?idempotency_key=nope", None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["data"].as_array().unwrap().is_empty());

    let (status, _) = send(&t.app, "GET", "/v1/graduations", None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_retry_graduation() {
    let subject = draft_subject(LaunchMode::Standard);
    let t = test_app(vec![subject.clone()]);

    let (_, body) = send(
        &t.app,
        "POST",
        "/v1/graduations",
        Some(create_body(&subject, "atlas-1")),
    )
    .await;
    let workflow: Workflow = serde_json::from_value(body).unwrap();
    let retry_uri = format!("/v1/graduations/{}/retry", workflow.id);

    // Pending workflows are not retryable
    let (status, body) = send(&t.app, "POST", &retry_uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("pending"));

    t.provisioners
        .fail_next(StepKind::DeployWallet, ProvisionError::retryable("rpc timeout"));
    t.executor.run(workflow.id).await;

    let (status, body) = send(&t.app, "GET", &format!("/v1/graduations/{}", workflow.id), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "failed");
    assert_eq!(body["error"], "deploy-wallet: rpc timeout");

    let (status, body) = send(&t.app, "POST", &retry_uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["attempts"], 2);
    assert_eq!(t.runner.submitted().last(), Some(&workflow.id));

    t.executor.run(workflow.id).await;
    let (_, body) = send(&t.app, "GET", &format!("/v1/graduations/{}", workflow.id), None).await;
    assert_eq!(body["status"], "success");

    let (status, _) = send(
        &t.app,
        "POST",
        &format!("/v1/graduations/{}/retry", Uuid::now_v7()),
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_openapi_document_is_served() {
    let t = test_app(vec![]);

    let (status, body) = send(&t.app, "GET", "/api-doc/openapi.json", None).await;

    assert_eq!(status, StatusCode::OK);
    assert!(body["paths"]["/v1/graduations"].is_object());
}
