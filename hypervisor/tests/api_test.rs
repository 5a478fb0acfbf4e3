//! HTTP surface integration tests

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use http_body_util::BodyExt;
use serde_json::Value;
use tower::ServiceExt;

use agent_hypervisor::api;
use agent_hypervisor::config::Config;
use agent_hypervisor::db;
use agent_hypervisor::repository::{Repository, SqliteRepository};
use agent_hypervisor::testing::{
    sample_topic, FakeConnector, FakeGateway, RecordingNotifier, FAKE_SANDBOX_ID,
};
use agent_hypervisor::AppState;
use shared_types::TaskStatus;

struct TestApp {
    router: axum::Router,
    repo: SqliteRepository,
    gateway: Arc<FakeGateway>,
}

async fn setup_test_app() -> TestApp {
    let pool = db::connect_in_memory()
        .await
        .expect("Failed to open in-memory database");
    let gateway = Arc::new(FakeGateway::new());
    let state = Arc::new(AppState::build(
        &Config::default(),
        pool.clone(),
        gateway.clone(),
        Arc::new(FakeConnector::replying(r#"{"code":1000}"#)),
        Arc::new(RecordingNotifier::new()),
    ));
    let repo = SqliteRepository::new(pool);
    repo.create_topic(&sample_topic("topic-1", "user-1", ""))
        .await
        .expect("Failed to seed topic");

    TestApp {
        router: api::router(state),
        repo,
        gateway,
    }
}

fn request(method: &str, uri: &str, user_id: Option<&str>, body: Option<Value>) -> Request<Body> {
    let mut builder = Request::builder().method(method).uri(uri);
    if let Some(user_id) = user_id {
        builder = builder
            .header(api::USER_ID_HEADER, user_id)
            .header(api::ORGANIZATION_CODE_HEADER, "org-1");
    }
    match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    }
}

async fn json_response(app: &axum::Router, req: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(req).await.expect("Request failed");
    let status = response.status();
    let body = response
        .into_body()
        .collect()
        .await
        .expect("Failed to read body")
        .to_bytes();
    let value: Value = serde_json::from_slice(&body).expect("Invalid JSON response");
    (status, value)
}

async fn status_only(app: &axum::Router, req: Request<Body>) -> StatusCode {
    app.clone().oneshot(req).await.expect("Request failed").status()
}

#[tokio::test]
async fn test_health() {
    let app = setup_test_app().await;
    let (status, body) = json_response(&app.router, request("GET", "/health", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
}

#[tokio::test]
async fn test_missing_user_header_is_unauthorized() {
    let app = setup_test_app().await;
    let req = request(
        "POST",
        "/topics/topic-1/messages",
        None,
        Some(serde_json::json!({ "prompt": "hi" })),
    );
    let (status, body) = json_response(&app.router, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["success"], false);
}

#[tokio::test]
async fn test_message_dispatch_then_interrupt_then_delete() {
    let app = setup_test_app().await;

    let req = request(
        "POST",
        "/topics/topic-1/messages",
        Some("user-1"),
        Some(serde_json::json!({ "prompt": "build the report", "chat_topic_id": "chat-1" })),
    );
    let (status, body) = json_response(&app.router, req).await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["sandbox_id"], FAKE_SANDBOX_ID);
    let task_id = body["data"]["task_id"].as_str().expect("task id").to_string();

    let (status, body) = json_response(
        &app.router,
        request("GET", &format!("/tasks/{task_id}"), Some("user-1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "running");

    // Other users cannot see it.
    let status = status_only(
        &app.router,
        request("GET", &format!("/tasks/{task_id}"), Some("user-2"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    // Running tasks cannot be deleted.
    let status = status_only(
        &app.router,
        request("DELETE", &format!("/tasks/{task_id}"), Some("user-1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = json_response(
        &app.router,
        request(
            "POST",
            "/topics/topic-1/interrupt",
            Some("user-1"),
            Some(serde_json::json!({})),
        ),
    )
    .await;
    assert_eq!(status, StatusCode::OK, "{body}");
    assert_eq!(body["data"]["delivered"], true);

    let task = app.repo.get_task_by_id(&task_id).await.unwrap().unwrap();
    assert_eq!(task.status, TaskStatus::Suspended);

    let status = status_only(
        &app.router,
        request("DELETE", &format!("/tasks/{task_id}"), Some("user-1"), None),
    )
    .await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(app.repo.get_task_by_id(&task_id).await.unwrap().is_none());
}

#[tokio::test]
async fn test_dispatch_failure_hides_cause() {
    let app = setup_test_app().await;
    app.gateway.fail_create(4002, "no capacity in region");

    let req = request(
        "POST",
        "/topics/topic-1/messages",
        Some("user-1"),
        Some(serde_json::json!({ "prompt": "hi" })),
    );
    let (status, body) = json_response(&app.router, req).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    let error = body["error"].as_str().expect("error message");
    assert!(!error.contains("no capacity"), "cause leaked: {error}");

    let topic = app.repo.get_topic_by_id("topic-1").await.unwrap().unwrap();
    let task = app
        .repo
        .get_task_by_id(&topic.current_task_id.unwrap())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.err_msg.unwrap().contains("no capacity in region"));
}

#[tokio::test]
async fn test_unknown_topic_is_not_found() {
    let app = setup_test_app().await;
    let req = request(
        "POST",
        "/topics/nope/interrupt",
        Some("user-1"),
        Some(serde_json::json!({})),
    );
    let (status, _) = json_response(&app.router, req).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_admin_jobs() {
    let app = setup_test_app().await;

    let (status, body) =
        json_response(&app.router, request("POST", "/admin/sweep", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["swept"], 0);

    let (status, body) =
        json_response(&app.router, request("POST", "/admin/reconcile", None, None)).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["running"], 0);
}
