//! HTTP surface tests: signature gate, event dispatch, admin reads

mod support;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use hmac::{Hmac, Mac};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use sha2::Sha256;
use support::{rig, REPO};
use swarm::server::{app, AppState};
use tower::ServiceExt;

fn sign(secret: &str, body: &[u8]) -> String {
    let mut mac =
        Hmac::<Sha256>::new_from_slice(secret.as_bytes()).expect("hmac accepts any key length");
    mac.update(body);
    format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
}

fn test_app(rig: &support::Rig) -> axum::Router {
    app(AppState {
        settings: rig.settings.clone(),
        router: rig.router.clone(),
        state_machine: rig.state.clone(),
    })
}

async fn body_json(response: axum::response::Response) -> Value {
    let bytes = response
        .into_body()
        .collect()
        .await
        .expect("body collects")
        .to_bytes();
    serde_json::from_slice(&bytes).expect("body is json")
}

// S6: wrong signature is a 401 and nothing is mutated
#[tokio::test]
async fn invalid_signature_is_rejected() {
    let rig = rig();
    let app = test_app(&rig);

    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-GitHub-Event", "issues")
                .header("X-Hub-Signature-256", "sha256=deadbeef")
                .body(Body::from("{}"))
                .expect("request builds"),
        )
        .await
        .expect("request runs");

    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    assert!(rig.state.list_active_tasks().await.expect("list").is_empty());
}

#[tokio::test]
async fn missing_signature_is_rejected() {
    let rig = rig();
    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-GitHub-Event", "issues")
                .body(Body::from("{}"))
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn unknown_event_kinds_are_acknowledged() {
    let rig = rig();
    let body = b"{}".to_vec();
    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-GitHub-Event", "star")
                .header("X-Hub-Signature-256", sign("secret", &body))
                .body(Body::from(body.clone()))
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["status"], "processed");
}

#[tokio::test]
async fn signed_issue_event_creates_a_task() {
    let rig = rig();
    let payload = json!({
        "action": "opened",
        "repository": {"full_name": REPO},
        "issue": {
            "number": 42,
            "title": "Fix the parser",
            "body": "It breaks on tabs",
            "labels": [{"name": "agent-ok"}]
        }
    });
    let body = serde_json::to_vec(&payload).expect("serialize payload");

    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-GitHub-Event", "issues")
                .header("X-Hub-Signature-256", sign("secret", &body))
                .body(Body::from(body))
                .expect("request builds"),
        )
        .await
        .expect("request runs");

    assert_eq!(response.status(), StatusCode::OK);
    let task = rig
        .state
        .get_task_for_issue(REPO, 42)
        .await
        .expect("lookup")
        .expect("task created inline");
    assert_eq!(task.issue_title, "Fix the parser");
}

#[tokio::test]
async fn malformed_json_with_valid_signature_is_a_400() {
    let rig = rig();
    let body = b"not json".to_vec();
    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/webhook")
                .header("X-GitHub-Event", "issues")
                .header("X-Hub-Signature-256", sign("secret", &body))
                .body(Body::from(body.clone()))
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn health_reports_the_service() {
    let rig = rig();
    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .uri("/health")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["status"], "healthy");
    assert_eq!(json["service"], "agent-swarm-orchestrator");
}

#[tokio::test]
async fn task_endpoints_read_the_store() {
    let rig = rig();
    rig.state
        .create_task(REPO, 1, "first")
        .await
        .expect("create");

    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .uri("/tasks")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    let json = body_json(response).await;
    assert_eq!(json["tasks"].as_array().map(Vec::len), Some(1));
    assert_eq!(json["tasks"][0]["id"], "issue-1");

    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .uri("/tasks/issue-1")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(body_json(response).await["state"], "queued");

    let response = test_app(&rig)
        .oneshot(
            Request::builder()
                .uri("/tasks/issue-404")
                .body(Body::empty())
                .expect("request builds"),
        )
        .await
        .expect("request runs");
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}
