//! HTTP surface - webhook ingress and admin endpoints
//!
//! `POST /webhook` verifies the HMAC signature over the raw body before
//! anything is parsed; a bad signature is a 401 with no task mutation and no
//! payload logging. Store and remote failures map to 502 so the platform
//! retries the delivery.

use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Json;
use hmac::{Hmac, Mac};
use serde_json::json;
use sha2::Sha256;
use swarm_core::Error;
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::router::{TaskRouter, WebhookPayload};
use crate::state_machine::StateMachine;

type HmacSha256 = Hmac<Sha256>;

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    /// Process settings
    pub settings: Arc<Settings>,
    /// Event router
    pub router: TaskRouter,
    /// Task state machine, for the admin reads
    pub state_machine: Arc<StateMachine>,
}

/// Build the HTTP application
pub fn app(state: AppState) -> axum::Router {
    axum::Router::new()
        .route("/webhook", post(webhook))
        .route("/health", get(health))
        .route("/tasks", get(list_tasks))
        .route("/tasks/:id", get(get_task))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Verify a `sha256=<hex>` signature header against the raw body using a
/// constant-time comparison
#[must_use]
pub fn verify_signature(secret: &str, body: &[u8], signature_header: &str) -> bool {
    let Some(hex_digest) = signature_header.strip_prefix("sha256=") else {
        return false;
    };
    let Ok(expected) = hex::decode(hex_digest) else {
        return false;
    };
    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(body);
    mac.verify_slice(&expected).is_ok()
}

async fn webhook(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let signature = headers
        .get("X-Hub-Signature-256")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    if !verify_signature(&state.settings.github_webhook_secret, &body, signature) {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"detail": Error::SignatureInvalid.to_string()})),
        )
            .into_response();
    }

    let event = headers
        .get("X-GitHub-Event")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let payload: WebhookPayload = match serde_json::from_slice(&body) {
        Ok(payload) => payload,
        Err(e) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"detail": format!("malformed payload: {e}")})),
            )
                .into_response();
        }
    };

    tracing::info!(
        event,
        action = payload.action.as_deref().unwrap_or_default(),
        "received webhook"
    );

    match state.router.handle_event(&event, &payload).await {
        Ok(followups) => {
            for followup in followups {
                state.router.spawn_followup(followup);
            }
            (StatusCode::OK, Json(json!({"status": "processed"}))).into_response()
        }
        // retryable by the platform
        Err(e @ (Error::StoreUnavailable(_) | Error::RemoteApi(_))) => {
            tracing::error!(error = %e, "webhook handling failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response()
        }
        Err(e) => {
            tracing::warn!(error = %e, "webhook handled with non-retryable error");
            (StatusCode::OK, Json(json!({"status": "processed"}))).into_response()
        }
    }
}

async fn health() -> Response {
    Json(json!({"status": "healthy", "service": "agent-swarm-orchestrator"})).into_response()
}

async fn list_tasks(State(state): State<AppState>) -> Response {
    match state.state_machine.list_active_tasks().await {
        Ok(tasks) => Json(json!({ "tasks": tasks })).into_response(),
        Err(e) => {
            tracing::error!(error = %e, "listing tasks failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response()
        }
    }
}

async fn get_task(State(state): State<AppState>, Path(id): Path<String>) -> Response {
    match state.state_machine.get_task(&id).await {
        Ok(Some(task)) => Json(task).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "Task not found"})),
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "reading task failed");
            (
                StatusCode::BAD_GATEWAY,
                Json(json!({"detail": e.to_string()})),
            )
                .into_response()
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    const SECRET: &str = "shhh";
    const BODY: &[u8] = b"{}";

    fn sign(secret: &str, body: &[u8]) -> String {
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).expect("any key length works");
        mac.update(body);
        format!("sha256={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_verifies() {
        let header = sign(SECRET, BODY);
        assert!(verify_signature(SECRET, BODY, &header));
    }

    #[test]
    fn test_any_byte_flip_fails() {
        let header = sign(SECRET, BODY);
        assert!(!verify_signature(SECRET, b"{ }", &header));
        assert!(!verify_signature("other", BODY, &header));
    }

    #[test]
    fn test_malformed_headers_fail_closed() {
        assert!(!verify_signature(SECRET, BODY, "sha256=deadbeef"));
        assert!(!verify_signature(SECRET, BODY, "sha1=whatever"));
        assert!(!verify_signature(SECRET, BODY, ""));
        assert!(!verify_signature(SECRET, BODY, "sha256=not-hex"));
    }
}
