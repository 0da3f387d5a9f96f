//! Admin API for the credential pool
//!
//! Served on its own listener when `server.admin_addr` is set, and meant to
//! stay on a private interface. Never returns credential values.
//!
//! Endpoints:
//! - GET  /admin/accounts                 pool status and per-account usage
//! - POST /admin/accounts/{label}/reset   clear one account's cooldown
//! - POST /admin/accounts/reset           clear every cooldown

use std::sync::Arc;

use account_pool::AccountPool;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use tracing::info;

#[derive(Clone)]
pub struct AdminState {
    pool: Arc<AccountPool>,
}

impl AdminState {
    pub fn new(pool: Arc<AccountPool>) -> Self {
        Self { pool }
    }
}

pub fn build_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/accounts", get(list_accounts))
        .route("/admin/accounts/reset", post(reset_all))
        .route("/admin/accounts/{label}/reset", post(reset_account))
        .with_state(state)
}

fn json(status: StatusCode, body: serde_json::Value) -> impl IntoResponse {
    (
        status,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
}

async fn list_accounts(State(state): State<AdminState>) -> impl IntoResponse {
    let status = state.pool.status_snapshot().await;
    let accounts = state.pool.usage_snapshot().await;
    json(
        StatusCode::OK,
        serde_json::json!({ "pool": status, "accounts": accounts }),
    )
}

/// Unknown labels are reported as 404; the pool itself treats them as a no-op.
async fn reset_account(
    State(state): State<AdminState>,
    Path(label): Path<String>,
) -> impl IntoResponse {
    let known = state
        .pool
        .usage_snapshot()
        .await
        .iter()
        .any(|a| a.label == label);
    if !known {
        return json(
            StatusCode::NOT_FOUND,
            serde_json::json!({ "error": format!("no account labelled {label}") }),
        );
    }

    state.pool.reset_cooldown(&label).await;
    info!(account = %label, "cooldown reset by admin");
    json(
        StatusCode::OK,
        serde_json::json!({ "label": label, "status": "reset" }),
    )
}

async fn reset_all(State(state): State<AdminState>) -> impl IntoResponse {
    let cleared = state.pool.reset_all().await;
    info!(cleared, "all cooldowns reset by admin");
    json(StatusCode::OK, serde_json::json!({ "cleared": cleared }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::CredentialRecord;
    use axum::body::Body;
    use axum::http::Request;
    use tower::ServiceExt;

    fn pool() -> Arc<AccountPool> {
        Arc::new(
            AccountPool::new(vec![
                CredentialRecord::new("alice", "gh-secret-a"),
                CredentialRecord::new("bob", "gh-secret-b"),
            ])
            .unwrap(),
        )
    }

    async fn call(app: Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let response = app
            .oneshot(
                Request::builder()
                    .method(method)
                    .uri(uri)
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = response.status();
        let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
            .await
            .unwrap();
        (status, serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn list_shows_status_and_usage_without_secrets() {
        let pool = pool();
        pool.record_request("alice").await;
        pool.rotate_on_status(429).await;

        let app = build_admin_router(AdminState::new(pool));
        let (status, json) = call(app, "GET", "/admin/accounts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["pool"]["size"], 2);
        assert_eq!(json["pool"]["current_label"], "bob");
        assert_eq!(json["pool"]["cooled_down"][0]["label"], "alice");
        assert_eq!(json["accounts"][0]["requests"], 1);
        assert_eq!(json["accounts"][0]["rate_limit_hits"], 1);
        assert!(!json.to_string().contains("gh-secret"));
    }

    #[tokio::test]
    async fn reset_one_clears_its_cooldown() {
        let pool = pool();
        pool.mark_cooled_down("alice").await;
        pool.mark_cooled_down("bob").await;
        assert!(pool.all_exhausted().await);

        let app = build_admin_router(AdminState::new(pool.clone()));
        let (status, json) = call(app, "POST", "/admin/accounts/alice/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["status"], "reset");
        assert!(!pool.all_exhausted().await);
        assert_eq!(pool.status_snapshot().await.cooled_down.len(), 1);
    }

    #[tokio::test]
    async fn reset_unknown_label_is_404() {
        let app = build_admin_router(AdminState::new(pool()));
        let (status, json) = call(app, "POST", "/admin/accounts/carol/reset").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert!(json["error"].as_str().unwrap().contains("carol"));
    }

    #[tokio::test]
    async fn reset_all_reports_count() {
        let pool = pool();
        pool.mark_cooled_down("alice").await;
        pool.mark_cooled_down("bob").await;

        let app = build_admin_router(AdminState::new(pool.clone()));
        let (status, json) = call(app, "POST", "/admin/accounts/reset").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["cleared"], 2);
        assert!(pool.status_snapshot().await.cooled_down.is_empty());
    }
}
