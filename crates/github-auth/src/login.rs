//! Long-lived GitHub credential acquisition
//!
//! Reuses the cached token file when it still authenticates; otherwise runs
//! the device flow and persists the new token with owner-only permissions.

use std::path::Path;

use common::Secret;
use tracing::{info, warn};

use crate::constants::Endpoints;
use crate::copilot::fetch_user;
use crate::device::{DeviceCode, run_device_flow};
use crate::error::{Error, Result};
use crate::headers::ClientIdentity;
use crate::token_file::{read_token_file, write_token_file};

/// Return a working GitHub token, running the device flow when needed.
///
/// With `force` set the cached token is ignored. A cached token that GitHub
/// rejects (401/403) falls through to the device flow; a transport failure
/// while validating is returned as-is, since the token may still be good.
pub async fn acquire_github_token(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    identity: &ClientIdentity,
    token_file: &Path,
    force: bool,
    notify: impl Fn(&DeviceCode),
) -> Result<Secret<String>> {
    if !force && let Some(cached) = read_token_file(token_file).await? {
        match fetch_user(client, endpoints, identity, &cached).await {
            Ok(user) => {
                info!(login = %user.login, "using cached GitHub token");
                return Ok(cached);
            }
            Err(Error::InvalidCredentials(reason)) => {
                warn!(reason = %reason, "cached GitHub token rejected, starting device flow");
            }
            Err(e) => return Err(e),
        }
    }

    let token = run_device_flow(client, endpoints, notify).await?;
    write_token_file(token_file, &token).await?;

    if let Ok(user) = fetch_user(client, endpoints, identity, &token).await {
        info!(login = %user.login, "logged in");
    }
    Ok(token)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode};
    use axum::response::IntoResponse;
    use axum::routing::{get, post};
    use axum::{Json, Router};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// GitHub mock: `/user` accepts only `ghu_valid` and `ghu_device`;
    /// the device flow approves on the first poll with `ghu_device`.
    async fn spawn_github() -> (Endpoints, Arc<AtomicUsize>) {
        let device_requests = Arc::new(AtomicUsize::new(0));
        let counter = device_requests.clone();
        let app = Router::new()
            .route(
                "/user",
                get(|headers: HeaderMap| async move {
                    let auth = headers
                        .get("authorization")
                        .and_then(|v| v.to_str().ok())
                        .unwrap_or_default()
                        .to_string();
                    if auth == "token ghu_valid" || auth == "token ghu_device" {
                        Json(serde_json::json!({"login": "octocat"})).into_response()
                    } else {
                        StatusCode::UNAUTHORIZED.into_response()
                    }
                }),
            )
            .route(
                "/login/device/code",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        counter.fetch_add(1, Ordering::SeqCst);
                        Json(serde_json::json!({
                            "device_code": "dc",
                            "user_code": "UC",
                            "verification_uri": "https://github.com/login/device",
                            "expires_in": 900,
                            "interval": 0
                        }))
                    }
                }),
            )
            .route(
                "/login/oauth/access_token",
                post(|| async { Json(serde_json::json!({"access_token": "ghu_device"})) }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        (
            Endpoints {
                github_web: format!("http://{addr}"),
                github_api: format!("http://{addr}"),
            },
            device_requests,
        )
    }

    #[tokio::test]
    async fn valid_cached_token_skips_device_flow() {
        let (endpoints, device_requests) = spawn_github().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        std::fs::write(&path, "ghu_valid\n").unwrap();

        let token = acquire_github_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &path,
            false,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(token.expose(), "ghu_valid");
        assert_eq!(device_requests.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn rejected_cached_token_runs_device_flow_and_persists() {
        let (endpoints, device_requests) = spawn_github().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        std::fs::write(&path, "ghu_revoked").unwrap();

        let token = acquire_github_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &path,
            false,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(token.expose(), "ghu_device");
        assert_eq!(device_requests.load(Ordering::SeqCst), 1);
        assert_eq!(std::fs::read_to_string(&path).unwrap(), "ghu_device");
    }

    #[tokio::test]
    async fn force_ignores_cached_token() {
        let (endpoints, device_requests) = spawn_github().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("github_token");
        std::fs::write(&path, "ghu_valid").unwrap();

        let token = acquire_github_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &path,
            true,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(token.expose(), "ghu_device");
        assert_eq!(device_requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_cache_runs_device_flow() {
        let (endpoints, device_requests) = spawn_github().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("github_token");

        acquire_github_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &path,
            false,
            |_| {},
        )
        .await
        .unwrap();

        assert_eq!(device_requests.load(Ordering::SeqCst), 1);
        assert!(path.exists());
    }
}
