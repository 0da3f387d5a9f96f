//! Copilot session token exchange and account lookups
//!
//! All three calls authenticate with the long-lived GitHub token:
//! - `exchange_session_token()` trades it for a short-lived backend token
//! - `fetch_user()` validates it against the identity endpoint
//! - `fetch_usage()` returns the account's quota snapshot
//!
//! Error bodies from GitHub are never copied into error messages; only the
//! status code is kept.

use std::time::Duration;

use common::Secret;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::debug;

use crate::constants::Endpoints;
use crate::error::{Error, Result, describe_reqwest_error};
use crate::headers::ClientIdentity;

/// Wire shape of the token endpoint response.
#[derive(Debug, Deserialize)]
struct SessionTokenResponse {
    token: String,
    /// Unix seconds at which the token stops working
    expires_at: u64,
    /// Seconds until the token should be renewed
    refresh_in: u64,
}

/// A short-lived Copilot session token.
///
/// `expires_in_secs` is the server-advised renewal delta (`refresh_in`),
/// which is what the refresh schedule is computed from.
#[derive(Debug, Clone)]
pub struct SessionToken {
    pub value: Secret<String>,
    pub expires_in_secs: u64,
    pub expires_at: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct GithubUser {
    pub login: String,
}

/// Exchange a GitHub token for a Copilot session token.
///
/// A 429 maps to [`Error::RateLimited`] so the caller can rotate before
/// propagating; 401/403 map to [`Error::InvalidCredentials`].
pub async fn exchange_session_token(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    identity: &ClientIdentity,
    github_token: &Secret<String>,
) -> Result<SessionToken> {
    let response = client
        .get(endpoints.copilot_token_url())
        .headers(identity.github_headers(github_token)?)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| {
            Error::Http(format!(
                "session token request failed: {}",
                describe_reqwest_error(&e)
            ))
        })?;

    let status = response.status();
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Err(Error::RateLimited {
            retry_after_secs: retry_after_secs(response.headers()),
        });
    }
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return Err(Error::InvalidCredentials(format!(
            "session token exchange rejected ({status})"
        )));
    }
    if !status.is_success() {
        return Err(Error::TokenExchange(format!(
            "session token endpoint returned {status}"
        )));
    }

    let body = response
        .json::<SessionTokenResponse>()
        .await
        .map_err(|e| {
            Error::TokenExchange(format!(
                "invalid session token response: {}",
                describe_reqwest_error(&e)
            ))
        })?;

    debug!(refresh_in = body.refresh_in, "obtained session token");
    Ok(SessionToken {
        value: Secret::new(body.token),
        expires_in_secs: body.refresh_in,
        expires_at: body.expires_at,
    })
}

/// Look up the identity behind a GitHub token.
pub async fn fetch_user(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    identity: &ClientIdentity,
    github_token: &Secret<String>,
) -> Result<GithubUser> {
    let response = get_authenticated(client, &endpoints.user_url(), identity, github_token).await?;
    response
        .json::<GithubUser>()
        .await
        .map_err(|e| {
            Error::TokenExchange(format!(
                "invalid user response: {}",
                describe_reqwest_error(&e)
            ))
        })
}

/// Fetch the account's quota snapshot as returned by the backend.
pub async fn fetch_usage(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    identity: &ClientIdentity,
    github_token: &Secret<String>,
) -> Result<serde_json::Value> {
    let response =
        get_authenticated(client, &endpoints.usage_url(), identity, github_token).await?;
    response
        .json::<serde_json::Value>()
        .await
        .map_err(|e| {
            Error::TokenExchange(format!(
                "invalid usage response: {}",
                describe_reqwest_error(&e)
            ))
        })
}

async fn get_authenticated(
    client: &reqwest::Client,
    url: &str,
    identity: &ClientIdentity,
    github_token: &Secret<String>,
) -> Result<reqwest::Response> {
    let response = client
        .get(url)
        .headers(identity.github_headers(github_token)?)
        .timeout(Duration::from_secs(30))
        .send()
        .await
        .map_err(|e| {
            Error::Http(format!(
                "GitHub request failed: {}",
                describe_reqwest_error(&e)
            ))
        })?;

    let status = response.status();
    match status {
        s if s.is_success() => Ok(response),
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => Err(Error::InvalidCredentials(
            format!("GitHub rejected token ({status})"),
        )),
        StatusCode::TOO_MANY_REQUESTS => Err(Error::RateLimited {
            retry_after_secs: retry_after_secs(response.headers()),
        }),
        _ => Err(Error::TokenExchange(format!("GitHub returned {status}"))),
    }
}

fn retry_after_secs(headers: &reqwest::header::HeaderMap) -> Option<u64> {
    headers
        .get(reqwest::header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse::<u64>().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::{HeaderMap, StatusCode as AxumStatus};
    use axum::response::IntoResponse;
    use axum::routing::get;
    use axum::{Json, Router};

    async fn spawn(app: Router) -> Endpoints {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        Endpoints {
            github_web: format!("http://{addr}"),
            github_api: format!("http://{addr}"),
        }
    }

    #[tokio::test]
    async fn exchange_returns_token_and_refresh_delta() {
        let app = Router::new().route(
            "/copilot_internal/v2/token",
            get(|headers: HeaderMap| async move {
                assert_eq!(headers["authorization"], "token ghu_ok");
                Json(serde_json::json!({
                    "token": "tid=session;exp=1",
                    "expires_at": 1_900_000_000u64,
                    "refresh_in": 1500
                }))
            }),
        );
        let endpoints = spawn(app).await;

        let token = exchange_session_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_ok"),
        )
        .await
        .unwrap();

        assert_eq!(token.value.expose(), "tid=session;exp=1");
        assert_eq!(token.expires_in_secs, 1500);
        assert_eq!(token.expires_at, 1_900_000_000);
    }

    #[tokio::test]
    async fn exchange_maps_429_with_retry_after() {
        let app = Router::new().route(
            "/copilot_internal/v2/token",
            get(|| async {
                (AxumStatus::TOO_MANY_REQUESTS, [("retry-after", "42")], "slow down")
                    .into_response()
            }),
        );
        let endpoints = spawn(app).await;

        let err = exchange_session_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_x"),
        )
        .await
        .unwrap_err();

        assert!(matches!(
            err,
            Error::RateLimited {
                retry_after_secs: Some(42)
            }
        ));
    }

    #[tokio::test]
    async fn exchange_maps_401_without_leaking_body() {
        let app = Router::new().route(
            "/copilot_internal/v2/token",
            get(|| async { (AxumStatus::UNAUTHORIZED, "secret-ish body").into_response() }),
        );
        let endpoints = spawn(app).await;

        let err = exchange_session_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_bad"),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, Error::InvalidCredentials(_)));
        let msg = err.to_string();
        assert!(!msg.contains("secret-ish"));
        assert!(!msg.contains("ghu_bad"));
    }

    #[tokio::test]
    async fn exchange_server_error_is_token_exchange() {
        let app = Router::new().route(
            "/copilot_internal/v2/token",
            get(|| async { AxumStatus::INTERNAL_SERVER_ERROR }),
        );
        let endpoints = spawn(app).await;

        let err = exchange_session_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_x"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::TokenExchange(_)));
    }

    #[tokio::test]
    async fn exchange_unreachable_is_http_error_without_url() {
        let endpoints = Endpoints {
            github_web: "http://127.0.0.1:1".into(),
            github_api: "http://127.0.0.1:1".into(),
        };
        let err = exchange_session_token(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_x"),
        )
        .await
        .unwrap_err();
        assert!(matches!(err, Error::Http(_)));
        let msg = err.to_string();
        assert!(msg.contains("could not connect"), "{msg}");
        assert!(!msg.contains("127.0.0.1"), "{msg}");
        assert!(!msg.contains("copilot_internal"), "{msg}");
    }

    #[tokio::test]
    async fn fetch_user_returns_login() {
        let app = Router::new().route(
            "/user",
            get(|| async { Json(serde_json::json!({"login": "octocat", "id": 1})) }),
        );
        let endpoints = spawn(app).await;

        let user = fetch_user(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_ok"),
        )
        .await
        .unwrap();
        assert_eq!(user.login, "octocat");
    }

    #[tokio::test]
    async fn fetch_usage_passes_snapshot_through() {
        let app = Router::new().route(
            "/copilot_internal/user",
            get(|| async {
                Json(serde_json::json!({
                    "copilot_plan": "individual",
                    "quota_snapshots": {"chat": {"remaining": 10}}
                }))
            }),
        );
        let endpoints = spawn(app).await;

        let usage = fetch_usage(
            &reqwest::Client::new(),
            &endpoints,
            &ClientIdentity::default(),
            &Secret::from("ghu_ok"),
        )
        .await
        .unwrap();
        assert_eq!(usage["quota_snapshots"]["chat"]["remaining"], 10);
    }
}
