//! Device-authorization login
//!
//! Pure state machine: `handle_event(state, event) -> (state, action)`.
//! `run_device_flow()` performs the I/O each action asks for, so the
//! transitions can be tested without a network or a clock.
//!
//! States: `Requested -> Polling -> Approved | Expired | Failed`.

use std::time::Duration;

use common::Secret;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::constants::{Endpoints, GITHUB_APP_SCOPES, GITHUB_CLIENT_ID};
use crate::error::{Error, Result, describe_reqwest_error};

/// Added to the poll interval each time the server answers `slow_down`.
const SLOW_DOWN_STEP: Duration = Duration::from_secs(5);

const DEVICE_GRANT_TYPE: &str = "urn:ietf:params:oauth:grant-type:device_code";

/// Device/user code pair returned by the device-code endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCode {
    pub device_code: String,
    pub user_code: String,
    pub verification_uri: String,
    pub expires_in: u64,
    #[serde(default = "default_interval")]
    pub interval: u64,
}

fn default_interval() -> u64 {
    5
}

/// Decoded answer from one poll of the access-token endpoint.
#[derive(Debug, Clone)]
pub enum PollResponse {
    Token(Secret<String>),
    Pending,
    SlowDown { interval: Option<u64> },
    Expired,
    Denied,
    Error(String),
}

#[derive(Debug, Deserialize)]
struct RawPollResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
    interval: Option<u64>,
}

impl From<RawPollResponse> for PollResponse {
    fn from(raw: RawPollResponse) -> Self {
        if let Some(token) = raw.access_token.filter(|t| !t.is_empty()) {
            return PollResponse::Token(Secret::new(token));
        }
        match raw.error.as_deref() {
            Some("authorization_pending") => PollResponse::Pending,
            Some("slow_down") => PollResponse::SlowDown {
                interval: raw.interval,
            },
            Some("expired_token") => PollResponse::Expired,
            Some("access_denied") => PollResponse::Denied,
            Some(other) => PollResponse::Error(match raw.error_description {
                Some(d) => format!("{other}: {d}"),
                None => other.to_string(),
            }),
            None => PollResponse::Error("response carried neither token nor error".into()),
        }
    }
}

#[derive(Debug, Clone)]
pub enum DeviceFlowState {
    /// Code obtained, not yet shown to the user
    Requested(DeviceCode),
    /// Waiting for the user to approve
    Polling {
        code: DeviceCode,
        interval: Duration,
        expires_in: Duration,
    },
    Approved(Secret<String>),
    Expired,
    Failed { reason: String },
}

#[derive(Debug, Clone)]
pub enum DeviceFlowEvent {
    /// The user code has been displayed
    CodeDisplayed,
    /// A poll returned; `elapsed` is measured from when polling began
    Polled {
        response: PollResponse,
        elapsed: Duration,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceFlowAction {
    WaitThenPoll(Duration),
    /// Approval received; the caller stores the token
    Persist,
    Abort(String),
    None,
}

/// Process one event. No I/O.
pub fn handle_event(
    state: DeviceFlowState,
    event: DeviceFlowEvent,
) -> (DeviceFlowState, DeviceFlowAction) {
    match (state, event) {
        (DeviceFlowState::Requested(code), DeviceFlowEvent::CodeDisplayed) => {
            let interval = Duration::from_secs(code.interval);
            let expires_in = Duration::from_secs(code.expires_in);
            (
                DeviceFlowState::Polling {
                    code,
                    interval,
                    expires_in,
                },
                DeviceFlowAction::WaitThenPoll(interval),
            )
        }

        (
            DeviceFlowState::Polling {
                code,
                interval,
                expires_in,
            },
            DeviceFlowEvent::Polled { response, elapsed },
        ) => match response {
            PollResponse::Token(token) => {
                (DeviceFlowState::Approved(token), DeviceFlowAction::Persist)
            }
            PollResponse::Expired => expired(),
            PollResponse::Denied => failed("authorization denied by user".into()),
            PollResponse::Error(reason) => failed(reason),
            PollResponse::Pending | PollResponse::SlowDown { .. } if elapsed >= expires_in => {
                expired()
            }
            PollResponse::Pending => (
                DeviceFlowState::Polling {
                    code,
                    interval,
                    expires_in,
                },
                DeviceFlowAction::WaitThenPoll(interval),
            ),
            PollResponse::SlowDown { interval: server } => {
                let next = match server {
                    Some(secs) => Duration::from_secs(secs).max(interval + SLOW_DOWN_STEP),
                    None => interval + SLOW_DOWN_STEP,
                };
                (
                    DeviceFlowState::Polling {
                        code,
                        interval: next,
                        expires_in,
                    },
                    DeviceFlowAction::WaitThenPoll(next),
                )
            }
        },

        // Terminal states and out-of-order events
        (state, _) => (state, DeviceFlowAction::None),
    }
}

fn expired() -> (DeviceFlowState, DeviceFlowAction) {
    (
        DeviceFlowState::Expired,
        DeviceFlowAction::Abort("device code expired".into()),
    )
}

fn failed(reason: String) -> (DeviceFlowState, DeviceFlowAction) {
    (
        DeviceFlowState::Failed {
            reason: reason.clone(),
        },
        DeviceFlowAction::Abort(reason),
    )
}

/// Request a device/user code pair.
pub async fn request_device_code(
    client: &reqwest::Client,
    endpoints: &Endpoints,
) -> Result<DeviceCode> {
    let response = client
        .post(endpoints.device_code_url())
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&serde_json::json!({
            "client_id": GITHUB_CLIENT_ID,
            "scope": GITHUB_APP_SCOPES,
        }))
        .send()
        .await
        .map_err(|e| {
            Error::Http(format!(
                "device code request failed: {}",
                describe_reqwest_error(&e)
            ))
        })?;

    let status = response.status();
    if !status.is_success() {
        return Err(Error::DeviceFlow(format!(
            "device code endpoint returned {status}"
        )));
    }

    response
        .json::<DeviceCode>()
        .await
        .map_err(|e| {
            Error::DeviceFlow(format!(
                "invalid device code response: {}",
                describe_reqwest_error(&e)
            ))
        })
}

async fn poll_access_token(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    code: &DeviceCode,
) -> Result<PollResponse> {
    let response = client
        .post(endpoints.access_token_url())
        .header(reqwest::header::ACCEPT, "application/json")
        .json(&serde_json::json!({
            "client_id": GITHUB_CLIENT_ID,
            "device_code": code.device_code,
            "grant_type": DEVICE_GRANT_TYPE,
        }))
        .send()
        .await
        .map_err(|e| {
            Error::Http(format!(
                "access token poll failed: {}",
                describe_reqwest_error(&e)
            ))
        })?;

    let status = response.status();
    // Pending/slow_down arrive as 200 or 400 with an `error` field.
    if !status.is_success() && status.as_u16() != 400 {
        return Err(Error::DeviceFlow(format!(
            "access token endpoint returned {status}"
        )));
    }

    let raw = response
        .json::<RawPollResponse>()
        .await
        .map_err(|e| {
            Error::DeviceFlow(format!(
                "invalid access token response: {}",
                describe_reqwest_error(&e)
            ))
        })?;
    Ok(raw.into())
}

/// Run the whole device flow and return the approved GitHub token.
///
/// `notify` is called once with the code the user must enter.
pub async fn run_device_flow(
    client: &reqwest::Client,
    endpoints: &Endpoints,
    notify: impl Fn(&DeviceCode),
) -> Result<Secret<String>> {
    let code = request_device_code(client, endpoints).await?;
    info!(
        verification_uri = %code.verification_uri,
        user_code = %code.user_code,
        expires_in = code.expires_in,
        "device authorization started"
    );
    notify(&code);

    let started = tokio::time::Instant::now();
    let (mut state, mut action) =
        handle_event(DeviceFlowState::Requested(code), DeviceFlowEvent::CodeDisplayed);

    loop {
        match action {
            DeviceFlowAction::WaitThenPoll(delay) => {
                tokio::time::sleep(delay).await;
                let DeviceFlowState::Polling { code, .. } = &state else {
                    return Err(Error::DeviceFlow("poll requested outside polling state".into()));
                };
                let response = poll_access_token(client, endpoints, code).await?;
                debug!(?response, "device flow poll");
                (state, action) = handle_event(
                    state,
                    DeviceFlowEvent::Polled {
                        response,
                        elapsed: started.elapsed(),
                    },
                );
            }
            DeviceFlowAction::Persist => {
                return match state {
                    DeviceFlowState::Approved(token) => {
                        info!("device authorization approved");
                        Ok(token)
                    }
                    _ => Err(Error::DeviceFlow("approval without token".into())),
                };
            }
            DeviceFlowAction::Abort(reason) => {
                warn!(reason = %reason, "device authorization ended");
                return Err(match state {
                    DeviceFlowState::Expired => Error::DeviceFlowExpired,
                    _ => Error::DeviceFlow(reason),
                });
            }
            DeviceFlowAction::None => {
                return Err(Error::DeviceFlow("device flow stalled".into()));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn code(interval: u64, expires_in: u64) -> DeviceCode {
        DeviceCode {
            device_code: "dc_1".into(),
            user_code: "ABCD-1234".into(),
            verification_uri: "https://github.com/login/device".into(),
            expires_in,
            interval,
        }
    }

    fn polling(interval: u64, expires_in: u64) -> DeviceFlowState {
        DeviceFlowState::Polling {
            code: code(interval, expires_in),
            interval: Duration::from_secs(interval),
            expires_in: Duration::from_secs(expires_in),
        }
    }

    fn polled(response: PollResponse, elapsed_secs: u64) -> DeviceFlowEvent {
        DeviceFlowEvent::Polled {
            response,
            elapsed: Duration::from_secs(elapsed_secs),
        }
    }

    #[test]
    fn displaying_code_starts_polling_at_server_interval() {
        let (state, action) = handle_event(
            DeviceFlowState::Requested(code(7, 900)),
            DeviceFlowEvent::CodeDisplayed,
        );
        assert!(matches!(state, DeviceFlowState::Polling { interval, .. } if interval == Duration::from_secs(7)));
        assert_eq!(action, DeviceFlowAction::WaitThenPoll(Duration::from_secs(7)));
    }

    #[test]
    fn pending_keeps_polling() {
        let (state, action) = handle_event(polling(5, 900), polled(PollResponse::Pending, 10));
        assert!(matches!(state, DeviceFlowState::Polling { .. }));
        assert_eq!(action, DeviceFlowAction::WaitThenPoll(Duration::from_secs(5)));
    }

    #[test]
    fn slow_down_adds_five_seconds() {
        let (state, action) = handle_event(
            polling(5, 900),
            polled(PollResponse::SlowDown { interval: None }, 10),
        );
        assert_eq!(action, DeviceFlowAction::WaitThenPoll(Duration::from_secs(10)));

        let (_, action) = handle_event(state, polled(PollResponse::Pending, 20));
        assert_eq!(
            action,
            DeviceFlowAction::WaitThenPoll(Duration::from_secs(10)),
            "slow_down is permanent"
        );
    }

    #[test]
    fn slow_down_honors_larger_server_interval() {
        let (_, action) = handle_event(
            polling(5, 900),
            polled(PollResponse::SlowDown { interval: Some(30) }, 10),
        );
        assert_eq!(action, DeviceFlowAction::WaitThenPoll(Duration::from_secs(30)));
    }

    #[test]
    fn token_moves_to_approved() {
        let (state, action) = handle_event(
            polling(5, 900),
            polled(PollResponse::Token(Secret::from("ghu_new")), 15),
        );
        assert_eq!(action, DeviceFlowAction::Persist);
        match state {
            DeviceFlowState::Approved(token) => assert_eq!(token.expose(), "ghu_new"),
            other => panic!("expected Approved, got {other:?}"),
        }
    }

    #[test]
    fn pending_past_deadline_expires() {
        let (state, action) = handle_event(polling(5, 60), polled(PollResponse::Pending, 60));
        assert!(matches!(state, DeviceFlowState::Expired));
        assert!(matches!(action, DeviceFlowAction::Abort(_)));
    }

    #[test]
    fn server_expiry_and_denial_abort() {
        let (state, _) = handle_event(polling(5, 900), polled(PollResponse::Expired, 1));
        assert!(matches!(state, DeviceFlowState::Expired));

        let (state, action) = handle_event(polling(5, 900), polled(PollResponse::Denied, 1));
        assert!(matches!(state, DeviceFlowState::Failed { .. }));
        assert!(matches!(action, DeviceFlowAction::Abort(r) if r.contains("denied")));
    }

    #[test]
    fn terminal_states_ignore_events() {
        let (state, action) = handle_event(DeviceFlowState::Expired, polled(PollResponse::Pending, 1));
        assert!(matches!(state, DeviceFlowState::Expired));
        assert_eq!(action, DeviceFlowAction::None);
    }

    #[test]
    fn raw_poll_responses_decode() {
        let raw: RawPollResponse =
            serde_json::from_str(r#"{"error":"authorization_pending"}"#).unwrap();
        assert!(matches!(PollResponse::from(raw), PollResponse::Pending));

        let raw: RawPollResponse =
            serde_json::from_str(r#"{"error":"slow_down","interval":10}"#).unwrap();
        assert!(matches!(
            PollResponse::from(raw),
            PollResponse::SlowDown { interval: Some(10) }
        ));

        let raw: RawPollResponse = serde_json::from_str(
            r#"{"access_token":"ghu_x","token_type":"bearer","scope":"read:user"}"#,
        )
        .unwrap();
        assert!(matches!(PollResponse::from(raw), PollResponse::Token(_)));

        let raw: RawPollResponse =
            serde_json::from_str(r#"{"error":"unsupported_grant_type"}"#).unwrap();
        assert!(matches!(PollResponse::from(raw), PollResponse::Error(e) if e == "unsupported_grant_type"));
    }

    #[test]
    fn device_code_interval_defaults_to_five() {
        let code: DeviceCode = serde_json::from_str(
            r#"{"device_code":"d","user_code":"U","verification_uri":"v","expires_in":900}"#,
        )
        .unwrap();
        assert_eq!(code.interval, 5);
    }

    async fn spawn_github(polls_until_token: usize, expires_in: u64) -> (Endpoints, Arc<AtomicUsize>) {
        use axum::routing::post;
        use axum::{Json, Router};

        let polls = Arc::new(AtomicUsize::new(0));
        let counter = polls.clone();
        let app = Router::new()
            .route(
                "/login/device/code",
                post(move || async move {
                    Json(serde_json::json!({
                        "device_code": "dc_test",
                        "user_code": "WXYZ-0000",
                        "verification_uri": "https://github.com/login/device",
                        "expires_in": expires_in,
                        "interval": 0
                    }))
                }),
            )
            .route(
                "/login/oauth/access_token",
                post(move || {
                    let counter = counter.clone();
                    async move {
                        let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                        if n >= polls_until_token {
                            Json(serde_json::json!({"access_token": "ghu_device", "token_type": "bearer"}))
                        } else {
                            Json(serde_json::json!({"error": "authorization_pending"}))
                        }
                    }
                }),
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
            polls,
        )
    }

    #[tokio::test]
    async fn run_device_flow_polls_until_approved() {
        let (endpoints, polls) = spawn_github(3, 900).await;
        let shown = Arc::new(AtomicUsize::new(0));
        let shown_in = shown.clone();

        let token = run_device_flow(&reqwest::Client::new(), &endpoints, move |code| {
            assert_eq!(code.user_code, "WXYZ-0000");
            shown_in.fetch_add(1, Ordering::SeqCst);
        })
        .await
        .unwrap();

        assert_eq!(token.expose(), "ghu_device");
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert_eq!(shown.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn run_device_flow_expires_without_approval() {
        let (endpoints, _) = spawn_github(usize::MAX, 0).await;
        let err = run_device_flow(&reqwest::Client::new(), &endpoints, |_| {})
            .await
            .unwrap_err();
        assert!(matches!(err, Error::DeviceFlowExpired));
    }
}
