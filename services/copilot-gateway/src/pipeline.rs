//! Request pipeline
//!
//! Per chat request: rate check, optional operator approval, translation,
//! session snapshot, backend call, then either a buffered translation or a
//! chunk-by-chunk stream relay. A backend 429 rotates the pool (guarded by the
//! index the request was dispatched on) and re-exchanges the session token for
//! the new credential before the error reaches the caller. The failing request
//! itself is never retried.
//!
//! Each request works from an `Arc<Session>` snapshot taken at dispatch, so a
//! refresh landing mid-request cannot change the token it sends.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use account_pool::{AccountPool, Session, SessionManager};
use axum::body::Body;
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use dialect::{
    DONE_FRAME, SseDecoder, SseEvent, backend_error_message, encode_data, translate_chat_request,
    translate_chunk, translate_completion,
};
use futures_util::StreamExt;
use github_auth::{ClientIdentity, Endpoints};
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::approval::{ApprovalRequest, Approver};
use crate::error::{GatewayError, RateLimitOrigin};
use crate::state::ProcessState;

/// Everything a request needs, shared by all handlers.
pub struct Pipeline {
    pub client: reqwest::Client,
    /// Copilot backend base URL, no trailing slash
    pub backend_url: String,
    pub endpoints: Endpoints,
    pub identity: ClientIdentity,
    pub timeout: Duration,
    pub process: Arc<ProcessState>,
    pub pool: Arc<AccountPool>,
    pub sessions: Arc<SessionManager>,
    /// Consulted only when manual approval is on
    pub approver: Option<Arc<dyn Approver>>,
}

/// Per-call options for the outgoing headers.
struct Dispatch<'a> {
    path: &'a str,
    body: Option<&'a Value>,
    vision: bool,
    initiator: Option<&'static str>,
    streamed: bool,
}

impl Pipeline {
    /// `POST /chat/completions`
    #[instrument(skip_all, fields(request_id = %request_id))]
    pub async fn chat_completions(
        &self,
        body: Value,
        request_id: &str,
    ) -> Result<Response, GatewayError> {
        self.process.rate_limiter.check().await?;

        if self.process.modes.manual_approval {
            self.await_approval(&body, request_id).await?;
        }

        let translated = translate_chat_request(body)?;
        let vision = translated.vision && self.process.modes.vision;
        debug!(
            stream = translated.stream,
            vision,
            initiator = translated.initiator.as_str(),
            "chat request translated"
        );

        let (response, session) = self
            .dispatch(
                Dispatch {
                    path: "/chat/completions",
                    body: Some(&translated.body),
                    vision,
                    initiator: Some(translated.initiator.as_str()),
                    streamed: translated.stream,
                },
                request_id,
            )
            .await?;

        if translated.stream {
            info!(account = %session.label, "relaying streamed completion");
            Ok(relay_stream(response, request_id.to_string()))
        } else {
            let body = read_json(response).await?;
            Ok(json_response(translate_completion(body)))
        }
    }

    /// `POST /embeddings`, forwarded without translation.
    #[instrument(skip_all, fields(request_id = %request_id))]
    pub async fn embeddings(&self, body: Value, request_id: &str) -> Result<Response, GatewayError> {
        if !body.is_object() {
            return Err(GatewayError::InvalidRequest(
                "request body must be a JSON object".into(),
            ));
        }
        self.process.rate_limiter.check().await?;
        let (response, _) = self
            .dispatch(
                Dispatch {
                    path: "/embeddings",
                    body: Some(&body),
                    vision: false,
                    initiator: None,
                    streamed: false,
                },
                request_id,
            )
            .await?;
        Ok(json_response(read_json(response).await?))
    }

    /// `GET /models`, forwarded without translation.
    #[instrument(skip_all, fields(request_id = %request_id))]
    pub async fn models(&self, request_id: &str) -> Result<Response, GatewayError> {
        self.process.rate_limiter.check().await?;
        let (response, _) = self
            .dispatch(
                Dispatch {
                    path: "/models",
                    body: None,
                    vision: false,
                    initiator: None,
                    streamed: false,
                },
                request_id,
            )
            .await?;
        Ok(json_response(read_json(response).await?))
    }

    /// `GET /usage`: quota snapshot for the active long-lived credential.
    pub async fn usage(&self) -> Result<Response, GatewayError> {
        let active = self.process.active().ok_or_else(|| {
            GatewayError::Configuration("no active credential in process state".into())
        })?;
        let usage = github_auth::fetch_usage(
            &self.client,
            &self.endpoints,
            &self.identity,
            &active.credential,
        )
        .await?;
        Ok(json_response(usage))
    }

    async fn await_approval(&self, body: &Value, request_id: &str) -> Result<(), GatewayError> {
        let Some(approver) = &self.approver else {
            return Err(GatewayError::Configuration(
                "manual approval is on but no approver is attached".into(),
            ));
        };
        let request = ApprovalRequest::from_body(request_id, body);
        if approver.approve(&request).await {
            Ok(())
        } else {
            info!("request rejected by operator");
            Err(GatewayError::ApprovalDenied)
        }
    }

    /// Session token to dispatch with.
    ///
    /// A session exchanged for a credential the pool has since rotated away
    /// from is re-exchanged first. If that fails the previous token is still
    /// tried, since it may remain valid.
    async fn session_for_dispatch(&self) -> Result<Arc<Session>, GatewayError> {
        let active_index = self.process.active().map(|a| a.index);
        match self.sessions.current().await {
            Some(session) if active_index.is_none_or(|i| i == session.index) => Ok(session),
            Some(stale) => match self.sessions.start().await {
                Ok(fresh) => Ok(fresh),
                Err(e) => {
                    warn!(
                        account = %stale.label,
                        error = %e,
                        "re-exchange for rotated credential failed, using previous session token"
                    );
                    Ok(stale)
                }
            },
            None => Ok(self.sessions.start().await?),
        }
    }

    /// Send one backend call and classify the answer.
    ///
    /// Returns the successful response with the session it was sent under.
    async fn dispatch(
        &self,
        call: Dispatch<'_>,
        request_id: &str,
    ) -> Result<(reqwest::Response, Arc<Session>), GatewayError> {
        let session = self.session_for_dispatch().await?;
        self.pool.record_request_at(session.index).await;

        let headers = self.identity.copilot_headers(
            &session.token.value,
            request_id,
            call.vision,
            call.initiator,
        )?;
        let url = format!("{}{}", self.backend_url, call.path);
        let mut request = match call.body {
            Some(body) => self.client.post(&url).json(body),
            None => self.client.get(&url),
        }
        .headers(headers);

        let sent = if call.streamed {
            // Only the wait for response headers is bounded; the stream itself
            // runs until the backend finishes or the caller goes away.
            match tokio::time::timeout(self.timeout, request.send()).await {
                Ok(result) => result,
                Err(_) => {
                    return Err(GatewayError::Transport(format!(
                        "backend did not respond within {}s",
                        self.timeout.as_secs()
                    )));
                }
            }
        } else {
            request = request.timeout(self.timeout);
            request.send().await
        };
        let response = sent.map_err(|e| GatewayError::Transport(describe_transport_error(&e)))?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return Err(self
                .backend_rate_limited(&session, response.headers())
                .await);
        }
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            let message = backend_error_message(status.as_u16(), &text);
            warn!(
                account = %session.label,
                status = status.as_u16(),
                "backend returned an error"
            );
            return Err(GatewayError::Backend {
                status: status.as_u16(),
                message,
            });
        }

        self.pool.reset_cooldown_at(session.index).await;
        Ok((response, session))
    }

    /// Rotate away from the credential that drew a 429 and build the error.
    async fn backend_rate_limited(&self, session: &Session, headers: &HeaderMap) -> GatewayError {
        let retry_after_secs = parse_retry_after(headers);
        warn!(
            account = %session.label,
            retry_after_secs,
            "backend rate limited this account"
        );

        let rotated = self
            .pool
            .rotate_if_current(
                session.index,
                StatusCode::TOO_MANY_REQUESTS.as_u16(),
                retry_after_secs.map(Duration::from_secs),
                self.process.as_ref(),
            )
            .await;

        if rotated {
            match self.sessions.refresh_now().await {
                Ok(next) => info!(account = %next.label, "rotated to next account"),
                Err(e) => warn!(error = %e, "session exchange after rotation failed"),
            }
        }

        GatewayError::RateLimit {
            origin: RateLimitOrigin::Backend,
            message: "backend rate limit reached for the active account, retry the request".into(),
            retry_after_secs,
        }
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
}

fn describe_transport_error(e: &reqwest::Error) -> String {
    if e.is_timeout() {
        "backend request timed out".into()
    } else if e.is_connect() {
        "could not connect to backend".into()
    } else {
        "backend request failed".into()
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value, GatewayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|e| GatewayError::Transport(describe_transport_error(&e)))?;
    serde_json::from_slice(&bytes).map_err(|_| GatewayError::Backend {
        status: StatusCode::BAD_GATEWAY.as_u16(),
        message: "backend returned a response that is not JSON".into(),
    })
}

fn json_response(body: Value) -> Response {
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "application/json")],
        body.to_string(),
    )
        .into_response()
}

/// Relay the backend event stream, translating each chunk.
///
/// Dropping the returned body (caller disconnect) drops the backend response
/// and closes its connection. A backend read error ends the stream with one
/// error-envelope event and no `[DONE]`.
fn relay_stream(response: reqwest::Response, request_id: String) -> Response {
    let stream = async_stream::stream! {
        let mut decoder = SseDecoder::new();
        let mut upstream = std::pin::pin!(response.bytes_stream());
        let mut relayed = 0usize;

        while let Some(chunk) = upstream.next().await {
            let bytes = match chunk {
                Ok(bytes) => bytes,
                Err(e) => {
                    let error = GatewayError::Transport(describe_transport_error(&e));
                    warn!(request_id = %request_id, relayed, "backend stream aborted");
                    crate::metrics::record_upstream_error("stream_aborted");
                    yield Ok::<Bytes, Infallible>(Bytes::from(encode_data(
                        &error.envelope().to_json_string(),
                    )));
                    return;
                }
            };
            for event in decoder.push(&bytes) {
                match event {
                    SseEvent::Data(data) => {
                        relayed += 1;
                        yield Ok(Bytes::from(encode_data(&translate_data(&data))));
                    }
                    SseEvent::Done => {
                        debug!(request_id = %request_id, relayed, "stream complete");
                        yield Ok(Bytes::from_static(DONE_FRAME.as_bytes()));
                        return;
                    }
                }
            }
        }

        if let Some(SseEvent::Data(data)) = decoder.finish() {
            relayed += 1;
            yield Ok(Bytes::from(encode_data(&translate_data(&data))));
        }
        debug!(request_id = %request_id, relayed, "backend closed stream without [DONE]");
        yield Ok(Bytes::from_static(DONE_FRAME.as_bytes()));
    };

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .body(Body::from_stream(stream))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// Translate one `data:` payload; anything that is not JSON is relayed as-is.
fn translate_data(data: &str) -> String {
    match serde_json::from_str::<Value>(data) {
        Ok(chunk) => translate_chunk(chunk).to_string(),
        Err(_) => data.to_string(),
    }
}
