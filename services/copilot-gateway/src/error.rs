//! Gateway error taxonomy
//!
//! Every failure a caller can see is one of these kinds, rendered as
//! `{"error":{"message","type","code"}}` with the kind's HTTP status.
//! Messages never carry credential values or raw backend bodies.

use axum::http::{HeaderValue, StatusCode, header};
use axum::response::{IntoResponse, Response};
use dialect::ErrorEnvelope;
use thiserror::Error;

/// Where a rate-limit rejection came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitOrigin {
    /// The gateway's own minimum-interval limiter
    Local,
    /// The backend answered 429
    Backend,
}

#[derive(Error, Debug)]
pub enum GatewayError {
    /// No usable credential. Fatal at startup.
    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("upstream authentication failed: {0}")]
    Auth(String),

    #[error("{message}")]
    RateLimit {
        origin: RateLimitOrigin,
        message: String,
        retry_after_secs: Option<u64>,
    },

    #[error("request rejected by operator")]
    ApprovalDenied,

    #[error("{message}")]
    Backend { status: u16, message: String },

    #[error("backend unreachable: {0}")]
    Transport(String),

    #[error("invalid request: {0}")]
    InvalidRequest(String),
}

impl GatewayError {
    pub fn status(&self) -> StatusCode {
        match self {
            GatewayError::Configuration(_) => StatusCode::INTERNAL_SERVER_ERROR,
            GatewayError::Auth(_) => StatusCode::UNAUTHORIZED,
            GatewayError::RateLimit { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::ApprovalDenied => StatusCode::FORBIDDEN,
            GatewayError::Backend { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            GatewayError::Transport(_) => StatusCode::BAD_GATEWAY,
            GatewayError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
        }
    }

    /// `(type, code)` pair of the caller-facing envelope.
    fn kind(&self) -> (&'static str, &'static str) {
        match self {
            GatewayError::Configuration(_) => ("server_error", "configuration_error"),
            GatewayError::Auth(_) => ("authentication_error", "upstream_auth_failed"),
            GatewayError::RateLimit {
                origin: RateLimitOrigin::Local,
                ..
            } => ("rate_limit_error", "rate_limited"),
            GatewayError::RateLimit {
                origin: RateLimitOrigin::Backend,
                ..
            } => ("rate_limit_error", "upstream_rate_limited"),
            GatewayError::ApprovalDenied => ("permission_error", "request_rejected"),
            GatewayError::Backend { .. } => ("api_error", "backend_error"),
            GatewayError::Transport(_) => ("api_error", "transport_error"),
            GatewayError::InvalidRequest(_) => ("invalid_request_error", "invalid_request"),
        }
    }

    pub fn envelope(&self) -> ErrorEnvelope {
        let (error_type, code) = self.kind();
        ErrorEnvelope::new(self.to_string(), error_type, code)
    }

    /// Worth retrying at startup: the backend was unreachable or asked us to
    /// slow down. Everything else needs operator action.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            GatewayError::Transport(_)
                | GatewayError::RateLimit {
                    origin: RateLimitOrigin::Backend,
                    ..
                }
        )
    }

    /// Label for `gateway_upstream_errors_total`.
    pub fn metric_label(&self) -> &'static str {
        match self {
            GatewayError::Configuration(_) => "configuration",
            GatewayError::Auth(_) => "auth",
            GatewayError::RateLimit {
                origin: RateLimitOrigin::Local,
                ..
            } => "local_rate_limit",
            GatewayError::RateLimit { .. } => "rate_limited",
            GatewayError::ApprovalDenied => "approval_denied",
            GatewayError::Backend { .. } => "backend",
            GatewayError::Transport(_) => "transport",
            GatewayError::InvalidRequest(_) => "invalid_request",
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status();
        let mut response = (
            status,
            [(header::CONTENT_TYPE, "application/json")],
            self.envelope().to_json_string(),
        )
            .into_response();
        if let GatewayError::RateLimit {
            retry_after_secs: Some(secs),
            ..
        } = self
            && let Ok(v) = HeaderValue::from_str(&secs.to_string())
        {
            response.headers_mut().insert(header::RETRY_AFTER, v);
        }
        response
    }
}

impl From<dialect::TranslateError> for GatewayError {
    fn from(e: dialect::TranslateError) -> Self {
        GatewayError::InvalidRequest(e.to_string())
    }
}

impl From<account_pool::Error> for GatewayError {
    fn from(e: account_pool::Error) -> Self {
        match e {
            account_pool::Error::NoCredentials(m) => GatewayError::Configuration(m),
            account_pool::Error::Exchange(inner) => inner.into(),
        }
    }
}

impl From<github_auth::Error> for GatewayError {
    fn from(e: github_auth::Error) -> Self {
        match e {
            github_auth::Error::RateLimited { retry_after_secs } => GatewayError::RateLimit {
                origin: RateLimitOrigin::Backend,
                message: "session token endpoint rate limited this account".into(),
                retry_after_secs,
            },
            github_auth::Error::Http(m) => GatewayError::Transport(m),
            other => GatewayError::Auth(other.to_string()),
        }
    }
}
