//! Error types for GitHub and Copilot authentication

/// Errors from authentication operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The request never produced an HTTP response.
    #[error("HTTP request failed: {0}")]
    Http(String),

    /// The backend answered 429 to a token exchange.
    #[error("rate limited by token endpoint")]
    RateLimited { retry_after_secs: Option<u64> },

    /// GitHub rejected the long-lived token (401/403).
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("device authorization expired before approval")]
    DeviceFlowExpired,

    #[error("device authorization failed: {0}")]
    DeviceFlow(String),

    #[error("I/O error: {0}")]
    Io(String),
}

/// Describe a reqwest failure by kind only; its own message carries the
/// request URL.
pub(crate) fn describe_reqwest_error(e: &reqwest::Error) -> &'static str {
    if e.is_timeout() {
        "timed out"
    } else if e.is_connect() {
        "could not connect"
    } else if e.is_decode() {
        "response body could not be decoded"
    } else {
        "request failed"
    }
}

/// Result alias for auth operations.
pub type Result<T> = std::result::Result<T, Error>;
