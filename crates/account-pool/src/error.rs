//! Error types for pool operations

/// Errors from pool operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// No source produced a usable credential. Fatal at startup.
    #[error("no credentials configured: {0}")]
    NoCredentials(String),

    /// Session token exchange failed for the active credential.
    #[error("session token exchange failed: {0}")]
    Exchange(#[from] github_auth::Error),
}

/// Result alias for pool operations.
pub type Result<T> = std::result::Result<T, Error>;
