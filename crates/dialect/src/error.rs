//! Error types for request translation

/// Reasons an inbound request body cannot be translated for the backend.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TranslateError {
    #[error("request body must be a JSON object")]
    NotAnObject,

    #[error("request body is missing a `messages` array")]
    MissingMessages,

    #[error("message {message} part {part} has no `type`")]
    MissingPartType { message: usize, part: usize },

    #[error("malformed `{kind}` part: {reason}")]
    MalformedPart { kind: String, reason: String },
}

/// Result alias for translation operations.
pub type Result<T> = std::result::Result<T, TranslateError>;
