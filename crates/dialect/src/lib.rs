//! Translation between the caller-facing OpenAI dialect and the Copilot backend
//!
//! Requests are decoded into an explicit tagged union of message parts before
//! being re-encoded for the backend, so every inbound part kind is either
//! mapped, passed through on purpose, or rejected. Responses go the other way:
//! buffered bodies and streamed chunks drop backend-only fields and fill in
//! the fields OpenAI clients rely on.
//!
//! Nothing in this crate performs I/O; the gateway service drives it.

pub mod envelope;
pub mod error;
pub mod request;
pub mod response;
pub mod sse;

pub use envelope::{ErrorBody, ErrorEnvelope};
pub use error::{Result, TranslateError};
pub use request::{ContentPart, Initiator, TranslatedRequest, translate_chat_request};
pub use response::{backend_error_message, translate_chunk, translate_completion};
pub use sse::{DONE_FRAME, SseDecoder, SseEvent, encode_data};
