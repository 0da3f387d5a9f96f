//! Response translation
//!
//! The backend already speaks a close relative of the OpenAI schema, so the
//! mapping is small: drop the content-filter annotations only the backend
//! emits, and fill in `object` and choice `index` where the backend omits
//! them. Buffered bodies and stream chunks go through the same helpers.

use serde_json::Value;

/// Top-level fields that exist only in backend responses.
const BACKEND_ONLY_FIELDS: &[&str] = &["prompt_filter_results"];

/// Per-choice fields that exist only in backend responses.
const BACKEND_ONLY_CHOICE_FIELDS: &[&str] = &["content_filter_results", "content_filter_offsets"];

/// Longest backend error message relayed to callers.
const MAX_ERROR_MESSAGE_LEN: usize = 512;

/// Translate a complete (non-streamed) chat completion body.
pub fn translate_completion(body: Value) -> Value {
    normalize(body, "chat.completion")
}

/// Translate one streamed chat completion chunk.
pub fn translate_chunk(chunk: Value) -> Value {
    normalize(chunk, "chat.completion.chunk")
}

fn normalize(mut body: Value, object: &str) -> Value {
    let Some(obj) = body.as_object_mut() else {
        return body;
    };

    for field in BACKEND_ONLY_FIELDS {
        obj.remove(*field);
    }
    if !obj.get("object").is_some_and(Value::is_string) {
        obj.insert("object".into(), Value::String(object.to_string()));
    }

    match obj.get_mut("choices") {
        Some(Value::Array(choices)) => {
            for (idx, choice) in choices.iter_mut().enumerate() {
                if let Some(c) = choice.as_object_mut() {
                    for field in BACKEND_ONLY_CHOICE_FIELDS {
                        c.remove(*field);
                    }
                    if !c.get("index").is_some_and(Value::is_u64) {
                        c.insert("index".into(), Value::from(idx as u64));
                    }
                }
            }
        }
        _ => {
            obj.insert("choices".into(), Value::Array(Vec::new()));
        }
    }

    body
}

/// Extract a caller-safe message from a backend error body.
///
/// Only the `error.message` (or top-level `message`) string is relayed; any
/// other body content is replaced by a generic status line.
pub fn backend_error_message(status: u16, body: &str) -> String {
    let parsed: Option<Value> = serde_json::from_str(body).ok();
    let message = parsed.as_ref().and_then(|v| {
        v.get("error")
            .and_then(|e| e.get("message").or(Some(e)))
            .and_then(Value::as_str)
            .or_else(|| v.get("message").and_then(Value::as_str))
    });

    match message {
        Some(m) if !m.trim().is_empty() => {
            let trimmed = m.trim();
            if trimmed.len() > MAX_ERROR_MESSAGE_LEN {
                let mut end = MAX_ERROR_MESSAGE_LEN;
                while !trimmed.is_char_boundary(end) {
                    end -= 1;
                }
                format!("{}...", &trimmed[..end])
            } else {
                trimmed.to_string()
            }
        }
        _ => format!("backend request failed with status {status}"),
    }
}
