//! Chat request translation
//!
//! Inbound message content is either a plain string or a list of parts. Each
//! part is decoded into [`ContentPart`] by its `type` tag:
//!
//! | inbound `type`             | backend part              |
//! |----------------------------|---------------------------|
//! | `text`, `input_text`       | `{"type":"text"}`         |
//! | `image_url`, `input_image` | `{"type":"image_url"}`    |
//! | anything else              | forwarded unchanged       |
//!
//! A part with no `type` at all is rejected.

use serde_json::{Map, Value, json};
use tracing::debug;

use crate::error::{Result, TranslateError};

/// Who started the conversation turn, reported to the backend as `x-initiator`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Initiator {
    User,
    Agent,
}

impl Initiator {
    pub fn as_str(&self) -> &'static str {
        match self {
            Initiator::User => "user",
            Initiator::Agent => "agent",
        }
    }
}

/// One decoded message part.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentPart {
    Text {
        text: String,
    },
    Image {
        url: String,
        detail: Option<String>,
    },
    /// A part kind this gateway has no mapping for; sent to the backend as-is.
    Passthrough(Value),
}

impl ContentPart {
    /// Decode an inbound part by its `type` tag.
    pub fn from_inbound(value: Value, message: usize, part: usize) -> Result<Self> {
        let kind = match value.get("type").and_then(Value::as_str) {
            Some(k) => k.to_string(),
            None => return Err(TranslateError::MissingPartType { message, part }),
        };

        match kind.as_str() {
            "text" | "input_text" => {
                let text = value
                    .get("text")
                    .and_then(Value::as_str)
                    .ok_or_else(|| TranslateError::MalformedPart {
                        kind: kind.clone(),
                        reason: "`text` must be a string".into(),
                    })?;
                Ok(ContentPart::Text {
                    text: text.to_string(),
                })
            }
            "image_url" | "input_image" => {
                let (url, nested_detail) = image_reference(&value, &kind)?;
                let detail = nested_detail.or_else(|| {
                    value
                        .get("detail")
                        .and_then(Value::as_str)
                        .map(str::to_string)
                });
                Ok(ContentPart::Image { url, detail })
            }
            other => {
                debug!(kind = other, "forwarding unmapped content part unchanged");
                Ok(ContentPart::Passthrough(value))
            }
        }
    }

    pub fn is_image(&self) -> bool {
        matches!(self, ContentPart::Image { .. })
    }

    /// Encode in the backend's part shape.
    pub fn into_backend(self) -> Value {
        match self {
            ContentPart::Text { text } => json!({ "type": "text", "text": text }),
            ContentPart::Image { url, detail } => {
                let mut image = Map::new();
                image.insert("url".into(), Value::String(url));
                if let Some(d) = detail {
                    image.insert("detail".into(), Value::String(d));
                }
                json!({ "type": "image_url", "image_url": Value::Object(image) })
            }
            ContentPart::Passthrough(v) => v,
        }
    }
}

/// `image_url` is a bare string in the Responses-style `input_image` part and
/// an object `{url, detail}` in the Chat-style `image_url` part. Accept both.
fn image_reference(value: &Value, kind: &str) -> Result<(String, Option<String>)> {
    match value.get("image_url") {
        Some(Value::String(url)) => Ok((url.clone(), None)),
        Some(Value::Object(obj)) => {
            let url = obj
                .get("url")
                .and_then(Value::as_str)
                .ok_or_else(|| TranslateError::MalformedPart {
                    kind: kind.to_string(),
                    reason: "`image_url.url` must be a string".into(),
                })?;
            let detail = obj
                .get("detail")
                .and_then(Value::as_str)
                .map(str::to_string);
            Ok((url.to_string(), detail))
        }
        _ => Err(TranslateError::MalformedPart {
            kind: kind.to_string(),
            reason: "missing `image_url`".into(),
        }),
    }
}

/// A chat request ready for the backend plus the facts the pipeline needs to
/// build outgoing headers.
#[derive(Debug, Clone)]
pub struct TranslatedRequest {
    pub body: Value,
    pub vision: bool,
    pub initiator: Initiator,
    pub stream: bool,
}

/// Translate an inbound chat-completions body into the backend's shape.
pub fn translate_chat_request(mut body: Value) -> Result<TranslatedRequest> {
    let obj = body.as_object_mut().ok_or(TranslateError::NotAnObject)?;
    let stream = obj.get("stream").and_then(Value::as_bool).unwrap_or(false);

    let messages = obj
        .get_mut("messages")
        .and_then(Value::as_array_mut)
        .ok_or(TranslateError::MissingMessages)?;

    let mut vision = false;
    let mut initiator = Initiator::User;

    for (m_idx, message) in messages.iter_mut().enumerate() {
        if let Some(role) = message.get("role").and_then(Value::as_str)
            && (role == "assistant" || role == "tool")
        {
            initiator = Initiator::Agent;
        }

        let Some(content) = message.get_mut("content") else {
            continue;
        };
        let Value::Array(parts) = content else {
            // Plain string or null content needs no mapping.
            continue;
        };

        let inbound = std::mem::take(parts);
        let mut outbound = Vec::with_capacity(inbound.len());
        for (p_idx, raw) in inbound.into_iter().enumerate() {
            let part = ContentPart::from_inbound(raw, m_idx, p_idx)?;
            vision |= part.is_image();
            outbound.push(part.into_backend());
        }
        *parts = outbound;
    }

    Ok(TranslatedRequest {
        body,
        vision,
        initiator,
        stream,
    })
}
