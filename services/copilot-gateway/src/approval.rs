//! Manual request approval
//!
//! With `copilot.manual_approval` on, every chat request waits for an
//! operator decision before anything is sent to the backend. The decision
//! source is a trait so the pipeline can be driven without a terminal.

use std::future::Future;
use std::pin::Pin;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// What the operator sees when asked to approve a request.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub request_id: String,
    pub model: Option<String>,
    pub messages: usize,
    pub stream: bool,
}

impl ApprovalRequest {
    pub fn from_body(request_id: &str, body: &serde_json::Value) -> Self {
        Self {
            request_id: request_id.to_string(),
            model: body
                .get("model")
                .and_then(serde_json::Value::as_str)
                .map(str::to_string),
            messages: body
                .get("messages")
                .and_then(serde_json::Value::as_array)
                .map_or(0, Vec::len),
            stream: body
                .get("stream")
                .and_then(serde_json::Value::as_bool)
                .unwrap_or(false),
        }
    }

    fn prompt(&self) -> String {
        format!(
            "Accept request {} (model {}, {} messages{})? [y/N] ",
            self.request_id,
            self.model.as_deref().unwrap_or("unspecified"),
            self.messages,
            if self.stream { ", streamed" } else { "" },
        )
    }
}

/// Source of accept/reject decisions.
pub trait Approver: Send + Sync {
    fn approve<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>>;
}

/// Asks on the controlling terminal. One prompt at a time; concurrent
/// requests queue behind the lock.
pub struct StdinApprover {
    lines: Mutex<Lines<BufReader<Stdin>>>,
}

impl StdinApprover {
    pub fn new() -> Self {
        Self {
            lines: Mutex::new(BufReader::new(tokio::io::stdin()).lines()),
        }
    }
}

impl Default for StdinApprover {
    fn default() -> Self {
        Self::new()
    }
}

impl Approver for StdinApprover {
    fn approve<'a>(
        &'a self,
        request: &'a ApprovalRequest,
    ) -> Pin<Box<dyn Future<Output = bool> + Send + 'a>> {
        Box::pin(async move {
            let mut lines = self.lines.lock().await;
            let mut stderr = tokio::io::stderr();
            if let Err(e) = stderr.write_all(request.prompt().as_bytes()).await {
                warn!(error = %e, "failed to write approval prompt");
            }
            let _ = stderr.flush().await;

            let accepted = match lines.next_line().await {
                Ok(Some(answer)) => is_accept(&answer),
                Ok(None) => {
                    warn!("stdin closed, rejecting request");
                    false
                }
                Err(e) => {
                    warn!(error = %e, "failed to read approval answer, rejecting request");
                    false
                }
            };
            info!(request_id = %request.request_id, accepted, "manual approval decision");
            accepted
        })
    }
}

fn is_accept(answer: &str) -> bool {
    matches!(answer.trim().to_ascii_lowercase().as_str(), "y" | "yes")
}
