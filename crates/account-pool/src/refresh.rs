//! Scheduled session token refresh
//!
//! One background task per session manager. It sleeps until the token is
//! due, re-exchanges, and computes the next delay from the new token. Only
//! the first firing may be immediate; later ones wait at least 5 seconds
//! even when the backend keeps issuing short-lived tokens. A failed exchange
//! is logged and retried after the same delay. Replacing or
//! dropping the `RefreshHandle` aborts the task, so schedules never stack.

use std::sync::Weak;
use std::time::Duration;

use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::session::SessionManager;

/// How long before the advised refresh point the exchange is made.
const REFRESH_MARGIN_SECS: u64 = 60;

/// Shortest wait between two exchanges made by the refresh loop.
const MIN_LOOP_DELAY: Duration = Duration::from_secs(5);

/// Delay before refreshing a token advised to be renewed in `refresh_in` seconds.
///
/// Tokens with 60 seconds or less are refreshed immediately.
pub fn refresh_delay(refresh_in: u64) -> Duration {
    if refresh_in <= REFRESH_MARGIN_SECS {
        Duration::ZERO
    } else {
        Duration::from_secs(refresh_in - REFRESH_MARGIN_SECS)
    }
}

/// Cancellable handle for the refresh task.
#[derive(Debug)]
pub struct RefreshHandle {
    task: JoinHandle<()>,
}

impl RefreshHandle {
    pub fn cancel(self) {
        self.task.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.task.is_finished()
    }
}

impl Drop for RefreshHandle {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Spawn the refresh loop, first firing after `first_delay`.
///
/// The task holds only a weak reference, so it ends on its own once the
/// manager is gone.
pub(crate) fn spawn_refresh_task(
    manager: Weak<SessionManager>,
    first_delay: Duration,
) -> RefreshHandle {
    let task = tokio::spawn(async move {
        let mut delay = first_delay;
        loop {
            debug!(delay_secs = delay.as_secs(), "session refresh scheduled");
            tokio::time::sleep(delay).await;

            let Some(manager) = manager.upgrade() else {
                return;
            };
            match manager.acquire_session_token().await {
                Ok(session) => {
                    metrics::counter!("gateway_session_refresh_total", "outcome" => "success")
                        .increment(1);
                    delay = refresh_delay(session.token.expires_in_secs).max(MIN_LOOP_DELAY);
                    info!(
                        account = %session.label,
                        next_refresh_secs = delay.as_secs(),
                        "session token refreshed"
                    );
                }
                Err(e) => {
                    metrics::counter!("gateway_session_refresh_total", "outcome" => "failure")
                        .increment(1);
                    delay = delay.max(MIN_LOOP_DELAY);
                    warn!(
                        error = %e,
                        retry_secs = delay.as_secs(),
                        "scheduled session refresh failed, keeping current token"
                    );
                }
            }
        }
    });
    RefreshHandle { task }
}
