//! Process-wide minimum spacing between backend calls
//!
//! One timestamp for the whole process. The read-compare-write of that
//! timestamp happens under a single async mutex, so two concurrent requests
//! can never both see "interval elapsed". Under the wait policy the lock is
//! held through the sleep; later callers queue behind it and are spaced out
//! in turn, while requests not touching the limiter are unaffected.

use std::time::Duration;

use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::error::{GatewayError, RateLimitOrigin};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// Suspend the caller until the interval has passed
    Wait,
    /// Fail with 429 and the remaining seconds
    Reject,
}

pub struct RateLimiter {
    interval: Option<Duration>,
    policy: RateLimitPolicy,
    last_request: Mutex<Option<Instant>>,
}

impl RateLimiter {
    pub fn new(interval: Option<Duration>, policy: RateLimitPolicy) -> Self {
        Self {
            interval,
            policy,
            last_request: Mutex::new(None),
        }
    }

    #[cfg(test)]
    pub fn disabled() -> Self {
        Self::new(None, RateLimitPolicy::Reject)
    }

    pub fn interval(&self) -> Option<Duration> {
        self.interval
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Admit one backend call, waiting or rejecting per policy.
    pub async fn check(&self) -> Result<(), GatewayError> {
        let Some(interval) = self.interval else {
            return Ok(());
        };

        let mut last = self.last_request.lock().await;
        let now = Instant::now();
        let elapsed = match *last {
            Some(t) => now.saturating_duration_since(t),
            None => {
                *last = Some(now);
                return Ok(());
            }
        };

        if elapsed >= interval {
            *last = Some(now);
            return Ok(());
        }

        let remaining = interval - elapsed;
        let remaining_secs = ceil_secs(remaining);
        match self.policy {
            RateLimitPolicy::Wait => {
                info!(wait_ms = remaining.as_millis() as u64, "rate limit reached, waiting");
                tokio::time::sleep(remaining).await;
                *last = Some(Instant::now());
                debug!("rate limit wait complete");
                Ok(())
            }
            RateLimitPolicy::Reject => Err(GatewayError::RateLimit {
                origin: RateLimitOrigin::Local,
                message: format!("rate limit exceeded, retry in {remaining_secs}s"),
                retry_after_secs: Some(remaining_secs),
            }),
        }
    }
}

/// Whole seconds rounded up, never less than one.
fn ceil_secs(d: Duration) -> u64 {
    let secs = d.as_secs() + u64::from(d.subsec_nanos() > 0);
    secs.max(1)
}
