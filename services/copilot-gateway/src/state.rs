//! Process-wide shared state
//!
//! The one record every request reads: which credential is active, the mode
//! flags from configuration, and the rate limiter. The active credential is
//! written only through `CredentialSink`, which the pool calls while holding
//! its own lock, so a rotation and the state update commit together.

use std::sync::{PoisonError, RwLock};

use account_pool::CredentialSink;
use common::Secret;
use github_auth::AccountType;
use serde::Serialize;
use tracing::debug;

use crate::rate_limit::RateLimiter;

/// The credential the pool currently points at.
#[derive(Debug, Clone)]
pub struct ActiveAccount {
    pub index: usize,
    pub label: String,
    pub credential: Secret<String>,
}

/// Mode flags fixed at startup.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct Modes {
    pub account_type: AccountType,
    /// Allow the vision capability header on requests carrying images
    pub vision: bool,
    pub manual_approval: bool,
}

pub struct ProcessState {
    active: RwLock<Option<ActiveAccount>>,
    pub modes: Modes,
    pub rate_limiter: RateLimiter,
}

impl ProcessState {
    pub fn new(modes: Modes, rate_limiter: RateLimiter) -> Self {
        Self {
            active: RwLock::new(None),
            modes,
            rate_limiter,
        }
    }

    /// Snapshot of the active credential, `None` before the first sync.
    pub fn active(&self) -> Option<ActiveAccount> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn active_label(&self) -> Option<String> {
        self.active
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|a| a.label.clone())
    }
}

impl CredentialSink for ProcessState {
    fn set_active_credential(&self, index: usize, label: &str, secret: &Secret<String>) {
        let mut active = self.active.write().unwrap_or_else(PoisonError::into_inner);
        *active = Some(ActiveAccount {
            index,
            label: label.to_string(),
            credential: secret.clone(),
        });
        debug!(account = %label, index, "active credential updated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use account_pool::{AccountPool, CredentialRecord};
    use std::sync::Arc;

    fn modes() -> Modes {
        Modes {
            account_type: AccountType::Individual,
            vision: true,
            manual_approval: false,
        }
    }

    #[test]
    fn empty_until_synced() {
        let state = ProcessState::new(modes(), RateLimiter::disabled());
        assert!(state.active().is_none());
        assert!(state.active_label().is_none());
    }

    #[tokio::test]
    async fn pool_sync_and_rotation_update_active_credential() {
        let state = Arc::new(ProcessState::new(modes(), RateLimiter::disabled()));
        let pool = AccountPool::new(vec![
            CredentialRecord::new("alice", "gh-a"),
            CredentialRecord::new("bob", "gh-b"),
        ])
        .unwrap();

        pool.sync_into_state(state.as_ref()).await;
        let active = state.active().unwrap();
        assert_eq!(active.label, "alice");
        assert_eq!(active.credential.expose(), "gh-a");

        assert!(pool.rotate_and_sync(429, state.as_ref()).await);
        let active = state.active().unwrap();
        assert_eq!(active.index, 1);
        assert_eq!(active.credential.expose(), "gh-b");
        assert_eq!(state.active_label().as_deref(), Some("bob"));
    }

    #[tokio::test]
    async fn non_rate_limit_status_leaves_state_alone() {
        let state = ProcessState::new(modes(), RateLimiter::disabled());
        let pool = AccountPool::new(vec![
            CredentialRecord::new("alice", "gh-a"),
            CredentialRecord::new("bob", "gh-b"),
        ])
        .unwrap();
        pool.sync_into_state(&state).await;

        assert!(!pool.rotate_and_sync(500, &state).await);
        assert_eq!(state.active_label().as_deref(), Some("alice"));
    }
}
