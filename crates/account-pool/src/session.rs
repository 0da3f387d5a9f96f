//! Session token lifecycle for the active credential
//!
//! `SessionManager` owns the one session token the gateway sends with every
//! backend call. Readers take an `Arc<Session>` snapshot, so a refresh that
//! lands mid-request replaces the pointer and never a value in use.
//!
//! The exchange itself sits behind `TokenExchanger`, the same
//! `Pin<Box<dyn Future>>` seam used for other upstream calls, so refresh and
//! rotation behaviour can be driven by scripted exchanges in tests.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use common::Secret;
use github_auth::{ClientIdentity, Endpoints, SessionToken};
use tokio::sync::{Mutex, RwLock};
use tracing::{info, warn};

use crate::error::Result;
use crate::pool::{AccountPool, CredentialSink};
use crate::refresh::{RefreshHandle, refresh_delay, spawn_refresh_task};

/// Exchanges a long-lived GitHub token for a session token.
pub trait TokenExchanger: Send + Sync {
    fn exchange<'a>(
        &'a self,
        github_token: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = github_auth::Result<SessionToken>> + Send + 'a>>;
}

/// Exchanger calling the real token endpoint.
pub struct GithubExchanger {
    client: reqwest::Client,
    endpoints: Endpoints,
    identity: ClientIdentity,
}

impl GithubExchanger {
    pub fn new(client: reqwest::Client, endpoints: Endpoints, identity: ClientIdentity) -> Self {
        Self {
            client,
            endpoints,
            identity,
        }
    }
}

impl TokenExchanger for GithubExchanger {
    fn exchange<'a>(
        &'a self,
        github_token: &'a Secret<String>,
    ) -> Pin<Box<dyn Future<Output = github_auth::Result<SessionToken>> + Send + 'a>> {
        Box::pin(github_auth::exchange_session_token(
            &self.client,
            &self.endpoints,
            &self.identity,
            github_token,
        ))
    }
}

/// A session token together with the pool entry it was exchanged from.
#[derive(Debug)]
pub struct Session {
    pub token: SessionToken,
    pub index: usize,
    pub label: String,
}

pub struct SessionManager {
    pool: Arc<AccountPool>,
    sink: Arc<dyn CredentialSink>,
    exchanger: Arc<dyn TokenExchanger>,
    session: RwLock<Option<Arc<Session>>>,
    refresh: Mutex<Option<RefreshHandle>>,
}

impl SessionManager {
    pub fn new(
        pool: Arc<AccountPool>,
        sink: Arc<dyn CredentialSink>,
        exchanger: Arc<dyn TokenExchanger>,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            sink,
            exchanger,
            session: RwLock::new(None),
            refresh: Mutex::new(None),
        })
    }

    /// Exchange the active credential and store the resulting session token.
    ///
    /// On a 429 from the token endpoint the pool is rotated (and the process
    /// state synced) before the error is returned, so the hit is recorded
    /// against the credential that caused it.
    pub async fn acquire_session_token(&self) -> Result<Arc<Session>> {
        let active = self.pool.current().await;
        match self.exchanger.exchange(&active.secret).await {
            Ok(token) => {
                let session = Arc::new(Session {
                    token,
                    index: active.index,
                    label: active.label,
                });
                *self.session.write().await = Some(session.clone());
                Ok(session)
            }
            Err(github_auth::Error::RateLimited { retry_after_secs }) => {
                warn!(
                    account = %active.label,
                    retry_after_secs,
                    "session token exchange rate limited, rotating"
                );
                self.pool
                    .rotate_if_current(
                        active.index,
                        429,
                        retry_after_secs.map(std::time::Duration::from_secs),
                        self.sink.as_ref(),
                    )
                    .await;
                Err(github_auth::Error::RateLimited { retry_after_secs }.into())
            }
            Err(e) => {
                warn!(account = %active.label, error = %e, "session token exchange failed");
                Err(e.into())
            }
        }
    }

    /// Current session snapshot, if one has been acquired.
    pub async fn current(&self) -> Option<Arc<Session>> {
        self.session.read().await.clone()
    }

    /// Exchange now and schedule the next refresh.
    ///
    /// Used at startup and after rotation; any previous schedule is replaced.
    pub async fn start(self: &Arc<Self>) -> Result<Arc<Session>> {
        let session = self.acquire_session_token().await?;
        self.schedule_refresh(&session).await;
        info!(
            account = %session.label,
            refresh_in = session.token.expires_in_secs,
            "session token acquired"
        );
        Ok(session)
    }

    /// Re-exchange for the credential that is now active. Alias of `start`
    /// for call sites reacting to a rotation.
    pub async fn refresh_now(self: &Arc<Self>) -> Result<Arc<Session>> {
        self.start().await
    }

    /// Arm the refresh timer for `session`, cancelling any earlier timer.
    pub async fn schedule_refresh(self: &Arc<Self>, session: &Session) {
        let delay = refresh_delay(session.token.expires_in_secs);
        let handle = spawn_refresh_task(Arc::downgrade(self), delay);
        if let Some(previous) = self.refresh.lock().await.replace(handle) {
            previous.cancel();
        }
    }

    /// Cancel the refresh timer. The current token stays readable.
    pub async fn shutdown(&self) {
        if let Some(handle) = self.refresh.lock().await.take() {
            handle.cancel();
            info!("session refresh cancelled");
        }
    }

    pub async fn refresh_scheduled(&self) -> bool {
        self.refresh
            .lock()
            .await
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::CredentialRecord;
    use std::collections::VecDeque;
    use std::sync::Mutex as StdMutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Scripted exchanger: pops one outcome per call, then repeats the last
    /// successful shape with a fresh token value.
    struct ScriptedExchanger {
        calls: AtomicUsize,
        seen: StdMutex<Vec<String>>,
        script: StdMutex<VecDeque<github_auth::Result<u64>>>,
        default_refresh_in: u64,
    }

    impl ScriptedExchanger {
        fn new(script: Vec<github_auth::Result<u64>>, default_refresh_in: u64) -> Arc<Self> {
            Arc::new(Self {
                calls: AtomicUsize::new(0),
                seen: StdMutex::new(Vec::new()),
                script: StdMutex::new(script.into()),
                default_refresh_in,
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenExchanger for ScriptedExchanger {
        fn exchange<'a>(
            &'a self,
            github_token: &'a Secret<String>,
        ) -> Pin<Box<dyn Future<Output = github_auth::Result<SessionToken>> + Send + 'a>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                self.seen.lock().unwrap().push(github_token.expose().clone());
                let next = self
                    .script
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or(Ok(self.default_refresh_in));
                next.map(|refresh_in| SessionToken {
                    value: Secret::new(format!("session-{n}-{}", github_token.expose())),
                    expires_in_secs: refresh_in,
                    expires_at: 0,
                })
            })
        }
    }

    #[derive(Default)]
    struct NullSink;

    impl CredentialSink for NullSink {
        fn set_active_credential(&self, _: usize, _: &str, _: &Secret<String>) {}
    }

    fn pool(n: usize) -> Arc<AccountPool> {
        let records = (1..=n)
            .map(|i| CredentialRecord::new(format!("account-{i}"), format!("gh{i}")))
            .collect();
        Arc::new(AccountPool::new(records).unwrap())
    }

    fn manager(pool: Arc<AccountPool>, exchanger: Arc<ScriptedExchanger>) -> Arc<SessionManager> {
        SessionManager::new(pool, Arc::new(NullSink), exchanger)
    }

    #[tokio::test(start_paused = true)]
    async fn start_acquires_and_schedules() {
        let exchanger = ScriptedExchanger::new(vec![Ok(1500)], 1500);
        let mgr = manager(pool(2), exchanger.clone());

        let session = mgr.start().await.unwrap();
        assert_eq!(session.index, 0);
        assert_eq!(session.token.value.expose(), "session-1-gh1");
        assert!(mgr.refresh_scheduled().await);

        // Refresh fires at refresh_in - 60 seconds.
        tokio::time::sleep(Duration::from_secs(1439)).await;
        assert_eq!(exchanger.calls(), 1);
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(exchanger.calls(), 2);
        let current = mgr.current().await.unwrap();
        assert_eq!(current.token.value.expose(), "session-2-gh1");
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn short_lived_token_refreshes_immediately() {
        let exchanger = ScriptedExchanger::new(vec![Ok(30), Ok(1500)], 1500);
        let mgr = manager(pool(1), exchanger.clone());

        mgr.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(exchanger.calls(), 2);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_short_lived_tokens_are_spaced_out() {
        let exchanger = ScriptedExchanger::new(vec![], 30);
        let mgr = manager(pool(1), exchanger.clone());

        mgr.start().await.unwrap();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(exchanger.calls(), 2);

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(exchanger.calls(), 2);
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(exchanger.calls(), 3);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(exchanger.calls(), 4);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn failed_refresh_keeps_token_and_retries() {
        let exchanger = ScriptedExchanger::new(
            vec![
                Ok(100),
                Err(github_auth::Error::Http("connection reset".into())),
                Ok(1000),
            ],
            1000,
        );
        let mgr = manager(pool(1), exchanger.clone());
        mgr.start().await.unwrap();

        // First refresh at 40s fails; the old token remains.
        tokio::time::sleep(Duration::from_secs(41)).await;
        assert_eq!(exchanger.calls(), 2);
        assert_eq!(
            mgr.current().await.unwrap().token.value.expose(),
            "session-1-gh1"
        );

        // Retried on the same 40s schedule.
        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(exchanger.calls(), 3);
        assert_eq!(
            mgr.current().await.unwrap().token.value.expose(),
            "session-3-gh1"
        );
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn shutdown_cancels_timer() {
        let exchanger = ScriptedExchanger::new(vec![Ok(120)], 120);
        let mgr = manager(pool(1), exchanger.clone());
        mgr.start().await.unwrap();
        mgr.shutdown().await;
        assert!(!mgr.refresh_scheduled().await);

        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(exchanger.calls(), 1);
        assert!(mgr.current().await.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn restart_replaces_schedule_instead_of_stacking() {
        let exchanger = ScriptedExchanger::new(vec![], 1000);
        let mgr = manager(pool(1), exchanger.clone());

        mgr.start().await.unwrap();
        mgr.refresh_now().await.unwrap();
        mgr.refresh_now().await.unwrap();
        assert_eq!(exchanger.calls(), 3);

        // One timer at 940s, not three.
        tokio::time::sleep(Duration::from_secs(941)).await;
        assert_eq!(exchanger.calls(), 4);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn rate_limited_exchange_rotates_before_failing() {
        let exchanger = ScriptedExchanger::new(
            vec![Err(github_auth::Error::RateLimited {
                retry_after_secs: Some(30),
            })],
            1500,
        );
        let pool = pool(3);
        let mgr = manager(pool.clone(), exchanger.clone());

        let err = mgr.acquire_session_token().await.unwrap_err();
        assert!(matches!(
            err,
            crate::Error::Exchange(github_auth::Error::RateLimited { .. })
        ));
        assert_eq!(pool.current().await.label, "account-2");
        assert_eq!(pool.usage_snapshot().await[0].rate_limit_hits, 1);

        let session = mgr.start().await.unwrap();
        assert_eq!(session.label, "account-2");
        assert_eq!(exchanger.seen.lock().unwrap().as_slice(), ["gh1", "gh2"]);
        mgr.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn snapshot_survives_refresh() {
        let exchanger = ScriptedExchanger::new(vec![Ok(100)], 100);
        let mgr = manager(pool(1), exchanger.clone());
        mgr.start().await.unwrap();

        let in_flight = mgr.current().await.unwrap();
        tokio::time::sleep(Duration::from_secs(41)).await;
        let after = mgr.current().await.unwrap();

        assert_eq!(in_flight.token.value.expose(), "session-1-gh1");
        assert_eq!(after.token.value.expose(), "session-2-gh1");
        mgr.shutdown().await;
    }
}
