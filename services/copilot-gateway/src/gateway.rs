//! Gateway assembly
//!
//! `initialize` turns a loaded `Config` into a ready `Pipeline`: client
//! identity, credential pool, process state, session manager. It makes no
//! session exchange; `GatewayHandle::authenticate` does that so startup
//! retries can be driven by the service state machine. `shutdown` cancels
//! the refresh timer so nothing fires against torn-down state.

use std::sync::Arc;

use account_pool::{
    AccountPool, CredentialRecord, CredentialSink, GithubExchanger, PoolSources, SessionManager,
    load_pool,
};
use github_auth::constants::VSCODE_RELEASES_URL;
use github_auth::{ClientIdentity, DeviceCode, Endpoints, acquire_github_token};
use tracing::{info, warn};

use crate::approval::Approver;
use crate::config::Config;
use crate::error::GatewayError;
use crate::pipeline::Pipeline;
use crate::rate_limit::{RateLimitPolicy, RateLimiter};
use crate::state::{Modes, ProcessState};

/// A running gateway's shared pieces.
pub struct GatewayHandle {
    pub pipeline: Arc<Pipeline>,
}

impl GatewayHandle {
    /// Exchange the first session token and arm its refresh.
    pub async fn authenticate(&self) -> Result<(), GatewayError> {
        let session = self.pipeline.sessions.start().await?;
        info!(account = %session.label, "gateway authenticated");
        Ok(())
    }
}

/// Build the gateway from configuration.
///
/// Fails with `GatewayError::Configuration` when no credential can be found.
pub async fn initialize(
    config: &Config,
    approver: Option<Arc<dyn Approver>>,
) -> Result<GatewayHandle, GatewayError> {
    let client = reqwest::Client::new();
    let endpoints = config.copilot.endpoints();
    let identity = resolve_identity(&client, config).await;

    let records = resolve_credentials(&client, config, &endpoints, &identity).await?;
    if let Some(hint) = config.accounts.pool_size_hint
        && hint != records.len()
    {
        warn!(
            expected = hint,
            resolved = records.len(),
            "credential pool size differs from configured hint"
        );
    }

    let pool = Arc::new(AccountPool::new(records)?);
    let modes = Modes {
        account_type: config.copilot.account_type,
        vision: config.copilot.vision,
        manual_approval: config.copilot.manual_approval,
    };
    let policy = if config.rate_limit.wait {
        RateLimitPolicy::Wait
    } else {
        RateLimitPolicy::Reject
    };
    let process = Arc::new(ProcessState::new(
        modes,
        RateLimiter::new(config.rate_limit.interval(), policy),
    ));
    pool.sync_into_state(process.as_ref()).await;

    let sink: Arc<dyn CredentialSink> = process.clone();
    let exchanger = Arc::new(GithubExchanger::new(
        client.clone(),
        endpoints.clone(),
        identity.clone(),
    ));
    let sessions = SessionManager::new(pool.clone(), sink, exchanger);

    if modes.manual_approval && approver.is_none() {
        return Err(GatewayError::Configuration(
            "manual approval enabled without an approver".into(),
        ));
    }

    let backend_url = config.copilot.backend_url().trim_end_matches('/').to_string();
    let limiter = &process.rate_limiter;
    info!(
        backend = %backend_url,
        account = ?process.active_label(),
        account_type = modes.account_type.as_str(),
        vision = modes.vision,
        manual_approval = modes.manual_approval,
        rate_limit_secs = ?limiter.interval().map(|d| d.as_secs()),
        rate_limit_policy = ?limiter.policy(),
        "gateway initialized"
    );

    let pipeline = Pipeline {
        client,
        backend_url,
        endpoints,
        identity,
        timeout: config.request_timeout(),
        process,
        pool,
        sessions,
        approver,
    };
    Ok(GatewayHandle {
        pipeline: Arc::new(pipeline),
    })
}

/// Cancel the session refresh and log final per-account usage.
pub async fn shutdown(handle: &GatewayHandle) {
    handle.pipeline.sessions.shutdown().await;
    for account in handle.pipeline.pool.usage_snapshot().await {
        info!(
            account = %account.label,
            requests = account.requests,
            rate_limit_hits = account.rate_limit_hits,
            "final account usage"
        );
    }
}

/// Run device-flow login unconditionally and cache the token.
pub async fn login(config: &Config) -> Result<(), GatewayError> {
    let client = reqwest::Client::new();
    let endpoints = config.copilot.endpoints();
    let identity = resolve_identity(&client, config).await;
    acquire_github_token(
        &client,
        &endpoints,
        &identity,
        &config.accounts.token_file,
        true,
        show_device_code,
    )
    .await?;
    info!(path = %config.accounts.token_file.display(), "GitHub token saved");
    Ok(())
}

async fn resolve_identity(client: &reqwest::Client, config: &Config) -> ClientIdentity {
    let version = match &config.copilot.vscode_version {
        Some(v) => v.clone(),
        None => github_auth::fetch_vscode_version(client, VSCODE_RELEASES_URL).await,
    };
    info!(vscode_version = %version, "client identity resolved");
    ClientIdentity::new(version)
}

/// Configured sources first; device login (or its cached token) last.
async fn resolve_credentials(
    client: &reqwest::Client,
    config: &Config,
    endpoints: &Endpoints,
    identity: &ClientIdentity,
) -> Result<Vec<CredentialRecord>, GatewayError> {
    let sources = PoolSources {
        inline: config.accounts.inline.as_ref().map(|s| s.expose().clone()),
        file: config.accounts.file.clone(),
        fallback: config.accounts.github_token.clone(),
    };
    match load_pool(&sources).await {
        Ok(records) => Ok(records),
        Err(account_pool::Error::NoCredentials(reason)) if config.accounts.device_login => {
            info!(reason = %reason, "no configured credentials, using device login");
            let token = acquire_github_token(
                client,
                endpoints,
                identity,
                &config.accounts.token_file,
                false,
                show_device_code,
            )
            .await
            .map_err(|e| GatewayError::Configuration(format!("device login failed: {e}")))?;
            Ok(vec![CredentialRecord::new("account-1", token)])
        }
        Err(e) => Err(e.into()),
    }
}

fn show_device_code(code: &DeviceCode) {
    info!(
        user_code = %code.user_code,
        verification_uri = %code.verification_uri,
        "device authorization required"
    );
    eprintln!(
        "To authorize this gateway, open {} and enter code {}",
        code.verification_uri, code.user_code
    );
}
