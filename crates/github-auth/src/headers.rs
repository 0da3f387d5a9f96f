//! Outgoing identification headers
//!
//! Both GitHub API calls and Copilot backend calls must look like they come
//! from a Copilot Chat editor client. `ClientIdentity` holds the one dynamic
//! piece (the editor version, looked up at startup) and builds both header
//! sets.

use std::time::Duration;

use common::Secret;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use tracing::{debug, warn};

use crate::constants::{
    EDITOR_PLUGIN_VERSION, FALLBACK_VSCODE_VERSION, GITHUB_API_VERSION, USER_AGENT,
};
use crate::error::{Error, Result};

/// Copilot integration the backend attributes requests to.
const COPILOT_INTEGRATION_ID: &str = "vscode-chat";

/// Intent value for chat panel conversations.
const OPENAI_INTENT: &str = "conversation-panel";

const USER_AGENT_LIBRARY: &str = "electron-fetch";

#[derive(Debug, Clone)]
pub struct ClientIdentity {
    pub vscode_version: String,
}

impl Default for ClientIdentity {
    fn default() -> Self {
        Self::new(FALLBACK_VSCODE_VERSION)
    }
}

impl ClientIdentity {
    pub fn new(vscode_version: impl Into<String>) -> Self {
        Self {
            vscode_version: vscode_version.into(),
        }
    }

    pub fn editor_version(&self) -> String {
        format!("vscode/{}", self.vscode_version)
    }

    /// Headers for `api.github.com` calls authenticated with a GitHub token.
    pub fn github_headers(&self, github_token: &Secret<String>) -> Result<HeaderMap> {
        let mut headers = self.common_headers()?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("token {}", github_token.expose()))
                .map_err(|_| Error::InvalidCredentials("token is not a valid header value".into()))?,
        );
        Ok(headers)
    }

    /// Headers for Copilot backend calls authenticated with a session token.
    ///
    /// `copilot-vision-request` is present only when `vision` is set.
    pub fn copilot_headers(
        &self,
        session_token: &Secret<String>,
        request_id: &str,
        vision: bool,
        initiator: Option<&str>,
    ) -> Result<HeaderMap> {
        let mut headers = self.common_headers()?;
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {}", session_token.expose())).map_err(|_| {
                Error::InvalidCredentials("session token is not a valid header value".into())
            })?,
        );
        headers.insert(
            HeaderName::from_static("copilot-integration-id"),
            HeaderValue::from_static(COPILOT_INTEGRATION_ID),
        );
        headers.insert(
            HeaderName::from_static("openai-intent"),
            HeaderValue::from_static(OPENAI_INTENT),
        );
        headers.insert(
            HeaderName::from_static("x-request-id"),
            HeaderValue::from_str(request_id)
                .map_err(|e| Error::TokenExchange(format!("invalid request id: {e}")))?,
        );
        if vision {
            headers.insert(
                HeaderName::from_static("copilot-vision-request"),
                HeaderValue::from_static("true"),
            );
        }
        if let Some(initiator) = initiator
            && let Ok(v) = HeaderValue::from_str(initiator)
        {
            headers.insert(HeaderName::from_static("x-initiator"), v);
        }
        Ok(headers)
    }

    fn common_headers(&self) -> Result<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        headers.insert(ACCEPT, HeaderValue::from_static("application/json"));
        headers.insert(
            HeaderName::from_static("editor-version"),
            HeaderValue::from_str(&self.editor_version())
                .map_err(|e| Error::TokenExchange(format!("invalid editor version: {e}")))?,
        );
        headers.insert(
            HeaderName::from_static("editor-plugin-version"),
            HeaderValue::from_static(EDITOR_PLUGIN_VERSION),
        );
        headers.insert(
            reqwest::header::USER_AGENT,
            HeaderValue::from_static(USER_AGENT),
        );
        headers.insert(
            HeaderName::from_static("x-github-api-version"),
            HeaderValue::from_static(GITHUB_API_VERSION),
        );
        headers.insert(
            HeaderName::from_static("x-vscode-user-agent-library-version"),
            HeaderValue::from_static(USER_AGENT_LIBRARY),
        );
        Ok(headers)
    }
}

/// Look up the current stable editor version, falling back to a pinned value.
pub async fn fetch_vscode_version(client: &reqwest::Client, url: &str) -> String {
    let result = client
        .get(url)
        .timeout(Duration::from_secs(5))
        .send()
        .await
        .and_then(|r| r.error_for_status());

    let response = match result {
        Ok(r) => r,
        Err(e) => {
            warn!(error = %e, fallback = FALLBACK_VSCODE_VERSION, "editor version lookup failed");
            return FALLBACK_VSCODE_VERSION.to_string();
        }
    };

    match response.json::<Vec<String>>().await {
        Ok(versions) => match versions.into_iter().next() {
            Some(v) if !v.trim().is_empty() => {
                debug!(version = %v, "resolved editor version");
                v
            }
            _ => FALLBACK_VSCODE_VERSION.to_string(),
        },
        Err(e) => {
            warn!(error = %e, fallback = FALLBACK_VSCODE_VERSION, "editor version response unparseable");
            FALLBACK_VSCODE_VERSION.to_string()
        }
    }
}
