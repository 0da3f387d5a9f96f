//! GitHub and Copilot endpoint constants
//!
//! The client ID identifies the public GitHub app Copilot editors log in
//! through; it is not a secret. The version strings are what the backend
//! expects from a current Copilot Chat client.

use serde::{Deserialize, Serialize};

/// GitHub OAuth app used for device-flow login
pub const GITHUB_CLIENT_ID: &str = "Iv1.b507a08c87ecfe98";

/// Scopes requested during device-flow login
pub const GITHUB_APP_SCOPES: &str = "read:user";

pub const GITHUB_WEB_URL: &str = "https://github.com";
pub const GITHUB_API_URL: &str = "https://api.github.com";

pub const DEVICE_CODE_PATH: &str = "/login/device/code";
pub const ACCESS_TOKEN_PATH: &str = "/login/oauth/access_token";
pub const COPILOT_TOKEN_PATH: &str = "/copilot_internal/v2/token";
pub const COPILOT_USAGE_PATH: &str = "/copilot_internal/user";
pub const USER_PATH: &str = "/user";

pub const EDITOR_PLUGIN_VERSION: &str = "copilot-chat/0.26.7";
pub const USER_AGENT: &str = "GitHubCopilotChat/0.26.7";
pub const GITHUB_API_VERSION: &str = "2025-04-01";

/// Editor version sent when the release lookup fails
pub const FALLBACK_VSCODE_VERSION: &str = "1.104.3";

/// Release feed listing stable editor versions, newest first
pub const VSCODE_RELEASES_URL: &str = "https://update.code.visualstudio.com/api/releases/stable";

/// Which Copilot plan the accounts belong to; selects the backend host.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccountType {
    #[default]
    Individual,
    Business,
    Enterprise,
}

impl AccountType {
    pub fn copilot_base_url(&self) -> &'static str {
        match self {
            AccountType::Individual => "https://api.githubcopilot.com",
            AccountType::Business => "https://api.business.githubcopilot.com",
            AccountType::Enterprise => "https://api.enterprise.githubcopilot.com",
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AccountType::Individual => "individual",
            AccountType::Business => "business",
            AccountType::Enterprise => "enterprise",
        }
    }
}

/// Base URLs for the GitHub hosts. Overridable so tests can point at local servers.
#[derive(Debug, Clone)]
pub struct Endpoints {
    pub github_web: String,
    pub github_api: String,
}

impl Default for Endpoints {
    fn default() -> Self {
        Self {
            github_web: GITHUB_WEB_URL.to_string(),
            github_api: GITHUB_API_URL.to_string(),
        }
    }
}

impl Endpoints {
    pub fn device_code_url(&self) -> String {
        join(&self.github_web, DEVICE_CODE_PATH)
    }

    pub fn access_token_url(&self) -> String {
        join(&self.github_web, ACCESS_TOKEN_PATH)
    }

    pub fn copilot_token_url(&self) -> String {
        join(&self.github_api, COPILOT_TOKEN_PATH)
    }

    pub fn usage_url(&self) -> String {
        join(&self.github_api, COPILOT_USAGE_PATH)
    }

    pub fn user_url(&self) -> String {
        join(&self.github_api, USER_PATH)
    }
}

fn join(base: &str, path: &str) -> String {
    format!("{}{}", base.trim_end_matches('/'), path)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn account_type_selects_host() {
        assert_eq!(
            AccountType::Individual.copilot_base_url(),
            "https://api.githubcopilot.com"
        );
        assert_eq!(
            AccountType::Business.copilot_base_url(),
            "https://api.business.githubcopilot.com"
        );
        assert_eq!(
            AccountType::Enterprise.copilot_base_url(),
            "https://api.enterprise.githubcopilot.com"
        );
    }

    #[test]
    fn account_type_deserializes_lowercase() {
        #[derive(Deserialize)]
        struct Wrapper {
            account_type: AccountType,
        }
        let w: Wrapper = toml::from_str("account_type = \"business\"").unwrap();
        assert_eq!(w.account_type, AccountType::Business);
    }

    #[test]
    fn endpoint_urls_tolerate_trailing_slash() {
        let endpoints = Endpoints {
            github_web: "http://127.0.0.1:9/".into(),
            github_api: "http://127.0.0.1:10".into(),
        };
        assert_eq!(
            endpoints.device_code_url(),
            "http://127.0.0.1:9/login/device/code"
        );
        assert_eq!(
            endpoints.copilot_token_url(),
            "http://127.0.0.1:10/copilot_internal/v2/token"
        );
    }
}
