//! Configuration types and loading
//!
//! Config precedence: CLI args > env vars > config file > defaults.
//! Credentials never come from the TOML: `GH_TOKEN` supplies a single
//! GitHub token and `COPILOT_ACCOUNTS` an inline `label:token` list.

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use common::Secret;
use github_auth::{AccountType, Endpoints};
use serde::Deserialize;

/// Root configuration
#[derive(Debug, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    #[serde(default)]
    pub copilot: CopilotConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub accounts: AccountsConfig,
}

/// HTTP listener settings
#[derive(Debug, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: SocketAddr,
    /// Admin API listener; the admin routes are not served when absent
    #[serde(default)]
    pub admin_addr: Option<SocketAddr>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
}

/// Backend selection and request flags
#[derive(Debug, Deserialize)]
pub struct CopilotConfig {
    #[serde(default)]
    pub account_type: AccountType,
    /// Allow the vision capability header on requests carrying images
    #[serde(default = "default_true")]
    pub vision: bool,
    /// Hold every chat request until an operator accepts it on stdin
    #[serde(default)]
    pub manual_approval: bool,
    /// Overrides the account-type backend URL
    #[serde(default)]
    pub base_url: Option<String>,
    #[serde(default)]
    pub github_web_url: Option<String>,
    #[serde(default)]
    pub github_api_url: Option<String>,
    /// Skip the editor version lookup and send this version
    #[serde(default)]
    pub vscode_version: Option<String>,
}

impl Default for CopilotConfig {
    fn default() -> Self {
        Self {
            account_type: AccountType::default(),
            vision: true,
            manual_approval: false,
            base_url: None,
            github_web_url: None,
            github_api_url: None,
            vscode_version: None,
        }
    }
}

impl CopilotConfig {
    pub fn backend_url(&self) -> String {
        self.base_url
            .clone()
            .unwrap_or_else(|| self.account_type.copilot_base_url().to_string())
    }

    pub fn endpoints(&self) -> Endpoints {
        let defaults = Endpoints::default();
        Endpoints {
            github_web: self.github_web_url.clone().unwrap_or(defaults.github_web),
            github_api: self.github_api_url.clone().unwrap_or(defaults.github_api),
        }
    }
}

/// Process-wide minimum spacing between backend calls
#[derive(Debug, Default, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default)]
    pub interval_secs: Option<u64>,
    /// Wait out the remaining interval instead of rejecting with 429
    #[serde(default)]
    pub wait: bool,
}

impl RateLimitConfig {
    pub fn interval(&self) -> Option<Duration> {
        self.interval_secs.map(Duration::from_secs)
    }
}

/// Credential sources
#[derive(Debug, Deserialize)]
pub struct AccountsConfig {
    /// Inline `label:token` list, from `COPILOT_ACCOUNTS` only
    #[serde(skip)]
    pub inline: Option<Secret<String>>,
    /// Newline-delimited `label:token` file
    #[serde(default)]
    pub file: Option<PathBuf>,
    /// Single token, from `GH_TOKEN` only
    #[serde(skip)]
    pub github_token: Option<Secret<String>>,
    /// Where the device-flow token is cached
    #[serde(default = "default_token_file")]
    pub token_file: PathBuf,
    /// Run device-flow login when no other source yields a credential
    #[serde(default = "default_true")]
    pub device_login: bool,
    /// Expected pool size; a mismatch is logged at startup
    #[serde(default)]
    pub pool_size_hint: Option<usize>,
}

impl Default for AccountsConfig {
    fn default() -> Self {
        Self {
            inline: None,
            file: None,
            github_token: None,
            token_file: default_token_file(),
            device_login: true,
            pool_size_hint: None,
        }
    }
}

fn default_timeout() -> u64 {
    300
}

fn default_max_connections() -> usize {
    1000
}

fn default_true() -> bool {
    true
}

fn default_token_file() -> PathBuf {
    PathBuf::from(".copilot-gateway/github_token")
}

impl Config {
    /// Load configuration from a TOML file, then overlay environment variables.
    pub fn load(path: &Path) -> common::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    pub fn from_toml(contents: &str) -> common::Result<Self> {
        let mut config: Config = toml::from_str(contents)?;
        config.validate()?;
        config.apply_env();
        Ok(config)
    }

    fn validate(&self) -> common::Result<()> {
        if self.server.timeout_secs == 0 {
            return Err(common::Error::Invalid {
                field: "server.timeout_secs",
                reason: "must be greater than 0".into(),
            });
        }
        if self.server.max_connections == 0 {
            return Err(common::Error::Invalid {
                field: "server.max_connections",
                reason: "must be greater than 0".into(),
            });
        }
        if self.rate_limit.interval_secs == Some(0) {
            return Err(common::Error::Invalid {
                field: "rate_limit.interval_secs",
                reason: "must be greater than 0 when set".into(),
            });
        }
        if let Some(url) = &self.copilot.base_url
            && !url.starts_with("http://")
            && !url.starts_with("https://")
        {
            return Err(common::Error::Config(format!(
                "copilot.base_url must start with http:// or https://, got: {url}"
            )));
        }
        Ok(())
    }

    fn apply_env(&mut self) {
        if let Some(list) = non_empty_env("COPILOT_ACCOUNTS") {
            self.accounts.inline = Some(Secret::new(list));
        }
        if let Some(path) = non_empty_env("COPILOT_ACCOUNTS_FILE") {
            self.accounts.file = Some(PathBuf::from(path));
        }
        if let Some(token) = non_empty_env("GH_TOKEN") {
            self.accounts.github_token = Some(Secret::new(token));
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.timeout_secs)
    }

    /// Resolve config file path from CLI arg or CONFIG_PATH env var.
    pub fn resolve_path(cli_path: Option<&str>) -> PathBuf {
        if let Some(p) = cli_path {
            return PathBuf::from(p);
        }
        if let Ok(p) = std::env::var("CONFIG_PATH") {
            return PathBuf::from(p);
        }
        PathBuf::from("copilot-gateway.toml")
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}
