//! Configuration for trackers and the backend client.
//!
//! Loaded from YAML, then overridden by `FLOWTRACK_*` environment variables.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use reqwest::{header, Client, ClientBuilder};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TrackerError};

pub const ENV_BASE_URL: &str = "FLOWTRACK_BASE_URL";
pub const ENV_API_TOKEN: &str = "FLOWTRACK_API_TOKEN";
pub const ENV_COMPLETION_DELAY_MS: &str = "FLOWTRACK_COMPLETION_DELAY_MS";
pub const ENV_TIMEOUT_MS: &str = "FLOWTRACK_TIMEOUT_MS";

const DEFAULT_BASE_URL: &str = "http://127.0.0.1:8000/api";
const DEFAULT_CANCEL_PATH: &str = "workflows/{workflow_id}/cancel";
const DEFAULT_COMPLETION_DELAY_MS: u64 = 1000;
const DEFAULT_REQUEST_TIMEOUT_SECS: u64 = 20;

/// Placeholder substituted with the workflow id in [`BackendConfig::cancel_path`].
pub const WORKFLOW_ID_PLACEHOLDER: &str = "{workflow_id}";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FlowtrackConfig {
    pub tracker: TrackerConfig,
    pub backend: BackendConfig,
}

/// Per-tracker timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrackerConfig {
    /// Delay between entering `Success` and firing `on_completed` (default: 1000)
    pub completion_delay_ms: u64,
    /// Force `Failed` if still loading after this long. Disabled when `None`.
    pub timeout_ms: Option<u64>,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            completion_delay_ms: DEFAULT_COMPLETION_DELAY_MS,
            timeout_ms: None,
        }
    }
}

impl TrackerConfig {
    pub fn with_completion_delay(mut self, delay: Duration) -> Self {
        self.completion_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = Some(timeout.as_millis() as u64);
        self
    }

    pub fn completion_delay(&self) -> Duration {
        Duration::from_millis(self.completion_delay_ms)
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_ms.map(Duration::from_millis)
    }
}

/// Where and how to reach the workflow backend.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendConfig {
    /// Base URL of the REST API
    pub base_url: String,
    /// Path below `base_url` for cancellation; must contain `{workflow_id}`
    pub cancel_path: String,
    /// Bearer token sent with backend requests
    pub api_token: Option<String>,
    /// File holding a persisted token, read when `api_token` is unset
    pub token_file: Option<PathBuf>,
    /// Per-request timeout in seconds (default: 20)
    pub request_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            cancel_path: DEFAULT_CANCEL_PATH.to_string(),
            api_token: None,
            token_file: None,
            request_timeout_secs: DEFAULT_REQUEST_TIMEOUT_SECS,
        }
    }
}

impl BackendConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Token to authenticate with: `api_token` first, then the contents of
    /// `token_file`. Blank values count as absent.
    pub fn bearer_token(&self) -> Result<Option<String>> {
        if let Some(token) = non_blank(self.api_token.as_deref()) {
            return Ok(Some(token));
        }
        match &self.token_file {
            Some(path) => Ok(non_blank(Some(fs::read_to_string(path)?.as_str()))),
            None => Ok(None),
        }
    }

    /// Client for request/response calls: authenticated, bounded by
    /// `request_timeout_secs`.
    pub fn http_client(&self) -> Result<Client> {
        Ok(self.client_builder()?.timeout(self.request_timeout()).build()?)
    }

    /// Client for long-lived streams: authenticated, only the connect phase
    /// is bounded.
    pub fn stream_client(&self) -> Result<Client> {
        Ok(self
            .client_builder()?
            .connect_timeout(self.request_timeout())
            .build()?)
    }

    fn client_builder(&self) -> Result<ClientBuilder> {
        let mut headers = header::HeaderMap::new();
        if let Some(token) = self.bearer_token()? {
            let value = header::HeaderValue::from_str(&format!("Bearer {token}"))
                .map_err(|error| TrackerError::Config(format!("API token is invalid: {error}")))?;
            headers.insert(header::AUTHORIZATION, value);
        }
        Ok(Client::builder().default_headers(headers))
    }
}

impl FlowtrackConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Self::from_yaml_str(&content)
    }

    pub fn from_yaml_str(content: &str) -> Result<Self> {
        if content.trim().is_empty() {
            return Ok(Self::default());
        }
        let config: Self = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Apply `FLOWTRACK_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from `lookup`, which maps variable names to values.
    pub fn apply_overrides<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = non_blank(lookup(ENV_BASE_URL).as_deref()) {
            self.backend.base_url = url;
        }
        if let Some(token) = non_blank(lookup(ENV_API_TOKEN).as_deref()) {
            self.backend.api_token = Some(token);
        }
        if let Some(raw) = non_blank(lookup(ENV_COMPLETION_DELAY_MS).as_deref()) {
            self.tracker.completion_delay_ms = parse_millis(ENV_COMPLETION_DELAY_MS, &raw)?;
        }
        if let Some(raw) = non_blank(lookup(ENV_TIMEOUT_MS).as_deref()) {
            let millis = parse_millis(ENV_TIMEOUT_MS, &raw)?;
            self.tracker.timeout_ms = (millis > 0).then_some(millis);
        }
        self.validate()?;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        if !self.backend.cancel_path.contains(WORKFLOW_ID_PLACEHOLDER) {
            return Err(TrackerError::Config(format!(
                "backend.cancel_path must contain {WORKFLOW_ID_PLACEHOLDER}, got '{}'",
                self.backend.cancel_path
            )));
        }
        if self.backend.base_url.trim().is_empty() {
            return Err(TrackerError::Config("backend.base_url is empty".to_string()));
        }
        Ok(())
    }
}

fn non_blank(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

fn parse_millis(key: &str, raw: &str) -> Result<u64> {
    raw.parse::<u64>().map_err(|_| {
        TrackerError::Config(format!("{key} must be a non-negative integer, got '{raw}'"))
    })
}
