use std::path::PathBuf;
use std::time::Duration;

/// Environment variable holding the GitHub token.
pub const GITHUB_TOKEN_ENV_VAR: &str = "GITHUB_TOKEN";
/// Environment variable overriding the API base URL (GitHub Enterprise).
pub const GITHUB_API_URL_ENV_VAR: &str = "GITHUB_API_URL";

pub const DEFAULT_API_URL: &str = "https://api.github.com";
pub const DEFAULT_DATA_DIR: &str = "data";
/// Name suffix shared by the monitoring artifact and the file inside it.
pub const MONITOR_FILE_NAME: &str = "octometrics.monitor.json";

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub token: Option<String>,
    pub base_url: String,
    /// Bound on every single API call.
    pub timeout: Duration,
    /// Bound on downloading an artifact payload.
    pub download_timeout: Duration,
    pub per_page: u8,
    /// Block until the quota resets instead of failing on a rate-limit response.
    pub sleep_when_rate_limited: bool,
    pub max_rate_limit_retries: u32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            token: None,
            base_url: DEFAULT_API_URL.to_string(),
            timeout: Duration::from_secs(10),
            download_timeout: Duration::from_secs(60),
            per_page: 100,
            sleep_when_rate_limited: true,
            max_rate_limit_retries: 5,
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        let token = std::env::var(GITHUB_TOKEN_ENV_VAR)
            .ok()
            .filter(|token| !token.is_empty());
        if token.is_some() {
            log::debug!("Using GitHub token from {GITHUB_TOKEN_ENV_VAR}");
        } else {
            log::warn!("GitHub token not provided, will likely hit rate limits quickly");
        }
        let base_url = std::env::var(GITHUB_API_URL_ENV_VAR)
            .ok()
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());
        Self {
            token,
            base_url,
            ..Self::default()
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Controls how gathered data is cached.
#[derive(Debug, Clone)]
pub struct GatherOptions {
    /// Call the API even when the data is already in the data directory.
    pub force_update: bool,
    pub data_dir: PathBuf,
    pub monitor_file_name: String,
}

impl Default for GatherOptions {
    fn default() -> Self {
        Self {
            force_update: false,
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
            monitor_file_name: MONITOR_FILE_NAME.to_string(),
        }
    }
}

impl GatherOptions {
    pub fn force_update(mut self) -> Self {
        self.force_update = true;
        self
    }

    pub fn with_data_dir(mut self, data_dir: impl Into<PathBuf>) -> Self {
        self.data_dir = data_dir.into();
        self
    }
}
