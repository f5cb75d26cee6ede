//! Configuration loading and validation.
//!
//! Loads settings from `./redreach.toml` (or `$REDREACH_CONFIG_PATH`).
//! Precedence: env vars > config file > defaults. App-level Reddit API
//! secrets are *not* configured here; see [`crate::credentials`].

use std::path::PathBuf;

use anyhow::Context;
use serde::Deserialize;

/// Top-level configuration for the outreach core.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Filesystem paths for persistent state.
    pub paths: PathsConfig,
    /// Per-subject quota windows.
    pub quota: QuotaConfig,
    /// Reddit endpoints, timeouts, and pacing.
    pub reddit: RedditConfig,
    /// Retry backoff shape and attempt cap.
    pub backoff: BackoffConfig,
    /// Contact discovery cache and search bounds.
    pub discovery: DiscoveryConfig,
}

impl Config {
    /// Load configuration with precedence: env vars > TOML file > defaults.
    ///
    /// Config file path: `$REDREACH_CONFIG_PATH` or `./redreach.toml`. A
    /// missing file is not an error; defaults apply.
    ///
    /// # Errors
    ///
    /// Returns an error if the file exists but cannot be read or parsed, or
    /// if the resulting configuration fails validation.
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML string into config (for testing).
    ///
    /// # Errors
    ///
    /// Returns an error when the TOML is malformed.
    pub fn from_toml(toml_str: &str) -> anyhow::Result<Self> {
        let config: Config = toml::from_str(toml_str).context("failed to parse config TOML")?;
        Ok(config)
    }

    fn load_from_file() -> anyhow::Result<Self> {
        let path = Self::config_path_with(|key| std::env::var(key).ok());
        match std::fs::read_to_string(&path) {
            Ok(contents) => {
                tracing::info!(path = %path.display(), "loading config from file");
                let config: Config =
                    toml::from_str(&contents).context("failed to parse config TOML")?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no config file found, using defaults");
                Ok(Config::default())
            }
            Err(e) => Err(anyhow::anyhow!("failed to read config file: {e}")),
        }
    }

    /// Resolve config path using a custom env resolver (for testing).
    fn config_path_with(env: impl Fn(&str) -> Option<String>) -> PathBuf {
        env("REDREACH_CONFIG_PATH").map_or_else(|| PathBuf::from("redreach.toml"), PathBuf::from)
    }

    /// Apply environment variable overrides (env > config > defaults).
    ///
    /// Takes a resolver function for testability (avoids mutating process
    /// env in tests).
    fn apply_overrides(&mut self, env: impl Fn(&str) -> Option<String>) {
        if let Some(v) = env("REDREACH_DB_PATH") {
            self.paths.db = v;
        }
        if let Some(v) = env("REDREACH_LOGS_DIR") {
            self.paths.logs_dir = v;
        }
        override_parsed(&env, "REDREACH_MESSAGE_LIMIT", &mut self.quota.message_limit);
        override_parsed(&env, "REDREACH_API_CALL_LIMIT", &mut self.quota.api_call_limit);
        if let Some(v) = env("REDREACH_USER_AGENT") {
            self.reddit.user_agent = v;
        }
        if let Some(v) = env("REDREACH_API_BASE_URL") {
            self.reddit.api_base_url = v;
        }
        if let Some(v) = env("REDREACH_TOKEN_URL") {
            self.reddit.token_url = v;
        }
        override_parsed(&env, "REDREACH_SWEEP_DELAY_MS", &mut self.reddit.sweep_delay_ms);
        override_parsed(&env, "REDREACH_MAX_ATTEMPTS", &mut self.backoff.max_attempts);
        override_parsed(&env, "REDREACH_DISCOVERY_TTL_HOURS", &mut self.discovery.ttl_hours);
    }

    /// Reject configurations that would disable the safety rails.
    fn validate(&self) -> anyhow::Result<()> {
        if self.quota.message_limit == 0 {
            anyhow::bail!("quota.message_limit must be at least 1");
        }
        if self.quota.message_window_secs <= 0 || self.quota.api_call_window_secs <= 0 {
            anyhow::bail!("quota windows must be positive");
        }
        if self.backoff.max_attempts == 0 {
            anyhow::bail!("backoff.max_attempts must be at least 1");
        }
        if self.reddit.user_agent.trim().is_empty() {
            anyhow::bail!("reddit.user_agent must not be empty (Reddit rejects blank agents)");
        }
        if self.discovery.default_page_size == 0
            || self.discovery.default_page_size > self.discovery.max_page_size
        {
            anyhow::bail!("discovery page sizes must satisfy 0 < default <= max");
        }
        Ok(())
    }
}

/// Parse an env override into a numeric field, warning on garbage.
fn override_parsed<T: std::str::FromStr>(
    env: impl Fn(&str) -> Option<String>,
    key: &'static str,
    slot: &mut T,
) {
    if let Some(v) = env(key) {
        match v.parse() {
            Ok(n) => *slot = n,
            Err(_) => tracing::warn!(var = key, value = %v, "ignoring invalid env override"),
        }
    }
}

// ── Paths ───────────────────────────────────────────────────────

/// Filesystem paths for persistent state.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    /// SQLite database path (messages, quota counters, credentials, runs).
    pub db: String,
    /// Directory for rotated JSON log files.
    pub logs_dir: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            db: "redreach.db".to_owned(),
            logs_dir: "logs".to_owned(),
        }
    }
}

// ── Quota ───────────────────────────────────────────────────────

/// Per-subject quota limits and window lengths.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct QuotaConfig {
    /// Outbound direct messages allowed per subject per window.
    pub message_limit: u32,
    /// Length of the message window in seconds.
    pub message_window_secs: i64,
    /// Platform API calls allowed per subject per window.
    pub api_call_limit: u32,
    /// Length of the API-call window in seconds.
    pub api_call_window_secs: i64,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            message_limit: 15,
            message_window_secs: 86_400,
            api_call_limit: 90,
            api_call_window_secs: 60,
        }
    }
}

// ── Reddit ──────────────────────────────────────────────────────

/// Reddit endpoints, HTTP timeouts, and sweep pacing.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedditConfig {
    /// User agent sent on every request. Reddit requires a descriptive one.
    pub user_agent: String,
    /// OAuth token endpoint.
    pub token_url: String,
    /// Authenticated API base URL.
    pub api_base_url: String,
    /// HTTP connect timeout in seconds.
    pub connect_timeout_secs: u64,
    /// HTTP request timeout in seconds.
    pub request_timeout_secs: u64,
    /// Delay between subreddits during a multi-subreddit sweep, in ms.
    pub sweep_delay_ms: u64,
    /// Refresh tokens this many seconds before their recorded expiry.
    pub refresh_margin_secs: i64,
}

impl Default for RedditConfig {
    fn default() -> Self {
        Self {
            user_agent: format!(
                "web:redreach:v{} (outreach integration)",
                env!("CARGO_PKG_VERSION")
            ),
            token_url: "https://www.reddit.com/api/v1/access_token".to_owned(),
            api_base_url: "https://oauth.reddit.com".to_owned(),
            connect_timeout_secs: 5,
            request_timeout_secs: 30,
            sweep_delay_ms: 1_500,
            refresh_margin_secs: 300,
        }
    }
}

// ── Backoff ─────────────────────────────────────────────────────

/// Retry backoff shape shared by all upstream calls.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// First retry delay in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound on a single delay in milliseconds.
    pub cap_delay_ms: u64,
    /// Total attempts before a retryable error becomes terminal.
    pub max_attempts: u32,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: 500,
            cap_delay_ms: 30_000,
            max_attempts: 4,
        }
    }
}

// ── Discovery ───────────────────────────────────────────────────

/// Contact discovery cache freshness and search bounds.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DiscoveryConfig {
    /// How long a discovery run stays fresh, in hours.
    pub ttl_hours: i64,
    /// Page size used when the caller does not specify one.
    pub default_page_size: u32,
    /// Hard ceiling on requested page size.
    pub max_page_size: u32,
    /// Posts fetched per subreddit per run.
    pub posts_per_subreddit: u32,
    /// Reddit search time filter (`hour`, `day`, `week`, `month`).
    pub time_window: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            ttl_hours: 48,
            default_page_size: 10,
            max_page_size: 50,
            posts_per_subreddit: 100,
            time_window: "week".to_owned(),
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────
