//! Configuration file parser for `~/.config/feedrelay/config.toml`.
//!
//! The config file is optional: a missing or empty file yields
//! `Config::default()`. Unknown keys are accepted but logged as warnings,
//! since they are usually typos. Secrets may also come from the environment,
//! which wins over the file.
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Environment variable overriding `telegram.bot_token`
pub const ENV_TELEGRAM_TOKEN: &str = "FEEDRELAY_TELEGRAM_TOKEN";
/// Environment variable overriding `discord.bot_token`
pub const ENV_DISCORD_TOKEN: &str = "FEEDRELAY_DISCORD_TOKEN";
/// Environment variable overriding `translation.api_key`
pub const ENV_TRANSLATION_API_KEY: &str = "FEEDRELAY_TRANSLATION_API_KEY";

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid TOML in config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Config file too large: {0}")]
    TooLarge(String),

    #[error("Invalid config value for {key}: {reason}")]
    Invalid { key: &'static str, reason: String },
}

// ============================================================================
// Configuration Structs
// ============================================================================

/// Top-level relay configuration.
///
/// Every section uses `#[serde(default)]`, so any subset of keys can be given.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// SQLite database file. `None` means `<config dir>/feedrelay.db`.
    pub database_path: Option<PathBuf>,
    pub scheduler: SchedulerConfig,
    pub fetcher: FetcherConfig,
    pub translation: TranslationConfig,
    pub dispatch: DispatchConfig,
    pub telegram: TelegramConfig,
    pub discord: DiscordConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Seconds between polling ticks.
    pub interval_secs: u64,
    /// Maximum feed cycles running at once.
    pub concurrency_limit: usize,
    /// Upper bound on per-feed start jitter within a tick.
    pub max_jitter_secs: u64,
    /// How long in-flight cycles may run after shutdown is requested.
    pub shutdown_grace_secs: u64,
    /// Hours between retention sweeps.
    pub cleanup_interval_hours: u64,
    /// Entries and cached translations older than this are pruned.
    pub entry_retention_days: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval_secs: 3600,
            concurrency_limit: 10,
            max_jitter_secs: 30,
            shutdown_grace_secs: 30,
            cleanup_interval_hours: 24,
            entry_retention_days: 7,
        }
    }
}

impl SchedulerConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn max_jitter(&self) -> Duration {
        Duration::from_secs(self.max_jitter_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_hours.saturating_mul(3600))
    }

    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.entry_retention_days.saturating_mul(86_400))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FetcherConfig {
    pub timeout_secs: u64,
    pub max_body_bytes: usize,
    /// Extra attempts within one fetch for 429, 5xx and truncated bodies.
    pub request_retries: u32,
    /// Base delay for failure backoff.
    pub backoff_base_secs: u64,
    /// Backoff stops doubling after this many failures.
    pub backoff_cap_exponent: u32,
    /// Backoff never exceeds this.
    pub backoff_max_secs: u64,
    /// Consecutive failures after which a feed is deactivated.
    pub max_failures: i64,
    pub user_agent: String,
    /// Permit feeds on localhost and private networks.
    pub allow_private_networks: bool,
}

impl FetcherConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

impl Default for FetcherConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 30,
            max_body_bytes: 10 * 1024 * 1024,
            request_retries: 2,
            backoff_base_secs: 60,
            backoff_cap_exponent: 6,
            backoff_max_secs: 6 * 3600,
            max_failures: 10,
            user_agent: concat!("feedrelay/", env!("CARGO_PKG_VERSION")).to_string(),
            allow_private_networks: false,
        }
    }
}

/// Which translation backend to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderKind {
    Deepl,
    Openai,
    Google,
}

/// SEC: `Debug` is implemented by hand so `api_key` never reaches logs.
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TranslationConfig {
    pub enabled: bool,
    pub provider: ProviderKind,
    pub api_key: Option<String>,
    /// Override the provider endpoint (OpenAI-compatible servers, DeepL Free, tests).
    pub api_url: Option<String>,
    /// Chat model for the `openai` provider.
    pub model: String,
    pub timeout_secs: u64,
    /// Entries held by the in-process tier.
    pub cache_capacity: usize,
    /// Maximum age of an in-process entry. 0 disables the age bound.
    pub cache_max_age_secs: u64,
}

impl Default for TranslationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            provider: ProviderKind::Deepl,
            api_key: None,
            api_url: None,
            model: "gpt-4o-mini".to_string(),
            timeout_secs: 30,
            cache_capacity: 10_000,
            cache_max_age_secs: 7 * 86_400,
        }
    }
}

impl std::fmt::Debug for TranslationConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TranslationConfig")
            .field("enabled", &self.enabled)
            .field("provider", &self.provider)
            .field("api_key", &self.api_key.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("model", &self.model)
            .field("timeout_secs", &self.timeout_secs)
            .field("cache_capacity", &self.cache_capacity)
            .field("cache_max_age_secs", &self.cache_max_age_secs)
            .finish()
    }
}

impl TranslationConfig {
    pub fn cache_max_age(&self) -> Option<Duration> {
        (self.cache_max_age_secs > 0).then(|| Duration::from_secs(self.cache_max_age_secs))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DispatchConfig {
    /// Subscriptions served concurrently within one feed cycle.
    pub max_concurrent_sends: usize,
    /// Total send attempts per entry and subscription (first try included).
    pub max_attempts: u32,
    pub retry_base_ms: u64,
    pub retry_max_secs: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_sends: 8,
            max_attempts: 4,
            retry_base_ms: 1_000,
            retry_max_secs: 60,
        }
    }
}

/// Token-bucket profile for one destination platform
#[derive(Debug, Clone, Copy, PartialEq, Deserialize)]
#[serde(default)]
pub struct RateProfile {
    /// Sustained sends per second.
    pub per_second: f64,
    /// Sends allowed back-to-back before the rate applies.
    pub burst: u32,
}

impl Default for RateProfile {
    fn default() -> Self {
        Self {
            per_second: 1.0,
            burst: 1,
        }
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
    pub api_url: String,
    pub rate: RateProfile,
}

impl Default for TelegramConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_url: "https://api.telegram.org".to_string(),
            rate: RateProfile {
                per_second: 25.0,
                burst: 30,
            },
        }
    }
}

impl std::fmt::Debug for TelegramConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TelegramConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("rate", &self.rate)
            .finish()
    }
}

#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct DiscordConfig {
    pub bot_token: Option<String>,
    pub api_url: String,
    pub rate: RateProfile,
}

impl Default for DiscordConfig {
    fn default() -> Self {
        Self {
            bot_token: None,
            api_url: "https://discord.com/api/v10".to_string(),
            rate: RateProfile {
                per_second: 5.0,
                burst: 5,
            },
        }
    }
}

impl std::fmt::Debug for DiscordConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DiscordConfig")
            .field("bot_token", &self.bot_token.as_ref().map(|_| "[REDACTED]"))
            .field("api_url", &self.api_url)
            .field("rate", &self.rate)
            .finish()
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub rate: RateProfile,
    /// Permit webhook targets on localhost and private networks.
    pub allow_private_networks: bool,
}

impl Default for WebhookConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            rate: RateProfile {
                per_second: 10.0,
                burst: 10,
            },
            allow_private_networks: false,
        }
    }
}

impl Config {
    /// Maximum config file size (1 MB).
    const MAX_FILE_SIZE: u64 = 1_048_576;

    /// Load configuration from a TOML file, then apply environment overrides.
    ///
    /// - Missing file → defaults
    /// - Empty file → defaults
    /// - Invalid TOML → `Err(ConfigError::Parse)` with line number info
    /// - Unknown keys → accepted, logged as warnings
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::load_file(path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    fn load_file(path: &Path) -> Result<Self, ConfigError> {
        // Check the size before reading so a huge file cannot exhaust memory.
        match std::fs::metadata(path) {
            Ok(meta) if meta.len() > Self::MAX_FILE_SIZE => {
                return Err(ConfigError::TooLarge(format!(
                    "Config file is {} bytes (max {} bytes)",
                    meta.len(),
                    Self::MAX_FILE_SIZE
                )));
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "No config file found, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
            Ok(_) => {}
        }

        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(path = %path.display(), "Config file disappeared, using defaults");
                return Ok(Self::default());
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };

        Self::parse(&content, path)
    }

    fn parse(content: &str, path: &Path) -> Result<Self, ConfigError> {
        if content.trim().is_empty() {
            tracing::debug!(path = %path.display(), "Config file is empty, using defaults");
            return Ok(Self::default());
        }

        if let Ok(raw) = content.parse::<toml::Table>() {
            for key in unknown_keys(&raw) {
                tracing::warn!(key = %key, "Unknown key in config file, ignoring");
            }
        }

        let config: Config = toml::from_str(content)?;
        tracing::info!(
            path = %path.display(),
            interval_secs = config.scheduler.interval_secs,
            translation = config.translation.enabled,
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Replace secrets with values from the environment when present.
    ///
    /// `lookup` is `std::env::var` in production; tests pass a map.
    pub fn apply_env_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        if let Some(token) = non_empty(ENV_TELEGRAM_TOKEN) {
            self.telegram.bot_token = Some(token);
        }
        if let Some(token) = non_empty(ENV_DISCORD_TOKEN) {
            self.discord.bot_token = Some(token);
        }
        if let Some(key) = non_empty(ENV_TRANSLATION_API_KEY) {
            self.translation.api_key = Some(key);
        }
    }

    /// Reject values that would make the relay spin or never deliver.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.scheduler.interval_secs == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.interval_secs",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.concurrency_limit == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.concurrency_limit",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.scheduler.entry_retention_days == 0 {
            return Err(ConfigError::Invalid {
                key: "scheduler.entry_retention_days",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.max_attempts == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.max_attempts",
                reason: "must be at least 1".to_string(),
            });
        }
        if self.dispatch.max_concurrent_sends == 0 {
            return Err(ConfigError::Invalid {
                key: "dispatch.max_concurrent_sends",
                reason: "must be at least 1".to_string(),
            });
        }
        for (key, rate) in [
            ("telegram.rate", &self.telegram.rate),
            ("discord.rate", &self.discord.rate),
            ("webhook.rate", &self.webhook.rate),
        ] {
            if !(rate.per_second > 0.0 && rate.per_second.is_finite()) || rate.burst == 0 {
                return Err(ConfigError::Invalid {
                    key,
                    reason: "per_second must be positive and burst at least 1".to_string(),
                });
            }
        }
        if self.translation.enabled && self.translation.api_key.is_none() {
            return Err(ConfigError::Invalid {
                key: "translation.api_key",
                reason: format!("required when translation is enabled (or set {ENV_TRANSLATION_API_KEY})"),
            });
        }
        Ok(())
    }
}

/// Dotted paths of keys that no config struct knows about.
fn unknown_keys(raw: &toml::Table) -> Vec<String> {
    const TOP: &[&str] = &[
        "database_path",
        "scheduler",
        "fetcher",
        "translation",
        "dispatch",
        "telegram",
        "discord",
        "webhook",
    ];
    const SECTIONS: &[(&str, &[&str])] = &[
        (
            "scheduler",
            &[
                "interval_secs",
                "concurrency_limit",
                "max_jitter_secs",
                "shutdown_grace_secs",
                "cleanup_interval_hours",
                "entry_retention_days",
            ],
        ),
        (
            "fetcher",
            &[
                "timeout_secs",
                "max_body_bytes",
                "request_retries",
                "backoff_base_secs",
                "backoff_cap_exponent",
                "backoff_max_secs",
                "max_failures",
                "user_agent",
                "allow_private_networks",
            ],
        ),
        (
            "translation",
            &[
                "enabled",
                "provider",
                "api_key",
                "api_url",
                "model",
                "timeout_secs",
                "cache_capacity",
                "cache_max_age_secs",
            ],
        ),
        (
            "dispatch",
            &[
                "max_concurrent_sends",
                "max_attempts",
                "retry_base_ms",
                "retry_max_secs",
            ],
        ),
        ("telegram", &["bot_token", "api_url", "rate"]),
        ("discord", &["bot_token", "api_url", "rate"]),
        ("webhook", &["enabled", "rate", "allow_private_networks"]),
    ];

    let mut unknown = Vec::new();
    for (key, value) in raw {
        if !TOP.contains(&key.as_str()) {
            unknown.push(key.clone());
            continue;
        }
        let Some(table) = value.as_table() else {
            continue;
        };
        if let Some((_, known)) = SECTIONS.iter().find(|(name, _)| name == key) {
            for sub in table.keys() {
                if !known.contains(&sub.as_str()) {
                    unknown.push(format!("{key}.{sub}"));
                }
            }
        }
    }
    unknown
}

// ============================================================================
// Tests
// ============================================================================
