use std::net::SocketAddr;
use std::path::PathBuf;

use serde::{Deserialize, Deserializer, Serialize};

use crate::utils::text::is_placeholder;

/// Main configuration structure loaded from counterpoint.toml and environment variables
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct Config {
    pub cache: CacheConfig,
    /// Lightweight content analyzer (Phase 1)
    #[serde(deserialize_with = "primary_provider")]
    pub primary: ProviderConfig,
    /// Heavier per-reader analyzer (Phase 2)
    #[serde(deserialize_with = "secondary_provider")]
    pub secondary: ProviderConfig,
    pub decision: DecisionConfig,
    pub quota: QuotaConfig,
    pub rate_limit: RateLimitConfig,
    pub storage: StorageConfig,
    pub server: ServerConfig,
}

/// Result cache sizing and lifetimes
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct CacheConfig {
    pub capacity: usize,
    pub phase1_ttl_ms: i64,
    pub phase2_ttl_ms: i64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 5000,
            phase1_ttl_ms: 24 * 60 * 60 * 1000,
            phase2_ttl_ms: 24 * 60 * 60 * 1000,
        }
    }
}

/// One OpenAI-compatible upstream provider
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ProviderConfig {
    pub name: String,
    pub base_url: String,
    pub model: String,
    #[serde(skip_serializing)]
    pub api_key: Option<String>,
    pub timeout_ms: u64,
    pub backoff_base_ms: u64,
    pub max_attempts: u32,
    pub max_input_chars: usize,
    pub requests_per_window: usize,
    pub window_ms: i64,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl ProviderConfig {
    pub fn primary() -> Self {
        Self {
            name: "primary".to_string(),
            base_url: "https://api.groq.com/openai/v1".to_string(),
            model: "llama-3.1-8b-instant".to_string(),
            api_key: None,
            timeout_ms: 8_000,
            backoff_base_ms: 200,
            max_attempts: 3,
            max_input_chars: 1_200,
            requests_per_window: 10,
            window_ms: 1_000,
            temperature: 0.0,
            max_tokens: 300,
        }
    }

    pub fn secondary() -> Self {
        Self {
            name: "secondary".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            model: "gpt-4o-mini".to_string(),
            api_key: None,
            timeout_ms: 25_000,
            backoff_base_ms: 250,
            max_attempts: 3,
            max_input_chars: 2_000,
            requests_per_window: 3,
            window_ms: 1_000,
            temperature: 0.2,
            max_tokens: 700,
        }
    }

    pub fn has_api_key(&self) -> bool {
        self.api_key.as_deref().is_some_and(|k| !is_placeholder(k))
    }
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self::primary()
    }
}

/// A provider section as written in the file; unset keys keep that provider's defaults
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ProviderPatch {
    name: Option<String>,
    base_url: Option<String>,
    model: Option<String>,
    api_key: Option<String>,
    timeout_ms: Option<u64>,
    backoff_base_ms: Option<u64>,
    max_attempts: Option<u32>,
    max_input_chars: Option<usize>,
    requests_per_window: Option<usize>,
    window_ms: Option<i64>,
    temperature: Option<f32>,
    max_tokens: Option<u32>,
}

impl ProviderPatch {
    fn apply(self, base: ProviderConfig) -> ProviderConfig {
        ProviderConfig {
            name: self.name.unwrap_or(base.name),
            base_url: self.base_url.unwrap_or(base.base_url),
            model: self.model.unwrap_or(base.model),
            api_key: self.api_key.or(base.api_key),
            timeout_ms: self.timeout_ms.unwrap_or(base.timeout_ms),
            backoff_base_ms: self.backoff_base_ms.unwrap_or(base.backoff_base_ms),
            max_attempts: self.max_attempts.unwrap_or(base.max_attempts),
            max_input_chars: self.max_input_chars.unwrap_or(base.max_input_chars),
            requests_per_window: self.requests_per_window.unwrap_or(base.requests_per_window),
            window_ms: self.window_ms.unwrap_or(base.window_ms),
            temperature: self.temperature.unwrap_or(base.temperature),
            max_tokens: self.max_tokens.unwrap_or(base.max_tokens),
        }
    }
}

fn primary_provider<'de, D: Deserializer<'de>>(d: D) -> Result<ProviderConfig, D::Error> {
    Ok(ProviderPatch::deserialize(d)?.apply(ProviderConfig::primary()))
}

fn secondary_provider<'de, D: Deserializer<'de>>(d: D) -> Result<ProviderConfig, D::Error> {
    Ok(ProviderPatch::deserialize(d)?.apply(ProviderConfig::secondary()))
}

/// Intervention banding and cooldown
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub echo_chamber_max_distance: f64,
    pub mild_bias_max_distance: f64,
    pub cooldown_ms: i64,
}

impl Default for DecisionConfig {
    fn default() -> Self {
        Self {
            echo_chamber_max_distance: 0.2,
            mild_bias_max_distance: 0.4,
            cooldown_ms: 30_000,
        }
    }
}

/// Business-level per-user allowances
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct QuotaConfig {
    pub daily_limit: u64,
    pub monthly_limit: u64,
    /// How long a locally cached counter is trusted before re-reading the store
    pub local_ttl_ms: i64,
    pub local_capacity: usize,
}

impl Default for QuotaConfig {
    fn default() -> Self {
        Self {
            daily_limit: 50,
            monthly_limit: 1_000,
            local_ttl_ms: 60_000,
            local_capacity: 10_000,
        }
    }
}

/// Request-level limiter applied to every inbound call
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub window_ms: i64,
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            window_ms: 60_000,
            max_requests: 60,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Keep every store in process memory instead of SQLite
    pub in_memory: bool,
    pub sqlite_path: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            in_memory: false,
            sqlite_path: None,
        }
    }
}

impl StorageConfig {
    /// Configured path, else the platform data dir, else ./counterpoint.db
    pub fn resolved_sqlite_path(&self) -> PathBuf {
        self.sqlite_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .map(|d| d.join("counterpoint").join("counterpoint.db"))
                .unwrap_or_else(|| PathBuf::from("counterpoint.db"))
        })
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    pub http_bind: SocketAddr,
    pub log_level: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_bind: SocketAddr::from(([127, 0, 0, 1], 8787)),
            log_level: "counterpoint=info".to_string(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            cache: CacheConfig::default(),
            primary: ProviderConfig::primary(),
            secondary: ProviderConfig::secondary(),
            decision: DecisionConfig::default(),
            quota: QuotaConfig::default(),
            rate_limit: RateLimitConfig::default(),
            storage: StorageConfig::default(),
            server: ServerConfig::default(),
        }
    }
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.trim().parse().ok())
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
}

impl Config {
    /// Load configuration from TOML file and environment variables.
    /// Uses COUNTERPOINT_CONFIG environment variable or defaults to "counterpoint.toml"
    pub fn load() -> anyhow::Result<Self> {
        // Environment files: CP_ENV_FILE if set, else ./.env
        if let Ok(env_path) = std::env::var("CP_ENV_FILE") {
            let _ = dotenvy::from_path(env_path);
        } else {
            let _ = dotenvy::from_path(".env");
        }

        let config_path = std::env::var("COUNTERPOINT_CONFIG")
            .unwrap_or_else(|_| "counterpoint.toml".to_string());

        let mut config: Config = if let Ok(content) = std::fs::read_to_string(&config_path) {
            Self::from_toml_str(&content)?
        } else {
            tracing::warn!("Config file {} not found, using defaults", config_path);
            Self::default()
        };

        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml_str(content: &str) -> anyhow::Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Environment wins over the file for secrets and deployment-specific values
    pub fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("CP_PRIMARY_API_KEY") {
            self.primary.api_key = Some(key);
            tracing::debug!("CP_PRIMARY_API_KEY env override applied");
        }
        if let Ok(key) = std::env::var("CP_SECONDARY_API_KEY") {
            self.secondary.api_key = Some(key);
            tracing::debug!("CP_SECONDARY_API_KEY env override applied");
        }
        if let Ok(url) = std::env::var("CP_PRIMARY_BASE_URL") {
            self.primary.base_url = url;
        }
        if let Ok(url) = std::env::var("CP_SECONDARY_BASE_URL") {
            self.secondary.base_url = url;
        }
        if let Ok(model) = std::env::var("CP_PRIMARY_MODEL") {
            self.primary.model = model;
        }
        if let Ok(model) = std::env::var("CP_SECONDARY_MODEL") {
            self.secondary.model = model;
        }
        if let Some(capacity) = env_parse("CP_CACHE_CAPACITY") {
            self.cache.capacity = capacity;
        }
        if let Some(daily) = env_parse("CP_QUOTA_DAILY") {
            self.quota.daily_limit = daily;
        }
        if let Some(monthly) = env_parse("CP_QUOTA_MONTHLY") {
            self.quota.monthly_limit = monthly;
        }
        if let Some(max) = env_parse("CP_RATE_LIMIT_MAX") {
            self.rate_limit.max_requests = max;
        }
        if let Some(enabled) = env_flag("CP_RATE_LIMIT_ENABLED") {
            self.rate_limit.enabled = enabled;
        }
        if let Ok(path) = std::env::var("CP_DB_PATH") {
            self.storage.sqlite_path = Some(PathBuf::from(path));
        }
        if let Some(in_memory) = env_flag("CP_STORAGE_IN_MEMORY") {
            self.storage.in_memory = in_memory;
        }
        if let Some(bind) = env_parse::<SocketAddr>("CP_HTTP_BIND") {
            self.server.http_bind = bind;
        }
        if let Ok(level) = std::env::var("RUST_LOG") {
            self.server.log_level = level;
        }
    }

    /// Reject nonsense, clamp the merely odd
    pub fn validate(&mut self) -> anyhow::Result<()> {
        if self.cache.capacity == 0 {
            tracing::warn!("cache.capacity 0 is not allowed, using 1");
            self.cache.capacity = 1;
        }
        if self.cache.phase1_ttl_ms <= 0 || self.cache.phase2_ttl_ms <= 0 {
            anyhow::bail!("cache TTLs must be positive");
        }
        for provider in [&mut self.primary, &mut self.secondary] {
            if provider.max_attempts == 0 {
                provider.max_attempts = 1;
            } else if provider.max_attempts > 10 {
                tracing::warn!(
                    "{}.max_attempts {} exceeds max 10, clamping to 10",
                    provider.name,
                    provider.max_attempts
                );
                provider.max_attempts = 10;
            }
            if provider.timeout_ms == 0 {
                anyhow::bail!("{}.timeout_ms must be positive", provider.name);
            }
            if provider.requests_per_window == 0 || provider.window_ms <= 0 {
                anyhow::bail!("{} rate limit window must admit requests", provider.name);
            }
            if provider.max_input_chars == 0 {
                anyhow::bail!("{}.max_input_chars must be positive", provider.name);
            }
            if !provider.base_url.starts_with("http://") && !provider.base_url.starts_with("https://")
            {
                tracing::warn!(
                    "{} base_url '{}' doesn't start with http:// or https://",
                    provider.name,
                    provider.base_url
                );
            }
        }
        if self.decision.cooldown_ms < 0 {
            anyhow::bail!("decision.cooldown_ms must not be negative");
        }
        if self.decision.echo_chamber_max_distance > self.decision.mild_bias_max_distance {
            tracing::warn!(
                "echo_chamber_max_distance {} exceeds mild_bias_max_distance {}",
                self.decision.echo_chamber_max_distance,
                self.decision.mild_bias_max_distance
            );
        }
        if self.quota.daily_limit > self.quota.monthly_limit {
            tracing::warn!(
                "quota.daily_limit {} exceeds monthly_limit {}; monthly limit will bind first",
                self.quota.daily_limit,
                self.quota.monthly_limit
            );
        }
        if self.rate_limit.window_ms <= 0 || self.rate_limit.max_requests == 0 {
            anyhow::bail!("rate_limit window must admit requests");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.primary.timeout_ms, 8_000);
        assert_eq!(config.primary.backoff_base_ms, 200);
        assert_eq!(config.secondary.timeout_ms, 25_000);
        assert_eq!(config.secondary.backoff_base_ms, 250);
        assert_eq!(config.decision.cooldown_ms, 30_000);
        assert_eq!(config.rate_limit.max_requests, 60);
        assert_eq!(config.quota.local_ttl_ms, 60_000);
        assert_eq!(config.cache.phase1_ttl_ms, 86_400_000);
    }

    #[test]
    fn partial_toml_keeps_defaults() {
        let config = Config::from_toml_str(
            r#"
            [decision]
            mild_bias_max_distance = 0.5

            [primary]
            model = "tiny"
            "#,
        )
        .unwrap();
        assert_eq!(config.decision.mild_bias_max_distance, 0.5);
        assert_eq!(config.decision.echo_chamber_max_distance, 0.2);
        assert_eq!(config.primary.model, "tiny");
        assert_eq!(config.primary.timeout_ms, 8_000);
        assert_eq!(config.secondary.name, "secondary");
    }

    #[test]
    fn partial_secondary_keeps_its_own_defaults() {
        let config = Config::from_toml_str(
            r#"
            [secondary]
            model = "gpt-4o"
            "#,
        )
        .unwrap();
        assert_eq!(config.secondary.model, "gpt-4o");
        assert_eq!(config.secondary.name, "secondary");
        assert_eq!(config.secondary.base_url, "https://api.openai.com/v1");
        assert_eq!(config.secondary.timeout_ms, 25_000);
    }

    #[test]
    fn validate_clamps_attempts() {
        let mut config = Config::default();
        config.primary.max_attempts = 0;
        config.secondary.max_attempts = 99;
        config.validate().unwrap();
        assert_eq!(config.primary.max_attempts, 1);
        assert_eq!(config.secondary.max_attempts, 10);
    }

    #[test]
    fn validate_rejects_empty_rate_window() {
        let mut config = Config::default();
        config.rate_limit.max_requests = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn placeholder_keys_do_not_count() {
        let mut provider = ProviderConfig::primary();
        provider.api_key = Some("${CP_PRIMARY_API_KEY}".into());
        assert!(!provider.has_api_key());
        provider.api_key = Some("gsk-live".into());
        assert!(provider.has_api_key());
    }
}
