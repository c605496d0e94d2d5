//! Configuration management for Turnstile.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use redis::{ConnectionAddr, ConnectionInfo, RedisConnectionInfo};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::error::{Result, TurnstileError};

/// Environment variable prefix for configuration overrides.
///
/// Nested keys are separated by `__`, e.g. `TURNSTILE__STORE__HOST`.
pub const ENV_PREFIX: &str = "TURNSTILE";

/// Longest accepted window, lockout or cache TTL, in seconds (ten years).
pub const MAX_DURATION_SECS: u64 = 10 * 365 * 24 * 60 * 60;

/// Main configuration for the Turnstile admission layer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TurnstileConfig {
    /// Backing store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Cache configuration
    #[serde(default)]
    pub cache: CacheConfig,

    /// Rate limiting policies
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Which store backs counters and cache entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process maps; only correct for a single instance
    #[default]
    Memory,
    /// Shared Redis-compatible server
    Redis,
}

/// Backing store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Store backend
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis host
    #[serde(default = "default_host")]
    pub host: String,

    /// Redis port
    #[serde(default = "default_port")]
    pub port: u16,

    /// Redis ACL username
    #[serde(default)]
    pub username: Option<String>,

    /// Redis password
    #[serde(default)]
    pub password: Option<String>,

    /// Redis logical database
    #[serde(default)]
    pub database: u16,

    /// Prefix prepended to every rate limit counter key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Upper bound for a single store operation in milliseconds
    #[serde(default = "default_operation_timeout")]
    pub operation_timeout_ms: u64,

    /// How often expired in-memory entries are purged, in seconds
    #[serde(default = "default_janitor_interval")]
    pub janitor_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            host: default_host(),
            port: default_port(),
            username: None,
            password: None,
            database: 0,
            key_prefix: default_key_prefix(),
            operation_timeout_ms: default_operation_timeout(),
            janitor_interval_secs: default_janitor_interval(),
        }
    }
}

impl StoreConfig {
    /// Connection parameters for the Redis backend.
    ///
    /// Credentials are passed through as-is, so they may contain characters
    /// that are reserved in URLs.
    pub fn connection_info(&self) -> ConnectionInfo {
        ConnectionInfo {
            addr: ConnectionAddr::Tcp(self.host.clone(), self.port),
            redis: RedisConnectionInfo {
                db: i64::from(self.database),
                username: self.username.clone(),
                password: self.password.clone(),
                ..RedisConnectionInfo::default()
            },
        }
    }

    /// Operation timeout as a duration.
    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6379
}

fn default_key_prefix() -> String {
    "turnstile:".to_string()
}

fn default_operation_timeout() -> u64 {
    250
}

fn default_janitor_interval() -> u64 {
    60
}

/// Cache configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// TTL applied when a caller does not pass one, in seconds
    #[serde(default = "default_cache_ttl")]
    pub default_ttl_secs: u64,

    /// Prefix for every cache key in the shared store
    #[serde(default = "default_namespace")]
    pub namespace: String,

    /// Prefix for tag membership sets
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: default_cache_ttl(),
            namespace: default_namespace(),
            tag_prefix: default_tag_prefix(),
        }
    }
}

impl CacheConfig {
    /// Default TTL as a duration.
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }
}

fn default_cache_ttl() -> u64 {
    300
}

fn default_namespace() -> String {
    "cache:".to_string()
}

fn default_tag_prefix() -> String {
    "tag:".to_string()
}

/// Settings for one rate limit policy, as they appear in configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicySettings {
    /// Requests allowed per window
    pub points: u64,
    /// Window length in seconds
    pub duration: u64,
    /// Lockout applied once the limit is exceeded, in seconds (0 = none)
    pub block_duration: u64,
    /// Do not count requests that complete successfully
    pub skip_successful: bool,
    /// Do not count requests that fail
    pub skip_failed: bool,
}

impl PolicySettings {
    /// Settings with the given points and window and no lockout.
    pub fn new(points: u64, duration: u64) -> Self {
        Self {
            points,
            duration,
            ..Self::default()
        }
    }

    /// Set the lockout duration.
    pub fn with_block(mut self, block_duration: u64) -> Self {
        self.block_duration = block_duration;
        self
    }
}

impl Default for PolicySettings {
    fn default() -> Self {
        Self {
            points: 100,
            duration: 60,
            block_duration: 0,
            skip_successful: false,
            skip_failed: false,
        }
    }
}

/// Rate limiting configuration: one entry per preset plus plan tiers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Whole-service limit
    #[serde(default = "default_global")]
    pub global: PolicySettings,

    /// Limit per client IP
    #[serde(default = "default_per_ip")]
    pub per_ip: PolicySettings,

    /// Limit per authenticated user
    #[serde(default = "default_per_user")]
    pub per_user: PolicySettings,

    /// Limit per API key
    #[serde(default = "default_per_api_key")]
    pub per_api_key: PolicySettings,

    /// Limit for expensive endpoints
    #[serde(default = "default_strict")]
    pub strict: PolicySettings,

    /// Limit for authentication attempts
    #[serde(default = "default_auth")]
    pub auth: PolicySettings,

    /// Limits per subscription plan
    #[serde(default = "default_tiers")]
    pub tiers: BTreeMap<String, PolicySettings>,

    /// Tier used when a request cannot be classified
    #[serde(default = "default_tier_name")]
    pub default_tier: String,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            global: default_global(),
            per_ip: default_per_ip(),
            per_user: default_per_user(),
            per_api_key: default_per_api_key(),
            strict: default_strict(),
            auth: default_auth(),
            tiers: default_tiers(),
            default_tier: default_tier_name(),
        }
    }
}

fn default_global() -> PolicySettings {
    PolicySettings::new(1000, 900)
}

fn default_per_ip() -> PolicySettings {
    PolicySettings::new(100, 60)
}

fn default_per_user() -> PolicySettings {
    PolicySettings::new(300, 60)
}

fn default_per_api_key() -> PolicySettings {
    PolicySettings::new(1000, 3600)
}

fn default_strict() -> PolicySettings {
    PolicySettings::new(10, 60).with_block(300)
}

fn default_auth() -> PolicySettings {
    PolicySettings {
        skip_successful: true,
        ..PolicySettings::new(5, 900).with_block(900)
    }
}

fn default_tiers() -> BTreeMap<String, PolicySettings> {
    let mut tiers = BTreeMap::new();
    tiers.insert("free".to_string(), PolicySettings::new(100, 3600));
    tiers.insert("pro".to_string(), PolicySettings::new(1000, 3600));
    tiers.insert("enterprise".to_string(), PolicySettings::new(10000, 3600));
    tiers
}

fn default_tier_name() -> String {
    "free".to_string()
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human readable output
    #[serde(default)]
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl TurnstileConfig {
    /// Load configuration from a YAML file path.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: TurnstileConfig = serde_yaml::from_str(yaml)
            .map_err(|e| TurnstileError::Config(format!("Failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from an optional file layered with
    /// `TURNSTILE__*` environment variables.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration");
            builder = builder.add_source(config::File::from(path));
        }

        let config: TurnstileConfig = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        config.validate()?;
        Ok(config)
    }

    /// Reject configurations that cannot produce a working limiter.
    pub fn validate(&self) -> Result<()> {
        if self.store.operation_timeout_ms == 0 {
            return Err(TurnstileError::Config(
                "store.operation_timeout_ms must be greater than zero".to_string(),
            ));
        }

        if self.cache.default_ttl_secs > MAX_DURATION_SECS {
            return Err(TurnstileError::Config(format!(
                "cache.default_ttl_secs must not exceed {}",
                MAX_DURATION_SECS
            )));
        }

        let rl = &self.rate_limiting;
        let named = [
            ("global", &rl.global),
            ("per_ip", &rl.per_ip),
            ("per_user", &rl.per_user),
            ("per_api_key", &rl.per_api_key),
            ("strict", &rl.strict),
            ("auth", &rl.auth),
        ];
        for (name, settings) in named {
            validate_settings(name, settings)?;
        }
        for (tier, settings) in &rl.tiers {
            validate_settings(&format!("tiers.{}", tier), settings)?;
        }
        if !rl.tiers.contains_key(&rl.default_tier) {
            return Err(TurnstileError::Config(format!(
                "default_tier '{}' is not a configured tier",
                rl.default_tier
            )));
        }

        Ok(())
    }
}

fn validate_settings(name: &str, settings: &PolicySettings) -> Result<()> {
    if settings.points == 0 {
        return Err(TurnstileError::Config(format!(
            "{}: points must be greater than zero",
            name
        )));
    }
    if settings.duration == 0 {
        return Err(TurnstileError::Config(format!(
            "{}: duration must be greater than zero",
            name
        )));
    }
    for (field, secs) in [
        ("duration", settings.duration),
        ("block_duration", settings.block_duration),
    ] {
        if secs > MAX_DURATION_SECS {
            return Err(TurnstileError::Config(format!(
                "{}: {} must not exceed {} seconds",
                name, field, MAX_DURATION_SECS
            )));
        }
    }
    Ok(())
}
