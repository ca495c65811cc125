//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use tracing::info;

use crate::error::{GatekeeperError, Result};
use crate::ratelimit::{RatelimiterOptions, RegistryOptions};

/// Prefix for environment overrides, e.g. `GATEKEEPER__STORE__REDIS_URL`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Per-class ratelimiter settings
    #[serde(default)]
    pub limiters: LimitersConfig,

    /// Bot IDs entitled to the premium limits
    #[serde(default)]
    pub premium_bots: Vec<String>,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,

    /// Forward requests when the counter store is down
    #[serde(default)]
    pub fail_open: bool,

    /// Take the fallback identity from `X-Forwarded-For`. Only enable
    /// behind a proxy that overwrites the header.
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
            fail_open: false,
            trust_forwarded_for: false,
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// Which counter store to use.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    #[default]
    Redis,
    /// Process-local; only correct with a single instance
    Memory,
}

/// Counter store configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on any single store call, in milliseconds
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,

    /// How often the memory backend drops expired windows, in seconds
    #[serde(default = "default_purge_interval")]
    pub purge_interval_secs: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_timeout_ms(),
            purge_interval_secs: default_purge_interval(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_timeout_ms() -> u64 {
    500
}

fn default_purge_interval() -> u64 {
    60
}

impl StoreConfig {
    /// Store call timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Memory backend purge interval.
    pub fn purge_interval(&self) -> Duration {
        Duration::from_secs(self.purge_interval_secs.max(1))
    }
}

/// Settings for one ratelimiter, as written in the config file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterSettings {
    /// Maximum admitted requests per window
    pub limit: u64,
    /// Window length in milliseconds
    pub reset_ms: u64,
    /// Key namespace
    pub redis_prefix: String,
    /// Overflow events before a temporary ban
    pub temp_ban_after: u32,
    /// Temporary bans before a permanent ban
    pub perm_ban_after: u32,
    /// Length of a temporary ban in seconds
    pub temp_ban_length_secs: u64,
}

impl LimiterSettings {
    fn bots(limit: u64, redis_prefix: &str, ban_after: u32) -> Self {
        Self {
            limit,
            reset_ms: 10_000,
            redis_prefix: redis_prefix.to_string(),
            temp_ban_after: ban_after,
            perm_ban_after: ban_after,
            temp_ban_length_secs: 24 * 60 * 60,
        }
    }

    /// Convert to engine options. Validation happens when the engine is built.
    pub fn to_options(&self) -> RatelimiterOptions {
        RatelimiterOptions {
            limit: self.limit,
            reset: Duration::from_millis(self.reset_ms),
            redis_prefix: self.redis_prefix.clone(),
            temp_ban_after: self.temp_ban_after,
            perm_ban_after: self.perm_ban_after,
            temp_ban_length: Duration::from_secs(self.temp_ban_length_secs),
        }
    }
}

/// Ratelimiter settings for each traffic class.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimitersConfig {
    #[serde(default = "default_standard")]
    pub standard: LimiterSettings,
    #[serde(default = "default_premium")]
    pub premium: LimiterSettings,
    #[serde(default = "default_fallback")]
    pub fallback: LimiterSettings,
}

impl Default for LimitersConfig {
    fn default() -> Self {
        Self {
            standard: default_standard(),
            premium: default_premium(),
            fallback: default_fallback(),
        }
    }
}

fn default_standard() -> LimiterSettings {
    LimiterSettings::bots(10, "rl_bots", 2)
}

fn default_premium() -> LimiterSettings {
    LimiterSettings::bots(20, "rl_premium_bots", 4)
}

fn default_fallback() -> LimiterSettings {
    LimiterSettings::bots(10, "rl_fallback", 2)
}

impl LimitersConfig {
    /// Engine options for every class.
    pub fn registry_options(&self) -> RegistryOptions {
        RegistryOptions {
            standard: self.standard.to_options(),
            premium: self.premium.to_options(),
            fallback: self.fallback.to_options(),
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading configuration");

        let contents = std::fs::read_to_string(path)?;
        Self::from_yaml(&contents)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Layer an optional YAML file and `GATEKEEPER__*` environment variables
    /// over the defaults.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = config::Config::builder();

        if let Some(path) = path {
            info!(path = %path, "Loading configuration");
            builder = builder.add_source(
                config::File::with_name(path).format(config::FileFormat::Yaml),
            );
        }

        let config = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Premium bot IDs as a lookup set.
    pub fn premium_set(&self) -> HashSet<String> {
        self.premium_bots.iter().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_bot_routes() {
        let config = GatekeeperConfig::default();
        let options = config.limiters.registry_options();

        assert_eq!(options.standard.limit, 10);
        assert_eq!(options.standard.reset, Duration::from_secs(10));
        assert_eq!(options.standard.redis_prefix, "rl_bots");
        assert_eq!(options.standard.temp_ban_length, Duration::from_secs(86400));
        assert_eq!(options.premium.limit, 20);
        assert_eq!(options.premium.temp_ban_after, 4);
        assert_eq!(options.premium.perm_ban_after, 4);
        assert_eq!(options.fallback.redis_prefix, "rl_fallback");
        assert!(!config.server.fail_open);
        assert!(!config.server.trust_forwarded_for);
        assert_eq!(config.store.backend, StoreBackend::Redis);
    }

    #[test]
    fn test_parse_partial_config() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
store:
  backend: memory
  timeout_ms: 250
limiters:
  premium:
    limit: 50
    reset_ms: 5000
    redis_prefix: rl_premium
    temp_ban_after: 3
    perm_ban_after: 5
    temp_ban_length_secs: 3600
premium_bots:
  - "568254611354419211"
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.server.http_addr, "0.0.0.0:9000".parse().unwrap());
        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.store.timeout(), Duration::from_millis(250));
        assert_eq!(config.limiters.premium.limit, 50);
        assert_eq!(config.limiters.premium.to_options().reset, Duration::from_secs(5));
        // Unset classes keep their defaults.
        assert_eq!(config.limiters.standard, default_standard());
        assert!(config.premium_set().contains("568254611354419211"));
    }

    #[test]
    fn test_invalid_yaml_is_config_error() {
        let result = GatekeeperConfig::from_yaml("store: [not, a, map]");
        assert!(matches!(result, Err(GatekeeperError::Config(_))));
    }

    #[test]
    fn test_load_from_file() {
        let path = std::env::temp_dir().join(format!("gatekeeper-{}.yaml", uuid::Uuid::new_v4()));
        std::fs::write(
            &path,
            "store:\n  backend: memory\nlimiters:\n  standard:\n    limit: 3\n    reset_ms: 1000\n    redis_prefix: rl_test\n    temp_ban_after: 1\n    perm_ban_after: 1\n    temp_ban_length_secs: 60\n",
        )
        .unwrap();

        let config = GatekeeperConfig::load(path.to_str()).unwrap();
        std::fs::remove_file(&path).unwrap();

        assert_eq!(config.store.backend, StoreBackend::Memory);
        assert_eq!(config.limiters.standard.limit, 3);
        assert_eq!(config.limiters.premium, default_premium());
    }

    #[test]
    fn test_from_missing_file_is_io_error() {
        let result = GatekeeperConfig::from_file("/nonexistent/gatekeeper.yaml");
        assert!(matches!(result, Err(GatekeeperError::Io(_))));
    }
}
