//! Configuration management for Gatekeeper.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crate::error::{GatekeeperError, Result};
use crate::http::{FailureMode, KeyStrategy, RateLimitLayer};
use crate::ratelimit::{Algorithm, RateLimiter, TieredLimit};
use crate::store::{RedisStoreConfig, Store};

/// Prefix of environment variables overriding file settings,
/// e.g. `GATEKEEPER__LIMITER__MAX=500`.
const ENV_PREFIX: &str = "GATEKEEPER";

/// Main configuration for the Gatekeeper service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct GatekeeperConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub limiter: LimiterConfig,

    /// Counter storage
    #[serde(default)]
    pub store: StoreConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP server address
    #[serde(default = "default_http_addr")]
    pub http_addr: SocketAddr,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            http_addr: default_http_addr(),
        }
    }
}

fn default_http_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8080))
}

/// How the middleware identifies callers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyStrategyKind {
    #[default]
    Ip,
    User,
    ApiKey,
}

impl From<KeyStrategyKind> for KeyStrategy {
    fn from(kind: KeyStrategyKind) -> Self {
        match kind {
            KeyStrategyKind::Ip => KeyStrategy::Ip,
            KeyStrategyKind::User => KeyStrategy::User,
            KeyStrategyKind::ApiKey => KeyStrategy::ApiKey,
        }
    }
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LimiterConfig {
    /// Window length in milliseconds
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    /// Limit for callers without a configured tier
    #[serde(default = "default_max")]
    pub max: u64,

    #[serde(default)]
    pub algorithm: Algorithm,

    /// Namespace for this limiter's keys in a shared store
    #[serde(default)]
    pub key_prefix: String,

    #[serde(default)]
    pub key_strategy: KeyStrategyKind,

    #[serde(default)]
    pub failure_mode: FailureMode,

    /// Header naming the caller's tier, set by a trusted proxy
    #[serde(default)]
    pub tier_header: Option<String>,

    /// Per-tier limits
    #[serde(default)]
    pub tiers: HashMap<String, u64>,

    /// Headers carrying the client address, set by a proxy in front of the
    /// service. Empty means the socket peer address is used.
    #[serde(default)]
    pub trusted_proxy_headers: Vec<String>,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max: default_max(),
            algorithm: Algorithm::default(),
            key_prefix: String::new(),
            key_strategy: KeyStrategyKind::default(),
            failure_mode: FailureMode::default(),
            tier_header: None,
            tiers: HashMap::new(),
            trusted_proxy_headers: Vec::new(),
        }
    }
}

fn default_window_ms() -> u64 {
    60_000
}

fn default_max() -> u64 {
    100
}

impl LimiterConfig {
    /// Build a limiter over `store`. Tiers, when configured, replace the
    /// fixed `max`, which remains the default for unknown tiers.
    pub fn build_limiter(&self, store: Arc<dyn Store>) -> Result<RateLimiter> {
        let builder = RateLimiter::builder(store)
            .window_ms(self.window_ms)
            .algorithm(self.algorithm)
            .key_prefix(self.key_prefix.clone());

        let builder = if self.tiers.is_empty() {
            builder.max(self.max)
        } else {
            let tiers = TieredLimit {
                default_max: self.max,
                tiers: self.tiers.clone(),
            };
            tiers.validate()?;
            builder.max_with(tiers)
        };

        builder.build()
    }

    /// Wrap `limiter` in a middleware layer with these settings.
    pub fn layer(&self, limiter: Arc<RateLimiter>) -> RateLimitLayer {
        let layer = RateLimitLayer::new(limiter)
            .key_strategy(self.key_strategy.into())
            .failure_mode(self.failure_mode)
            .trusted_proxy_headers(self.trusted_proxy_headers.iter().cloned());

        match &self.tier_header {
            Some(header) => layer.tier_header(header.clone()),
            None => layer,
        }
    }
}

/// Counter storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StoreConfig {
    /// Process-local store
    Memory {
        /// Interval between expired-record sweeps
        #[serde(default = "default_sweep_interval")]
        sweep_interval_secs: u64,
    },
    /// Store shared by every instance through Redis
    Redis {
        url: String,
        #[serde(default = "default_command_timeout")]
        command_timeout_ms: u64,
    },
}

impl Default for StoreConfig {
    fn default() -> Self {
        StoreConfig::Memory {
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_command_timeout() -> u64 {
    1000
}

impl StoreConfig {
    /// Connection settings when this is a Redis store.
    pub fn redis(&self) -> Option<RedisStoreConfig> {
        match self {
            StoreConfig::Redis {
                url,
                command_timeout_ms,
            } => Some(RedisStoreConfig {
                url: url.clone(),
                command_timeout: Duration::from_millis(*command_timeout_ms),
            }),
            StoreConfig::Memory { .. } => None,
        }
    }
}

impl GatekeeperConfig {
    /// Load configuration from a YAML file, applying `GATEKEEPER__*`
    /// environment overrides.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let source = config::File::from(path).format(config::FileFormat::Yaml);

        let config: GatekeeperConfig = config::Config::builder()
            .add_source(source)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .and_then(|settings| settings.try_deserialize())
            .map_err(|e| {
                GatekeeperError::Configuration(format!("{}: {}", path.display(), e))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: GatekeeperConfig = serde_yaml::from_str(yaml)
            .map_err(|e| GatekeeperError::Configuration(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if self.limiter.window_ms == 0 {
            return Err(GatekeeperError::Configuration(
                "limiter.window_ms must be positive".to_string(),
            ));
        }
        if self.limiter.max == 0 {
            return Err(GatekeeperError::Configuration(
                "limiter.max must be positive".to_string(),
            ));
        }
        if let Some((tier, _)) = self.limiter.tiers.iter().find(|(_, max)| **max == 0) {
            return Err(GatekeeperError::Configuration(format!(
                "limiter.tiers.{} must be positive",
                tier
            )));
        }

        match &self.store {
            StoreConfig::Memory {
                sweep_interval_secs: 0,
            } => Err(GatekeeperError::Configuration(
                "store.sweep_interval_secs must be positive".to_string(),
            )),
            StoreConfig::Redis { url, .. } if url.is_empty() => Err(
                GatekeeperError::Configuration("store.url must not be empty".to_string()),
            ),
            StoreConfig::Redis {
                command_timeout_ms: 0,
                ..
            } => Err(GatekeeperError::Configuration(
                "store.command_timeout_ms must be positive".to_string(),
            )),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ratelimit::CheckRequest;
    use crate::store::MemoryStore;
    use std::io::Write;

    #[test]
    fn test_defaults() {
        let config = GatekeeperConfig::default();
        assert_eq!(config.server.http_addr, SocketAddr::from(([127, 0, 0, 1], 8080)));
        assert_eq!(config.limiter.window_ms, 60_000);
        assert_eq!(config.limiter.max, 100);
        assert_eq!(config.limiter.failure_mode, FailureMode::FailClosed);
        assert!(config.limiter.trusted_proxy_headers.is_empty());
        assert_eq!(config.store, StoreConfig::Memory { sweep_interval_secs: 60 });
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let yaml = r#"
server:
  http_addr: "0.0.0.0:9000"
limiter:
  window_ms: 1000
  max: 10
  algorithm: sliding_log
  key_prefix: api
  key_strategy: api_key
  failure_mode: fail_open
  tier_header: x-plan
  tiers:
    pro: 100
  trusted_proxy_headers:
    - X-Forwarded-For
store:
  type: redis
  url: "redis://cache:6379"
"#;
        let config = GatekeeperConfig::from_yaml(yaml).unwrap();
        assert_eq!(config.server.http_addr.port(), 9000);
        assert_eq!(config.limiter.algorithm, Algorithm::SlidingLog);
        assert_eq!(config.limiter.key_strategy, KeyStrategyKind::ApiKey);
        assert_eq!(config.limiter.failure_mode, FailureMode::FailOpen);
        assert_eq!(config.limiter.tiers.get("pro"), Some(&100));
        assert_eq!(config.limiter.trusted_proxy_headers, vec!["X-Forwarded-For"]);

        let redis = config.store.redis().unwrap();
        assert_eq!(redis.url, "redis://cache:6379");
        assert_eq!(redis.command_timeout, Duration::from_millis(1000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config = GatekeeperConfig::from_yaml("limiter:\n  max: 5\n").unwrap();
        assert_eq!(config.limiter.max, 5);
        assert_eq!(config.limiter.window_ms, 60_000);
        assert!(config.store.redis().is_none());
    }

    #[test]
    fn test_rejects_zero_values() {
        assert!(matches!(
            GatekeeperConfig::from_yaml("limiter:\n  max: 0\n"),
            Err(GatekeeperError::Configuration(_))
        ));
        assert!(matches!(
            GatekeeperConfig::from_yaml("limiter:\n  window_ms: 0\n"),
            Err(GatekeeperError::Configuration(_))
        ));
        assert!(matches!(
            GatekeeperConfig::from_yaml("limiter:\n  tiers:\n    free: 0\n"),
            Err(GatekeeperError::Configuration(_))
        ));
        assert!(matches!(
            GatekeeperConfig::from_yaml("store:\n  type: redis\n  url: \"\"\n"),
            Err(GatekeeperError::Configuration(_))
        ));
    }

    #[test]
    fn test_rejects_unknown_algorithm() {
        let result = GatekeeperConfig::from_yaml("limiter:\n  algorithm: token_bucket\n");
        assert!(matches!(result, Err(GatekeeperError::Configuration(_))));
    }

    // Only this test touches GATEKEEPER__* variables.
    #[test]
    fn test_load_from_file_with_env_override() {
        let path = std::env::temp_dir().join(format!("gatekeeper-{}.yaml", uuid::Uuid::new_v4()));
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(file, "limiter:\n  max: 7\n  algorithm: cost_based").unwrap();

        let config = GatekeeperConfig::load(&path).unwrap();
        assert_eq!(config.limiter.max, 7);
        assert_eq!(config.limiter.algorithm, Algorithm::CostBased);

        std::env::set_var("GATEKEEPER__LIMITER__MAX", "250");
        let overridden = GatekeeperConfig::load(&path);
        std::env::remove_var("GATEKEEPER__LIMITER__MAX");
        std::fs::remove_file(&path).unwrap();

        let overridden = overridden.unwrap();
        assert_eq!(overridden.limiter.max, 250);
        assert_eq!(overridden.limiter.algorithm, Algorithm::CostBased);
    }

    #[test]
    fn test_load_missing_file() {
        let result = GatekeeperConfig::load("/nonexistent/gatekeeper.yaml");
        assert!(matches!(result, Err(GatekeeperError::Configuration(_))));
    }

    #[tokio::test]
    async fn test_build_tiered_limiter() {
        let config = GatekeeperConfig::from_yaml(
            "limiter:\n  max: 2\n  key_prefix: api\n  tiers:\n    pro: 5\n",
        )
        .unwrap();
        let limiter = config
            .limiter
            .build_limiter(Arc::new(MemoryStore::new()))
            .unwrap();

        let pro = limiter
            .check_request(&CheckRequest::new("a").with_tier("pro"))
            .await
            .unwrap();
        assert_eq!(pro.limit, 5);

        let free = limiter.check("b", 1).await.unwrap();
        assert_eq!(free.limit, 2);
    }
}
