//! Configuration management for Quotagate.

use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::path::Path;
use tracing::info;

use crate::error::{QuotagateError, Result};
use crate::ratelimit::{LimiterPolicy, DEFAULT_KEY_PREFIX};
use crate::web::StoreErrorPolicy;

/// Prefix of environment variables that override file settings, e.g.
/// `QUOTAGATE__STORE__REDIS_URL`.
pub const ENV_PREFIX: &str = "QUOTAGATE";

/// Main configuration for the Quotagate service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct QuotagateConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Counter store configuration
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limiting: RateLimitingConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// HTTP listen address
    #[serde(default = "default_listen_addr")]
    pub listen_addr: SocketAddr,

    /// Take the client key from the first `X-Forwarded-For` hop
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            trust_forwarded_for: false,
        }
    }
}

fn default_listen_addr() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 3000))
}

/// Which counter store backs the limiters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Shared Redis server
    #[default]
    Redis,
    /// Process-local memory, for single instances and development
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

    /// Upper bound on a single store call in milliseconds
    #[serde(default = "default_store_timeout_ms")]
    pub timeout_ms: u64,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_store_timeout_ms(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379".to_string()
}

fn default_store_timeout_ms() -> u64 {
    300
}

/// Rate limiting configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitingConfig {
    /// Prefix for every store key
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Block duration applied to routes that do not set their own
    #[serde(default = "default_block_secs")]
    pub block_secs: f64,

    /// Header that skips rate limiting when set to `true`
    #[serde(default = "default_bypass_header")]
    pub bypass_header: String,

    /// What to do with a request when the store fails
    #[serde(default)]
    pub on_store_error: StoreErrorPolicy,

    /// `Retry-After` sent when a store failure rejects a request
    #[serde(default = "default_store_error_retry_after")]
    pub store_error_retry_after_secs: u64,

    /// Rate limited routes
    #[serde(default = "default_routes")]
    pub routes: Vec<RouteConfig>,
}

impl Default for RateLimitingConfig {
    fn default() -> Self {
        Self {
            key_prefix: default_key_prefix(),
            block_secs: default_block_secs(),
            bypass_header: default_bypass_header(),
            on_store_error: StoreErrorPolicy::default(),
            store_error_retry_after_secs: default_store_error_retry_after(),
            routes: default_routes(),
        }
    }
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

fn default_block_secs() -> f64 {
    40.0
}

fn default_bypass_header() -> String {
    "x-bypass-rate-limit".to_string()
}

fn default_store_error_retry_after() -> u64 {
    1
}

fn default_routes() -> Vec<RouteConfig> {
    vec![RouteConfig {
        path: "/api/fast".to_string(),
        capacity: 2000,
        window_secs: 1.0,
        block_secs: None,
        body: "Fast endpoint — up to 2000 req/sec".to_string(),
    }]
}

/// A rate limited route served by the binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouteConfig {
    /// Request path
    pub path: String,
    /// Requests allowed per window
    pub capacity: u64,
    /// Window length in seconds
    pub window_secs: f64,
    /// Overrides `rate_limiting.block_secs` for this route
    #[serde(default)]
    pub block_secs: Option<f64>,
    /// Static response body
    #[serde(default)]
    pub body: String,
}

impl RouteConfig {
    /// The limiter policy for this route.
    pub fn policy(&self, default_block_secs: f64) -> Result<LimiterPolicy> {
        LimiterPolicy::from_secs(
            self.capacity,
            self.window_secs,
            self.block_secs.unwrap_or(default_block_secs),
        )
    }
}

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default)]
    pub format: LogFormat,

    /// Default filter directive when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            format: LogFormat::default(),
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl QuotagateConfig {
    /// Load configuration from an optional file, then environment overrides.
    ///
    /// The file format follows its extension (`.yaml`, `.toml`, `.json`).
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = path {
            info!(path = %path.display(), "Loading configuration file");
            builder = builder.add_source(config::File::from(path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        let config: QuotagateConfig = settings.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a YAML string.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: QuotagateConfig = serde_yaml::from_str(yaml)
            .map_err(|e| QuotagateError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Check every route policy and reject duplicate paths.
    ///
    /// Routes with the same capacity and window share one limiter, so they
    /// must also agree on the block duration.
    pub fn validate(&self) -> Result<()> {
        let mut paths = HashSet::new();
        let mut blocks = HashMap::new();
        for route in &self.rate_limiting.routes {
            if !route.path.starts_with('/') {
                return Err(QuotagateError::Config(format!(
                    "route path {:?} must start with '/'",
                    route.path
                )));
            }
            if !paths.insert(route.path.as_str()) {
                return Err(QuotagateError::Config(format!(
                    "route path {:?} is configured twice",
                    route.path
                )));
            }
            let policy = route.policy(self.rate_limiting.block_secs)?;
            if let Some(block) = blocks.insert(policy.identity(), policy.block()) {
                if block != policy.block() {
                    return Err(QuotagateError::PolicyConflict(format!(
                        "route {:?} shares capacity {} and window {:?} with another route but blocks for {:?} instead of {:?}",
                        route.path,
                        policy.capacity(),
                        policy.window(),
                        policy.block(),
                        block
                    )));
                }
            }
        }
        if self.store.timeout_ms == 0 {
            return Err(QuotagateError::Config(
                "store.timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }
}
