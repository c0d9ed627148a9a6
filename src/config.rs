use config::{Config, Environment, File};
use serde::Deserialize;
use std::path::PathBuf;

#[derive(Debug, Deserialize, Clone)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    #[serde(default)]
    pub cache: CacheConfig,
    #[serde(default)]
    pub tracking: TrackingConfig,
    #[serde(default)]
    pub pipeline: PipelineConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DatabaseConfig {
    pub path: PathBuf,
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,
}

fn default_pool_size() -> usize {
    8
}

#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CacheBackend {
    Memory,
    Redis,
}

#[derive(Debug, Deserialize, Clone)]
pub struct CacheConfig {
    #[serde(default = "default_cache_backend")]
    pub backend: CacheBackend,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default = "default_cache_ttl")]
    pub ttl_secs: u64,
    /// Upper bound on entries for the in-process backend.
    #[serde(default = "default_cache_capacity")]
    pub max_capacity: u64,
    /// Coalesce concurrent misses for the same key within this process.
    #[serde(default = "default_single_flight")]
    pub single_flight: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            backend: CacheBackend::Memory,
            redis_url: None,
            ttl_secs: 600,
            max_capacity: 10_000,
            single_flight: true,
        }
    }
}

fn default_cache_backend() -> CacheBackend {
    CacheBackend::Memory
}
fn default_cache_ttl() -> u64 {
    600 // 10 minutes
}
fn default_cache_capacity() -> u64 {
    10_000
}
fn default_single_flight() -> bool {
    true
}

/// Ingress limits. Session capture clamps to the same defaults so the events
/// a storefront page sends are never rejected as too large.
pub const DEFAULT_MAX_PAYLOAD_BYTES: usize = 8192;
pub const DEFAULT_MAX_ID_BYTES: usize = 128;
pub const DEFAULT_MAX_REFERRER_BYTES: usize = 2048;
pub const DEFAULT_MAX_UTM_PARAMS: usize = 16;
pub const DEFAULT_MAX_UTM_VALUE_BYTES: usize = 256;

#[derive(Debug, Deserialize, Clone)]
pub struct TrackingConfig {
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    #[serde(default = "default_max_payload")]
    pub max_payload_bytes: usize,
    #[serde(default = "default_max_id")]
    pub max_id_bytes: usize,
    #[serde(default = "default_max_referrer")]
    pub max_referrer_bytes: usize,
    #[serde(default = "default_max_utm_params")]
    pub max_utm_params: usize,
    #[serde(default = "default_max_utm_value")]
    pub max_utm_value_bytes: usize,
}

impl Default for TrackingConfig {
    fn default() -> Self {
        Self {
            channel_capacity: 8192,
            max_payload_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            max_id_bytes: DEFAULT_MAX_ID_BYTES,
            max_referrer_bytes: DEFAULT_MAX_REFERRER_BYTES,
            max_utm_params: DEFAULT_MAX_UTM_PARAMS,
            max_utm_value_bytes: DEFAULT_MAX_UTM_VALUE_BYTES,
        }
    }
}

fn default_channel_capacity() -> usize {
    8192
}
fn default_max_payload() -> usize {
    DEFAULT_MAX_PAYLOAD_BYTES
}
fn default_max_id() -> usize {
    DEFAULT_MAX_ID_BYTES
}
fn default_max_referrer() -> usize {
    DEFAULT_MAX_REFERRER_BYTES
}
fn default_max_utm_params() -> usize {
    DEFAULT_MAX_UTM_PARAMS
}
fn default_max_utm_value() -> usize {
    DEFAULT_MAX_UTM_VALUE_BYTES
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    #[serde(default = "default_flush_interval")]
    pub flush_interval_secs: u64,
    #[serde(default = "default_flush_batch_size")]
    pub flush_batch_size: usize,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            flush_interval_secs: 2,
            flush_batch_size: 500,
        }
    }
}

fn default_flush_interval() -> u64 {
    2
}
fn default_flush_batch_size() -> usize {
    500
}

#[derive(Debug, Deserialize, Clone)]
pub struct RateLimitConfig {
    #[serde(default = "default_per_second")]
    pub per_second: u64,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_second: 50,
            burst_size: 100,
        }
    }
}

fn default_per_second() -> u64 {
    50
}
fn default_burst_size() -> u32 {
    100
}

impl AppConfig {
    /// Validate settings that serde defaults cannot catch.
    pub fn validate(&self) -> Result<(), String> {
        if self.cache.ttl_secs == 0 {
            return Err("cache.ttl_secs must be a positive number of seconds".to_string());
        }
        if self.cache.backend == CacheBackend::Redis
            && self
                .cache
                .redis_url
                .as_deref()
                .map_or(true, |u| u.trim().is_empty())
        {
            return Err("cache.redis_url is required when cache.backend = \"redis\". \
                 Set it in config.toml or via STOREFRONT__CACHE__REDIS_URL env var."
                .to_string());
        }
        if self.tracking.channel_capacity == 0 {
            return Err("tracking.channel_capacity must be greater than zero".to_string());
        }
        Ok(())
    }

    pub fn load(config_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = Config::builder();

        let path = config_path.unwrap_or("config.toml");
        builder = builder.add_source(File::with_name(path).required(false));

        // Overlay with environment variables (STOREFRONT__SERVER__PORT=3001, etc.)
        builder = builder.add_source(
            Environment::with_prefix("STOREFRONT")
                .separator("__")
                .try_parsing(true),
        );

        builder.build()?.try_deserialize()
    }
}
