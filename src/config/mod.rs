//! Configuration layer: typed settings with layered precedence (file → env).

use std::time::Duration;

use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const ENV_PREFIX: &str = "VETRINA";
const ENV_SEPARATOR: &str = "__";

const DEFAULT_UPSTREAM_BASE_URL: &str = "https://www.rentman.online";
const DEFAULT_LISTINGS_TIMEOUT_SECS: u64 = 10;
const DEFAULT_MEDIA_TIMEOUT_SECS: u64 = 15;

const DEFAULT_METADATA_TTL_SECS: u64 = 300;
const DEFAULT_IMAGE_TTL_SECS: u64 = 3600;
const DEFAULT_RECORD_TTL_SECS: u64 = 900;
const DEFAULT_ETAG_TTL_SECS: u64 = 86_400;
const DEFAULT_FEATURED_CACHE_TTL_SECS: u64 = 3600;
const DEFAULT_MIN_PUT_TTL_SECS: u64 = 60;

const DEFAULT_MIN_FEATURED: usize = 7;
const DEFAULT_MAX_FEATURED: usize = 10;
const DEFAULT_BACKFILL_DELAY_SECS: u64 = 300;
const DEFAULT_BACKFILL_TTL_BUFFER_SECS: u64 = 600;

#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid configuration: {message}")]
    Invalid { message: String },
}

impl SettingsError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }
}

/// Base log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl From<LogLevel> for LevelFilter {
    fn from(level: LogLevel) -> Self {
        match level {
            LogLevel::Trace => LevelFilter::TRACE,
            LogLevel::Debug => LevelFilter::DEBUG,
            LogLevel::Info => LevelFilter::INFO,
            LogLevel::Warn => LevelFilter::WARN,
            LogLevel::Error => LevelFilter::ERROR,
        }
    }
}

/// Log output encoding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    Compact,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LoggingSettings {
    pub level: LogLevel,
    pub format: LogFormat,
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            format: LogFormat::Compact,
        }
    }
}

/// Upstream listings API endpoint and budgets.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct UpstreamSettings {
    /// Base URL of the listings source.
    pub base_url: String,
    /// Access token, configured in decoded form; sent as a query parameter
    /// for the listings endpoint and as a `token` header for media.
    pub api_token: String,
    /// Hard wall-clock budget for listings fetches.
    pub listings_timeout_secs: u64,
    /// Hard wall-clock budget for media fetches (larger payloads).
    pub media_timeout_secs: u64,
}

impl Default for UpstreamSettings {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_UPSTREAM_BASE_URL.to_string(),
            api_token: String::new(),
            listings_timeout_secs: DEFAULT_LISTINGS_TIMEOUT_SECS,
            media_timeout_secs: DEFAULT_MEDIA_TIMEOUT_SECS,
        }
    }
}

impl UpstreamSettings {
    pub fn listings_timeout(&self) -> Duration {
        Duration::from_secs(self.listings_timeout_secs)
    }

    pub fn media_timeout(&self) -> Duration {
        Duration::from_secs(self.media_timeout_secs)
    }
}

/// TTLs for the key-value cache tiers, in seconds.
///
/// Images churn less than metadata, so `image_ttl_secs > metadata_ttl_secs`;
/// the ETag outlives the data it validates, so `etag_ttl_secs` is longest.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub metadata_ttl_secs: u64,
    pub image_ttl_secs: u64,
    /// Per-id record entries; longer-lived than the snapshot they came from.
    pub record_ttl_secs: u64,
    pub etag_ttl_secs: u64,
    /// Derived featured-id read cache.
    pub featured_cache_ttl_secs: u64,
    /// Store-enforced floor for expiring writes (worker KV rejects lower).
    pub min_put_ttl_secs: u64,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            metadata_ttl_secs: DEFAULT_METADATA_TTL_SECS,
            image_ttl_secs: DEFAULT_IMAGE_TTL_SECS,
            record_ttl_secs: DEFAULT_RECORD_TTL_SECS,
            etag_ttl_secs: DEFAULT_ETAG_TTL_SECS,
            featured_cache_ttl_secs: DEFAULT_FEATURED_CACHE_TTL_SECS,
            min_put_ttl_secs: DEFAULT_MIN_PUT_TTL_SECS,
        }
    }
}

impl CacheSettings {
    /// Clamp a remaining-lifetime TTL to the store's accepted floor.
    pub fn clamp_put_ttl(&self, ttl_secs: u64) -> u64 {
        ttl_secs.max(self.min_put_ttl_secs)
    }
}

/// Featured-set cardinality bounds and backfill cadence.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FeaturedSettings {
    pub min_featured: usize,
    pub max_featured: usize,
    /// Delay between scheduling a backfill and it becoming due.
    pub backfill_delay_secs: u64,
    /// Extra store lifetime past `execute_at` before an unpolled job expires.
    pub backfill_ttl_buffer_secs: u64,
}

impl Default for FeaturedSettings {
    fn default() -> Self {
        Self {
            min_featured: DEFAULT_MIN_FEATURED,
            max_featured: DEFAULT_MAX_FEATURED,
            backfill_delay_secs: DEFAULT_BACKFILL_DELAY_SECS,
            backfill_ttl_buffer_secs: DEFAULT_BACKFILL_TTL_BUFFER_SECS,
        }
    }
}

/// Root settings, deserialized from an optional file plus `VETRINA__`
/// environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub upstream: UpstreamSettings,
    pub cache: CacheSettings,
    pub featured: FeaturedSettings,
}

impl Settings {
    /// Load settings from the given file (if any) layered under environment
    /// overrides, then validate cross-field invariants.
    pub fn load(config_file: Option<&str>) -> Result<Self, SettingsError> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::with_name(path));
        }
        let settings: Settings = builder
            .add_source(Environment::with_prefix(ENV_PREFIX).separator(ENV_SEPARATOR))
            .build()?
            .try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    fn validate(&self) -> Result<(), SettingsError> {
        if self.featured.min_featured > self.featured.max_featured {
            return Err(SettingsError::invalid(format!(
                "featured.min_featured ({}) exceeds featured.max_featured ({})",
                self.featured.min_featured, self.featured.max_featured
            )));
        }
        if self.cache.image_ttl_secs < self.cache.metadata_ttl_secs {
            return Err(SettingsError::invalid(
                "cache.image_ttl_secs must not be shorter than cache.metadata_ttl_secs",
            ));
        }
        if self.upstream.listings_timeout_secs == 0 {
            return Err(SettingsError::invalid(
                "upstream.listings_timeout_secs must be positive",
            ));
        }
        Ok(())
    }
}
