use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::error::ConfigError;

/// Environment variable overriding `providers.weather_api.api_key`
pub const ENV_WEATHER_API_KEY: &str = "SKYCAST_WEATHERAPI_KEY";
/// Environment variable overriding `forecast.primary_max_duration_ms`
pub const ENV_PRIMARY_MAX_DURATION_MS: &str = "SKYCAST_PRIMARY_MAX_DURATION_MS";

/// Upper bound shared by the minute-based cache durations (one week)
const MAX_DURATION_MINUTES: u32 = 10_080;

/// Configuration validation errors
#[derive(Debug, Clone)]
pub struct ConfigValidationError {
    pub field: String,
    pub message: String,
}

impl std::fmt::Display for ConfigValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// Result of config validation
#[derive(Debug, Clone, Default)]
pub struct ValidationResult {
    pub errors: Vec<ConfigValidationError>,
    pub warnings: Vec<ConfigValidationError>,
}

impl ValidationResult {
    /// Returns true if there are no errors (warnings are OK)
    pub fn is_valid(&self) -> bool {
        self.errors.is_empty()
    }

    /// Add an error
    pub fn add_error(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.errors.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Add a warning
    pub fn add_warning(&mut self, field: impl Into<String>, message: impl Into<String>) {
        self.warnings.push(ConfigValidationError {
            field: field.into(),
            message: message.into(),
        });
    }

    /// Get a user-friendly message summarizing all errors
    pub fn error_summary(&self) -> String {
        if self.errors.is_empty() {
            return String::new();
        }
        self.errors
            .iter()
            .map(|e| e.to_string())
            .collect::<Vec<_>>()
            .join("; ")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Hedging and request deadlines
    #[serde(default)]
    pub forecast: ForecastConfig,

    /// Resilient cache policy
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream forecast providers
    #[serde(default)]
    pub providers: ProvidersConfig,

    /// "Forecast requested" side channel
    #[serde(default)]
    pub publisher: PublisherConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ForecastConfig {
    /// How long the primary provider may run before the next one is started
    #[serde(default = "default_primary_max_duration_ms")]
    pub primary_max_duration_ms: u64,

    /// Overall deadline for a single caller request
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_primary_max_duration_ms() -> u64 {
    150
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for ForecastConfig {
    fn default() -> Self {
        Self {
            primary_max_duration_ms: default_primary_max_duration_ms(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl ForecastConfig {
    pub fn primary_max_duration(&self) -> Duration {
        Duration::from_millis(self.primary_max_duration_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Entry time-to-live in minutes
    pub duration_minutes: u32,

    /// Serve expired entries when a refresh fails
    pub enable_fail_safe: bool,

    /// How long past creation an entry may still be served as stale
    pub fail_safe_max_duration_minutes: u32,

    /// Minimum spacing between refresh attempts for a stale key
    pub fail_safe_throttle_seconds: u32,

    /// How long a caller holding a stale value waits for its refresh (0 = no wait)
    pub factory_soft_timeout_ms: u64,

    /// Absolute ceiling for a factory call (0 = no ceiling)
    pub factory_hard_timeout_ms: u64,

    /// Fraction of the ttl after which a background refresh starts
    pub eager_refresh_threshold: f64,

    /// Maximum number of cached keys before least-recently-used eviction
    pub max_entries: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            duration_minutes: 30,
            enable_fail_safe: true,
            fail_safe_max_duration_minutes: 1440,
            fail_safe_throttle_seconds: 30,
            factory_soft_timeout_ms: 100,
            factory_hard_timeout_ms: 10_000,
            eager_refresh_threshold: 0.9,
            max_entries: 10_000,
        }
    }
}

impl CacheConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(u64::from(self.duration_minutes) * 60)
    }

    pub fn fail_safe_max_age(&self) -> Duration {
        Duration::from_secs(u64::from(self.fail_safe_max_duration_minutes) * 60)
    }

    pub fn fail_safe_throttle(&self) -> Duration {
        Duration::from_secs(u64::from(self.fail_safe_throttle_seconds))
    }

    pub fn factory_soft_timeout(&self) -> Duration {
        Duration::from_millis(self.factory_soft_timeout_ms)
    }

    pub fn factory_hard_timeout(&self) -> Duration {
        Duration::from_millis(self.factory_hard_timeout_ms)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProvidersConfig {
    /// Priority order of provider names; unknown or disabled names are skipped
    #[serde(default = "default_provider_order")]
    pub order: Vec<String>,

    #[serde(default)]
    pub open_meteo: OpenMeteoConfig,

    #[serde(default)]
    pub weather_api: WeatherApiConfig,
}

fn default_provider_order() -> Vec<String> {
    vec!["open_meteo".to_string(), "weather_api".to_string()]
}

impl Default for ProvidersConfig {
    fn default() -> Self {
        Self {
            order: default_provider_order(),
            open_meteo: OpenMeteoConfig::default(),
            weather_api: WeatherApiConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OpenMeteoConfig {
    pub enabled: bool,
    pub forecast_url: String,
    pub geocoding_url: String,
}

impl Default for OpenMeteoConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            forecast_url: "https://api.open-meteo.com".to_string(),
            geocoding_url: "https://geocoding-api.open-meteo.com".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WeatherApiConfig {
    pub enabled: bool,
    pub base_url: String,
    /// API key (optional here, can be set via environment)
    pub api_key: Option<String>,
}

impl Default for WeatherApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            base_url: "https://api.weatherapi.com".to_string(),
            api_key: None,
        }
    }
}

impl WeatherApiConfig {
    /// Check if an API key is present (not a placeholder)
    pub fn is_configured(&self) -> bool {
        self.api_key
            .as_deref()
            .is_some_and(|k| !k.is_empty() && !k.starts_with("YOUR_"))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PublisherConfig {
    /// Bounded queue size; events beyond it are dropped
    pub queue_capacity: usize,
    /// Optional HTTP endpoint receiving events as JSON; logged only when unset
    pub webhook_url: Option<String>,
    /// Per-event delivery timeout
    pub publish_timeout_ms: u64,
}

impl Default for PublisherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            webhook_url: None,
            publish_timeout_ms: 2_000,
        }
    }
}

impl PublisherConfig {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }
}

impl Config {
    /// Load configuration from the default location, creating it if it doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;
        Self::load_or_create(&config_path)
    }

    /// Load `path`, writing the defaults there first if it doesn't exist
    ///
    /// Environment overrides only touch the returned value, never the file.
    pub fn load_or_create(path: &Path) -> Result<Self> {
        Self::load_or_create_with(path, env_var)
    }

    fn load_or_create_with(path: &Path, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if !path.exists() {
            tracing::info!("Writing default config to {}", path.display());
            Self::default().save_to(path)?;
        }
        Ok(Self::read_file(path)?.with_overrides(lookup))
    }

    /// Load configuration from an explicit file and apply environment overrides
    pub fn load_from(path: &Path) -> Result<Self> {
        Ok(Self::read_file(path)?.with_env_overrides())
    }

    fn read_file(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;

        let config: Config = toml::from_str(&contents).map_err(|e| ConfigError::Malformed {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        Ok(config)
    }

    /// Load configuration and validate it
    ///
    /// Returns the config along with any validation warnings.
    /// Returns an error if validation fails with critical errors.
    pub fn load_validated(path: Option<&Path>) -> Result<(Self, ValidationResult)> {
        let config = match path {
            Some(p) => Self::load_from(p)?,
            None => Self::load()?,
        };
        let validation = config.validate();

        if !validation.is_valid() {
            return Err(ConfigError::Rejected(validation.error_summary()).into());
        }

        for warning in &validation.warnings {
            tracing::warn!("Config warning: {}", warning);
        }

        Ok((config, validation))
    }

    /// Apply `SKYCAST_*` environment overrides
    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(env_var)
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(key) = lookup(ENV_WEATHER_API_KEY) {
            if !key.is_empty() {
                tracing::debug!("Using WeatherAPI key from {}", ENV_WEATHER_API_KEY);
                self.providers.weather_api.api_key = Some(key);
            }
        }

        if let Some(raw) = lookup(ENV_PRIMARY_MAX_DURATION_MS) {
            match raw.parse::<u64>() {
                Ok(ms) => self.forecast.primary_max_duration_ms = ms,
                Err(e) => tracing::warn!(
                    "Ignoring {}={:?}: {}",
                    ENV_PRIMARY_MAX_DURATION_MS,
                    raw,
                    e
                ),
            }
        }

        self
    }

    /// Validate the configuration
    ///
    /// Returns a ValidationResult containing any errors or warnings.
    pub fn validate(&self) -> ValidationResult {
        let mut result = ValidationResult::default();

        let primary = self.forecast.primary_max_duration_ms;
        if !(1..=1000).contains(&primary) {
            result.add_error(
                "forecast.primary_max_duration_ms",
                format!("Must be between 1 and 1000, got {}", primary),
            );
        }

        if self.forecast.request_timeout_ms == 0 {
            result.add_error(
                "forecast.request_timeout_ms",
                "Request timeout must be greater than 0",
            );
        } else if self.forecast.request_timeout_ms <= primary {
            result.add_warning(
                "forecast.request_timeout_ms",
                "Request timeout is shorter than the primary max duration; hedging never starts",
            );
        }

        self.validate_cache(&mut result);
        self.validate_providers(&mut result);

        if self.publisher.queue_capacity == 0 {
            result.add_error("publisher.queue_capacity", "Queue capacity must be greater than 0");
        }
        if let Some(url) = &self.publisher.webhook_url {
            self.validate_url(url, "publisher.webhook_url", &mut result);
        }

        result
    }

    fn validate_cache(&self, result: &mut ValidationResult) {
        let cache = &self.cache;

        if cache.duration_minutes > MAX_DURATION_MINUTES {
            result.add_error(
                "cache.duration_minutes",
                format!("Must be at most {}", MAX_DURATION_MINUTES),
            );
        } else if cache.duration_minutes == 0 {
            result.add_warning("cache.duration_minutes", "Caching disabled (0 minutes)");
        }

        if cache.fail_safe_max_duration_minutes > MAX_DURATION_MINUTES {
            result.add_error(
                "cache.fail_safe_max_duration_minutes",
                format!("Must be at most {}", MAX_DURATION_MINUTES),
            );
        } else if cache.enable_fail_safe
            && cache.fail_safe_max_duration_minutes <= cache.duration_minutes
        {
            result.add_warning(
                "cache.fail_safe_max_duration_minutes",
                "Fail-safe window does not extend past the ttl; stale values are never served",
            );
        }

        if cache.fail_safe_throttle_seconds > 60 {
            result.add_error("cache.fail_safe_throttle_seconds", "Must be at most 60");
        }

        if cache.factory_soft_timeout_ms > 60_000 {
            result.add_error("cache.factory_soft_timeout_ms", "Must be at most 60000");
        }

        if cache.factory_hard_timeout_ms > 300_000 {
            result.add_error("cache.factory_hard_timeout_ms", "Must be at most 300000");
        } else if cache.factory_hard_timeout_ms == 0 {
            result.add_warning(
                "cache.factory_hard_timeout_ms",
                "No hard timeout; background refreshes may run indefinitely",
            );
        }

        if !(0.0..=1.0).contains(&cache.eager_refresh_threshold) {
            result.add_error(
                "cache.eager_refresh_threshold",
                format!("Must be between 0.0 and 1.0, got {}", cache.eager_refresh_threshold),
            );
        }

        if cache.max_entries == 0 {
            result.add_error("cache.max_entries", "Must be greater than 0");
        }
    }

    fn validate_providers(&self, result: &mut ValidationResult) {
        let providers = &self.providers;

        if providers.open_meteo.enabled {
            self.validate_url(
                &providers.open_meteo.forecast_url,
                "providers.open_meteo.forecast_url",
                result,
            );
            self.validate_url(
                &providers.open_meteo.geocoding_url,
                "providers.open_meteo.geocoding_url",
                result,
            );
        }

        if providers.weather_api.enabled {
            self.validate_url(
                &providers.weather_api.base_url,
                "providers.weather_api.base_url",
                result,
            );
            if !providers.weather_api.is_configured() {
                result.add_warning(
                    "providers.weather_api.api_key",
                    "WeatherAPI key not configured - provider will be skipped",
                );
            }
        }

        for name in &providers.order {
            if name != "open_meteo" && name != "weather_api" {
                result.add_error("providers.order", format!("Unknown provider: {}", name));
            }
        }

        if self.enabled_provider_names().is_empty() {
            result.add_error("providers", "At least one provider must be enabled");
        }
    }

    /// Provider names in priority order, limited to enabled and usable providers
    pub fn enabled_provider_names(&self) -> Vec<&str> {
        let mut seen = Vec::new();
        for name in &self.providers.order {
            let usable = match name.as_str() {
                "open_meteo" => self.providers.open_meteo.enabled,
                "weather_api" => {
                    self.providers.weather_api.enabled && self.providers.weather_api.is_configured()
                }
                _ => false,
            };
            if usable && !seen.contains(&name.as_str()) {
                seen.push(name.as_str());
            }
        }
        seen
    }

    /// Validate a URL field
    fn validate_url(&self, url_str: &str, field_name: &str, result: &mut ValidationResult) {
        match Url::parse(url_str) {
            Ok(url) => {
                if url.scheme() != "http" && url.scheme() != "https" {
                    result.add_error(
                        field_name,
                        format!("URL must use http or https scheme, got: {}", url.scheme()),
                    );
                }

                if url.host().is_none() {
                    result.add_error(field_name, "URL must have a host");
                }

                if url.port() == Some(0) {
                    result.add_error(field_name, "Port cannot be 0");
                }
            }
            Err(e) => {
                result.add_error(field_name, format!("Invalid URL: {}", e));
            }
        }
    }

    /// Save configuration to a file
    pub fn save_to(&self, config_path: &Path) -> Result<()> {
        if let Some(parent) = config_path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create config directory")?;
        }

        let contents = toml::to_string_pretty(self).context("Failed to serialize config")?;

        std::fs::write(config_path, contents).context("Failed to write config file")?;

        Ok(())
    }

    /// Get the path to the configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .context("Failed to get config directory")?
            .join("skycast");

        Ok(config_dir.join("config.toml"))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok()
}
