//! Configuration management for rescuelink.
//!
//! This module provides configuration loading and validation using figment,
//! supporting TOML config files, environment variables, and defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::alert::GeoPoint;
use crate::composer::ComposerConfig;
use crate::delivery::DeliveryConfig;
use crate::error::{Error, Result};
use crate::motion::{SamplerConfig, Sensitivity, SpeedConfig, Thresholds};
use crate::pipeline::PipelineConfig;
use crate::queue::DEFAULT_CAPACITY;

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "config.toml";

/// Default data directory name.
const DATA_DIR_NAME: &str = "rescuelink";

/// Default database file name.
const DATABASE_FILE_NAME: &str = "rescuelink.db";

/// Environment variable prefix. Nested keys are separated by `__`.
const ENV_PREFIX: &str = "RESCUELINK_";

/// Longest crash countdown accepted, in seconds.
const MAX_COUNTDOWN_SECS: u64 = 120;

/// Allowed remote collection names.
const COLLECTION_NAME_PATTERN: &str = r"^[A-Za-z0-9_-]{1,64}$";

/// Application configuration.
///
/// Configuration is loaded from (in order of precedence, highest first):
/// 1. Environment variables (prefixed with `RESCUELINK_`, `__` between levels)
/// 2. TOML config file at `~/.config/rescuelink/config.toml`
/// 3. Default values
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Crash detection tuning.
    pub detection: DetectionConfig,
    /// Remote delivery and local queues.
    pub delivery: DeliverySettings,
    /// Location lookup.
    pub location: LocationConfig,
    /// Fixed device profile used by the command line.
    pub device: DeviceConfig,
    /// Storage configuration.
    pub storage: StorageConfig,
}

/// Crash detection configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    /// Threshold profile: `low`, `medium` or `high`.
    pub sensitivity: Sensitivity,
    /// Override the profile's moderate threshold, in g.
    pub moderate_g: Option<f64>,
    /// Override the profile's severe threshold, in g.
    pub severe_g: Option<f64>,
    /// Minimum ground speed for crash classification, in km/h.
    pub min_speed_kmh: f64,
    /// Minimum time between two impact events, in milliseconds.
    pub cooldown_ms: u64,
    /// Seconds the user has to cancel a crash alert.
    pub countdown_secs: u64,
    /// Only detect crashes while in driving mode.
    pub require_driving_mode: bool,
    /// Number of speed readings averaged.
    pub speed_window: usize,
    /// Smoothed speed that turns driving mode on, in km/h.
    pub activation_kmh: f64,
    /// Smoothed speed below which driving mode turns off, in km/h.
    pub deactivation_kmh: f64,
}

/// Delivery configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliverySettings {
    /// Base URL of the remote document store. Unset means offline.
    pub endpoint: Option<String>,
    /// Destination chain for SOS alerts.
    pub sos_collections: Vec<String>,
    /// Destination chain for crash alerts.
    pub crash_collections: Vec<String>,
    /// Destination of location updates.
    pub updates_collection: String,
    /// Timeout of each remote write, in milliseconds.
    pub write_timeout_ms: u64,
    /// Entries kept per local queue.
    pub queue_capacity: usize,
    /// Send a missing location as zero coordinates instead of null.
    pub zero_fill_location: bool,
}

/// Location configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LocationConfig {
    /// Upper bound on waiting for a fix, in milliseconds.
    pub timeout_ms: u64,
    /// Use the last cached fix when no fresh one is available.
    pub fallback_to_last_known: bool,
}

/// Fixed device location.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Latitude in degrees.
    pub latitude: Option<f64>,
    /// Longitude in degrees.
    pub longitude: Option<f64>,
    /// Accuracy radius in meters.
    pub accuracy_m: f64,
}

/// Storage-related configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Path to the database file.
    /// Defaults to `~/.local/share/rescuelink/rescuelink.db`
    pub database_path: Option<PathBuf>,
}

impl Default for DetectionConfig {
    fn default() -> Self {
        let speed = SpeedConfig::default();
        Self {
            sensitivity: Sensitivity::Medium,
            moderate_g: None,
            severe_g: None,
            min_speed_kmh: 10.0,
            cooldown_ms: 5_000,
            countdown_secs: 10,
            require_driving_mode: true,
            speed_window: speed.window,
            activation_kmh: speed.activation_kmh,
            deactivation_kmh: speed.deactivation_kmh,
        }
    }
}

impl Default for DeliverySettings {
    fn default() -> Self {
        let delivery = DeliveryConfig::default();
        Self {
            endpoint: None,
            sos_collections: delivery.sos_collections,
            crash_collections: delivery.crash_collections,
            updates_collection: delivery.updates_collection,
            write_timeout_ms: 10_000,
            queue_capacity: DEFAULT_CAPACITY,
            zero_fill_location: true,
        }
    }
}

impl Default for LocationConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 5_000,
            fallback_to_last_known: false,
        }
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            latitude: None,
            longitude: None,
            accuracy_m: 10.0,
        }
    }
}

fn invalid(message: impl Into<String>) -> Error {
    Error::ConfigValidation {
        message: message.into(),
    }
}

impl Config {
    /// Load configuration from all sources.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load() -> Result<Self> {
        Self::load_from(None)
    }

    /// Load configuration with an optional custom config path.
    ///
    /// # Errors
    ///
    /// Returns an error if configuration loading, parsing or validation fails.
    pub fn load_from(config_path: Option<PathBuf>) -> Result<Self> {
        let config_file = config_path.unwrap_or_else(Self::default_config_path);

        let config: Config = Self::figment(&config_file).extract()?;
        config.validate()?;
        Ok(config)
    }

    fn figment(config_file: &Path) -> Figment {
        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(config_file))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Get the default configuration file path.
    #[must_use]
    pub fn default_config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from(".config"))
            .join(DATA_DIR_NAME)
            .join(CONFIG_FILE_NAME)
    }

    /// Get the default data directory path.
    #[must_use]
    pub fn default_data_dir() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from(".local/share"))
            .join(DATA_DIR_NAME)
    }

    /// Validate the configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if any configuration values are invalid.
    pub fn validate(&self) -> Result<()> {
        self.validate_detection()?;
        self.validate_delivery()?;

        if self.location.timeout_ms == 0 {
            return Err(invalid("location.timeout_ms must be greater than 0"));
        }

        match (self.device.latitude, self.device.longitude) {
            (Some(lat), Some(lon)) => {
                if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lon) {
                    return Err(invalid(format!(
                        "device location ({lat}, {lon}) is out of range"
                    )));
                }
            }
            (None, None) => {}
            _ => {
                return Err(invalid(
                    "device.latitude and device.longitude must be set together",
                ))
            }
        }
        if self.device.accuracy_m < 0.0 {
            return Err(invalid("device.accuracy_m cannot be negative"));
        }

        Ok(())
    }

    fn validate_detection(&self) -> Result<()> {
        let detection = &self.detection;
        let thresholds = self.thresholds();

        if thresholds.moderate_g <= 0.0 {
            return Err(invalid("moderate_g must be greater than 0"));
        }
        if thresholds.moderate_g >= thresholds.severe_g {
            return Err(invalid(format!(
                "moderate_g ({}) must be less than severe_g ({})",
                thresholds.moderate_g, thresholds.severe_g
            )));
        }
        if detection.min_speed_kmh < 0.0 {
            return Err(invalid("min_speed_kmh cannot be negative"));
        }
        if detection.cooldown_ms == 0 {
            return Err(invalid("cooldown_ms must be greater than 0"));
        }
        if detection.countdown_secs > MAX_COUNTDOWN_SECS {
            return Err(invalid(format!(
                "countdown_secs ({}) cannot exceed {MAX_COUNTDOWN_SECS}",
                detection.countdown_secs
            )));
        }
        if detection.speed_window == 0 {
            return Err(invalid("speed_window must be greater than 0"));
        }
        if detection.deactivation_kmh >= detection.activation_kmh {
            return Err(invalid(format!(
                "deactivation_kmh ({}) must be less than activation_kmh ({})",
                detection.deactivation_kmh, detection.activation_kmh
            )));
        }
        Ok(())
    }

    fn validate_delivery(&self) -> Result<()> {
        let delivery = &self.delivery;

        if let Some(endpoint) = &delivery.endpoint {
            if !(endpoint.starts_with("http://") || endpoint.starts_with("https://")) {
                return Err(invalid(format!(
                    "delivery.endpoint must be an http(s) URL: {endpoint}"
                )));
            }
        }
        if delivery.write_timeout_ms == 0 {
            return Err(invalid("write_timeout_ms must be greater than 0"));
        }
        if delivery.queue_capacity == 0 {
            return Err(invalid("queue_capacity must be greater than 0"));
        }

        let pattern = Regex::new(COLLECTION_NAME_PATTERN)
            .map_err(|e| Error::internal(format!("collection name pattern: {e}")))?;
        for (chain, names) in [
            ("sos_collections", &delivery.sos_collections),
            ("crash_collections", &delivery.crash_collections),
        ] {
            if names.is_empty() {
                return Err(invalid(format!("{chain} cannot be empty")));
            }
            if let Some(bad) = names.iter().find(|name| !pattern.is_match(name)) {
                return Err(invalid(format!("invalid collection name in {chain}: '{bad}'")));
            }
        }
        if !pattern.is_match(&delivery.updates_collection) {
            return Err(invalid(format!(
                "invalid updates_collection: '{}'",
                delivery.updates_collection
            )));
        }
        Ok(())
    }

    /// Replace the crash countdown and validate the result.
    ///
    /// # Errors
    ///
    /// Returns an error if the new countdown is out of range.
    pub fn with_countdown(mut self, countdown_secs: u64) -> Result<Self> {
        self.detection.countdown_secs = countdown_secs;
        self.validate()?;
        Ok(self)
    }

    /// Get the database path, resolving defaults if not set.
    #[must_use]
    pub fn database_path(&self) -> PathBuf {
        self.storage
            .database_path
            .clone()
            .unwrap_or_else(|| Self::default_data_dir().join(DATABASE_FILE_NAME))
    }

    /// Effective thresholds: the profile with any overrides applied.
    #[must_use]
    pub fn thresholds(&self) -> Thresholds {
        let profile = self.detection.sensitivity.thresholds();
        Thresholds {
            moderate_g: self.detection.moderate_g.unwrap_or(profile.moderate_g),
            severe_g: self.detection.severe_g.unwrap_or(profile.severe_g),
        }
    }

    /// Sampler tuning.
    #[must_use]
    pub fn sampler_config(&self) -> SamplerConfig {
        SamplerConfig {
            thresholds: self.thresholds(),
            min_speed_kmh: self.detection.min_speed_kmh,
            cooldown_ms: i64::try_from(self.detection.cooldown_ms).unwrap_or(i64::MAX),
        }
    }

    /// Speed tracker tuning.
    #[must_use]
    pub fn speed_config(&self) -> SpeedConfig {
        SpeedConfig {
            window: self.detection.speed_window,
            activation_kmh: self.detection.activation_kmh,
            deactivation_kmh: self.detection.deactivation_kmh,
        }
    }

    /// Pipeline tuning.
    #[must_use]
    pub fn pipeline_config(&self) -> PipelineConfig {
        PipelineConfig {
            sampler: self.sampler_config(),
            speed: self.speed_config(),
            require_driving_mode: self.detection.require_driving_mode,
            countdown: Duration::from_secs(self.detection.countdown_secs),
            ..PipelineConfig::default()
        }
    }

    /// Delivery tuning.
    #[must_use]
    pub fn delivery_config(&self) -> DeliveryConfig {
        DeliveryConfig {
            sos_collections: self.delivery.sos_collections.clone(),
            crash_collections: self.delivery.crash_collections.clone(),
            updates_collection: self.delivery.updates_collection.clone(),
            write_timeout: self.write_timeout(),
            queue_capacity: self.delivery.queue_capacity,
            zero_fill_location: self.delivery.zero_fill_location,
        }
    }

    /// Composer tuning.
    #[must_use]
    pub fn composer_config(&self) -> ComposerConfig {
        ComposerConfig {
            location_timeout: Duration::from_millis(self.location.timeout_ms),
            fallback_to_last_known: self.location.fallback_to_last_known,
        }
    }

    /// Get the remote write timeout as a Duration.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.delivery.write_timeout_ms)
    }

    /// The configured device location, if both coordinates are set.
    #[must_use]
    pub fn device_location(&self) -> Option<GeoPoint> {
        Some(GeoPoint {
            latitude: self.device.latitude?,
            longitude: self.device.longitude?,
            accuracy_meters: self.device.accuracy_m,
        })
    }
}
