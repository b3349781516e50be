//! # Configuration Module
//!
//! Handles loading and validating configuration from TOML files.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::consent::RepromptPolicy;
use crate::error::ConfigError;

/// Main configuration structure
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub consent: ConsentConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub buffer: BufferConfig,
    #[serde(default)]
    pub delivery: DeliveryConfig,
    #[serde(default)]
    pub diagnostics: DiagnosticsConfig,
    #[serde(default)]
    pub simulation: SimulationConfig,
}

/// Local state configuration
#[derive(Debug, Deserialize, Clone)]
pub struct StorageConfig {
    #[serde(default = "default_data_dir")]
    pub data_dir: String,
}

/// Consent configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ConsentConfig {
    /// Version of the consent agreement presented to users
    #[serde(default = "default_consent_version")]
    pub consent_version: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_reprompt_policy")]
    pub reprompt_policy: RepromptPolicy,
}

/// Device capture configuration
#[derive(Debug, Deserialize, Clone)]
pub struct CaptureConfig {
    #[serde(default = "default_enabled")]
    pub enable_location: bool,

    #[serde(default = "default_enabled")]
    pub enable_camera: bool,

    #[serde(default = "default_enabled")]
    pub high_accuracy: bool,

    #[serde(default = "default_location_timeout_ms")]
    pub location_timeout_ms: u64,

    #[serde(default)]
    pub location_max_age_ms: u64,

    #[serde(default = "default_camera_timeout_ms")]
    pub camera_timeout_ms: u64,

    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: f32,

    /// Also capture the back camera when more than one video input exists
    #[serde(default = "default_enabled")]
    pub capture_back_camera: bool,
}

/// Capture schedule configuration
#[derive(Debug, Deserialize, Clone)]
pub struct ScheduleConfig {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    #[serde(default = "default_enabled")]
    pub run_immediately: bool,
}

/// Event buffer configuration
#[derive(Debug, Deserialize, Clone)]
pub struct BufferConfig {
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    #[serde(default = "default_compact_after_ops")]
    pub compact_after_ops: usize,
}

/// Delivery configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DeliveryConfig {
    #[serde(default = "default_endpoint_url")]
    pub endpoint_url: String,

    /// Environment variable holding the bearer token, if any
    #[serde(default = "default_api_token_env")]
    pub api_token_env: String,

    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_max_retries")]
    pub max_retries: u32,

    #[serde(default = "default_base_backoff_ms")]
    pub base_backoff_ms: u64,

    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,

    #[serde(default = "default_enabled")]
    pub drain_after_capture: bool,
}

/// Diagnostics log configuration
#[derive(Debug, Deserialize, Clone)]
pub struct DiagnosticsConfig {
    #[serde(default = "default_enabled")]
    pub enabled: bool,

    #[serde(default = "default_log_dir")]
    pub log_dir: String,

    #[serde(default = "default_max_records_per_file")]
    pub max_records_per_file: usize,

    #[serde(default = "default_max_files_to_keep")]
    pub max_files_to_keep: usize,

    #[serde(default = "default_max_in_memory")]
    pub max_in_memory: usize,
}

/// Simulated device platform used by the host binary
#[derive(Debug, Deserialize, Clone)]
pub struct SimulationConfig {
    #[serde(default = "default_latitude")]
    pub latitude: f64,

    #[serde(default = "default_longitude")]
    pub longitude: f64,

    #[serde(default = "default_video_inputs")]
    pub video_inputs: usize,
}

// Default value functions
fn default_data_dir() -> String { "./data".to_string() }

fn default_consent_version() -> String { "2024-01".to_string() }
fn default_app_version() -> String { env!("CARGO_PKG_VERSION").to_string() }
fn default_reprompt_policy() -> RepromptPolicy { RepromptPolicy::OncePerAppVersion }

fn default_enabled() -> bool { true }
fn default_location_timeout_ms() -> u64 { 15000 }
fn default_camera_timeout_ms() -> u64 { 10000 }
fn default_jpeg_quality() -> f32 { 0.8 }

fn default_interval_ms() -> u64 { 60000 }

fn default_capacity() -> usize { 1000 }
fn default_compact_after_ops() -> usize { 500 }

fn default_endpoint_url() -> String { "http://localhost:8080".to_string() }
fn default_api_token_env() -> String { "CONSENT_CAPTURE_API_TOKEN".to_string() }
fn default_batch_size() -> usize { 50 }
fn default_request_timeout_ms() -> u64 { 10000 }
fn default_max_retries() -> u32 { 5 }
fn default_base_backoff_ms() -> u64 { 1000 }
fn default_max_backoff_ms() -> u64 { 300000 }

fn default_log_dir() -> String { "./logs".to_string() }
fn default_max_records_per_file() -> usize { 10000 }
fn default_max_files_to_keep() -> usize { 10 }
fn default_max_in_memory() -> usize { 500 }

fn default_latitude() -> f64 { 52.520008 }
fn default_longitude() -> f64 { 13.404954 }
fn default_video_inputs() -> usize { 2 }

impl Default for StorageConfig {
    fn default() -> Self {
        Self { data_dir: default_data_dir() }
    }
}

impl Default for ConsentConfig {
    fn default() -> Self {
        Self {
            consent_version: default_consent_version(),
            app_version: default_app_version(),
            reprompt_policy: default_reprompt_policy(),
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            enable_location: default_enabled(),
            enable_camera: default_enabled(),
            high_accuracy: default_enabled(),
            location_timeout_ms: default_location_timeout_ms(),
            location_max_age_ms: 0,
            camera_timeout_ms: default_camera_timeout_ms(),
            jpeg_quality: default_jpeg_quality(),
            capture_back_camera: default_enabled(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            run_immediately: default_enabled(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            compact_after_ops: default_compact_after_ops(),
        }
    }
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        Self {
            endpoint_url: default_endpoint_url(),
            api_token_env: default_api_token_env(),
            batch_size: default_batch_size(),
            request_timeout_ms: default_request_timeout_ms(),
            max_retries: default_max_retries(),
            base_backoff_ms: default_base_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            drain_after_capture: default_enabled(),
        }
    }
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled(),
            log_dir: default_log_dir(),
            max_records_per_file: default_max_records_per_file(),
            max_files_to_keep: default_max_files_to_keep(),
            max_in_memory: default_max_in_memory(),
        }
    }
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            latitude: default_latitude(),
            longitude: default_longitude(),
            video_inputs: default_video_inputs(),
        }
    }
}

impl Config {
    /// Load configuration from a TOML file
    ///
    /// # Arguments
    ///
    /// * `path` - Path to the configuration file
    ///
    /// # Returns
    ///
    /// * `Result<Config>` - Loaded and validated configuration
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - File cannot be read
    /// - TOML parsing fails
    /// - Validation fails
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use consent_capture::config::Config;
    ///
    /// let config = Config::load("config/default.toml")?;
    /// # Ok::<(), Box<dyn std::error::Error>>(())
    /// ```
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse and validate configuration from a TOML string
    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Validate configuration values
    ///
    /// # Errors
    ///
    /// Returns error if any configuration value is out of valid range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.storage.data_dir.is_empty() {
            return Err(invalid("data_dir cannot be empty"));
        }

        // Validate consent configuration
        if self.consent.consent_version.is_empty() {
            return Err(invalid("consent_version cannot be empty"));
        }

        if self.consent.app_version.is_empty() {
            return Err(invalid("app_version cannot be empty"));
        }

        // Validate capture timing fields
        if self.capture.location_timeout_ms == 0 || self.capture.location_timeout_ms > 60000 {
            return Err(invalid("location_timeout_ms must be between 1 and 60000"));
        }

        if self.capture.location_max_age_ms > 3_600_000 {
            return Err(invalid("location_max_age_ms must be at most 3600000"));
        }

        if self.capture.camera_timeout_ms == 0 || self.capture.camera_timeout_ms > 60000 {
            return Err(invalid("camera_timeout_ms must be between 1 and 60000"));
        }

        if self.capture.jpeg_quality <= 0.0 || self.capture.jpeg_quality > 1.0 {
            return Err(invalid("jpeg_quality must be greater than 0.0 and at most 1.0"));
        }

        if self.schedule.interval_ms == 0 || self.schedule.interval_ms > 86_400_000 {
            return Err(invalid("interval_ms must be between 1 and 86400000"));
        }

        // Validate buffer limits
        if self.buffer.capacity == 0 {
            return Err(invalid("buffer capacity must be greater than 0"));
        }

        if self.buffer.compact_after_ops == 0 {
            return Err(invalid("compact_after_ops must be greater than 0"));
        }

        // Validate delivery configuration
        if !self.delivery.endpoint_url.starts_with("http://")
            && !self.delivery.endpoint_url.starts_with("https://")
        {
            return Err(invalid("endpoint_url must start with http:// or https://"));
        }

        if self.delivery.batch_size == 0 || self.delivery.batch_size > 500 {
            return Err(invalid("batch_size must be between 1 and 500"));
        }

        if self.delivery.request_timeout_ms == 0 || self.delivery.request_timeout_ms > 120000 {
            return Err(invalid("request_timeout_ms must be between 1 and 120000"));
        }

        if self.delivery.max_retries > 100 {
            return Err(invalid("max_retries must be at most 100"));
        }

        if self.delivery.base_backoff_ms == 0 {
            return Err(invalid("base_backoff_ms must be greater than 0"));
        }

        if self.delivery.max_backoff_ms < self.delivery.base_backoff_ms {
            return Err(invalid("max_backoff_ms must be at least base_backoff_ms"));
        }

        // Validate diagnostics configuration
        if self.diagnostics.enabled && self.diagnostics.log_dir.is_empty() {
            return Err(invalid("diagnostics log_dir cannot be empty when enabled"));
        }

        if self.diagnostics.max_records_per_file == 0 {
            return Err(invalid("max_records_per_file must be greater than 0"));
        }

        if self.diagnostics.max_files_to_keep == 0 {
            return Err(invalid("max_files_to_keep must be greater than 0"));
        }

        if self.diagnostics.max_in_memory == 0 {
            return Err(invalid("max_in_memory must be greater than 0"));
        }

        if !(-90.0..=90.0).contains(&self.simulation.latitude) {
            return Err(invalid("simulated latitude must be between -90 and 90"));
        }

        if !(-180.0..=180.0).contains(&self.simulation.longitude) {
            return Err(invalid("simulated longitude must be between -180 and 180"));
        }

        Ok(())
    }
}

fn invalid(message: &str) -> ConfigError {
    ConfigError::Invalid(message.to_string())
}
