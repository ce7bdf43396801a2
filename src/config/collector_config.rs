//! Collector configuration structs with serde defaults.
//!
//! Every section and field carries `#[serde(default)]`, so a partial (or
//! empty) TOML file yields a complete config.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{info, warn};

use super::defaults::{
    MAX_MIN_AHEAD_MINUTES, MAX_SESSION_BACKOFF_MS, MAX_SUPPRESS_MINUTES, MAX_TOLERANCE_MS,
};

/// Environment variable naming the config file.
pub const CONFIG_ENV_VAR: &str = "AIOT_CONFIG";

/// Config file looked up in the working directory.
pub const LOCAL_CONFIG_FILE: &str = "collector.toml";

// ============================================================================
// Top-level config
// ============================================================================

/// Complete collector configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CollectorConfig {
    #[serde(default)]
    pub acquisition: AcquisitionConfig,

    #[serde(default)]
    pub prediction_cache: PredictionCacheConfig,

    #[serde(default)]
    pub predictor: PredictorConfig,

    #[serde(default)]
    pub alert: AlertConfig,

    #[serde(default)]
    pub storage: StorageConfig,

    #[serde(default)]
    pub registry: RegistryConfig,

    #[serde(default)]
    pub logging: LoggingConfig,
}

impl CollectorConfig {
    /// Load configuration using the standard search order.
    ///
    /// A file that fails to load or validate is logged and skipped; the
    /// search continues with the next candidate and ends at the defaults.
    pub fn load(cli_path: Option<&Path>) -> Self {
        // 1. --config flag
        if let Some(p) = cli_path {
            match Self::load_from_file(p) {
                Ok(config) => {
                    info!(path = %p.display(), "Loaded collector config from --config");
                    return config;
                }
                Err(e) => {
                    warn!(path = %p.display(), error = %e, "Failed to load --config file, falling back");
                }
            }
        }

        // 2. AIOT_CONFIG env var
        if let Ok(path) = std::env::var(CONFIG_ENV_VAR) {
            let p = PathBuf::from(&path);
            if p.exists() {
                match Self::load_from_file(&p) {
                    Ok(config) => {
                        info!(path = %p.display(), "Loaded collector config from {CONFIG_ENV_VAR}");
                        return config;
                    }
                    Err(e) => {
                        warn!(path = %p.display(), error = %e, "Failed to load config from {CONFIG_ENV_VAR}, falling back");
                    }
                }
            } else {
                warn!(path = %path, "{CONFIG_ENV_VAR} points to non-existent file, falling back");
            }
        }

        // 3. ./collector.toml
        let local = PathBuf::from(LOCAL_CONFIG_FILE);
        if local.exists() {
            match Self::load_from_file(&local) {
                Ok(config) => {
                    info!("Loaded collector config from ./{LOCAL_CONFIG_FILE}");
                    return config;
                }
                Err(e) => {
                    warn!(error = %e, "Failed to load ./{LOCAL_CONFIG_FILE}, using defaults");
                }
            }
        }

        // 4. Defaults
        info!("No collector.toml found, using built-in defaults");
        Self::default()
    }

    /// Load and validate a specific TOML file.
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::Io(path.to_path_buf(), e))?;
        Self::from_toml_str(&contents)
    }

    /// Parse and validate TOML text. Unknown keys are logged as warnings.
    pub fn from_toml_str(contents: &str) -> Result<Self, ConfigError> {
        for w in super::validation::validate_unknown_keys(contents) {
            warn!("{}", w);
        }

        let config: Self = toml::from_str(contents).map_err(|e| ConfigError::Parse(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Serialize to TOML (used to print the effective config).
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))
    }

    /// Check ranges and threshold escalation. All problems are collected.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        let a = &self.acquisition;
        if a.tick_period_ms == 0 {
            errors.push("acquisition.tick_period_ms must be > 0".to_string());
        }
        if a.operation_timeout_ms == 0 {
            errors.push("acquisition.operation_timeout_ms must be > 0".to_string());
        }
        if a.publishing_interval_ms == 0 {
            errors.push("acquisition.publishing_interval_ms must be > 0".to_string());
        }
        if a.session_backoff_ms > MAX_SESSION_BACKOFF_MS {
            errors.push(format!(
                "acquisition.session_backoff_ms = {} exceeds {MAX_SESSION_BACKOFF_MS}",
                a.session_backoff_ms
            ));
        }

        let c = &self.prediction_cache;
        if c.prefetch_interval_ms == 0 {
            errors.push("prediction_cache.prefetch_interval_ms must be > 0".to_string());
        }
        if c.tolerance_ms == 0 {
            errors.push("prediction_cache.tolerance_ms must be > 0".to_string());
        }
        if c.tolerance_ms > MAX_TOLERANCE_MS {
            errors.push(format!(
                "prediction_cache.tolerance_ms = {} exceeds {MAX_TOLERANCE_MS}",
                c.tolerance_ms
            ));
        }
        if c.min_ahead_minutes > MAX_MIN_AHEAD_MINUTES {
            errors.push(format!(
                "prediction_cache.min_ahead_minutes = {} exceeds {MAX_MIN_AHEAD_MINUTES}",
                c.min_ahead_minutes
            ));
        }
        if c.max_points_per_series == 0 {
            errors.push("prediction_cache.max_points_per_series must be > 0".to_string());
        }

        let p = &self.predictor;
        if p.prediction_length == 0 {
            errors.push("predictor.prediction_length must be > 0".to_string());
        }
        if p.history_length == 0 {
            errors.push("predictor.history_length must be > 0".to_string());
        }
        if p.kind == PredictorKind::Http && p.url.trim().is_empty() {
            errors.push("predictor.url must be set when predictor.kind = \"http\"".to_string());
        }

        let al = &self.alert;
        if al.scan_interval_ms == 0 {
            errors.push("alert.scan_interval_ms must be > 0".to_string());
        }
        if !(al.deviation_percent_threshold > 0.0) {
            errors.push(format!(
                "alert.deviation_percent_threshold = {} must be > 0",
                al.deviation_percent_threshold
            ));
        }
        if al.duplicate_suppress_minutes > MAX_SUPPRESS_MINUTES {
            errors.push(format!(
                "alert.duplicate_suppress_minutes = {} exceeds {MAX_SUPPRESS_MINUTES}",
                al.duplicate_suppress_minutes
            ));
        }
        if al.severity_high_percent < al.deviation_percent_threshold {
            errors.push(format!(
                "alert.severity_high_percent ({}) must be >= alert.deviation_percent_threshold ({})",
                al.severity_high_percent, al.deviation_percent_threshold
            ));
        }

        if self.storage.backend == StorageBackend::Sled && self.storage.path.trim().is_empty() {
            errors.push("storage.path must be set when storage.backend = \"sled\"".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }
}

// ============================================================================
// Errors
// ============================================================================

/// Errors that can occur when loading or validating config.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {0}: {1}")]
    Io(PathBuf, #[source] std::io::Error),
    #[error("TOML parse error: {0}")]
    Parse(String),
    #[error("TOML serialize error: {0}")]
    Serialize(String),
    #[error("validation failed:\n  - {}", .0.join("\n  - "))]
    Validation(Vec<String>),
}

// ============================================================================
// [acquisition]
// ============================================================================

/// Which acquisition strategy drives the devices.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CollectorStrategy {
    /// Server-pushed value changes over persistent subscriptions
    #[default]
    Subscription,
    /// One read of all measurement addresses per tick
    Polling,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcquisitionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default)]
    pub strategy: CollectorStrategy,

    /// Acquisition tick period (ms)
    #[serde(default = "default_tick_period_ms")]
    pub tick_period_ms: u64,

    /// Cooldown after a session/resource-limit error (ms)
    #[serde(default = "default_session_backoff_ms")]
    pub session_backoff_ms: u64,

    /// Upper bound on any single connect/subscribe/read call (ms)
    #[serde(default = "default_operation_timeout_ms")]
    pub operation_timeout_ms: u64,

    /// Per-session disconnect bound during shutdown (ms)
    #[serde(default = "default_shutdown_disconnect_timeout_ms")]
    pub shutdown_disconnect_timeout_ms: u64,

    /// Requested publishing interval for subscriptions (ms)
    #[serde(default = "default_publishing_interval_ms")]
    pub publishing_interval_ms: u64,

    /// Status text fragments that classify an error as a session/resource limit
    #[serde(default = "default_session_limit_markers")]
    pub session_limit_markers: Vec<String>,
}

fn default_true() -> bool {
    true
}
fn default_tick_period_ms() -> u64 {
    1_000
}
fn default_session_backoff_ms() -> u64 {
    30_000
}
fn default_operation_timeout_ms() -> u64 {
    5_000
}
fn default_shutdown_disconnect_timeout_ms() -> u64 {
    3_000
}
fn default_publishing_interval_ms() -> u64 {
    1_000
}
fn default_session_limit_markers() -> Vec<String> {
    vec![
        "Bad_TooManySessions".to_string(),
        "Bad_TooManySubscriptions".to_string(),
        "Bad_TooManyMonitoredItems".to_string(),
    ]
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: CollectorStrategy::default(),
            tick_period_ms: default_tick_period_ms(),
            session_backoff_ms: default_session_backoff_ms(),
            operation_timeout_ms: default_operation_timeout_ms(),
            shutdown_disconnect_timeout_ms: default_shutdown_disconnect_timeout_ms(),
            publishing_interval_ms: default_publishing_interval_ms(),
            session_limit_markers: default_session_limit_markers(),
        }
    }
}

impl AcquisitionConfig {
    pub fn tick_period(&self) -> Duration {
        Duration::from_millis(self.tick_period_ms)
    }

    /// Clamped to `MAX_SESSION_BACKOFF_MS`.
    pub fn session_backoff(&self) -> Duration {
        Duration::from_millis(self.session_backoff_ms.min(MAX_SESSION_BACKOFF_MS))
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.operation_timeout_ms)
    }

    pub fn shutdown_disconnect_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_disconnect_timeout_ms)
    }

    pub fn publishing_interval(&self) -> Duration {
        Duration::from_millis(self.publishing_interval_ms)
    }
}

// ============================================================================
// [prediction_cache]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionCacheConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Prefetch scheduler period (ms)
    #[serde(default = "default_prefetch_interval_ms")]
    pub prefetch_interval_ms: u64,

    /// Minimum forecast coverage ahead of now (minutes)
    #[serde(default = "default_min_ahead_minutes")]
    pub min_ahead_minutes: u64,

    /// Maximum distance between a query and a cached point (ms)
    #[serde(default = "default_tolerance_ms")]
    pub tolerance_ms: u64,

    /// Oldest points are evicted beyond this many per series
    #[serde(default = "default_max_points_per_series")]
    pub max_points_per_series: usize,
}

fn default_prefetch_interval_ms() -> u64 {
    30_000
}
fn default_min_ahead_minutes() -> u64 {
    2
}
fn default_tolerance_ms() -> u64 {
    30_000
}
fn default_max_points_per_series() -> usize {
    5_000
}

impl Default for PredictionCacheConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            prefetch_interval_ms: default_prefetch_interval_ms(),
            min_ahead_minutes: default_min_ahead_minutes(),
            tolerance_ms: default_tolerance_ms(),
            max_points_per_series: default_max_points_per_series(),
        }
    }
}

impl PredictionCacheConfig {
    pub fn prefetch_interval(&self) -> Duration {
        Duration::from_millis(self.prefetch_interval_ms)
    }

    /// Clamped to `MAX_TOLERANCE_MS`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn tolerance(&self) -> chrono::Duration {
        chrono::Duration::milliseconds(self.tolerance_ms.min(MAX_TOLERANCE_MS) as i64)
    }

    /// Clamped to `MAX_MIN_AHEAD_MINUTES`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn min_ahead(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.min_ahead_minutes.min(MAX_MIN_AHEAD_MINUTES) as i64)
    }
}

// ============================================================================
// [predictor]
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PredictorKind {
    /// Remote model server over HTTP
    #[default]
    Http,
    /// Local persistence forecast
    LastValue,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictorConfig {
    #[serde(default)]
    pub kind: PredictorKind,

    #[serde(default = "default_predictor_url")]
    pub url: String,

    /// Number of future points requested per forecast
    #[serde(default = "default_prediction_length")]
    pub prediction_length: usize,

    /// Number of stored points sent as model input
    #[serde(default = "default_history_length")]
    pub history_length: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
}

fn default_predictor_url() -> String {
    "http://localhost:50000/predict".to_string()
}
fn default_prediction_length() -> usize {
    60
}
fn default_history_length() -> usize {
    200
}
fn default_request_timeout_ms() -> u64 {
    10_000
}

impl Default for PredictorConfig {
    fn default() -> Self {
        Self {
            kind: PredictorKind::default(),
            url: default_predictor_url(),
            prediction_length: default_prediction_length(),
            history_length: default_history_length(),
            request_timeout_ms: default_request_timeout_ms(),
        }
    }
}

impl PredictorConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

// ============================================================================
// [alert]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertConfig {
    /// Global deviation alerting switch
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_scan_interval_ms")]
    pub scan_interval_ms: u64,

    /// |deviation| below this percentage never alerts
    #[serde(default = "default_deviation_percent_threshold")]
    pub deviation_percent_threshold: f64,

    /// |deviation| at or above this percentage is HIGH severity
    #[serde(default = "default_severity_high_percent")]
    pub severity_high_percent: f64,

    /// Pending alerts younger than this suppress new ones (minutes)
    #[serde(default = "default_duplicate_suppress_minutes")]
    pub duplicate_suppress_minutes: u64,
}

fn default_scan_interval_ms() -> u64 {
    60_000
}
fn default_deviation_percent_threshold() -> f64 {
    15.0
}
fn default_severity_high_percent() -> f64 {
    20.0
}
fn default_duplicate_suppress_minutes() -> u64 {
    5
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            scan_interval_ms: default_scan_interval_ms(),
            deviation_percent_threshold: default_deviation_percent_threshold(),
            severity_high_percent: default_severity_high_percent(),
            duplicate_suppress_minutes: default_duplicate_suppress_minutes(),
        }
    }
}

impl AlertConfig {
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.scan_interval_ms)
    }

    /// Clamped to `MAX_SUPPRESS_MINUTES`.
    #[allow(clippy::cast_possible_wrap)]
    pub fn suppression_window(&self) -> chrono::Duration {
        chrono::Duration::minutes(self.duplicate_suppress_minutes.min(MAX_SUPPRESS_MINUTES) as i64)
    }
}

// ============================================================================
// [storage]
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageBackend {
    #[default]
    Memory,
    Sled,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default)]
    pub backend: StorageBackend,

    /// sled database directory
    #[serde(default = "default_storage_path")]
    pub path: String,
}

fn default_storage_path() -> String {
    "./data/collector.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: StorageBackend::default(),
            path: default_storage_path(),
        }
    }
}

// ============================================================================
// [registry]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(default = "default_devices_file")]
    pub devices_file: String,

    /// Poll the devices file for changes
    #[serde(default = "default_true")]
    pub watch: bool,
}

fn default_devices_file() -> String {
    "devices.toml".to_string()
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            devices_file: default_devices_file(),
            watch: true,
        }
    }
}

// ============================================================================
// [logging]
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when RUST_LOG is not set
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Emit JSON lines instead of human-readable output
    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}
