//! Collector Configuration Module
//!
//! Provides the collector configuration loaded from a TOML file, covering
//! acquisition timing, prediction cache sizing, predictor endpoint, alert
//! thresholds, storage backend, device registry and logging.
//!
//! ## Loading Order
//!
//! 1. `--config <path>` on the command line
//! 2. `AIOT_CONFIG` environment variable (path to TOML file)
//! 3. `collector.toml` in the current working directory
//! 4. Built-in defaults
//!
//! ## Usage
//!
//! The binary calls `config::init()` once at startup. Library components take
//! their section struct by value so they can be built directly in tests:
//!
//! ```ignore
//! config::init(CollectorConfig::load(cli_path.as_deref()));
//! let cfg = config::get();
//! let cache = PredictionCache::new(cfg.prediction_cache.clone(), &cfg.predictor, predictor, series);
//! ```

mod collector_config;
pub mod defaults;
pub mod validation;

pub use collector_config::*;

use std::sync::OnceLock;

/// Global collector configuration, initialized once at startup.
static COLLECTOR_CONFIG: OnceLock<CollectorConfig> = OnceLock::new();

/// Initialize the global collector configuration.
///
/// A second call is ignored with a warning.
pub fn init(config: CollectorConfig) {
    if COLLECTOR_CONFIG.set(config).is_err() {
        tracing::warn!("config::init() called more than once, ignoring");
    }
}

/// Get a reference to the global collector configuration.
///
/// Falls back to built-in defaults if `init()` was never called.
pub fn get() -> &'static CollectorConfig {
    COLLECTOR_CONFIG.get_or_init(|| {
        tracing::warn!("config::get() called before config::init(), using defaults");
        CollectorConfig::default()
    })
}

/// Check whether the config has been initialized.
pub fn is_initialized() -> bool {
    COLLECTOR_CONFIG.get().is_some()
}
