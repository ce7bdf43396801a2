//! Config Validation Tests
//!
//! Unknown-key detection (typo warnings with suggestions) and range /
//! escalation validation of the collector configuration, exercised
//! independently from the rest of the collector.

use aiot_collector::config::validation::{
    known_config_keys, suggest_correction, validate_unknown_keys,
};
use aiot_collector::config::{
    CollectorConfig, CollectorStrategy, ConfigError, PredictorKind, StorageBackend,
};

// ============================================================================
// Typo Detection
// ============================================================================

#[test]
fn typo_in_cache_tolerance_warns_with_suggestion() {
    let toml_str = r#"
[prediction_cache]
tolerence_ms = 15000
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1, "Expected exactly 1 warning");
    assert!(warnings[0].field.contains("tolerence_ms"));
    assert_eq!(
        warnings[0].suggestion.as_deref(),
        Some("prediction_cache.tolerance_ms"),
        "Should suggest the correct spelling"
    );
}

#[test]
fn typo_in_alert_section_warns() {
    let toml_str = r#"
[alert]
enabeld = false
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert_eq!(warnings.len(), 1);
    assert_eq!(warnings[0].suggestion.as_deref(), Some("alert.enabled"));
}

#[test]
fn valid_config_produces_zero_warnings() {
    let toml_str = r#"
[acquisition]
enabled = true
strategy = "subscription"
tick_period_ms = 1000
session_backoff_ms = 30000
operation_timeout_ms = 5000
shutdown_disconnect_timeout_ms = 3000
publishing_interval_ms = 1000
session_limit_markers = ["Bad_TooManySessions"]

[prediction_cache]
enabled = true
prefetch_interval_ms = 30000
min_ahead_minutes = 2
tolerance_ms = 30000
max_points_per_series = 5000

[predictor]
kind = "http"
url = "http://models:50000/predict"
prediction_length = 60
history_length = 200
request_timeout_ms = 10000

[alert]
enabled = true
scan_interval_ms = 60000
deviation_percent_threshold = 15.0
severity_high_percent = 20.0
duplicate_suppress_minutes = 5

[storage]
backend = "sled"
path = "./data/collector.db"

[registry]
devices_file = "devices.toml"
watch = true

[logging]
level = "debug"
json = true
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert!(
        warnings.is_empty(),
        "Valid config should produce 0 warnings, got: {:?}",
        warnings.iter().map(|w| &w.field).collect::<Vec<_>>()
    );

    let config = CollectorConfig::from_toml_str(toml_str).expect("valid config");
    assert_eq!(config.storage.backend, StorageBackend::Sled);
    assert!(config.logging.json);
}

#[test]
fn unknown_section_warns() {
    let toml_str = r#"
[dashboard]
port = 8080
"#;
    let warnings = validate_unknown_keys(toml_str);
    assert!(warnings.iter().any(|w| w.field == "dashboard"));
    assert!(warnings.iter().any(|w| w.field == "dashboard.port"));
}

#[test]
fn unknown_keys_never_fail_loading() {
    let config = CollectorConfig::from_toml_str(
        r#"
[alert]
deviation_percent_treshold = 12.0
"#,
    )
    .expect("unknown keys are warnings only");
    // misspelled key is ignored, default stays
    assert!((config.alert.deviation_percent_threshold - 15.0).abs() < f64::EPSILON);
}

#[test]
fn far_off_keys_get_no_suggestion() {
    let known = known_config_keys();
    assert_eq!(suggest_correction("completely_unrelated_key", &known), None);
    assert_eq!(
        suggest_correction("predictor.histroy_length", &known).as_deref(),
        Some("predictor.history_length")
    );
}

#[test]
fn every_serialized_key_is_known() {
    let toml_str = CollectorConfig::default().to_toml().expect("serialize defaults");
    let warnings = validate_unknown_keys(&toml_str);
    assert!(
        warnings.is_empty(),
        "Default config should round through the key table, got: {:?}",
        warnings.iter().map(|w| &w.field).collect::<Vec<_>>()
    );
}

// ============================================================================
// Range Validation
// ============================================================================

#[test]
fn defaults_match_documented_values() {
    let config = CollectorConfig::default();
    assert!(config.validate().is_ok());
    assert_eq!(config.acquisition.strategy, CollectorStrategy::Subscription);
    assert_eq!(config.acquisition.session_backoff_ms, 30_000);
    assert_eq!(config.prediction_cache.tolerance_ms, 30_000);
    assert_eq!(config.prediction_cache.min_ahead_minutes, 2);
    assert_eq!(config.prediction_cache.max_points_per_series, 5_000);
    assert_eq!(config.predictor.kind, PredictorKind::Http);
    assert_eq!(config.alert.duplicate_suppress_minutes, 5);
    assert!((config.alert.severity_high_percent - 20.0).abs() < f64::EPSILON);
}

#[test]
fn severity_below_threshold_is_rejected() {
    let result = CollectorConfig::from_toml_str(
        r#"
[alert]
deviation_percent_threshold = 25.0
severity_high_percent = 20.0
"#,
    );
    match result {
        Err(ConfigError::Validation(errors)) => {
            assert_eq!(errors.len(), 1);
            assert!(errors[0].contains("severity_high_percent"));
        }
        other => panic!("expected validation error, got {other:?}"),
    }
}

#[test]
fn all_range_errors_are_collected() {
    let result = CollectorConfig::from_toml_str(
        r#"
[acquisition]
tick_period_ms = 0

[prediction_cache]
tolerance_ms = 0
max_points_per_series = 0

[predictor]
prediction_length = 0
"#,
    );
    let Err(ConfigError::Validation(errors)) = result else {
        panic!("expected validation errors");
    };
    assert_eq!(errors.len(), 4, "got: {errors:?}");
}

#[test]
fn unknown_enum_value_is_a_parse_error() {
    let result = CollectorConfig::from_toml_str(
        r#"
[acquisition]
strategy = "carrier_pigeon"
"#,
    );
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}

#[test]
fn load_from_file_reads_toml() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("collector.toml");
    std::fs::write(
        &path,
        r#"
[acquisition]
strategy = "polling"
tick_period_ms = 250
"#,
    )
    .expect("write config");

    let config = CollectorConfig::load_from_file(&path).expect("load");
    assert_eq!(config.acquisition.strategy, CollectorStrategy::Polling);
    assert_eq!(config.acquisition.tick_period_ms, 250);

    let missing = CollectorConfig::load_from_file(&dir.path().join("absent.toml"));
    assert!(matches!(missing, Err(ConfigError::Io(_, _))));
}

#[test]
fn explicit_path_wins_over_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("custom.toml");
    std::fs::write(&path, "[alert]\nscan_interval_ms = 5000\n").expect("write config");

    let config = CollectorConfig::load(Some(&path));
    assert_eq!(config.alert.scan_interval_ms, 5_000);
}

// ============================================================================
// Shipped Samples
// ============================================================================

#[test]
fn demo_files_load_cleanly() {
    let root = std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("demos");

    let raw = std::fs::read_to_string(root.join("collector.toml")).expect("read demo config");
    assert!(validate_unknown_keys(&raw).is_empty());
    let config = CollectorConfig::from_toml_str(&raw).expect("demo config is valid");
    assert_eq!(config.predictor.kind, PredictorKind::LastValue);

    let raw = std::fs::read_to_string(root.join("devices.toml")).expect("read demo devices");
    let devices = aiot_collector::registry::parse_devices(&raw).expect("demo devices parse");
    assert_eq!(devices.len(), 2);
    assert!(devices
        .iter()
        .flat_map(|d| &d.measurements)
        .all(|m| m.address.parse::<aiot_collector::acquisition::NodeAddress>().is_ok()));
}
