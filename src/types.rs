//! Shared data structures for telemetry acquisition and deviation alerting
//!
//! This module defines the core types that flow between subsystems:
//! - Device / Measurement: what the registry hands to the acquisition engine
//! - TagValue / DataPoint: what the acquisition engine hands to storage
//! - Forecast / PredictionPoint: what the predictor hands to the prediction cache
//! - Alert: what the deviation scanner persists for operators

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Device identifier (assigned by the management surface).
pub type DeviceId = u64;

/// Measurement (tag) identifier, unique across devices.
pub type MeasurementId = u64;

// ============================================================================
// Devices & Measurements
// ============================================================================

/// Protocol connection descriptor for a device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionDescriptor {
    /// Endpoint URL, e.g. `opc.tcp://10.0.0.5:4840/server` or `sim://press-1`
    pub endpoint: String,

    /// Security policy name (`None`, `Basic256Sha256`, ...)
    #[serde(default = "default_security_policy")]
    pub security_policy: String,

    /// Optional user name for user/password identity tokens
    #[serde(default)]
    pub username: Option<String>,

    /// Optional password for user/password identity tokens
    #[serde(default, skip_serializing)]
    pub password: Option<String>,
}

fn default_security_policy() -> String {
    "None".to_string()
}

impl ConnectionDescriptor {
    pub fn new(endpoint: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            security_policy: default_security_policy(),
            username: None,
            password: None,
        }
    }
}

/// A single addressable value exposed by a device (a.k.a. tag).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Measurement {
    pub id: MeasurementId,
    /// Owning device; filled in by the registry when loading nested config
    #[serde(default)]
    pub device_id: DeviceId,
    pub name: String,
    /// Protocol address expression, e.g. `ns=2;s=Line1.Temperature`
    pub address: String,
}

/// A remote controller with its ordered set of measurements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub name: String,
    #[serde(flatten)]
    pub connection: ConnectionDescriptor,
    #[serde(default)]
    pub measurements: Vec<Measurement>,
}

impl Device {
    pub fn new(id: DeviceId, name: &str, endpoint: &str) -> Self {
        Self {
            id,
            name: name.to_string(),
            connection: ConnectionDescriptor::new(endpoint),
            measurements: Vec::new(),
        }
    }

    /// Builder-style helper to attach a measurement.
    pub fn with_measurement(mut self, id: MeasurementId, name: &str, address: &str) -> Self {
        self.measurements.push(Measurement {
            id,
            device_id: self.id,
            name: name.to_string(),
            address: address.to_string(),
        });
        self
    }

    pub fn measurement(&self, id: MeasurementId) -> Option<&Measurement> {
        self.measurements.iter().find(|m| m.id == id)
    }
}

// ============================================================================
// Values
// ============================================================================

/// Dynamically typed protocol value.
///
/// Only the numeric interpretation (`as_f64`) participates in forecasting and
/// alerting; every other shape converts to NaN instead of failing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TagValue {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    Text(String),
    Array(Vec<TagValue>),
}

impl TagValue {
    /// Total numeric conversion. Returns NaN for anything without a finite
    /// numeric reading.
    pub fn as_f64(&self) -> f64 {
        match self {
            TagValue::Null => f64::NAN,
            TagValue::Bool(b) => {
                if *b {
                    1.0
                } else {
                    0.0
                }
            }
            #[allow(clippy::cast_precision_loss)]
            TagValue::Int(i) => *i as f64,
            TagValue::Float(f) => finite_or_nan(*f),
            TagValue::Text(s) => parse_numeric_text(s),
            TagValue::Array(items) => items.first().map_or(f64::NAN, TagValue::as_f64),
        }
    }

    /// True when the value has a finite numeric reading.
    pub fn is_numeric(&self) -> bool {
        self.as_f64().is_finite()
    }
}

impl std::fmt::Display for TagValue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TagValue::Null => write!(f, "null"),
            TagValue::Bool(b) => write!(f, "{b}"),
            TagValue::Int(i) => write!(f, "{i}"),
            TagValue::Float(v) => write!(f, "{v}"),
            TagValue::Text(s) => write!(f, "{s}"),
            TagValue::Array(items) => write!(f, "[{} items]", items.len()),
        }
    }
}

impl From<f64> for TagValue {
    fn from(v: f64) -> Self {
        TagValue::Float(v)
    }
}

impl From<i64> for TagValue {
    fn from(v: i64) -> Self {
        TagValue::Int(v)
    }
}

impl From<bool> for TagValue {
    fn from(v: bool) -> Self {
        TagValue::Bool(v)
    }
}

impl From<&str> for TagValue {
    fn from(v: &str) -> Self {
        TagValue::Text(v.to_string())
    }
}

fn finite_or_nan(v: f64) -> f64 {
    if v.is_finite() {
        v
    } else {
        f64::NAN
    }
}

/// Parse operator-entered or device-formatted text: thousands separators are
/// dropped, a trailing `%` scales by 1/100, and trailing units are ignored.
fn parse_numeric_text(raw: &str) -> f64 {
    let trimmed = raw.trim();
    if trimmed.is_empty() {
        return f64::NAN;
    }
    let cleaned = trimmed.replace(',', "");

    if let Some(pct) = cleaned.strip_suffix('%') {
        return pct
            .trim()
            .parse::<f64>()
            .map_or(f64::NAN, |v| finite_or_nan(v / 100.0));
    }

    if let Ok(v) = cleaned.parse::<f64>() {
        return finite_or_nan(v);
    }

    // Leading numeric prefix, e.g. "123.45degC"
    let mut end = 0;
    let mut dot_seen = false;
    for (i, c) in cleaned.char_indices() {
        let accept = c.is_ascii_digit()
            || (c == '.' && !dot_seen)
            || ((c == '+' || c == '-') && i == 0);
        if !accept {
            break;
        }
        if c == '.' {
            dot_seen = true;
        }
        end = i + c.len_utf8();
    }
    cleaned[..end].parse::<f64>().map_or(f64::NAN, finite_or_nan)
}

/// The atomic unit persisted to storage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataPoint {
    pub device_id: DeviceId,
    pub measurement_id: MeasurementId,
    pub value: TagValue,
    /// Source timestamp from the device, or wall-clock receipt time
    pub timestamp: DateTime<Utc>,
}

impl DataPoint {
    pub fn new(
        device_id: DeviceId,
        measurement_id: MeasurementId,
        value: impl Into<TagValue>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            device_id,
            measurement_id,
            value: value.into(),
            timestamp,
        }
    }
}

// ============================================================================
// Forecasts
// ============================================================================

/// One predicted value at one instant.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PredictionPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
}

/// Forecast series as returned by a predictor: parallel timestamp/value arrays.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Forecast {
    pub timestamps: Vec<DateTime<Utc>>,
    pub values: Vec<f64>,
}

impl Forecast {
    pub fn from_points(points: &[PredictionPoint]) -> Self {
        Self {
            timestamps: points.iter().map(|p| p.timestamp).collect(),
            values: points.iter().map(|p| p.value).collect(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.timestamps.is_empty() || self.values.is_empty()
    }

    /// Zip into points. `None` when the arrays disagree in length.
    pub fn points(&self) -> Option<Vec<PredictionPoint>> {
        if self.timestamps.len() != self.values.len() {
            return None;
        }
        Some(
            self.timestamps
                .iter()
                .zip(&self.values)
                .map(|(&timestamp, &value)| PredictionPoint { timestamp, value })
                .collect(),
        )
    }
}

// ============================================================================
// Alerts
// ============================================================================

/// Alert type classifier, part of the duplicate-suppression signature.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertType {
    Deviation,
    Threshold,
}

impl AlertType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertType::Deviation => "DEVIATION",
            AlertType::Threshold => "THRESHOLD",
        }
    }
}

impl std::fmt::Display for AlertType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Alert severity. Ordering follows urgency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlertSeverity {
    Low,
    Medium,
    High,
}

impl AlertSeverity {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertSeverity::Low => "LOW",
            AlertSeverity::Medium => "MEDIUM",
            AlertSeverity::High => "HIGH",
        }
    }
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A persisted deviation (or threshold) alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    /// Assigned by the alert store on insert (0 until then)
    pub id: u64,
    pub device_id: DeviceId,
    pub measurement_id: MeasurementId,
    pub alert_type: AlertType,
    pub severity: AlertSeverity,
    pub message: String,
    pub actual_value: f64,
    pub predicted_base_value: f64,
    pub deviation_percent: f64,
    pub created_at: DateTime<Utc>,
    pub acknowledged: bool,
    pub acknowledged_at: Option<DateTime<Utc>>,
    pub ignored: bool,
    pub ignored_at: Option<DateTime<Utc>>,
    /// `device:measurement:TYPE`, used for duplicate suppression
    pub signature: String,
}

impl Alert {
    /// Neither acknowledged nor ignored.
    pub fn is_pending(&self) -> bool {
        !self.acknowledged && !self.ignored
    }
}

/// Operator action that ends an alert's pending state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposal {
    Acknowledge,
    Ignore,
}

impl Disposal {
    /// Stamp the flag and time unless already set. Returns whether the
    /// alert changed.
    pub fn apply(self, alert: &mut Alert, at: DateTime<Utc>) -> bool {
        match self {
            Disposal::Acknowledge if !alert.acknowledged => {
                alert.acknowledged = true;
                alert.acknowledged_at = Some(at);
                true
            }
            Disposal::Ignore if !alert.ignored => {
                alert.ignored = true;
                alert.ignored_at = Some(at);
                true
            }
            _ => false,
        }
    }
}

/// Build the duplicate-suppression signature for an alert.
pub fn alert_signature(
    device_id: DeviceId,
    measurement_id: MeasurementId,
    alert_type: AlertType,
) -> String {
    format!("{device_id}:{measurement_id}:{alert_type}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_conversion_is_total() {
        assert_eq!(TagValue::Float(3.5).as_f64(), 3.5);
        assert_eq!(TagValue::Int(-7).as_f64(), -7.0);
        assert_eq!(TagValue::Bool(true).as_f64(), 1.0);
        assert_eq!(TagValue::Bool(false).as_f64(), 0.0);
        assert!(TagValue::Null.as_f64().is_nan());
        assert!(TagValue::Float(f64::INFINITY).as_f64().is_nan());
        assert!(TagValue::Text("running".into()).as_f64().is_nan());
        assert!(TagValue::Text("   ".into()).as_f64().is_nan());
    }

    #[test]
    fn text_conversion_handles_device_formats() {
        assert_eq!(TagValue::from("1,234.5").as_f64(), 1234.5);
        assert_eq!(TagValue::from("45%").as_f64(), 0.45);
        assert_eq!(TagValue::from("72.5degC").as_f64(), 72.5);
        assert_eq!(TagValue::from("-3.25 bar").as_f64(), -3.25);
    }

    #[test]
    fn arrays_take_first_element_recursively() {
        let nested = TagValue::Array(vec![
            TagValue::Array(vec![TagValue::Int(9), TagValue::Int(1)]),
            TagValue::Int(2),
        ]);
        assert_eq!(nested.as_f64(), 9.0);
        assert!(TagValue::Array(Vec::new()).as_f64().is_nan());
    }

    #[test]
    fn signature_format() {
        assert_eq!(alert_signature(3, 17, AlertType::Deviation), "3:17:DEVIATION");
    }

    #[test]
    fn forecast_shape_mismatch_yields_none() {
        let now = Utc::now();
        let forecast = Forecast {
            timestamps: vec![now],
            values: vec![1.0, 2.0],
        };
        assert!(forecast.points().is_none());
    }

    #[test]
    fn tag_value_json_roundtrip_keeps_variant() {
        let v: TagValue = serde_json::from_str("12").expect("int");
        assert_eq!(v, TagValue::Int(12));
        let v: TagValue = serde_json::from_str("12.5").expect("float");
        assert_eq!(v, TagValue::Float(12.5));
        let v: TagValue = serde_json::from_str("null").expect("null");
        assert_eq!(v, TagValue::Null);
    }

    #[test]
    fn pending_means_undisposed() {
        let mut alert = Alert {
            id: 1,
            device_id: 1,
            measurement_id: 2,
            alert_type: AlertType::Deviation,
            severity: AlertSeverity::High,
            message: String::new(),
            actual_value: 0.0,
            predicted_base_value: 0.0,
            deviation_percent: 0.0,
            created_at: Utc::now(),
            acknowledged: false,
            acknowledged_at: None,
            ignored: false,
            ignored_at: None,
            signature: alert_signature(1, 2, AlertType::Deviation),
        };
        assert!(alert.is_pending());
        alert.ignored = true;
        assert!(!alert.is_pending());
    }
}
