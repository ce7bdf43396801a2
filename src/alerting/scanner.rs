//! Deviation alert scanner
//!
//! For every registered measurement: take the newest stored value, look up
//! the cached forecast at that value's timestamp, and raise a DEVIATION
//! alert when the gap exceeds the threshold.
//!
//! Duplicate suppression: while a pending (neither acknowledged nor ignored)
//! alert with the same `device:measurement:DEVIATION` signature was created
//! within the suppression window, no new alert is raised. The window is
//! measured back from the scan's wall clock, not from data timestamps.
//! Disposing of the pending alert lifts suppression at the next scan.
//! The pending check and the insert happen in one `insert_unless_pending`
//! call, so overlapping scans of the same store raise at most one alert.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::deviation::{classify_severity, compute_deviation_percent};
use crate::config::AlertConfig;
use crate::prediction::PredictionCache;
use crate::storage::{AlertStore, PendingInsert, TimeSeriesStore};
use crate::types::{alert_signature, Alert, AlertType, Device, Measurement};

const TS_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Per-measurement result of one scan.
#[derive(Debug, Clone, PartialEq)]
pub enum Evaluation {
    /// No stored value yet
    NoData,
    /// Latest value does not convert to a finite number
    NonNumeric,
    /// No forecast within tolerance of the value's timestamp
    NoBaseline,
    /// No usable deviation (e.g. non-finite prediction)
    Undefined,
    BelowThreshold { deviation_percent: f64 },
    Suppressed { pending_id: u64 },
    Created(Alert),
    /// A storage query or insert failed
    Failed,
}

/// Counts for one scan pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScanSummary {
    pub checked: usize,
    pub created: usize,
    pub suppressed: usize,
    pub below_threshold: usize,
    pub no_data: usize,
    pub no_baseline: usize,
    pub skipped: usize,
    pub failed: usize,
}

impl ScanSummary {
    fn record(&mut self, evaluation: &Evaluation) {
        self.checked += 1;
        match evaluation {
            Evaluation::NoData => self.no_data += 1,
            Evaluation::NoBaseline => self.no_baseline += 1,
            Evaluation::NonNumeric | Evaluation::Undefined => self.skipped += 1,
            Evaluation::BelowThreshold { .. } => self.below_threshold += 1,
            Evaluation::Suppressed { .. } => self.suppressed += 1,
            Evaluation::Created(_) => self.created += 1,
            Evaluation::Failed => self.failed += 1,
        }
    }
}

pub struct DeviationScanner {
    config: AlertConfig,
    cache: Arc<PredictionCache>,
    series: Arc<dyn TimeSeriesStore>,
    alerts: Arc<dyn AlertStore>,
}

impl DeviationScanner {
    pub fn new(
        config: AlertConfig,
        cache: Arc<PredictionCache>,
        series: Arc<dyn TimeSeriesStore>,
        alerts: Arc<dyn AlertStore>,
    ) -> Self {
        Self {
            config,
            cache,
            series,
            alerts,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }

    /// Scan every measurement of `devices` against the wall clock.
    pub async fn scan_once(&self, devices: &[Device]) -> ScanSummary {
        self.scan_at(devices, Utc::now()).await
    }

    /// Scan with an explicit "now", which stamps created alerts and anchors
    /// the suppression window.
    pub async fn scan_at(&self, devices: &[Device], now: DateTime<Utc>) -> ScanSummary {
        let mut summary = ScanSummary::default();
        if !self.config.enabled {
            debug!("Deviation alerting disabled, scan skipped");
            return summary;
        }

        for device in devices {
            for measurement in &device.measurements {
                let evaluation = self.evaluate(device, measurement, now).await;
                summary.record(&evaluation);
            }
        }

        if summary.checked > 0 {
            debug!(
                devices = devices.len(),
                checked = summary.checked,
                created = summary.created,
                suppressed = summary.suppressed,
                no_baseline = summary.no_baseline,
                "Deviation scan complete"
            );
        }
        summary
    }

    /// Evaluate one measurement, creating an alert when warranted.
    pub async fn evaluate(
        &self,
        device: &Device,
        measurement: &Measurement,
        now: DateTime<Utc>,
    ) -> Evaluation {
        let latest = match self.series.find_latest(device.id, measurement.id) {
            Ok(Some(point)) => point,
            Ok(None) => return Evaluation::NoData,
            Err(e) => {
                warn!(device = device.id, measurement = measurement.id, error = %e, "Latest value query failed");
                return Evaluation::Failed;
            }
        };
        let actual = latest.value.as_f64();
        if !actual.is_finite() {
            return Evaluation::NonNumeric;
        }

        let Some(predicted) = self.cache.get(device.id, measurement.id, latest.timestamp).await else {
            info!(
                device = device.id,
                measurement = measurement.id,
                ts = %latest.timestamp,
                "No cached prediction for deviation check"
            );
            return Evaluation::NoBaseline;
        };

        let Some(deviation) = compute_deviation_percent(actual, predicted) else {
            debug!(device = device.id, measurement = measurement.id, actual, predicted, "Deviation undefined");
            return Evaluation::Undefined;
        };
        debug!(
            device = device.id,
            measurement = measurement.id,
            actual,
            predicted,
            deviation_pct = %format!("{deviation:.2}"),
            threshold_pct = self.config.deviation_percent_threshold,
            "Deviation evaluated"
        );
        if deviation.abs() < self.config.deviation_percent_threshold {
            return Evaluation::BelowThreshold {
                deviation_percent: deviation,
            };
        }

        let signature = alert_signature(device.id, measurement.id, AlertType::Deviation);
        let cutoff = now
            .checked_sub_signed(self.config.suppression_window())
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let severity = classify_severity(deviation.abs(), self.config.severity_high_percent);
        let message = format!(
            "Deviation alert: device [{}] measurement [{}] actual {:.2} predicted {:.2} deviation {:.2}% (threshold {:.2}%) data time: {} alert time: {}",
            device.name,
            measurement.name,
            actual,
            predicted,
            deviation,
            self.config.deviation_percent_threshold,
            latest.timestamp.format(TS_FORMAT),
            now.format(TS_FORMAT),
        );
        let alert = Alert {
            id: 0,
            device_id: device.id,
            measurement_id: measurement.id,
            alert_type: AlertType::Deviation,
            severity,
            message,
            actual_value: actual,
            predicted_base_value: predicted,
            deviation_percent: deviation,
            created_at: now,
            acknowledged: false,
            acknowledged_at: None,
            ignored: false,
            ignored_at: None,
            signature,
        };

        match self.alerts.insert_unless_pending(alert, cutoff) {
            Ok(PendingInsert::Inserted(stored)) => {
                info!(
                    id = stored.id,
                    signature = %stored.signature,
                    severity = %stored.severity,
                    deviation_pct = %format!("{deviation:.2}"),
                    data_ts = %latest.timestamp,
                    "Deviation alert created"
                );
                Evaluation::Created(stored)
            }
            Ok(PendingInsert::Suppressed(existing)) => {
                info!(
                    device = device.id,
                    measurement = measurement.id,
                    signature = %existing.signature,
                    pending_id = existing.id,
                    since = %cutoff.format(TS_FORMAT),
                    "Duplicate deviation alert suppressed"
                );
                Evaluation::Suppressed {
                    pending_id: existing.id,
                }
            }
            Err(e) => {
                warn!(device = device.id, measurement = measurement.id, error = %e, "Failed to store alert");
                Evaluation::Failed
            }
        }
    }
}
