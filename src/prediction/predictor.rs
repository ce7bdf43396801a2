//! Forecast producers
//!
//! A `Predictor` turns recent history for one measurement into a forecast
//! series. The model server speaks a small JSON protocol:
//!
//! ```text
//! POST <url>  {"data": [f32, ...], "prediction_length": n}
//! 200         {"predictions": [v1, v2, ...]}      // numbers or numeric strings
//! ```
//!
//! Forecast timestamps are not part of the response; they continue the
//! history at its median sampling step.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

use super::PredictError;
use crate::config::defaults::FALLBACK_STEP_SECS;
use crate::config::{PredictorConfig, PredictorKind};
use crate::storage::{StorageError, TimeSeriesStore};
use crate::types::{DataPoint, DeviceId, Forecast, MeasurementId};

/// Forecast producer for one measurement at a time.
#[async_trait]
pub trait Predictor: Send + Sync {
    /// `history` is oldest first.
    async fn forecast(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        history: &[DataPoint],
    ) -> Result<Forecast, PredictError>;

    fn name(&self) -> &'static str;
}

/// Build the configured predictor.
pub fn build_predictor(config: &PredictorConfig) -> Result<Arc<dyn Predictor>, PredictError> {
    let predictor: Arc<dyn Predictor> = match config.kind {
        PredictorKind::Http => Arc::new(HttpPredictor::new(config)?),
        PredictorKind::LastValue => Arc::new(LastValuePredictor::new(config.prediction_length)),
    };
    Ok(predictor)
}

// ============================================================================
// Input assembly and timestamp continuation
// ============================================================================

/// The `n` newest stored points, returned oldest first.
pub fn assemble_history(
    storage: &dyn TimeSeriesStore,
    device_id: DeviceId,
    measurement_id: MeasurementId,
    n: usize,
) -> Result<Vec<DataPoint>, StorageError> {
    let mut points = storage.find_top_n(device_id, measurement_id, n)?;
    points.reverse();
    Ok(points)
}

/// Median of the positive deltas between consecutive timestamps.
///
/// Falls back to 60s with fewer than two timestamps or no positive delta.
pub fn infer_step(timestamps: &[DateTime<Utc>]) -> chrono::Duration {
    let mut deltas: Vec<chrono::Duration> = timestamps
        .windows(2)
        .map(|w| w[1] - w[0])
        .filter(|d| *d > chrono::Duration::zero())
        .collect();
    if deltas.is_empty() {
        return chrono::Duration::seconds(FALLBACK_STEP_SECS);
    }
    deltas.sort_unstable();
    deltas[deltas.len() / 2]
}

/// `count` timestamps continuing `history` at its inferred step, or starting
/// from `now` at the fallback step when there is no history.
pub fn forecast_timestamps(
    history: &[DataPoint],
    count: usize,
    now: DateTime<Utc>,
) -> Vec<DateTime<Utc>> {
    let stamps: Vec<DateTime<Utc>> = history.iter().map(|p| p.timestamp).collect();
    let (origin, step) = match stamps.last() {
        Some(&last) => (last, infer_step(&stamps)),
        None => (now, chrono::Duration::seconds(FALLBACK_STEP_SECS)),
    };
    std::iter::successors(Some(origin + step), |t| Some(*t + step))
        .take(count)
        .collect()
}

// ============================================================================
// HTTP model server
// ============================================================================

#[derive(Serialize)]
struct PredictRequest<'a> {
    data: &'a [f32],
    prediction_length: usize,
}

#[derive(Deserialize)]
struct PredictResponse {
    #[serde(default)]
    predictions: Vec<serde_json::Value>,
}

/// Accepts JSON numbers and numeric strings; anything else is dropped.
fn prediction_value(value: &serde_json::Value) -> Option<f64> {
    match value {
        serde_json::Value::Number(n) => n.as_f64(),
        serde_json::Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
}

/// Client for a remote forecasting model server.
pub struct HttpPredictor {
    http: reqwest::Client,
    url: String,
    prediction_length: usize,
}

impl HttpPredictor {
    pub fn new(config: &PredictorConfig) -> Result<Self, PredictError> {
        let http = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            http,
            url: config.url.clone(),
            prediction_length: config.prediction_length,
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Predictor for HttpPredictor {
    async fn forecast(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        history: &[DataPoint],
    ) -> Result<Forecast, PredictError> {
        if history.is_empty() {
            return Err(PredictError::EmptyHistory);
        }

        #[allow(clippy::cast_possible_truncation)]
        let data: Vec<f32> = history.iter().map(|p| p.value.as_f64() as f32).collect();
        let body = PredictRequest {
            data: &data,
            prediction_length: self.prediction_length,
        };

        let resp = self.http.post(&self.url).json(&body).send().await?;
        if !resp.status().is_success() {
            return Err(PredictError::Status(resp.status()));
        }
        let parsed: PredictResponse = resp.json().await?;

        let values: Vec<f64> = parsed.predictions.iter().filter_map(prediction_value).collect();
        if values.len() != self.prediction_length {
            return Err(PredictError::Shape {
                expected: self.prediction_length,
                got: values.len(),
            });
        }

        debug!(
            device = device_id,
            measurement = measurement_id,
            inputs = data.len(),
            outputs = values.len(),
            "Forecast received"
        );
        Ok(Forecast {
            timestamps: forecast_timestamps(history, values.len(), Utc::now()),
            values,
        })
    }

    fn name(&self) -> &'static str {
        "http"
    }
}

// ============================================================================
// Last-value persistence forecast
// ============================================================================

/// Repeats the most recent finite value. Used when no model server is
/// deployed.
pub struct LastValuePredictor {
    prediction_length: usize,
}

impl LastValuePredictor {
    pub fn new(prediction_length: usize) -> Self {
        Self { prediction_length }
    }

    /// Last value if finite, else the mean of finite values, else zero.
    fn level(history: &[DataPoint]) -> f64 {
        let values: Vec<f64> = history.iter().map(|p| p.value.as_f64()).collect();
        if let Some(&last) = values.last() {
            if last.is_finite() {
                return last;
            }
        }
        let finite: Vec<f64> = values.into_iter().filter(|v| v.is_finite()).collect();
        if finite.is_empty() {
            return 0.0;
        }
        #[allow(clippy::cast_precision_loss)]
        let n = finite.len() as f64;
        finite.iter().sum::<f64>() / n
    }
}

#[async_trait]
impl Predictor for LastValuePredictor {
    async fn forecast(
        &self,
        _device_id: DeviceId,
        _measurement_id: MeasurementId,
        history: &[DataPoint],
    ) -> Result<Forecast, PredictError> {
        if history.is_empty() {
            return Err(PredictError::EmptyHistory);
        }
        let level = Self::level(history);
        Ok(Forecast {
            timestamps: forecast_timestamps(history, self.prediction_length, Utc::now()),
            values: vec![level; self.prediction_length],
        })
    }

    fn name(&self) -> &'static str {
        "last_value"
    }
}
