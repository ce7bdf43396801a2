//! Prediction cache
//!
//! Holds one forecast series per (device, measurement) so the alert scanner
//! can ask "what was predicted at T?" without calling the model on its hot
//! path. A background prefetch keeps each series covering at least
//! `min_ahead_minutes` past now.
//!
//! Each series sits behind its own mutex; the outer map only hands out
//! `Arc`s, so prefetching one measurement never blocks lookups on another.
//! Predictor calls run without any series lock held.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info};

use super::predictor::{assemble_history, infer_step, Predictor};
use super::PredictError;
use crate::config::defaults::FALLBACK_STEP_SECS;
use crate::config::{PredictionCacheConfig, PredictorConfig};
use crate::storage::TimeSeriesStore;
use crate::types::{Device, DeviceId, MeasurementId, PredictionPoint};

type SeriesKey = (DeviceId, MeasurementId);

/// Timestamp-ordered forecast points for one measurement.
#[derive(Debug)]
struct PredictionSeries {
    points: BTreeMap<DateTime<Utc>, f64>,
    step: chrono::Duration,
    last_prefetch: Option<DateTime<Utc>>,
}

impl Default for PredictionSeries {
    fn default() -> Self {
        Self {
            points: BTreeMap::new(),
            step: chrono::Duration::seconds(FALLBACK_STEP_SECS),
            last_prefetch: None,
        }
    }
}

impl PredictionSeries {
    /// Exact match, else the nearer neighbour within `tolerance`. On a tie
    /// the earlier point wins.
    fn find(&self, ts: DateTime<Utc>, tolerance: chrono::Duration) -> Option<f64> {
        if let Some(v) = self.points.get(&ts) {
            return Some(*v);
        }
        let below = self.points.range(..ts).next_back();
        let above = self.points.range(ts..).next();
        let (delta, value) = [below, above]
            .into_iter()
            .flatten()
            .map(|(t, v)| ((ts - *t).abs(), *v))
            .min_by_key(|(delta, _)| *delta)?;
        (delta <= tolerance).then_some(value)
    }

    /// Insert or overwrite points. Non-finite values are not cached.
    fn merge(&mut self, points: &[PredictionPoint], step: chrono::Duration) {
        for p in points.iter().filter(|p| p.value.is_finite()) {
            self.points.insert(p.timestamp, p.value);
        }
        if step > chrono::Duration::zero() {
            self.step = step;
        }
    }

    /// Evict oldest points beyond `max_points`.
    fn trim(&mut self, max_points: usize) -> usize {
        let mut evicted = 0;
        while self.points.len() > max_points {
            self.points.pop_first();
            evicted += 1;
        }
        evicted
    }

    fn last_timestamp(&self) -> Option<DateTime<Utc>> {
        self.points.last_key_value().map(|(t, _)| *t)
    }
}

fn lock(series: &Mutex<PredictionSeries>) -> MutexGuard<'_, PredictionSeries> {
    series.lock().unwrap_or_else(|e| e.into_inner())
}

/// What one prefetch pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrefetchSummary {
    /// (device, measurement) pairs examined
    pub checked: usize,
    /// Series that received a new forecast
    pub refreshed: usize,
    /// Series whose forecast attempt failed
    pub failed: usize,
    /// Points evicted by trimming
    pub evicted: usize,
    /// Series dropped because their measurement left the registry
    pub dropped: usize,
}

/// Per-measurement forecast cache with tolerance lookup and prefetch.
pub struct PredictionCache {
    config: PredictionCacheConfig,
    predictor: Arc<dyn Predictor>,
    storage: Arc<dyn TimeSeriesStore>,
    history_length: usize,
    request_timeout: Duration,
    series: DashMap<SeriesKey, Arc<Mutex<PredictionSeries>>>,
}

impl PredictionCache {
    pub fn new(
        config: PredictionCacheConfig,
        predictor_config: &PredictorConfig,
        predictor: Arc<dyn Predictor>,
        storage: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        Self {
            config,
            predictor,
            storage,
            history_length: predictor_config.history_length,
            request_timeout: predictor_config.request_timeout(),
            series: DashMap::new(),
        }
    }

    fn entry(&self, key: SeriesKey) -> Arc<Mutex<PredictionSeries>> {
        self.series.entry(key).or_default().value().clone()
    }

    /// Predicted value for `timestamp`, if a cached point lies within the
    /// configured tolerance.
    ///
    /// A series with no points at all gets one synchronous prefetch before
    /// the lookup is retried, so the first query for a new measurement is
    /// not permanently empty.
    pub async fn get(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        timestamp: DateTime<Utc>,
    ) -> Option<f64> {
        if !self.config.enabled {
            return None;
        }
        let tolerance = self.config.tolerance();
        let series = self.entry((device_id, measurement_id));
        {
            let s = lock(&series);
            if let Some(v) = s.find(timestamp, tolerance) {
                return Some(v);
            }
            if !s.points.is_empty() {
                return None;
            }
        }

        if let Err(e) = self.refresh((device_id, measurement_id), &series).await {
            debug!(
                device = device_id,
                measurement = measurement_id,
                error = %e,
                "Warm-up forecast unavailable"
            );
            return None;
        }
        let found = lock(&series).find(timestamp, tolerance);
        found
    }

    /// Inject one predicted point without calling the predictor.
    pub fn put(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        timestamp: DateTime<Utc>,
        value: f64,
    ) {
        let series = self.entry((device_id, measurement_id));
        let mut s = lock(&series);
        let step = s.step;
        s.merge(&[PredictionPoint { timestamp, value }], step);
        s.trim(self.config.max_points_per_series);
    }

    /// True when the series ends less than `min_ahead_minutes` after `now`.
    pub fn needs_prefetch(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        now: DateTime<Utc>,
    ) -> bool {
        match self.inspect((device_id, measurement_id), PredictionSeries::last_timestamp).flatten() {
            Some(last) => last - now < self.config.min_ahead(),
            None => true,
        }
    }

    /// Unconditionally request a fresh forecast and merge it. Returns the
    /// number of points received.
    pub async fn prefetch(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Result<usize, PredictError> {
        let series = self.entry((device_id, measurement_id));
        self.refresh((device_id, measurement_id), &series).await
    }

    /// One scheduler pass: drop series of unregistered measurements, refresh
    /// every registered measurement whose coverage is short, then trim every
    /// series.
    pub async fn prefetch_all(&self, devices: &[Device]) -> PrefetchSummary {
        let mut summary = PrefetchSummary::default();
        if !self.config.enabled {
            return summary;
        }

        let registered: HashSet<SeriesKey> = devices
            .iter()
            .flat_map(|d| d.measurements.iter().map(move |m| (d.id, m.id)))
            .collect();
        let before = self.series.len();
        self.series.retain(|key, _| registered.contains(key));
        summary.dropped = before.saturating_sub(self.series.len());

        for device in devices {
            for m in &device.measurements {
                summary.checked += 1;
                let key = (device.id, m.id);
                let series = self.entry(key);
                if self.needs_prefetch(device.id, m.id, Utc::now()) {
                    match self.refresh(key, &series).await {
                        Ok(n) if n > 0 => summary.refreshed += 1,
                        Ok(_) => {}
                        Err(e) => {
                            summary.failed += 1;
                            debug!(
                                device = device.id,
                                measurement = m.id,
                                error = %e,
                                "Prefetch forecast failed"
                            );
                        }
                    }
                }
                summary.evicted += lock(&series).trim(self.config.max_points_per_series);
            }
        }

        if summary.checked > 0 || summary.dropped > 0 {
            debug!(
                checked = summary.checked,
                refreshed = summary.refreshed,
                failed = summary.failed,
                evicted = summary.evicted,
                dropped = summary.dropped,
                "Prediction prefetch complete"
            );
        }
        summary
    }

    async fn refresh(
        &self,
        key: SeriesKey,
        series: &Mutex<PredictionSeries>,
    ) -> Result<usize, PredictError> {
        let (device_id, measurement_id) = key;
        let history = assemble_history(
            self.storage.as_ref(),
            device_id,
            measurement_id,
            self.history_length,
        )?;

        let forecast = tokio::time::timeout(
            self.request_timeout,
            self.predictor.forecast(device_id, measurement_id, &history),
        )
        .await
        .map_err(|_| PredictError::Timeout(self.request_timeout))??;

        let points = forecast.points().ok_or(PredictError::Shape {
            expected: forecast.timestamps.len(),
            got: forecast.values.len(),
        })?;
        if points.is_empty() {
            return Ok(0);
        }

        let step = infer_step(&forecast.timestamps);
        let mut s = lock(series);
        let was_empty = s.points.is_empty();
        s.merge(&points, step);
        s.last_prefetch = Some(Utc::now());
        s.trim(self.config.max_points_per_series);
        if was_empty {
            info!(
                device = device_id,
                measurement = measurement_id,
                points = points.len(),
                predictor = self.predictor.name(),
                "Forecast series warmed up"
            );
        }
        Ok(points.len())
    }

    fn inspect<T>(&self, key: SeriesKey, f: impl FnOnce(&PredictionSeries) -> T) -> Option<T> {
        let series = self.series.get(&key)?.value().clone();
        let guard = lock(&series);
        Some(f(&guard))
    }

    /// Number of measurements with a cached series.
    pub fn series_count(&self) -> usize {
        self.series.len()
    }

    /// Number of cached points for a measurement.
    pub fn series_len(&self, device_id: DeviceId, measurement_id: MeasurementId) -> usize {
        self.inspect((device_id, measurement_id), |s| s.points.len())
            .unwrap_or(0)
    }

    /// Inferred sampling step of a measurement's forecast series.
    pub fn series_step(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Option<chrono::Duration> {
        self.inspect((device_id, measurement_id), |s| s.step)
    }

    /// When a measurement's series last received a predictor forecast.
    pub fn last_prefetch(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Option<DateTime<Utc>> {
        self.inspect((device_id, measurement_id), |s| s.last_prefetch)
            .flatten()
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled
    }
}
