//! In-memory storage backends
//!
//! Thread-safe via `RwLock`. Not durable: data lost on restart.

use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{sort_newest_first, AlertStore, PendingInsert, StorageError, TimeSeriesStore};
use crate::types::{Alert, DataPoint, DeviceId, Disposal, MeasurementId};

/// Default per-series retention for the in-memory time series.
const DEFAULT_MAX_POINTS_PER_SERIES: usize = 100_000;

type SeriesKey = (DeviceId, MeasurementId);

/// In-memory measurement history, one ordered map per series.
pub struct InMemoryTimeSeries {
    series: RwLock<HashMap<SeriesKey, BTreeMap<DateTime<Utc>, DataPoint>>>,
    max_points_per_series: usize,
}

impl InMemoryTimeSeries {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_POINTS_PER_SERIES)
    }

    /// Oldest points are evicted once a series exceeds `max_points_per_series`.
    pub fn with_capacity(max_points_per_series: usize) -> Self {
        Self {
            series: RwLock::new(HashMap::new()),
            max_points_per_series: max_points_per_series.max(1),
        }
    }

    /// Total points across all series.
    pub fn len(&self) -> usize {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        series.values().map(BTreeMap::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryTimeSeries {
    fn default() -> Self {
        Self::new()
    }
}

impl TimeSeriesStore for InMemoryTimeSeries {
    fn save(&self, points: &[DataPoint]) -> Result<(), StorageError> {
        let mut series = self.series.write().unwrap_or_else(|e| e.into_inner());
        for point in points {
            let entry = series
                .entry((point.device_id, point.measurement_id))
                .or_default();
            entry.insert(point.timestamp, point.clone());
            while entry.len() > self.max_points_per_series {
                entry.pop_first();
            }
        }
        Ok(())
    }

    fn find_latest(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Result<Option<DataPoint>, StorageError> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        Ok(series
            .get(&(device_id, measurement_id))
            .and_then(|s| s.last_key_value())
            .map(|(_, p)| p.clone()))
    }

    fn find_top_n(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        n: usize,
    ) -> Result<Vec<DataPoint>, StorageError> {
        let series = self.series.read().unwrap_or_else(|e| e.into_inner());
        Ok(series
            .get(&(device_id, measurement_id))
            .map(|s| s.values().rev().take(n).cloned().collect())
            .unwrap_or_default())
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

/// In-memory alert store. Ids are assigned sequentially from 1.
pub struct InMemoryAlertStore {
    alerts: RwLock<Vec<Alert>>,
}

impl InMemoryAlertStore {
    pub fn new() -> Self {
        Self {
            alerts: RwLock::new(Vec::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.alerts.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryAlertStore {
    fn default() -> Self {
        Self::new()
    }
}

impl AlertStore for InMemoryAlertStore {
    fn insert(&self, alert: Alert) -> Result<Alert, StorageError> {
        let mut store = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        Ok(push_alert(&mut store, alert))
    }

    fn get(&self, id: u64) -> Result<Option<Alert>, StorageError> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        Ok(store.iter().find(|a| a.id == id).cloned())
    }

    fn update(&self, alert: &Alert) -> Result<(), StorageError> {
        let mut store = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        let slot = store
            .iter_mut()
            .find(|a| a.id == alert.id)
            .ok_or(StorageError::NotFound(alert.id))?;
        *slot = alert.clone();
        Ok(())
    }

    fn dispose(
        &self,
        id: u64,
        disposal: Disposal,
        at: DateTime<Utc>,
    ) -> Result<(Alert, bool), StorageError> {
        let mut store = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        let slot = store
            .iter_mut()
            .find(|a| a.id == id)
            .ok_or(StorageError::NotFound(id))?;
        let changed = disposal.apply(slot, at);
        Ok((slot.clone(), changed))
    }

    fn insert_unless_pending(
        &self,
        alert: Alert,
        cutoff: DateTime<Utc>,
    ) -> Result<PendingInsert, StorageError> {
        let mut store = self.alerts.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = pending_since(&store, &alert.signature, cutoff).into_iter().next() {
            return Ok(PendingInsert::Suppressed(existing));
        }
        Ok(PendingInsert::Inserted(push_alert(&mut store, alert)))
    }

    fn find_pending_since(
        &self,
        signature: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StorageError> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        Ok(pending_since(&store, signature, cutoff))
    }

    fn list_pending(&self) -> Result<Vec<Alert>, StorageError> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        let mut pending: Vec<Alert> = store.iter().filter(|a| a.is_pending()).cloned().collect();
        sort_newest_first(&mut pending);
        Ok(pending)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        let mut all = store.clone();
        sort_newest_first(&mut all);
        all.truncate(limit);
        Ok(all)
    }

    fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Alert>, StorageError> {
        let store = self.alerts.read().unwrap_or_else(|e| e.into_inner());
        let mut recent: Vec<Alert> = store
            .iter()
            .filter(|a| a.created_at >= cutoff)
            .cloned()
            .collect();
        recent.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(recent)
    }

    fn backend_name(&self) -> &'static str {
        "InMemory"
    }
}

fn push_alert(store: &mut Vec<Alert>, mut alert: Alert) -> Alert {
    alert.id = store.last().map_or(1, |a| a.id + 1);
    store.push(alert.clone());
    alert
}

fn pending_since(store: &[Alert], signature: &str, cutoff: DateTime<Utc>) -> Vec<Alert> {
    let mut hits: Vec<Alert> = store
        .iter()
        .filter(|a| a.signature == signature && a.is_pending() && a.created_at >= cutoff)
        .cloned()
        .collect();
    sort_newest_first(&mut hits);
    hits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{alert_signature, AlertSeverity, AlertType};
    use chrono::Duration;

    fn point(m: MeasurementId, secs: i64, v: f64) -> DataPoint {
        let ts = DateTime::from_timestamp(1_700_000_000 + secs, 0).expect("valid ts");
        DataPoint::new(1, m, v, ts)
    }

    fn alert_at(created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: 0,
            device_id: 1,
            measurement_id: 2,
            alert_type: AlertType::Deviation,
            severity: AlertSeverity::Medium,
            message: "test".to_string(),
            actual_value: 120.0,
            predicted_base_value: 100.0,
            deviation_percent: 20.0,
            created_at,
            acknowledged: false,
            acknowledged_at: None,
            ignored: false,
            ignored_at: None,
            signature: alert_signature(1, 2, AlertType::Deviation),
        }
    }

    #[test]
    fn latest_and_top_n_are_newest_first() {
        let store = InMemoryTimeSeries::new();
        store
            .save(&[point(7, 0, 1.0), point(7, 20, 3.0), point(7, 10, 2.0)])
            .expect("save");

        let latest = store.find_latest(1, 7).expect("query").expect("some");
        assert_eq!(latest.value.as_f64(), 3.0);

        let top: Vec<f64> = store
            .find_top_n(1, 7, 2)
            .expect("query")
            .iter()
            .map(|p| p.value.as_f64())
            .collect();
        assert_eq!(top, vec![3.0, 2.0]);
        assert!(store.find_latest(1, 8).expect("query").is_none());
    }

    #[test]
    fn series_capacity_evicts_oldest() {
        let store = InMemoryTimeSeries::with_capacity(2);
        store
            .save(&[point(1, 0, 1.0), point(1, 1, 2.0), point(1, 2, 3.0)])
            .expect("save");
        assert_eq!(store.len(), 2);
        let top = store.find_top_n(1, 1, 10).expect("query");
        assert_eq!(top.last().map(|p| p.value.as_f64()), Some(2.0));
    }

    #[test]
    fn alert_ids_are_sequential_and_update_persists() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        let a = store.insert(alert_at(now)).expect("insert");
        let b = store.insert(alert_at(now)).expect("insert");
        assert_eq!((a.id, b.id), (1, 2));

        let mut acked = a.clone();
        acked.acknowledged = true;
        store.update(&acked).expect("update");
        assert_eq!(store.list_pending().expect("pending").len(), 1);

        let mut ghost = a;
        ghost.id = 99;
        assert!(matches!(store.update(&ghost), Err(StorageError::NotFound(99))));
    }

    #[test]
    fn pending_since_respects_cutoff_and_state() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        store.insert(alert_at(now - Duration::minutes(10))).expect("insert");
        let fresh = store.insert(alert_at(now - Duration::minutes(1))).expect("insert");

        let sig = alert_signature(1, 2, AlertType::Deviation);
        let hits = store
            .find_pending_since(&sig, now - Duration::minutes(5))
            .expect("query");
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].id, fresh.id);

        let since = store.list_since(now - Duration::hours(1)).expect("query");
        assert_eq!(since.first().map(|a| a.id), Some(1));
    }

    #[test]
    fn conditional_insert_holds_back_duplicates() {
        let store = InMemoryAlertStore::new();
        let now = Utc::now();
        let cutoff = now - Duration::minutes(5);

        let first = match store.insert_unless_pending(alert_at(now), cutoff).expect("insert") {
            PendingInsert::Inserted(a) => a,
            other => panic!("expected insert, got {other:?}"),
        };
        match store.insert_unless_pending(alert_at(now), cutoff).expect("insert") {
            PendingInsert::Suppressed(existing) => assert_eq!(existing.id, first.id),
            other => panic!("expected suppression, got {other:?}"),
        }
        assert_eq!(store.len(), 1);

        let (disposed, changed) = store.dispose(first.id, Disposal::Ignore, now).expect("dispose");
        assert!(changed && disposed.ignored);
        let (_, changed) = store.dispose(first.id, Disposal::Ignore, now).expect("dispose");
        assert!(!changed);
        assert!(matches!(
            store.dispose(42, Disposal::Acknowledge, now),
            Err(StorageError::NotFound(42))
        ));

        assert!(matches!(
            store.insert_unless_pending(alert_at(now), cutoff).expect("insert"),
            PendingInsert::Inserted(_)
        ));
    }
}
