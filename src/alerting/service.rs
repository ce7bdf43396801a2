//! Alert disposal and queries
//!
//! Operators acknowledge or ignore alerts; either action ends the alert's
//! pending state and so lifts duplicate suppression for its signature.
//! Both actions are idempotent: the first call stamps the flag and time,
//! later calls leave the record untouched. The store applies each disposal
//! as a single read-modify-write, so concurrent calls stamp once.

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;

use crate::config::defaults::{ALERT_STATS_HOURS, RECENT_ALERTS_LIMIT};
use crate::storage::{AlertStore, StorageError};
use crate::types::{Alert, AlertSeverity, Disposal};

#[derive(Debug, thiserror::Error)]
pub enum AlertError {
    #[error("alert {0} not found")]
    NotFound(u64),

    #[error("alert storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Outcome of a batch disposal. Already-disposed alerts count as successes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchResult {
    pub success_count: usize,
    pub failed_ids: Vec<u64>,
}

/// Alerts created within one clock hour.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HourBucket {
    /// "HH:00" (UTC)
    pub hour: String,
    pub count: usize,
}

/// Dashboard counters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AlertStats {
    pub active_count: usize,
    pub recent_24h_count: usize,
    pub severity_active: BTreeMap<AlertSeverity, usize>,
    pub severity_recent_24h: BTreeMap<AlertSeverity, usize>,
    /// Oldest hour first, ending with the current hour
    pub hourly: Vec<HourBucket>,
}

fn count_by_severity(alerts: &[Alert]) -> BTreeMap<AlertSeverity, usize> {
    let mut counts = BTreeMap::new();
    for a in alerts {
        *counts.entry(a.severity).or_insert(0) += 1;
    }
    counts
}

fn hour_start(ts: DateTime<Utc>) -> DateTime<Utc> {
    ts.with_minute(0)
        .and_then(|t| t.with_second(0))
        .and_then(|t| t.with_nanosecond(0))
        .unwrap_or(ts)
}

pub struct AlertService {
    store: Arc<dyn AlertStore>,
}

impl AlertService {
    pub fn new(store: Arc<dyn AlertStore>) -> Self {
        Self { store }
    }

    pub fn acknowledge(&self, id: u64) -> Result<Alert, AlertError> {
        self.dispose(id, Disposal::Acknowledge, Utc::now())
    }

    pub fn ignore(&self, id: u64) -> Result<Alert, AlertError> {
        self.dispose(id, Disposal::Ignore, Utc::now())
    }

    pub fn batch_acknowledge(&self, ids: &[u64]) -> BatchResult {
        self.dispose_all(ids, Disposal::Acknowledge)
    }

    pub fn batch_ignore(&self, ids: &[u64]) -> BatchResult {
        self.dispose_all(ids, Disposal::Ignore)
    }

    fn dispose(&self, id: u64, action: Disposal, now: DateTime<Utc>) -> Result<Alert, AlertError> {
        let (alert, changed) = match self.store.dispose(id, action, now) {
            Ok(result) => result,
            Err(StorageError::NotFound(id)) => return Err(AlertError::NotFound(id)),
            Err(e) => return Err(e.into()),
        };
        if changed {
            info!(
                id,
                signature = %alert.signature,
                acknowledged = alert.acknowledged,
                ignored = alert.ignored,
                "Alert disposed"
            );
        }
        Ok(alert)
    }

    fn dispose_all(&self, ids: &[u64], action: Disposal) -> BatchResult {
        let now = Utc::now();
        let mut result = BatchResult::default();
        for &id in ids {
            match self.dispose(id, action, now) {
                Ok(_) => result.success_count += 1,
                Err(e) => {
                    tracing::warn!(id, error = %e, "Batch disposal failed");
                    result.failed_ids.push(id);
                }
            }
        }
        result
    }

    /// Pending alerts, newest first.
    pub fn list_pending(&self) -> Result<Vec<Alert>, AlertError> {
        Ok(self.store.list_pending()?)
    }

    /// The newest alerts regardless of state; `None` uses the default page size.
    pub fn list_recent(&self, limit: Option<usize>) -> Result<Vec<Alert>, AlertError> {
        Ok(self.store.list_recent(limit.unwrap_or(RECENT_ALERTS_LIMIT))?)
    }

    pub fn stats(&self, now: DateTime<Utc>) -> Result<AlertStats, AlertError> {
        let active = self.store.list_pending()?;
        let recent = self.store.list_since(now - Duration::hours(24))?;

        let current_hour = hour_start(now);
        let starts: Vec<DateTime<Utc>> = (0..ALERT_STATS_HOURS)
            .rev()
            .map(|i| current_hour - Duration::hours(i))
            .collect();
        let hourly = starts
            .iter()
            .map(|&start| HourBucket {
                hour: format!("{:02}:00", start.hour()),
                count: recent
                    .iter()
                    .filter(|a| a.created_at <= now && hour_start(a.created_at) == start)
                    .count(),
            })
            .collect();

        Ok(AlertStats {
            active_count: active.len(),
            recent_24h_count: recent.len(),
            severity_active: count_by_severity(&active),
            severity_recent_24h: count_by_severity(&recent),
            hourly,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::InMemoryAlertStore;
    use crate::types::{alert_signature, AlertType};
    use chrono::TimeZone;

    fn alert(severity: AlertSeverity, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: 0,
            device_id: 1,
            measurement_id: 10,
            alert_type: AlertType::Deviation,
            severity,
            message: "test".into(),
            actual_value: 120.0,
            predicted_base_value: 100.0,
            deviation_percent: 20.0,
            created_at,
            acknowledged: false,
            acknowledged_at: None,
            ignored: false,
            ignored_at: None,
            signature: alert_signature(1, 10, AlertType::Deviation),
        }
    }

    fn service() -> (Arc<InMemoryAlertStore>, AlertService) {
        let store = Arc::new(InMemoryAlertStore::new());
        (store.clone(), AlertService::new(store))
    }

    #[test]
    fn acknowledge_is_idempotent() {
        let (store, service) = service();
        let id = store.insert(alert(AlertSeverity::High, Utc::now())).expect("insert").id;

        let first = service.acknowledge(id).expect("ack");
        assert!(first.acknowledged && !first.is_pending());
        let stamped = first.acknowledged_at;

        let second = service.acknowledge(id).expect("ack again");
        assert_eq!(second.acknowledged_at, stamped);
        assert!(service.list_pending().expect("pending").is_empty());
    }

    #[test]
    fn ignore_sets_its_own_flag() {
        let (store, service) = service();
        let id = store.insert(alert(AlertSeverity::Medium, Utc::now())).expect("insert").id;
        let ignored = service.ignore(id).expect("ignore");
        assert!(ignored.ignored && ignored.ignored_at.is_some());
        assert!(!ignored.acknowledged);
        assert!(matches!(service.ignore(999), Err(AlertError::NotFound(999))));
    }

    #[test]
    fn batch_reports_missing_ids() {
        let (store, service) = service();
        let a = store.insert(alert(AlertSeverity::High, Utc::now())).expect("insert").id;
        let b = store.insert(alert(AlertSeverity::High, Utc::now())).expect("insert").id;
        service.acknowledge(b).expect("ack");

        let result = service.batch_acknowledge(&[a, b, 404]);
        assert_eq!(result.success_count, 2);
        assert_eq!(result.failed_ids, vec![404]);

        let result = service.batch_ignore(&[a, 405]);
        assert_eq!(result, BatchResult { success_count: 1, failed_ids: vec![405] });
    }

    #[tokio::test]
    async fn concurrent_acknowledgements_keep_the_first_stamp() {
        let (store, service) = service();
        let id = store.insert(alert(AlertSeverity::High, Utc::now())).expect("insert").id;
        let service = Arc::new(service);

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let service = service.clone();
                tokio::task::spawn_blocking(move || service.acknowledge(id).expect("ack"))
            })
            .collect();
        let mut stamps = Vec::new();
        for handle in handles {
            stamps.push(handle.await.expect("join").acknowledged_at);
        }
        let stored = store.get(id).expect("get").expect("present").acknowledged_at;
        assert!(stored.is_some());
        assert!(stamps.iter().all(|s| *s == stored));
    }

    #[test]
    fn stats_bucket_by_hour() {
        let (store, service) = service();
        let now = Utc.with_ymd_and_hms(2024, 3, 1, 12, 30, 0).single().expect("valid time");
        store.insert(alert(AlertSeverity::High, now - Duration::minutes(10))).expect("insert");
        store.insert(alert(AlertSeverity::Medium, now - Duration::minutes(20))).expect("insert");
        let old = store.insert(alert(AlertSeverity::High, now - Duration::hours(3))).expect("insert");
        store.insert(alert(AlertSeverity::Low, now - Duration::hours(30))).expect("insert");
        service.acknowledge(old.id).expect("ack");

        let stats = service.stats(now).expect("stats");
        assert_eq!(stats.active_count, 3);
        assert_eq!(stats.recent_24h_count, 3);
        assert_eq!(stats.severity_active.get(&AlertSeverity::Low), Some(&1));
        assert_eq!(stats.severity_recent_24h.get(&AlertSeverity::High), Some(&2));

        assert_eq!(stats.hourly.len(), 12);
        assert_eq!(stats.hourly[0].hour, "01:00");
        let last = stats.hourly.last().expect("current hour");
        assert_eq!((last.hour.as_str(), last.count), ("12:00", 2));
        let nine = stats.hourly.iter().find(|b| b.hour == "09:00").expect("09:00");
        assert_eq!(nine.count, 1);
    }
}
