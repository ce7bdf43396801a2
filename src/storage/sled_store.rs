//! sled-backed storage
//!
//! One database, three named trees:
//! - `datapoints`: key = device (u64 BE) | measurement (u64 BE) | timestamp
//!   (sign-flipped i64 micros, BE), so a prefix scan of one series iterates
//!   chronologically
//! - `alerts`: key = alert id (u64 BE), value = JSON `Alert`
//! - `alert_signatures`: key = signature | 0x00 | created_at (sign-flipped
//!   micros, BE) | id (u64 BE), empty value. Duplicate suppression range
//!   scans this index instead of decoding every alert.
//!
//! Writes are not flushed individually; sled flushes in the background.

use chrono::{DateTime, Utc};
use sled::transaction::{ConflictableTransactionError, TransactionError};
use sled::Transactional;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{info, warn};

use super::{sort_newest_first, AlertStore, PendingInsert, StorageError, TimeSeriesStore};
use crate::types::{Alert, DataPoint, DeviceId, Disposal, MeasurementId};

const DATAPOINTS_TREE: &str = "datapoints";
const ALERTS_TREE: &str = "alerts";
const SIGNATURES_TREE: &str = "alert_signatures";

/// Embedded store for both measurement history and alerts.
///
/// sled holds an exclusive file lock on the database, so `insert_lock` only
/// has to serialize conditional inserts within this process.
#[derive(Clone)]
pub struct SledStore {
    db: sled::Db,
    points: sled::Tree,
    alerts: sled::Tree,
    signatures: sled::Tree,
    insert_lock: Arc<Mutex<()>>,
}

impl SledStore {
    /// Open or create the database at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StorageError> {
        let db = sled::open(path)?;
        let points = db.open_tree(DATAPOINTS_TREE)?;
        let alerts = db.open_tree(ALERTS_TREE)?;
        let signatures = db.open_tree(SIGNATURES_TREE)?;
        let store = Self {
            db,
            points,
            alerts,
            signatures,
            insert_lock: Arc::new(Mutex::new(())),
        };
        if store.signatures.is_empty() && !store.alerts.is_empty() {
            store.rebuild_signature_index()?;
        }
        Ok(store)
    }

    /// Flush pending writes to disk.
    pub fn flush(&self) -> Result<(), StorageError> {
        self.db.flush()?;
        Ok(())
    }

    /// Database size in bytes
    pub fn size_bytes(&self) -> u64 {
        self.db.size_on_disk().unwrap_or(0)
    }

    /// Index alerts written before the signature tree existed.
    fn rebuild_signature_index(&self) -> Result<(), StorageError> {
        let alerts = self.decode_alerts()?;
        let mut batch = sled::Batch::default();
        for alert in &alerts {
            batch.insert(signature_key(&alert.signature, alert.created_at, alert.id), Vec::new());
        }
        self.signatures.apply_batch(batch)?;
        info!(indexed = alerts.len(), "Rebuilt alert signature index");
        Ok(())
    }

    /// Every decodable alert. Undecodable records are logged and skipped.
    fn decode_alerts(&self) -> Result<Vec<Alert>, StorageError> {
        let mut out = Vec::with_capacity(self.alerts.len());
        for item in self.alerts.iter() {
            let (key, value) = item?;
            match serde_json::from_slice::<Alert>(&value) {
                Ok(alert) => out.push(alert),
                Err(e) => warn!(key = ?key, error = %e, "Skipping undecodable alert record"),
            }
        }
        Ok(out)
    }

    fn insert_alert(&self, mut alert: Alert) -> Result<Alert, StorageError> {
        alert.id = self.db.generate_id()? + 1;
        let id_key = alert.id.to_be_bytes();
        let index_key = signature_key(&alert.signature, alert.created_at, alert.id);
        let value = serde_json::to_vec(&alert)?;

        (&self.alerts, &self.signatures)
            .transaction(|(alerts, signatures)| {
                alerts.insert(&id_key[..], value.as_slice())?;
                signatures.insert(index_key.as_slice(), &[] as &[u8])?;
                Ok::<_, ConflictableTransactionError<()>>(())
            })
            .map_err(|e| match e {
                TransactionError::Storage(e) => StorageError::from(e),
                TransactionError::Abort(()) => {
                    StorageError::Database("alert insert aborted".to_string())
                }
            })?;
        Ok(alert)
    }
}

/// `signature | 0x00`, the start of one signature's index range.
fn signature_prefix(signature: &str) -> Vec<u8> {
    let mut key = Vec::with_capacity(signature.len() + 17);
    key.extend_from_slice(signature.as_bytes());
    key.push(0);
    key
}

fn signature_key(signature: &str, created_at: DateTime<Utc>, id: u64) -> Vec<u8> {
    let mut key = signature_prefix(signature);
    key.extend_from_slice(&sortable_micros(created_at));
    key.extend_from_slice(&id.to_be_bytes());
    key
}

/// Alert id from the trailing eight bytes of an index key.
fn indexed_id(key: &[u8]) -> Option<u64> {
    let tail: [u8; 8] = key.get(key.len().checked_sub(8)?..)?.try_into().ok()?;
    Some(u64::from_be_bytes(tail))
}

fn series_prefix(device_id: DeviceId, measurement_id: MeasurementId) -> [u8; 16] {
    let mut key = [0u8; 16];
    key[..8].copy_from_slice(&device_id.to_be_bytes());
    key[8..].copy_from_slice(&measurement_id.to_be_bytes());
    key
}

/// Flip the sign bit so negative timestamps sort before positive ones.
#[allow(clippy::cast_sign_loss)]
fn sortable_micros(ts: DateTime<Utc>) -> [u8; 8] {
    ((ts.timestamp_micros() as u64) ^ (1 << 63)).to_be_bytes()
}

fn point_key(point: &DataPoint) -> [u8; 24] {
    let mut key = [0u8; 24];
    key[..16].copy_from_slice(&series_prefix(point.device_id, point.measurement_id));
    key[16..].copy_from_slice(&sortable_micros(point.timestamp));
    key
}

impl TimeSeriesStore for SledStore {
    fn save(&self, points: &[DataPoint]) -> Result<(), StorageError> {
        let mut batch = sled::Batch::default();
        for point in points {
            batch.insert(point_key(point).to_vec(), serde_json::to_vec(point)?);
        }
        self.points.apply_batch(batch)?;
        Ok(())
    }

    fn find_latest(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Result<Option<DataPoint>, StorageError> {
        Ok(self.find_top_n(device_id, measurement_id, 1)?.into_iter().next())
    }

    fn find_top_n(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        n: usize,
    ) -> Result<Vec<DataPoint>, StorageError> {
        let mut out = Vec::with_capacity(n.min(1024));
        for item in self.points.scan_prefix(series_prefix(device_id, measurement_id)).rev() {
            if out.len() >= n {
                break;
            }
            let (_, value) = item?;
            match serde_json::from_slice::<DataPoint>(&value) {
                Ok(point) => out.push(point),
                Err(e) => tracing::warn!(device = device_id, measurement = measurement_id, error = %e, "Skipping undecodable data point"),
            }
        }
        Ok(out)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

impl AlertStore for SledStore {
    fn insert(&self, alert: Alert) -> Result<Alert, StorageError> {
        self.insert_alert(alert)
    }

    fn get(&self, id: u64) -> Result<Option<Alert>, StorageError> {
        match self.alerts.get(id.to_be_bytes())? {
            Some(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            None => Ok(None),
        }
    }

    fn update(&self, alert: &Alert) -> Result<(), StorageError> {
        let key = alert.id.to_be_bytes();
        if !self.alerts.contains_key(key)? {
            return Err(StorageError::NotFound(alert.id));
        }
        self.alerts.insert(key, serde_json::to_vec(alert)?)?;
        Ok(())
    }

    fn dispose(
        &self,
        id: u64,
        disposal: Disposal,
        at: DateTime<Utc>,
    ) -> Result<(Alert, bool), StorageError> {
        let mut changed = false;
        let mut failure: Option<StorageError> = None;
        // the closure reruns on compare-and-swap conflicts
        let stored = self.alerts.update_and_fetch(id.to_be_bytes(), |old| {
            let old = old?;
            changed = false;
            failure = None;
            let mut alert = match serde_json::from_slice::<Alert>(old) {
                Ok(alert) => alert,
                Err(e) => {
                    failure = Some(e.into());
                    return Some(old.to_vec());
                }
            };
            if !disposal.apply(&mut alert, at) {
                return Some(old.to_vec());
            }
            match serde_json::to_vec(&alert) {
                Ok(bytes) => {
                    changed = true;
                    Some(bytes)
                }
                Err(e) => {
                    failure = Some(e.into());
                    Some(old.to_vec())
                }
            }
        })?;
        if let Some(e) = failure {
            return Err(e);
        }
        let bytes = stored.ok_or(StorageError::NotFound(id))?;
        Ok((serde_json::from_slice(&bytes)?, changed))
    }

    fn insert_unless_pending(
        &self,
        alert: Alert,
        cutoff: DateTime<Utc>,
    ) -> Result<PendingInsert, StorageError> {
        let _guard = self.insert_lock.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = self
            .find_pending_since(&alert.signature, cutoff)?
            .into_iter()
            .next()
        {
            return Ok(PendingInsert::Suppressed(existing));
        }
        Ok(PendingInsert::Inserted(self.insert_alert(alert)?))
    }

    fn find_pending_since(
        &self,
        signature: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StorageError> {
        let mut start = signature_prefix(signature);
        start.extend_from_slice(&sortable_micros(cutoff));
        let mut end = signature.as_bytes().to_vec();
        end.push(1);

        let mut out = Vec::new();
        for item in self.signatures.range(start..end).rev() {
            let (key, _) = item?;
            let Some(id) = indexed_id(&key) else {
                warn!(signature, key = ?key, "Malformed alert signature index key");
                continue;
            };
            match self.get(id)? {
                Some(alert) if alert.is_pending() => out.push(alert),
                Some(_) => {}
                None => warn!(signature, id, "Signature index points at a missing alert"),
            }
        }
        Ok(out)
    }

    fn list_pending(&self) -> Result<Vec<Alert>, StorageError> {
        let mut pending: Vec<Alert> = self
            .decode_alerts()?
            .into_iter()
            .filter(Alert::is_pending)
            .collect();
        sort_newest_first(&mut pending);
        Ok(pending)
    }

    fn list_recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError> {
        let mut all = self.decode_alerts()?;
        sort_newest_first(&mut all);
        all.truncate(limit);
        Ok(all)
    }

    fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Alert>, StorageError> {
        let mut recent: Vec<Alert> = self
            .decode_alerts()?
            .into_iter()
            .filter(|a| a.created_at >= cutoff)
            .collect();
        recent.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(recent)
    }

    fn backend_name(&self) -> &'static str {
        "sled"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{alert_signature, AlertSeverity, AlertType, TagValue};
    use chrono::Duration;

    fn alert_at(device_id: DeviceId, created_at: DateTime<Utc>) -> Alert {
        Alert {
            id: 0,
            device_id,
            measurement_id: 5,
            alert_type: AlertType::Deviation,
            severity: AlertSeverity::High,
            message: "deviation".to_string(),
            actual_value: 200.0,
            predicted_base_value: 100.0,
            deviation_percent: 100.0,
            created_at,
            acknowledged: false,
            acknowledged_at: None,
            ignored: false,
            ignored_at: None,
            signature: alert_signature(device_id, 5, AlertType::Deviation),
        }
    }

    fn open_temp() -> (tempfile::TempDir, SledStore) {
        let dir = tempfile::tempdir().expect("tempdir");
        let store = SledStore::open(dir.path().join("db")).expect("open sled");
        (dir, store)
    }

    #[test]
    fn series_are_isolated_and_ordered() {
        let (_dir, store) = open_temp();
        let base = DateTime::from_timestamp(1_700_000_000, 0).expect("ts");
        store
            .save(&[
                DataPoint::new(1, 1, 10.0, base),
                DataPoint::new(1, 1, 11.0, base + Duration::seconds(5)),
                DataPoint::new(1, 2, 99.0, base + Duration::seconds(9)),
                DataPoint::new(2, 1, 77.0, base + Duration::seconds(9)),
            ])
            .expect("save");

        let top = store.find_top_n(1, 1, 10).expect("query");
        assert_eq!(top.len(), 2);
        assert_eq!(top[0].value, TagValue::Float(11.0));
        assert_eq!(top[1].value, TagValue::Float(10.0));

        let latest = store.find_latest(1, 2).expect("query").expect("some");
        assert_eq!(latest.value.as_f64(), 99.0);
    }

    #[test]
    fn pre_epoch_timestamps_sort_first() {
        let (_dir, store) = open_temp();
        let before = DateTime::from_timestamp(-100, 0).expect("ts");
        let after = DateTime::from_timestamp(100, 0).expect("ts");
        store
            .save(&[DataPoint::new(1, 1, 2.0, after), DataPoint::new(1, 1, 1.0, before)])
            .expect("save");
        let latest = store.find_latest(1, 1).expect("query").expect("some");
        assert_eq!(latest.timestamp, after);
    }

    #[test]
    fn alerts_survive_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let id = {
            let store = SledStore::open(&path).expect("open");
            let stored = store.insert(alert_at(4, Utc::now())).expect("insert");
            store.flush().expect("flush");
            stored.id
        };

        let store = SledStore::open(&path).expect("reopen");
        let alert = store.get(id).expect("get").expect("present");
        assert_eq!(alert.signature, "4:5:DEVIATION");
        assert_eq!(store.list_pending().expect("pending").len(), 1);
    }

    #[test]
    fn pending_lookup_scans_only_its_signature() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let old = store.insert(alert_at(4, now - Duration::minutes(10))).expect("insert");
        let a = store.insert(alert_at(4, now - Duration::minutes(2))).expect("insert");
        let b = store.insert(alert_at(4, now - Duration::minutes(1))).expect("insert");
        // another signature, newer than everything above
        store.insert(alert_at(44, now)).expect("insert");
        store.dispose(a.id, Disposal::Acknowledge, now).expect("dispose");

        let sig = alert_signature(4, 5, AlertType::Deviation);
        let hits = store.find_pending_since(&sig, now - Duration::minutes(5)).expect("query");
        assert_eq!(hits.iter().map(|h| h.id).collect::<Vec<_>>(), vec![b.id]);

        let all = store.find_pending_since(&sig, now - Duration::hours(1)).expect("query");
        assert_eq!(all.iter().map(|h| h.id).collect::<Vec<_>>(), vec![b.id, old.id]);
    }

    #[test]
    fn corrupt_alert_fails_the_pending_lookup() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let good = store.insert(alert_at(4, now)).expect("insert");
        let bad = store.insert(alert_at(4, now)).expect("insert");
        store
            .alerts
            .insert(bad.id.to_be_bytes(), b"{not json".to_vec())
            .expect("overwrite");

        let sig = alert_signature(4, 5, AlertType::Deviation);
        assert!(matches!(
            store.find_pending_since(&sig, now - Duration::minutes(5)),
            Err(StorageError::Serialization(_))
        ));
        // listings skip the record and keep going
        let listed = store.list_recent(10).expect("list");
        assert_eq!(listed.iter().map(|a| a.id).collect::<Vec<_>>(), vec![good.id]);
        assert!(matches!(
            store.dispose(bad.id, Disposal::Ignore, now),
            Err(StorageError::Serialization(_))
        ));
    }

    #[test]
    fn signature_index_is_rebuilt_on_open() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("db");
        let now = Utc::now();
        let id = {
            let store = SledStore::open(&path).expect("open");
            let id = store.insert(alert_at(4, now)).expect("insert").id;
            store.signatures.clear().expect("clear index");
            store.flush().expect("flush");
            id
        };

        let store = SledStore::open(&path).expect("reopen");
        let sig = alert_signature(4, 5, AlertType::Deviation);
        let hits = store.find_pending_since(&sig, now - Duration::minutes(1)).expect("query");
        assert_eq!(hits.first().map(|a| a.id), Some(id));
    }

    #[test]
    fn concurrent_disposal_stamps_once() {
        let (_dir, store) = open_temp();
        let id = store.insert(alert_at(4, Utc::now())).expect("insert").id;

        let changed: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        let (_, changed) = store
                            .dispose(id, Disposal::Acknowledge, Utc::now())
                            .expect("dispose");
                        usize::from(changed)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).sum()
        });
        assert_eq!(changed, 1);
        assert!(matches!(
            store.dispose(999, Disposal::Acknowledge, Utc::now()),
            Err(StorageError::NotFound(999))
        ));
    }

    #[test]
    fn overlapping_conditional_inserts_store_one_alert() {
        let (_dir, store) = open_temp();
        let now = Utc::now();
        let cutoff = now - Duration::minutes(5);

        let inserted: usize = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| {
                    s.spawn(|| {
                        match store.insert_unless_pending(alert_at(4, now), cutoff).expect("insert") {
                            PendingInsert::Inserted(_) => 1,
                            PendingInsert::Suppressed(_) => 0,
                        }
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().expect("join")).sum()
        });
        assert_eq!(inserted, 1);
        assert_eq!(store.list_recent(10).expect("list").len(), 1);
    }
}
