//! Time-series and alert persistence
//!
//! Two pluggable traits sit between the core subsystems and their storage:
//! - `TimeSeriesStore`: measurement history written by acquisition, read by
//!   the deviation scanner and predictor input assembly
//! - `AlertStore`: persisted alerts, written by the scanner and disposal
//!   service, queried by operators
//!
//! Backends:
//! - `memory`: in-memory maps for testing and minimal deployments
//! - `sled_store`: embedded sled database with big-endian sortable keys

pub mod memory;
pub mod sled_store;

pub use memory::{InMemoryAlertStore, InMemoryTimeSeries};
pub use sled_store::SledStore;

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::config::{StorageBackend, StorageConfig};
use crate::types::{Alert, DataPoint, DeviceId, Disposal, MeasurementId};

/// Storage errors
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(String),
    #[error("serialization error: {0}")]
    Serialization(String),
    #[error("alert {0} not found")]
    NotFound(u64),
}

impl From<sled::Error> for StorageError {
    fn from(err: sled::Error) -> Self {
        StorageError::Database(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

/// Result of a conditional alert insert.
#[derive(Debug, Clone, PartialEq)]
pub enum PendingInsert {
    /// Stored with its assigned id
    Inserted(Alert),
    /// Not stored; this newest pending alert already covers the signature
    Suppressed(Alert),
}

/// Measurement history backend.
///
/// Implementations must be thread-safe (Send + Sync) for shared access
/// across async tasks.
pub trait TimeSeriesStore: Send + Sync {
    /// Persist a batch of points. A point with the same (device, measurement,
    /// timestamp) as an existing one replaces it.
    fn save(&self, points: &[DataPoint]) -> Result<(), StorageError>;

    /// Newest point for a measurement.
    fn find_latest(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
    ) -> Result<Option<DataPoint>, StorageError>;

    /// Up to `n` newest points, newest first.
    fn find_top_n(
        &self,
        device_id: DeviceId,
        measurement_id: MeasurementId,
        n: usize,
    ) -> Result<Vec<DataPoint>, StorageError>;

    /// Backend name for logging
    fn backend_name(&self) -> &'static str;
}

/// Alert persistence backend.
pub trait AlertStore: Send + Sync {
    /// Persist a new alert, assigning its id. Returns the stored alert.
    fn insert(&self, alert: Alert) -> Result<Alert, StorageError>;

    fn get(&self, id: u64) -> Result<Option<Alert>, StorageError>;

    /// Overwrite an existing alert. `NotFound` if the id is unknown.
    fn update(&self, alert: &Alert) -> Result<(), StorageError>;

    /// Apply a disposal as one read-modify-write. Returns the resulting
    /// alert and whether it changed. `NotFound` if the id is unknown.
    fn dispose(
        &self,
        id: u64,
        disposal: Disposal,
        at: DateTime<Utc>,
    ) -> Result<(Alert, bool), StorageError>;

    /// Insert `alert` unless a pending alert with the same signature was
    /// created at or after `cutoff`. The check and the insert are atomic
    /// with respect to other calls on the same store.
    fn insert_unless_pending(
        &self,
        alert: Alert,
        cutoff: DateTime<Utc>,
    ) -> Result<PendingInsert, StorageError>;

    /// Pending alerts with this signature created at or after `cutoff`,
    /// newest first.
    fn find_pending_since(
        &self,
        signature: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Alert>, StorageError>;

    /// All pending alerts, newest first.
    fn list_pending(&self) -> Result<Vec<Alert>, StorageError>;

    /// Up to `limit` alerts regardless of state, newest first.
    fn list_recent(&self, limit: usize) -> Result<Vec<Alert>, StorageError>;

    /// Alerts created at or after `cutoff`, oldest first.
    fn list_since(&self, cutoff: DateTime<Utc>) -> Result<Vec<Alert>, StorageError>;

    fn backend_name(&self) -> &'static str;
}

/// Open the configured backend, returning both store handles.
pub fn open_stores(
    config: &StorageConfig,
) -> Result<(Arc<dyn TimeSeriesStore>, Arc<dyn AlertStore>), StorageError> {
    match config.backend {
        StorageBackend::Memory => {
            let series: Arc<dyn TimeSeriesStore> = Arc::new(InMemoryTimeSeries::new());
            let alerts: Arc<dyn AlertStore> = Arc::new(InMemoryAlertStore::new());
            Ok((series, alerts))
        }
        StorageBackend::Sled => {
            let store = Arc::new(SledStore::open(&config.path)?);
            tracing::info!(path = %config.path, "Opened sled storage");
            let series: Arc<dyn TimeSeriesStore> = store.clone();
            let alerts: Arc<dyn AlertStore> = store;
            Ok((series, alerts))
        }
    }
}

/// Sort newest-first by creation time, ties broken by id.
pub(crate) fn sort_newest_first(alerts: &mut [Alert]) {
    alerts.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_backend_opens_without_path() {
        let config = StorageConfig::default();
        let (ts, alerts) = open_stores(&config).expect("memory backend");
        assert_eq!(ts.backend_name(), "InMemory");
        assert_eq!(alerts.backend_name(), "InMemory");
    }

    #[test]
    fn sled_backend_shares_one_database() {
        let dir = tempfile::tempdir().expect("tempdir");
        let config = StorageConfig {
            backend: StorageBackend::Sled,
            path: dir.path().join("db").display().to_string(),
        };
        let (ts, alerts) = open_stores(&config).expect("sled backend");
        assert_eq!(ts.backend_name(), "sled");
        assert_eq!(alerts.backend_name(), "sled");
    }
}
