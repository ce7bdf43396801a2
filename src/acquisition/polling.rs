//! Read-per-tick acquisition
//!
//! Shares the session pool and failure classification with the subscription
//! collector, but instead of subscribing it reads every resolved address
//! once per tick and stores the batch.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::session::{DeviceState, SessionPool};
use super::transport::ProtocolClient;
use super::{bounded, resolve_measurements, AcquisitionError, Collector, ShutdownReport, TickSummary};
use crate::config::AcquisitionConfig;
use crate::registry::DeviceRegistry;
use crate::storage::TimeSeriesStore;
use crate::types::{DataPoint, Device, DeviceId};

pub struct PollingCollector {
    config: AcquisitionConfig,
    registry: Arc<dyn DeviceRegistry>,
    pool: SessionPool,
    storage: Arc<dyn TimeSeriesStore>,
}

impl PollingCollector {
    pub fn new(
        config: AcquisitionConfig,
        registry: Arc<dyn DeviceRegistry>,
        client: Arc<dyn ProtocolClient>,
        storage: Arc<dyn TimeSeriesStore>,
    ) -> Self {
        // Polling never subscribes, so nothing is pushed on this channel.
        let (tx, _rx) = mpsc::channel(1);
        Self {
            pool: SessionPool::new(client, tx, config.clone()),
            config,
            registry,
            storage,
        }
    }

    pub fn device_state(&self, device_id: DeviceId) -> DeviceState {
        self.pool.state(device_id)
    }

    /// Read all of a device's addresses; returns (points saved, addresses skipped).
    async fn poll_device(&self, device: &Device) -> Result<(usize, usize), AcquisitionError> {
        let session = self.pool.get_or_connect(device).await?;
        let (resolved, skipped) = resolve_measurements(device);
        if resolved.is_empty() {
            return Ok((0, skipped));
        }

        let addresses: Vec<_> = resolved.keys().cloned().collect();
        let values = bounded(
            "read",
            self.config.operation_timeout(),
            session.protocol().read(&addresses),
        )
        .await?;

        let now = Utc::now();
        let points: Vec<DataPoint> = values
            .into_iter()
            .filter_map(|rv| {
                let measurement = resolved.get(&rv.address)?;
                let value = rv.value?;
                Some(DataPoint {
                    device_id: device.id,
                    measurement_id: measurement.id,
                    value,
                    timestamp: rv.source_timestamp.unwrap_or(now),
                })
            })
            .collect();

        if points.is_empty() {
            return Ok((0, skipped));
        }
        match self.storage.save(&points) {
            Ok(()) => Ok((points.len(), skipped)),
            Err(e) => {
                warn!(device = device.id, points = points.len(), error = %e, "Failed to store polled values");
                Ok((0, skipped))
            }
        }
    }
}

#[async_trait]
impl Collector for PollingCollector {
    async fn collect_once(&self) -> Result<TickSummary, AcquisitionError> {
        let devices = self.registry.list_devices_with_measurements()?;
        let mut summary = TickSummary {
            devices: devices.len(),
            ..TickSummary::default()
        };

        let current: HashSet<DeviceId> = devices.iter().map(|d| d.id).collect();
        let mut gone: Vec<DeviceId> = self
            .pool
            .tracked_device_ids()
            .into_iter()
            .filter(|id| !current.contains(id))
            .collect();
        gone.sort_unstable();
        summary.reset = devices.is_empty() && !gone.is_empty();
        for id in gone {
            self.pool.drop_session(id, self.config.operation_timeout()).await;
            self.pool.clear_backoff(id);
            summary.removed += 1;
            info!(device = id, "Device removed, session closed");
        }

        let (backing_off, active): (Vec<&Device>, Vec<&Device>) =
            devices.iter().partition(|d| self.pool.in_backoff(d.id));
        summary.in_backoff = backing_off.len();

        let results = futures::future::join_all(active.iter().map(|d| async move {
            let result = self.poll_device(d).await;
            (d.id, result)
        }))
        .await;

        for (device_id, result) in results {
            match result {
                Ok((saved, skipped)) => {
                    summary.synced += 1;
                    summary.points_saved += saved;
                    summary.addresses_skipped += skipped;
                }
                Err(e) => {
                    summary.failed += 1;
                    self.pool.record_failure(device_id, &e).await;
                }
            }
        }

        debug!(
            devices = summary.devices,
            synced = summary.synced,
            failed = summary.failed,
            points = summary.points_saved,
            "Polling tick complete"
        );
        Ok(summary)
    }

    async fn shutdown(&self) -> ShutdownReport {
        let report = self
            .pool
            .close_all(self.config.shutdown_disconnect_timeout())
            .await;
        info!(closed = report.closed, failed = report.failed, "Polling sessions closed");
        report
    }

    fn name(&self) -> &'static str {
        "polling"
    }
}
