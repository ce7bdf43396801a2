//! Subscription-based acquisition
//!
//! Each tick diffs every device's resolved measurement addresses against its
//! session's active subscriptions: new addresses are subscribed, vanished
//! ones cancelled, unchanged ones left alone. Devices that leave the registry
//! are torn down; an empty registry tears everything down.
//!
//! Value changes arrive on an mpsc channel and are resolved by the
//! `ValueRouter` through a reverse index `(device, address) -> Measurement`.
//! The index entry is written before the subscribe call, so a value that
//! races the tick's bookkeeping still finds its measurement.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::{DashMap, DashSet};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::address::NodeAddress;
use super::session::{DeviceState, FailureAction, SessionPool};
use super::transport::{ProtocolClient, ValueNotification};
use super::{bounded, resolve_measurements, AcquisitionError, Collector, ShutdownReport, TickSummary};
use crate::config::defaults::NOTIFICATION_CHANNEL_CAPACITY;
use crate::config::AcquisitionConfig;
use crate::registry::DeviceRegistry;
use crate::storage::TimeSeriesStore;
use crate::types::{DataPoint, Device, DeviceId, Measurement};

// ============================================================================
// Value routing
// ============================================================================

/// What happened to one notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Stored,
    /// Device no longer in the registry
    UnknownDevice,
    /// No measurement bound to this address (cancelled or never subscribed)
    UnknownAddress,
    /// Storage rejected the point; logged and dropped
    StorageFailed,
}

/// Resolves value notifications to measurements and stores them.
pub struct ValueRouter {
    index: DashMap<(DeviceId, NodeAddress), Measurement>,
    known_devices: DashSet<DeviceId>,
    storage: Arc<dyn TimeSeriesStore>,
    stored: AtomicU64,
    dropped: AtomicU64,
}

impl ValueRouter {
    pub fn new(storage: Arc<dyn TimeSeriesStore>) -> Self {
        Self {
            index: DashMap::new(),
            known_devices: DashSet::new(),
            storage,
            stored: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Resolve and store one notification. Never blocks on the tick.
    pub fn route(&self, n: ValueNotification) -> RouteOutcome {
        if !self.known_devices.contains(&n.device_id) {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::UnknownDevice;
        }
        let Some(measurement_id) = self
            .index
            .get(&(n.device_id, n.address.clone()))
            .map(|m| m.id)
        else {
            debug!(device = n.device_id, address = %n.address, "Value for unbound address dropped");
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return RouteOutcome::UnknownAddress;
        };

        let point = DataPoint {
            device_id: n.device_id,
            measurement_id,
            value: n.value,
            timestamp: n.source_timestamp.unwrap_or_else(Utc::now),
        };
        match self.storage.save(std::slice::from_ref(&point)) {
            Ok(()) => {
                self.stored.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::Stored
            }
            Err(e) => {
                warn!(device = n.device_id, measurement = measurement_id, error = %e, "Failed to store value");
                self.dropped.fetch_add(1, Ordering::Relaxed);
                RouteOutcome::StorageFailed
            }
        }
    }

    /// Drain notifications until cancelled or every sender is gone.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<ValueNotification>, cancel: CancellationToken) {
        info!("Value router started");
        loop {
            tokio::select! {
                () = cancel.cancelled() => break,
                next = rx.recv() => match next {
                    Some(n) => { self.route(n); }
                    None => break,
                },
            }
        }
        info!(
            stored = self.stored.load(Ordering::Relaxed),
            dropped = self.dropped.load(Ordering::Relaxed),
            "Value router stopped"
        );
    }

    pub fn resolve(&self, device_id: DeviceId, address: &NodeAddress) -> Option<Measurement> {
        self.index.get(&(device_id, address.clone())).map(|m| m.clone())
    }

    pub fn index_len(&self) -> usize {
        self.index.len()
    }

    /// (stored, dropped) since start
    pub fn counts(&self) -> (u64, u64) {
        (self.stored.load(Ordering::Relaxed), self.dropped.load(Ordering::Relaxed))
    }

    fn bind(&self, device_id: DeviceId, address: NodeAddress, measurement: Measurement) {
        self.index.insert((device_id, address), measurement);
    }

    fn unbind(&self, device_id: DeviceId, address: &NodeAddress) {
        self.index.remove(&(device_id, address.clone()));
    }

    fn forget_device(&self, device_id: DeviceId) {
        self.index.retain(|(d, _), _| *d != device_id);
    }

    fn indexed_devices(&self) -> HashSet<DeviceId> {
        self.index.iter().map(|e| e.key().0).collect()
    }

    fn set_known_devices(&self, ids: impl IntoIterator<Item = DeviceId>) {
        let ids: HashSet<DeviceId> = ids.into_iter().collect();
        self.known_devices.retain(|id| ids.contains(id));
        for id in ids {
            self.known_devices.insert(id);
        }
    }

    fn clear(&self) {
        self.index.clear();
        self.known_devices.clear();
    }
}

// ============================================================================
// Subscription collector
// ============================================================================

/// Per-device result of one diff pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
struct DeviceSync {
    created: usize,
    cancelled: usize,
    skipped: usize,
}

/// Canonical acquisition strategy: persistent sessions with server-pushed
/// value changes.
pub struct SubscriptionCollector {
    config: AcquisitionConfig,
    registry: Arc<dyn DeviceRegistry>,
    pool: SessionPool,
    router: Arc<ValueRouter>,
}

impl SubscriptionCollector {
    /// Build the collector. The returned receiver carries every value change
    /// and must be drained with `ValueRouter::run`.
    pub fn new(
        config: AcquisitionConfig,
        registry: Arc<dyn DeviceRegistry>,
        client: Arc<dyn ProtocolClient>,
        storage: Arc<dyn TimeSeriesStore>,
    ) -> (Self, mpsc::Receiver<ValueNotification>) {
        let (tx, rx) = mpsc::channel(NOTIFICATION_CHANNEL_CAPACITY);
        let collector = Self {
            pool: SessionPool::new(client, tx, config.clone()),
            config,
            registry,
            router: Arc::new(ValueRouter::new(storage)),
        };
        (collector, rx)
    }

    pub fn router(&self) -> Arc<ValueRouter> {
        self.router.clone()
    }

    pub fn device_state(&self, device_id: DeviceId) -> DeviceState {
        self.pool.state(device_id)
    }

    /// Active subscriptions on the device's session (0 without a session).
    pub fn subscription_count(&self, device_id: DeviceId) -> usize {
        self.pool.get(device_id).map_or(0, |s| s.subscription_count())
    }

    pub fn session_count(&self) -> usize {
        self.pool.session_count()
    }

    /// Diff one device's measurements against its live subscriptions.
    async fn sync_device(&self, device: &Device) -> Result<DeviceSync, AcquisitionError> {
        let session = self.pool.get_or_connect(device).await?;
        let (desired, skipped) = resolve_measurements(device);
        let current = session.subscribed();
        let op_timeout = self.config.operation_timeout();
        let mut sync = DeviceSync {
            skipped,
            ..DeviceSync::default()
        };

        let mut stale: Vec<&NodeAddress> = current.iter().filter(|a| !desired.contains_key(*a)).collect();
        stale.sort();
        for address in stale {
            bounded("unsubscribe", op_timeout, session.protocol().unsubscribe(address)).await?;
            session.mark_unsubscribed(address);
            self.router.unbind(device.id, address);
            sync.cancelled += 1;
            debug!(device = device.id, address = %address, "Subscription cancelled");
        }

        for (address, measurement) in desired {
            if current.contains(&address) {
                // measurement metadata may have changed under the same address
                self.router.bind(device.id, address, measurement);
                continue;
            }

            self.router.bind(device.id, address.clone(), measurement.clone());
            let subscribed = bounded(
                "subscribe",
                op_timeout,
                session
                    .protocol()
                    .subscribe(&address, self.config.publishing_interval()),
            )
            .await;
            if let Err(e) = subscribed {
                self.router.unbind(device.id, &address);
                return Err(e);
            }
            debug!(device = device.id, measurement = measurement.id, address = %address, "Subscription created");
            session.mark_subscribed(address);
            sync.created += 1;
        }

        Ok(sync)
    }

    /// Cancel every subscription of a device and drop its session.
    pub async fn remove_device(&self, device_id: DeviceId) {
        if let Some(session) = self.pool.get(device_id) {
            let op_timeout = self.config.operation_timeout();
            for address in session.subscribed() {
                if let Err(e) = bounded("unsubscribe", op_timeout, session.protocol().unsubscribe(&address)).await {
                    debug!(device = device_id, address = %address, error = %e, "Unsubscribe during removal failed");
                }
                session.mark_unsubscribed(&address);
            }
        }
        self.pool.drop_session(device_id, self.config.operation_timeout()).await;
        self.pool.clear_backoff(device_id);
        self.router.forget_device(device_id);
        info!(device = device_id, "Device removed, session closed");
    }

    /// Tear down every session and clear all indices.
    pub async fn full_reset(&self) {
        let ids = self.pool.tracked_device_ids();
        for id in ids {
            self.remove_device(id).await;
        }
        self.router.clear();
    }
}

#[async_trait]
impl Collector for SubscriptionCollector {
    async fn collect_once(&self) -> Result<TickSummary, AcquisitionError> {
        let devices = self.registry.list_devices_with_measurements()?;
        let mut summary = TickSummary {
            devices: devices.len(),
            ..TickSummary::default()
        };

        if devices.is_empty() {
            if !self.pool.tracked_device_ids().is_empty() || self.router.index_len() > 0 {
                info!("Registry is empty, tearing down all sessions");
                self.full_reset().await;
                summary.reset = true;
            }
            self.router.set_known_devices(std::iter::empty());
            return Ok(summary);
        }

        let current: HashSet<DeviceId> = devices.iter().map(|d| d.id).collect();
        self.router.set_known_devices(current.iter().copied());

        let mut gone: Vec<DeviceId> = self
            .pool
            .tracked_device_ids()
            .union(&self.router.indexed_devices())
            .filter(|id| !current.contains(id))
            .copied()
            .collect();
        gone.sort_unstable();
        for id in gone {
            self.remove_device(id).await;
            summary.removed += 1;
        }

        let (backing_off, active): (Vec<&Device>, Vec<&Device>) =
            devices.iter().partition(|d| self.pool.in_backoff(d.id));
        summary.in_backoff = backing_off.len();

        let results = futures::future::join_all(active.iter().map(|d| async move {
            let result = self.sync_device(d).await;
            (d.id, result)
        }))
        .await;

        for (device_id, result) in results {
            match result {
                Ok(sync) => {
                    summary.synced += 1;
                    summary.subscriptions_created += sync.created;
                    summary.subscriptions_cancelled += sync.cancelled;
                    summary.addresses_skipped += sync.skipped;
                }
                Err(e) => {
                    summary.failed += 1;
                    if self.pool.record_failure(device_id, &e).await == FailureAction::Invalidated {
                        debug!(device = device_id, "Next tick will reconnect");
                    }
                    // the session is gone, and its subscriptions with it
                    self.router.forget_device(device_id);
                }
            }
        }

        debug!(
            devices = summary.devices,
            synced = summary.synced,
            in_backoff = summary.in_backoff,
            failed = summary.failed,
            created = summary.subscriptions_created,
            cancelled = summary.subscriptions_cancelled,
            "Acquisition tick complete"
        );
        Ok(summary)
    }

    async fn shutdown(&self) -> ShutdownReport {
        let report = self
            .pool
            .close_all(self.config.shutdown_disconnect_timeout())
            .await;
        self.router.clear();
        info!(closed = report.closed, failed = report.failed, "Subscription sessions closed");
        report
    }

    fn name(&self) -> &'static str {
        "subscription"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::acquisition::simulated::SimulatedClient;
    use crate::registry::StaticRegistry;
    use crate::storage::InMemoryTimeSeries;
    use crate::types::TagValue;

    #[test]
    fn router_ignores_unknown_device_and_address() {
        let storage = Arc::new(InMemoryTimeSeries::new());
        let router = ValueRouter::new(storage.clone());
        let addr = NodeAddress::numeric(2, 7);
        let n = ValueNotification {
            device_id: 1,
            address: addr.clone(),
            value: TagValue::Float(1.0),
            source_timestamp: None,
        };

        assert_eq!(router.route(n.clone()), RouteOutcome::UnknownDevice);
        router.set_known_devices([1]);
        assert_eq!(router.route(n.clone()), RouteOutcome::UnknownAddress);

        router.bind(
            1,
            addr,
            Measurement {
                id: 70,
                device_id: 1,
                name: "m".into(),
                address: "ns=2;i=7".into(),
            },
        );
        assert_eq!(router.route(n), RouteOutcome::Stored);
        assert_eq!(storage.find_latest(1, 70).expect("query").map(|p| p.value), Some(TagValue::Float(1.0)));
        assert_eq!(router.counts(), (1, 2));
    }

    #[tokio::test]
    async fn failed_subscribe_leaves_no_index_entry() {
        let client = Arc::new(SimulatedClient::silent());
        let registry = Arc::new(StaticRegistry::new(vec![
            Device::new(1, "d", "sim://d").with_measurement(10, "a", "ns=2;i=1"),
        ]));
        let (collector, _rx) = SubscriptionCollector::new(
            AcquisitionConfig::default(),
            registry,
            client.clone(),
            Arc::new(InMemoryTimeSeries::new()),
        );

        client.fail_next_subscribe(1, crate::acquisition::TransportError::ServiceFault("Bad_NodeIdUnknown".into()));
        let summary = collector.collect_once().await.expect("tick");
        assert_eq!(summary.failed, 1);
        assert_eq!(collector.router().index_len(), 0);
        assert_eq!(collector.device_state(1), DeviceState::NoSession);

        let summary = collector.collect_once().await.expect("tick");
        assert_eq!(summary.subscriptions_created, 1);
        assert!(collector.router().resolve(1, &NodeAddress::numeric(2, 1)).is_some());
    }
}
