//! In-process simulated transport
//!
//! Serves `sim://` endpoints (or every endpoint with `--simulate`). Each
//! subscribed address emits a noisy sine wave at the publishing interval;
//! reads return the same signal. Per-device counters and fault injection
//! make protocol behaviour testable without a network.

use async_trait::async_trait;
use chrono::Utc;
use dashmap::DashMap;
use rand_distr::{Distribution, Normal};
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

use super::address::NodeAddress;
use super::transport::{
    NotificationSender, ProtocolClient, ProtocolSession, ReadValue, TransportError,
    ValueNotification,
};
use crate::types::{Device, DeviceId, TagValue};

/// Per-device operation counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SimCounters {
    pub connects: usize,
    pub subscribes: usize,
    pub unsubscribes: usize,
    pub reads: usize,
    pub disconnects: usize,
}

#[derive(Default)]
struct Faults {
    connect: VecDeque<TransportError>,
    subscribe: VecDeque<TransportError>,
    read: VecDeque<TransportError>,
    disconnect: VecDeque<TransportError>,
    connect_delay: Option<Duration>,
}

#[derive(Default)]
struct Shared {
    counters: DashMap<DeviceId, SimCounters>,
    faults: DashMap<DeviceId, Faults>,
    sessions: DashMap<DeviceId, Arc<SimSession>>,
}

impl Shared {
    fn bump(&self, device_id: DeviceId, f: impl FnOnce(&mut SimCounters)) {
        f(&mut self.counters.entry(device_id).or_default());
    }

    fn take_fault(
        &self,
        device_id: DeviceId,
        pick: impl FnOnce(&mut Faults) -> &mut VecDeque<TransportError>,
    ) -> Option<TransportError> {
        self.faults.get_mut(&device_id).and_then(|mut f| pick(f.value_mut()).pop_front())
    }
}

/// Simulated protocol client.
pub struct SimulatedClient {
    shared: Arc<Shared>,
    /// Periodic emission; off for tests that push values explicitly
    emits: bool,
}

impl SimulatedClient {
    /// Emits a value for every subscribed address at the subscription's
    /// publishing interval.
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            emits: true,
        }
    }

    /// Never emits on its own; use `emit()`.
    pub fn silent() -> Self {
        Self {
            shared: Arc::new(Shared::default()),
            emits: false,
        }
    }

    pub fn counters(&self, device_id: DeviceId) -> SimCounters {
        self.shared
            .counters
            .get(&device_id)
            .map(|c| *c)
            .unwrap_or_default()
    }

    /// Addresses currently subscribed on the device's live session.
    pub fn active_subscriptions(&self, device_id: DeviceId) -> Vec<NodeAddress> {
        self.shared
            .sessions
            .get(&device_id)
            .map(|s| s.subscribed())
            .unwrap_or_default()
    }

    pub fn is_connected(&self, device_id: DeviceId) -> bool {
        self.shared.sessions.contains_key(&device_id)
    }

    pub fn fail_next_connect(&self, device_id: DeviceId, error: TransportError) {
        self.shared.faults.entry(device_id).or_default().connect.push_back(error);
    }

    pub fn fail_next_subscribe(&self, device_id: DeviceId, error: TransportError) {
        self.shared.faults.entry(device_id).or_default().subscribe.push_back(error);
    }

    pub fn fail_next_read(&self, device_id: DeviceId, error: TransportError) {
        self.shared.faults.entry(device_id).or_default().read.push_back(error);
    }

    pub fn fail_next_disconnect(&self, device_id: DeviceId, error: TransportError) {
        self.shared.faults.entry(device_id).or_default().disconnect.push_back(error);
    }

    /// Make every connect to this device stall for `delay`.
    pub fn delay_connect(&self, device_id: DeviceId, delay: Duration) {
        self.shared.faults.entry(device_id).or_default().connect_delay = Some(delay);
    }

    /// Push a value change through the device's live session, as the server
    /// would. Returns false when the address is not subscribed.
    pub async fn emit(&self, device_id: DeviceId, address: &NodeAddress, value: TagValue) -> bool {
        let session = match self.shared.sessions.get(&device_id) {
            Some(s) => s.clone(),
            None => return false,
        };
        if !session.is_subscribed(address) {
            return false;
        }
        session
            .notifications
            .send(ValueNotification {
                device_id,
                address: address.clone(),
                value,
                source_timestamp: Some(Utc::now()),
            })
            .await
            .is_ok()
    }
}

impl Default for SimulatedClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProtocolClient for SimulatedClient {
    async fn connect(
        &self,
        device: &Device,
        notifications: NotificationSender,
    ) -> Result<Arc<dyn ProtocolSession>, TransportError> {
        let delay = self
            .shared
            .faults
            .get(&device.id)
            .and_then(|f| f.connect_delay);
        self.shared.bump(device.id, |c| c.connects += 1);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if let Some(err) = self.shared.take_fault(device.id, |f| &mut f.connect) {
            return Err(err);
        }

        let session = Arc::new(SimSession {
            device_id: device.id,
            shared: Arc::downgrade(&self.shared),
            notifications,
            emit: self.emits,
            subscriptions: Mutex::new(HashMap::new()),
        });
        self.shared.sessions.insert(device.id, session.clone());
        Ok(session)
    }

    fn transport_name(&self) -> &str {
        "simulated"
    }
}

/// One simulated session.
pub struct SimSession {
    device_id: DeviceId,
    shared: std::sync::Weak<Shared>,
    notifications: NotificationSender,
    emit: bool,
    subscriptions: Mutex<HashMap<NodeAddress, Option<JoinHandle<()>>>>,
}

impl SimSession {
    fn subscribed(&self) -> Vec<NodeAddress> {
        let mut addresses: Vec<NodeAddress> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .keys()
            .cloned()
            .collect();
        addresses.sort();
        addresses
    }

    fn is_subscribed(&self, address: &NodeAddress) -> bool {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains_key(address)
    }

    fn with_shared<T>(&self, f: impl FnOnce(&Shared) -> T) -> Option<T> {
        self.shared.upgrade().map(|s| f(&s))
    }
}

/// Deterministic sine per address plus gaussian noise.
#[allow(clippy::cast_precision_loss)]
fn signal(address: &NodeAddress) -> f64 {
    let fp = address.fingerprint();
    let phase = (fp % 360) as f64;
    let base = 50.0 + (fp % 50) as f64;
    let t = Utc::now().timestamp_millis() as f64 / 1000.0;
    let noise = Normal::new(0.0, 0.5).map_or(0.0, |n| n.sample(&mut rand::thread_rng()));
    base + 10.0 * ((t / 60.0) * std::f64::consts::TAU + phase.to_radians()).sin() + noise
}

#[async_trait]
impl ProtocolSession for SimSession {
    async fn subscribe(
        &self,
        address: &NodeAddress,
        publishing_interval: Duration,
    ) -> Result<(), TransportError> {
        self.with_shared(|s| s.bump(self.device_id, |c| c.subscribes += 1));
        if let Some(Some(err)) = self.with_shared(|s| s.take_fault(self.device_id, |f| &mut f.subscribe)) {
            return Err(err);
        }

        let emitter = self.emit.then(|| {
            let tx = self.notifications.clone();
            let device_id = self.device_id;
            let address = address.clone();
            let period = publishing_interval.max(Duration::from_millis(10));
            tokio::spawn(async move {
                let mut ticker = tokio::time::interval(period);
                loop {
                    ticker.tick().await;
                    let n = ValueNotification {
                        device_id,
                        value: TagValue::Float(signal(&address)),
                        address: address.clone(),
                        source_timestamp: Some(Utc::now()),
                    };
                    if tx.send(n).await.is_err() {
                        return;
                    }
                }
            })
        });

        let previous = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address.clone(), emitter);
        if let Some(Some(old)) = previous {
            old.abort();
        }
        Ok(())
    }

    async fn unsubscribe(&self, address: &NodeAddress) -> Result<(), TransportError> {
        self.with_shared(|s| s.bump(self.device_id, |c| c.unsubscribes += 1));
        let removed = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
        match removed {
            Some(Some(handle)) => handle.abort(),
            Some(None) => {}
            None => {
                return Err(TransportError::ServiceFault(format!(
                    "Bad_MonitoredItemIdInvalid: {address}"
                )))
            }
        }
        Ok(())
    }

    async fn read(&self, addresses: &[NodeAddress]) -> Result<Vec<ReadValue>, TransportError> {
        self.with_shared(|s| s.bump(self.device_id, |c| c.reads += 1));
        if let Some(Some(err)) = self.with_shared(|s| s.take_fault(self.device_id, |f| &mut f.read)) {
            return Err(err);
        }
        let now = Utc::now();
        Ok(addresses
            .iter()
            .map(|a| ReadValue {
                address: a.clone(),
                value: Some(TagValue::Float(signal(a))),
                source_timestamp: Some(now),
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        let handles: Vec<_> = self
            .subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .drain()
            .filter_map(|(_, h)| h)
            .collect();
        for h in handles {
            h.abort();
        }

        let fault = self.with_shared(|s| {
            s.bump(self.device_id, |c| c.disconnects += 1);
            s.sessions.remove(&self.device_id);
            s.take_fault(self.device_id, |f| &mut f.disconnect)
        });
        match fault {
            Some(Some(err)) => Err(err),
            _ => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[tokio::test]
    async fn counts_and_tracks_subscriptions() {
        let client = SimulatedClient::silent();
        let (tx, mut rx) = mpsc::channel(8);
        let session = client
            .connect(&Device::new(9, "d", "sim://d"), tx)
            .await
            .map_err(|e| e.to_string())
            .expect("connect");

        let a = NodeAddress::numeric(2, 1);
        session.subscribe(&a, Duration::from_secs(1)).await.expect("subscribe");
        assert_eq!(client.active_subscriptions(9), vec![a.clone()]);

        assert!(client.emit(9, &a, TagValue::Float(4.0)).await);
        let n = rx.recv().await.expect("notification");
        assert_eq!(n.value, TagValue::Float(4.0));
        assert!(!client.emit(9, &NodeAddress::numeric(2, 2), TagValue::Null).await);

        session.unsubscribe(&a).await.expect("unsubscribe");
        assert!(session.unsubscribe(&a).await.is_err());
        session.disconnect().await.expect("disconnect");
        assert!(!client.is_connected(9));

        let c = client.counters(9);
        assert_eq!((c.connects, c.subscribes, c.unsubscribes, c.disconnects), (1, 1, 2, 1));
    }

    #[tokio::test]
    async fn injected_faults_fire_once() {
        let client = SimulatedClient::silent();
        client.fail_next_connect(1, TransportError::ServiceFault("Bad_TooManySessions".into()));
        let (tx, _rx) = mpsc::channel(8);
        let device = Device::new(1, "d", "sim://d");
        assert!(client.connect(&device, tx.clone()).await.is_err());
        assert!(client.connect(&device, tx).await.is_ok());
        assert_eq!(client.counters(1).connects, 2);
    }

    #[tokio::test]
    async fn emitting_client_pushes_values() {
        let client = SimulatedClient::new();
        let (tx, mut rx) = mpsc::channel(8);
        let session = client
            .connect(&Device::new(3, "d", "sim://d"), tx)
            .await
            .map_err(|e| e.to_string())
            .expect("connect");
        session
            .subscribe(&NodeAddress::string(1, "Temp"), Duration::from_millis(10))
            .await
            .expect("subscribe");
        let n = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .expect("in time")
            .expect("value");
        assert!(n.value.is_numeric());
        session.disconnect().await.expect("disconnect");
    }
}
