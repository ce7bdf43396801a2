//! Per-device session pool
//!
//! One session per device, created lazily and reused across ticks with no
//! liveness check. A failing device either enters backoff (session or
//! resource limits) or has its session dropped so the next tick reconnects.
//!
//! ```text
//! NoSession --connect ok--> Connected --limit error--> Backoff
//!     ^                         |                         |
//!     +------other error--------+<----cooldown elapsed----+
//! ```

use dashmap::DashMap;
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use super::address::NodeAddress;
use super::transport::{NotificationSender, ProtocolClient, ProtocolSession};
use super::{bounded, AcquisitionError, ShutdownReport};
use crate::config::AcquisitionConfig;
use crate::types::{Device, DeviceId};

/// Observable per-device state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    NoSession,
    Connected,
    Backoff { remaining: Duration },
}

/// What a device failure did to its session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// Resource-limit error: no connection attempts until the cooldown elapses
    Backoff,
    /// Any other error: session dropped, next tick reconnects
    Invalidated,
}

/// A live session plus the addresses subscribed on it.
pub struct DeviceSession {
    pub device_id: DeviceId,
    session: Arc<dyn ProtocolSession>,
    subscriptions: Mutex<HashSet<NodeAddress>>,
}

impl DeviceSession {
    pub fn protocol(&self) -> &dyn ProtocolSession {
        self.session.as_ref()
    }

    /// Snapshot of active subscriptions.
    pub fn subscribed(&self) -> HashSet<NodeAddress> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn mark_subscribed(&self, address: NodeAddress) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(address);
    }

    pub(crate) fn mark_unsubscribed(&self, address: &NodeAddress) {
        self.subscriptions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(address);
    }
}

/// Sessions and backoff deadlines, keyed by device.
pub struct SessionPool {
    client: Arc<dyn ProtocolClient>,
    notifications: NotificationSender,
    config: AcquisitionConfig,
    sessions: DashMap<DeviceId, Arc<DeviceSession>>,
    backoff_until: DashMap<DeviceId, Instant>,
}

impl SessionPool {
    pub fn new(
        client: Arc<dyn ProtocolClient>,
        notifications: NotificationSender,
        config: AcquisitionConfig,
    ) -> Self {
        Self {
            client,
            notifications,
            config,
            sessions: DashMap::new(),
            backoff_until: DashMap::new(),
        }
    }

    pub fn state(&self, device_id: DeviceId) -> DeviceState {
        let now = Instant::now();
        if let Some(until) = self.backoff_until.get(&device_id).map(|u| *u) {
            if until > now {
                return DeviceState::Backoff {
                    remaining: until - now,
                };
            }
        }
        if self.sessions.contains_key(&device_id) {
            DeviceState::Connected
        } else {
            DeviceState::NoSession
        }
    }

    /// True while the device's cooldown is running. An elapsed deadline is
    /// cleared here, returning the device to `NoSession`.
    pub fn in_backoff(&self, device_id: DeviceId) -> bool {
        let Some(until) = self.backoff_until.get(&device_id).map(|u| *u) else {
            return false;
        };
        if until > Instant::now() {
            return true;
        }
        self.backoff_until.remove(&device_id);
        info!(device = device_id, "Backoff elapsed, device eligible for reconnect");
        false
    }

    pub fn get(&self, device_id: DeviceId) -> Option<Arc<DeviceSession>> {
        self.sessions.get(&device_id).map(|s| s.value().clone())
    }

    /// Reuse the device's session or connect a new one.
    pub async fn get_or_connect(&self, device: &Device) -> Result<Arc<DeviceSession>, AcquisitionError> {
        if let Some(existing) = self.get(device.id) {
            return Ok(existing);
        }

        let session = bounded(
            "connect",
            self.config.operation_timeout(),
            self.client.connect(device, self.notifications.clone()),
        )
        .await?;

        info!(
            device = device.id,
            name = %device.name,
            endpoint = %device.connection.endpoint,
            transport = self.client.transport_name(),
            "Session connected"
        );

        let entry = Arc::new(DeviceSession {
            device_id: device.id,
            session,
            subscriptions: Mutex::new(HashSet::new()),
        });
        self.sessions.insert(device.id, entry.clone());
        Ok(entry)
    }

    /// Classify a device failure and apply it: backoff for resource limits,
    /// otherwise drop the session. Either way the session is disconnected.
    pub async fn record_failure(&self, device_id: DeviceId, err: &AcquisitionError) -> FailureAction {
        let action = if err.is_session_limit(&self.config.session_limit_markers) {
            let now = Instant::now();
            let until = now.checked_add(self.config.session_backoff()).unwrap_or(now);
            self.backoff_until.insert(device_id, until);
            warn!(
                device = device_id,
                error = %err,
                cooldown_ms = self.config.session_backoff_ms,
                "Session limit reached, backing off"
            );
            FailureAction::Backoff
        } else {
            warn!(device = device_id, error = %err, "Device operation failed, invalidating session");
            FailureAction::Invalidated
        };
        self.drop_session(device_id, self.config.operation_timeout()).await;
        action
    }

    /// Remove and disconnect the device's session. Disconnect failures are
    /// logged; the session is gone either way. Returns false if a disconnect
    /// was attempted and failed.
    pub async fn drop_session(&self, device_id: DeviceId, limit: Duration) -> bool {
        let Some((_, entry)) = self.sessions.remove(&device_id) else {
            return true;
        };
        match bounded("disconnect", limit, entry.protocol().disconnect()).await {
            Ok(()) => {
                debug!(device = device_id, "Session disconnected");
                true
            }
            Err(e) => {
                warn!(device = device_id, error = %e, "Disconnect failed, session dropped anyway");
                false
            }
        }
    }

    pub fn clear_backoff(&self, device_id: DeviceId) {
        self.backoff_until.remove(&device_id);
    }

    /// Devices with a session or a backoff deadline.
    pub fn tracked_device_ids(&self) -> HashSet<DeviceId> {
        self.sessions
            .iter()
            .map(|e| *e.key())
            .chain(self.backoff_until.iter().map(|e| *e.key()))
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Disconnect every session concurrently, each bounded by `limit`.
    pub async fn close_all(&self, limit: Duration) -> ShutdownReport {
        let ids: Vec<DeviceId> = self.sessions.iter().map(|e| *e.key()).collect();
        let results = futures::future::join_all(ids.iter().map(|&id| self.drop_session(id, limit))).await;
        self.backoff_until.clear();

        let closed = results.iter().filter(|ok| **ok).count();
        ShutdownReport {
            closed,
            failed: results.len() - closed,
        }
    }
}
