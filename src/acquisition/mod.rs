//! Device data acquisition
//!
//! Keeps protocol sessions and subscriptions aligned with the device
//! registry and turns inbound values into stored `DataPoint`s.
//!
//! - `address`: node-id and endpoint grammar
//! - `transport`: `ProtocolClient` / `ProtocolSession` seam
//! - `session`: per-device session pool with backoff
//! - `engine`: subscription collector (diffing + value routing)
//! - `polling`: read-per-tick collector
//! - `simulated`: in-process transport for `sim://` endpoints and tests
//! - `opcua_client`: OPC UA transport for `opc.tcp://` endpoints (`opcua`
//!   feature)

pub mod address;
pub mod engine;
#[cfg(feature = "opcua")]
pub mod opcua_client;
pub mod polling;
pub mod session;
pub mod simulated;
pub mod transport;

pub use address::{AddressError, Endpoint, Identifier, NodeAddress};
pub use engine::{RouteOutcome, SubscriptionCollector, ValueRouter};
#[cfg(feature = "opcua")]
pub use opcua_client::{OpcUaClient, OpcUaSession};
pub use polling::PollingCollector;
pub use session::{DeviceSession, DeviceState, FailureAction, SessionPool};
pub use simulated::{SimCounters, SimulatedClient};
pub use transport::{
    EndpointRouter, NotificationSender, ProtocolClient, ProtocolSession, ReadValue,
    TransportError, ValueNotification,
};

use async_trait::async_trait;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use crate::registry::RegistryError;
use crate::types::{Device, Measurement};

/// Errors from one device's acquisition work.
#[derive(Debug, thiserror::Error)]
pub enum AcquisitionError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("device registry unavailable: {0}")]
    Registry(#[from] RegistryError),
}

impl AcquisitionError {
    /// Session/resource-limit errors put the device into backoff instead of
    /// forcing a reconnect.
    pub fn is_session_limit(&self, markers: &[String]) -> bool {
        match self {
            AcquisitionError::Transport(e) => e.is_session_limit(markers),
            _ => false,
        }
    }
}

/// Await a transport call with an upper bound on its duration.
pub(crate) async fn bounded<T>(
    operation: &'static str,
    limit: Duration,
    fut: impl Future<Output = Result<T, TransportError>>,
) -> Result<T, AcquisitionError> {
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result.map_err(AcquisitionError::from),
        Err(_) => Err(AcquisitionError::Timeout {
            operation,
            after: limit,
        }),
    }
}

/// Resolve each measurement's address. Unparseable addresses are logged and
/// counted; a second measurement on an already-used address is skipped.
pub(crate) fn resolve_measurements(device: &Device) -> (BTreeMap<NodeAddress, Measurement>, usize) {
    let mut resolved = BTreeMap::new();
    let mut skipped = 0;
    for m in &device.measurements {
        match m.address.parse::<NodeAddress>() {
            Ok(addr) => {
                if resolved.contains_key(&addr) {
                    tracing::warn!(
                        device = device.id,
                        measurement = m.id,
                        address = %addr,
                        "Address already bound to another measurement, skipping"
                    );
                    skipped += 1;
                } else {
                    resolved.insert(addr, m.clone());
                }
            }
            Err(e) => {
                tracing::warn!(
                    device = device.id,
                    measurement = m.id,
                    address = %m.address,
                    error = %e,
                    "Unresolvable measurement address, skipping"
                );
                skipped += 1;
            }
        }
    }
    (resolved, skipped)
}

/// What one acquisition tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickSummary {
    /// Devices listed by the registry
    pub devices: usize,
    /// Devices whose work completed without error
    pub synced: usize,
    /// Devices skipped because they are in backoff
    pub in_backoff: usize,
    /// Devices whose work failed this tick
    pub failed: usize,
    /// Devices torn down because they left the registry
    pub removed: usize,
    pub subscriptions_created: usize,
    pub subscriptions_cancelled: usize,
    pub addresses_skipped: usize,
    /// Points stored directly by the tick (polling strategy)
    pub points_saved: usize,
    /// The registry was empty and every session was torn down
    pub reset: bool,
}

/// Outcome of disconnecting every session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub closed: usize,
    pub failed: usize,
}

/// Acquisition strategy.
///
/// One tick aligns every device with the registry; the background loop
/// calls `collect_once` on a fixed period and `shutdown` on exit.
#[async_trait]
pub trait Collector: Send + Sync {
    async fn collect_once(&self) -> Result<TickSummary, AcquisitionError>;

    /// Disconnect every session, bounded per session.
    async fn shutdown(&self) -> ShutdownReport;

    /// Strategy name for logging
    fn name(&self) -> &'static str;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_skips_bad_and_duplicate_addresses() {
        let device = Device::new(1, "d", "sim://d")
            .with_measurement(1, "a", "ns=2;i=1")
            .with_measurement(2, "bad", "ns=2;q=1")
            .with_measurement(3, "dup", "ns=2;i=1")
            .with_measurement(4, "b", "ns=2;s=B");
        let (resolved, skipped) = resolve_measurements(&device);
        assert_eq!(resolved.len(), 2);
        assert_eq!(skipped, 2);
        assert_eq!(resolved.get(&NodeAddress::numeric(2, 1)).map(|m| m.id), Some(1));
    }

    #[test]
    fn only_transport_limit_errors_back_off() {
        let markers = vec!["Bad_TooManySessions".to_string()];
        let limit = AcquisitionError::from(TransportError::ServiceFault(
            "Bad_TooManySessions".to_string(),
        ));
        let timeout = AcquisitionError::Timeout {
            operation: "connect",
            after: Duration::from_secs(1),
        };
        assert!(limit.is_session_limit(&markers));
        assert!(!timeout.is_session_limit(&markers));
    }

    #[tokio::test]
    async fn bounded_maps_elapsed_to_timeout() {
        let slow = async {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok::<_, TransportError>(())
        };
        let err = bounded("subscribe", Duration::from_millis(10), slow).await;
        assert!(matches!(err, Err(AcquisitionError::Timeout { operation: "subscribe", .. })));
    }
}
