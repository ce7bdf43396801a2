//! Protocol transport seam
//!
//! The acquisition engine talks to devices only through these traits:
//! - `ProtocolClient`: opens a session for a device
//! - `ProtocolSession`: subscribe / unsubscribe / read / disconnect
//!
//! Value changes are pushed by the transport onto an mpsc channel as
//! `ValueNotification`s; the transport never calls back into the engine.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::address::{Endpoint, NodeAddress};
use crate::types::{Device, DeviceId, TagValue};

/// One server-pushed value change.
#[derive(Debug, Clone, PartialEq)]
pub struct ValueNotification {
    pub device_id: DeviceId,
    pub address: NodeAddress,
    pub value: TagValue,
    /// Device-side timestamp, if the server supplied one
    pub source_timestamp: Option<DateTime<Utc>>,
}

pub type NotificationSender = mpsc::Sender<ValueNotification>;

/// Result of reading one address.
#[derive(Debug, Clone, PartialEq)]
pub struct ReadValue {
    pub address: NodeAddress,
    /// `None` when the server reported a bad status for this address
    pub value: Option<TagValue>,
    pub source_timestamp: Option<DateTime<Utc>>,
}

/// Transport-level errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("connection failed: {0}")]
    ConnectionFailed(String),

    /// Remote service fault; the text carries the server status code name
    #[error("service fault: {0}")]
    ServiceFault(String),

    #[error("session closed")]
    SessionClosed,

    #[error("no transport for endpoint '{0}'")]
    UnsupportedEndpoint(String),
}

impl TransportError {
    /// True when the error text contains one of the session/resource-limit markers.
    pub fn is_session_limit(&self, markers: &[String]) -> bool {
        let text = self.to_string();
        markers.iter().any(|m| !m.is_empty() && text.contains(m.as_str()))
    }
}

/// Opens sessions to devices.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Connect to `device`. Value changes for addresses later subscribed on
    /// the returned session are sent on `notifications`.
    async fn connect(
        &self,
        device: &Device,
        notifications: NotificationSender,
    ) -> Result<Arc<dyn ProtocolSession>, TransportError>;

    /// Human-readable name for logging
    fn transport_name(&self) -> &str;
}

/// A live connection to one device.
#[async_trait]
pub trait ProtocolSession: Send + Sync {
    /// Start pushing value changes for `address`.
    async fn subscribe(&self, address: &NodeAddress, publishing_interval: Duration) -> Result<(), TransportError>;

    async fn unsubscribe(&self, address: &NodeAddress) -> Result<(), TransportError>;

    /// One-shot read of several addresses, in request order.
    async fn read(&self, addresses: &[NodeAddress]) -> Result<Vec<ReadValue>, TransportError>;

    async fn disconnect(&self) -> Result<(), TransportError>;
}

// ============================================================================
// Endpoint routing
// ============================================================================

/// Dispatches each device to the client registered for its endpoint scheme.
#[derive(Default)]
pub struct EndpointRouter {
    routes: Vec<(&'static str, Arc<dyn ProtocolClient>)>,
    fallback: Option<Arc<dyn ProtocolClient>>,
}

impl EndpointRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Serve endpoints with this scheme (`"sim"`, `"opc.tcp"`) from `client`.
    pub fn route(mut self, scheme: &'static str, client: Arc<dyn ProtocolClient>) -> Self {
        self.routes.push((scheme, client));
        self
    }

    /// Serve every endpoint without a matching route from `client`.
    pub fn fallback(mut self, client: Arc<dyn ProtocolClient>) -> Self {
        self.fallback = Some(client);
        self
    }

    fn client_for(&self, endpoint: &str) -> Option<&Arc<dyn ProtocolClient>> {
        let scheme = endpoint.parse::<Endpoint>().ok().map(|e| e.scheme());
        self.routes
            .iter()
            .find(|(s, _)| Some(*s) == scheme)
            .map(|(_, c)| c)
            .or(self.fallback.as_ref())
    }
}

#[async_trait]
impl ProtocolClient for EndpointRouter {
    async fn connect(
        &self,
        device: &Device,
        notifications: NotificationSender,
    ) -> Result<Arc<dyn ProtocolSession>, TransportError> {
        let endpoint = &device.connection.endpoint;
        match self.client_for(endpoint) {
            Some(client) => client.connect(device, notifications).await,
            None => Err(TransportError::UnsupportedEndpoint(endpoint.clone())),
        }
    }

    fn transport_name(&self) -> &str {
        "router"
    }
}
