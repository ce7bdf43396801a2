//! OPC UA transport for `opc.tcp://` endpoints
//!
//! Built on the `opcua` crate's synchronous client. Every session call is
//! blocking, so each one runs on the blocking pool. A session owns at most
//! one subscription, created on the first `subscribe` with that call's
//! publishing interval; each subscribed address becomes one monitored item.
//!
//! Server status codes are reported as `Bad_TooManySessions` style text so
//! the configured session-limit markers match them.

use async_trait::async_trait;
use opcua::client::prelude::*;
use opcua::sync::RwLock;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use tokio::sync::oneshot;
use tracing::{debug, info};

use super::address::{Identifier as AddressIdentifier, NodeAddress};
use super::transport::{
    NotificationSender, ProtocolClient, ProtocolSession, ReadValue, TransportError,
    ValueNotification,
};
use crate::types::{Device, DeviceId, TagValue};

const APPLICATION_NAME: &str = "aiot-collector";
const APPLICATION_URI: &str = "urn:aiot-collector";

/// Monitored-item routing: server node id back to the subscribed address.
type Routes = Arc<Mutex<HashMap<NodeId, NodeAddress>>>;

/// Opens one OPC UA session per device.
pub struct OpcUaClient {
    pki_dir: PathBuf,
}

impl OpcUaClient {
    /// `pki_dir` holds the client certificate (created on first use) and the
    /// trusted server certificates.
    pub fn new(pki_dir: impl Into<PathBuf>) -> Self {
        Self {
            pki_dir: pki_dir.into(),
        }
    }

    fn build(&self) -> Result<Client, TransportError> {
        ClientBuilder::new()
            .application_name(APPLICATION_NAME)
            .application_uri(APPLICATION_URI)
            .product_uri(APPLICATION_URI)
            .pki_dir(self.pki_dir.clone())
            .create_sample_keypair(true)
            .trust_server_certs(true)
            .session_retry_limit(0)
            .client()
            .ok_or_else(|| TransportError::ConnectionFailed("invalid OPC UA client configuration".to_string()))
    }
}

#[async_trait]
impl ProtocolClient for OpcUaClient {
    async fn connect(
        &self,
        device: &Device,
        notifications: NotificationSender,
    ) -> Result<Arc<dyn ProtocolSession>, TransportError> {
        let mut client = self.build()?;
        let url = device.connection.endpoint.clone();
        let policy = device.connection.security_policy.clone();
        let identity = match &device.connection.username {
            Some(user) => IdentityToken::UserName(
                user.clone(),
                device.connection.password.clone().unwrap_or_default(),
            ),
            None => IdentityToken::Anonymous,
        };

        let session = tokio::task::spawn_blocking(move || {
            let mode = if policy.eq_ignore_ascii_case("None") {
                MessageSecurityMode::None
            } else {
                MessageSecurityMode::SignAndEncrypt
            };
            client.connect_to_endpoint(
                (url.as_str(), policy.as_str(), mode, UserTokenPolicy::anonymous()),
                identity,
            )
        })
        .await
        .map_err(|e| TransportError::ConnectionFailed(format!("connect task failed: {e}")))?
        .map_err(|code| TransportError::ConnectionFailed(status_text(&code.to_string())))?;

        let stop = Session::run_async(session.clone());
        info!(
            device = device.id,
            endpoint = %device.connection.endpoint,
            "OPC UA session established"
        );
        Ok(Arc::new(OpcUaSession {
            device_id: device.id,
            session,
            stop: Mutex::new(Some(stop)),
            subscription: tokio::sync::Mutex::new(None),
            monitored: Mutex::new(HashMap::new()),
            routes: Arc::new(Mutex::new(HashMap::new())),
            notifications,
        }))
    }

    fn transport_name(&self) -> &str {
        "opc.tcp"
    }
}

/// A live OPC UA session.
pub struct OpcUaSession {
    device_id: DeviceId,
    session: Arc<RwLock<Session>>,
    stop: Mutex<Option<oneshot::Sender<SessionCommand>>>,
    subscription: tokio::sync::Mutex<Option<u32>>,
    monitored: Mutex<HashMap<NodeAddress, u32>>,
    routes: Routes,
    notifications: NotificationSender,
}

impl OpcUaSession {
    async fn blocking<T, F>(&self, call: F) -> Result<T, TransportError>
    where
        T: Send + 'static,
        F: FnOnce(&Session) -> Result<T, StatusCode> + Send + 'static,
    {
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || call(&session.read()))
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("session task failed: {e}")))?
            .map_err(status_fault)
    }

    async fn ensure_subscription(&self, publishing_interval: std::time::Duration) -> Result<u32, TransportError> {
        let mut current = self.subscription.lock().await;
        if let Some(id) = *current {
            return Ok(id);
        }

        let device_id = self.device_id;
        let routes = self.routes.clone();
        let tx = self.notifications.clone();
        let callback = DataChangeCallback::new(move |items| {
            for item in items {
                let node_id = &item.item_to_monitor().node_id;
                let Some(address) = lock(&routes).get(node_id).cloned() else {
                    continue;
                };
                let value = item.last_value();
                let notification = ValueNotification {
                    device_id,
                    address,
                    value: value.value.as_ref().map_or(TagValue::Null, tag_value),
                    source_timestamp: value.source_timestamp.as_ref().map(opcua::types::DateTime::as_chrono),
                };
                if tx.try_send(notification).is_err() {
                    debug!(device = device_id, "Notification channel full or closed, value dropped");
                }
            }
        });

        let interval_ms = publishing_interval.as_secs_f64() * 1000.0;
        let id = self
            .blocking(move |s| s.create_subscription(interval_ms, 10, 30, 0, 0, true, callback))
            .await?;
        debug!(device = self.device_id, subscription = id, "OPC UA subscription created");
        *current = Some(id);
        Ok(id)
    }
}

#[async_trait]
impl ProtocolSession for OpcUaSession {
    async fn subscribe(
        &self,
        address: &NodeAddress,
        publishing_interval: std::time::Duration,
    ) -> Result<(), TransportError> {
        let node = node_id(address)?;
        let subscription = self.ensure_subscription(publishing_interval).await?;
        lock(&self.routes).insert(node.clone(), address.clone());

        let request = node.clone();
        let results = self
            .blocking(move |s| {
                s.create_monitored_items(subscription, TimestampsToReturn::Both, &[request.into()])
            })
            .await;
        let created = match results.map(|r| r.into_iter().next()) {
            Ok(Some(result)) if result.status_code.is_good() => result.monitored_item_id,
            Ok(Some(result)) => {
                lock(&self.routes).remove(&node);
                return Err(status_fault(result.status_code));
            }
            Ok(None) => {
                lock(&self.routes).remove(&node);
                return Err(TransportError::ServiceFault("Bad_NothingToDo".to_string()));
            }
            Err(e) => {
                lock(&self.routes).remove(&node);
                return Err(e);
            }
        };
        lock(&self.monitored).insert(address.clone(), created);
        Ok(())
    }

    async fn unsubscribe(&self, address: &NodeAddress) -> Result<(), TransportError> {
        let Some(item) = lock(&self.monitored).remove(address) else {
            return Err(TransportError::ServiceFault("Bad_MonitoredItemIdInvalid".to_string()));
        };
        if let Ok(node) = node_id(address) {
            lock(&self.routes).remove(&node);
        }
        let Some(subscription) = *self.subscription.lock().await else {
            return Ok(());
        };
        let statuses = self
            .blocking(move |s| s.delete_monitored_items(subscription, &[item]))
            .await?;
        match statuses.into_iter().find(|code| code.is_bad()) {
            Some(code) => Err(status_fault(code)),
            None => Ok(()),
        }
    }

    async fn read(&self, addresses: &[NodeAddress]) -> Result<Vec<ReadValue>, TransportError> {
        let requests = addresses
            .iter()
            .map(|a| {
                node_id(a).map(|node_id| ReadValueId {
                    node_id,
                    attribute_id: AttributeId::Value as u32,
                    index_range: UAString::null(),
                    data_encoding: QualifiedName::null(),
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        let values = self
            .blocking(move |s| s.read(&requests, TimestampsToReturn::Both, 0.0))
            .await?;

        Ok(addresses
            .iter()
            .zip(values.iter().map(Some).chain(std::iter::repeat(None)))
            .map(|(address, value)| ReadValue {
                address: address.clone(),
                value: value.and_then(read_value),
                source_timestamp: value
                    .and_then(|v| v.source_timestamp.as_ref())
                    .map(opcua::types::DateTime::as_chrono),
            })
            .collect())
    }

    async fn disconnect(&self) -> Result<(), TransportError> {
        if let Some(stop) = lock(&self.stop).take() {
            // the run loop is gone already when the send fails
            let _ = stop.send(SessionCommand::Stop);
        }
        let session = self.session.clone();
        tokio::task::spawn_blocking(move || session.write().disconnect())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("disconnect task failed: {e}")))?;
        lock(&self.monitored).clear();
        lock(&self.routes).clear();
        debug!(device = self.device_id, "OPC UA session closed");
        Ok(())
    }
}

impl Drop for OpcUaSession {
    fn drop(&mut self) {
        if let Some(stop) = lock(&self.stop).take() {
            if stop.send(SessionCommand::Stop).is_err() {
                debug!(device = self.device_id, "OPC UA run loop already stopped");
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Conversions
// ============================================================================

/// `BadTooManySessions` -> `Bad_TooManySessions`
fn status_text(name: &str) -> String {
    for severity in ["Bad", "Good", "Uncertain"] {
        if let Some(rest) = name.strip_prefix(severity) {
            if rest.starts_with(|c: char| c.is_ascii_uppercase()) {
                return format!("{severity}_{rest}");
            }
        }
    }
    name.to_string()
}

fn status_fault(code: StatusCode) -> TransportError {
    TransportError::ServiceFault(status_text(&code.to_string()))
}

fn node_id(address: &NodeAddress) -> Result<NodeId, TransportError> {
    let ns = address.namespace;
    let node = match &address.identifier {
        AddressIdentifier::Numeric(n) => Some(NodeId::new(ns, *n)),
        AddressIdentifier::String(s) => Some(NodeId::new(ns, UAString::from(s.as_str()))),
        AddressIdentifier::Guid(g) => Guid::from_str(g).ok().map(|g| NodeId::new(ns, g)),
        AddressIdentifier::Opaque(b) => ByteString::from_base64(b).map(|b| NodeId::new(ns, b)),
    };
    node.ok_or_else(|| TransportError::ServiceFault(format!("Bad_NodeIdInvalid: {address}")))
}

fn read_value(value: &DataValue) -> Option<TagValue> {
    if value.status.is_some_and(|s| s.is_bad()) {
        return None;
    }
    Some(value.value.as_ref().map_or(TagValue::Null, tag_value))
}

#[allow(clippy::cast_possible_wrap)]
fn tag_value(variant: &Variant) -> TagValue {
    match variant {
        Variant::Boolean(b) => TagValue::Bool(*b),
        Variant::SByte(v) => TagValue::Int(i64::from(*v)),
        Variant::Byte(v) => TagValue::Int(i64::from(*v)),
        Variant::Int16(v) => TagValue::Int(i64::from(*v)),
        Variant::UInt16(v) => TagValue::Int(i64::from(*v)),
        Variant::Int32(v) => TagValue::Int(i64::from(*v)),
        Variant::UInt32(v) => TagValue::Int(i64::from(*v)),
        Variant::Int64(v) => TagValue::Int(*v),
        Variant::UInt64(v) => i64::try_from(*v).map_or(TagValue::Float(*v as f64), TagValue::Int),
        Variant::Float(v) => TagValue::Float(f64::from(*v)),
        Variant::Double(v) => TagValue::Float(*v),
        Variant::String(s) => s.value().clone().map_or(TagValue::Null, TagValue::Text),
        Variant::LocalizedText(t) => t.text.value().clone().map_or(TagValue::Null, TagValue::Text),
        Variant::Array(array) => TagValue::Array(array.values.iter().map(tag_value).collect()),
        _ => TagValue::Null,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_names_match_session_limit_markers() {
        assert_eq!(status_text("BadTooManySessions"), "Bad_TooManySessions");
        assert_eq!(status_text("Good"), "Good");
        assert_eq!(status_text("Bad_NodeIdUnknown"), "Bad_NodeIdUnknown");

        let fault = status_fault(StatusCode::BadTooManySessions);
        assert!(fault.is_session_limit(&["Bad_TooManySessions".to_string()]));
    }

    #[test]
    fn addresses_become_node_ids() {
        let numeric = node_id(&NodeAddress::numeric(2, 7)).expect("numeric");
        assert_eq!(numeric, NodeId::new(2, 7u32));
        let text = node_id(&NodeAddress::string(3, "Line1.Temp")).expect("string");
        assert_eq!(text, NodeId::new(3, UAString::from("Line1.Temp")));

        let bad_guid = NodeAddress {
            namespace: 1,
            identifier: AddressIdentifier::Guid("not-a-guid".to_string()),
        };
        assert!(matches!(node_id(&bad_guid), Err(TransportError::ServiceFault(_))));
    }

    #[test]
    fn variants_convert_to_tag_values() {
        assert_eq!(tag_value(&Variant::Double(2.5)), TagValue::Float(2.5));
        assert_eq!(tag_value(&Variant::UInt16(9)), TagValue::Int(9));
        assert_eq!(tag_value(&Variant::Boolean(true)), TagValue::Bool(true));
        assert_eq!(
            tag_value(&Variant::String(UAString::from("RUN"))),
            TagValue::Text("RUN".to_string())
        );
        assert_eq!(tag_value(&Variant::Empty), TagValue::Null);

        let mut value = DataValue::null();
        value.value = Some(Variant::Double(1.0));
        assert_eq!(read_value(&value), Some(TagValue::Float(1.0)));
        value.status = Some(StatusCode::BadNodeIdUnknown);
        assert_eq!(read_value(&value), None);
    }

    #[tokio::test]
    async fn refused_endpoint_fails_to_connect() {
        let dir = tempfile::tempdir().expect("tempdir");
        let client = OpcUaClient::new(dir.path().join("pki"));
        let (tx, _rx) = tokio::sync::mpsc::channel(8);
        let device = Device::new(1, "plc", "opc.tcp://127.0.0.1:1/");

        let result = tokio::time::timeout(
            std::time::Duration::from_secs(30),
            client.connect(&device, tx),
        )
        .await
        .expect("connect returns");
        assert!(matches!(result, Err(TransportError::ConnectionFailed(_))));
    }
}
