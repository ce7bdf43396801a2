//! Protocol address and endpoint parsing
//!
//! Measurement addresses follow the node-id expression grammar
//! `[ns=<u16>;]<i|s|g|b>=<identifier>`:
//!
//! | kind | identifier |
//! |------|------------|
//! | `i`  | unsigned 32-bit integer |
//! | `s`  | any non-empty string |
//! | `g`  | GUID `xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx` |
//! | `b`  | opaque bytes, base64 text |
//!
//! Endpoints are `opc.tcp://host[:port][/path]` or `sim://<name>`.

use regex::Regex;
use std::fmt;
use std::str::FromStr;
use std::sync::OnceLock;

use crate::config::defaults::DEFAULT_OPC_TCP_PORT;

/// Address and endpoint parse errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum AddressError {
    #[error("empty address")]
    Empty,
    #[error("malformed address '{0}': expected [ns=<n>;]<i|s|g|b>=<id>")]
    Malformed(String),
    #[error("invalid namespace index '{0}'")]
    InvalidNamespace(String),
    #[error("missing identifier in '{0}'")]
    MissingIdentifier(String),
    #[error("invalid numeric identifier '{0}'")]
    InvalidNumeric(String),
    #[error("invalid GUID identifier '{0}'")]
    InvalidGuid(String),
    #[error("invalid opaque identifier '{0}'")]
    InvalidOpaque(String),
    #[error("unsupported endpoint '{0}'")]
    InvalidEndpoint(String),
}

/// Identifier part of a node address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Identifier {
    Numeric(u32),
    String(String),
    /// Lower-cased canonical GUID text
    Guid(String),
    /// Base64 text as written
    Opaque(String),
}

/// A resolved protocol address.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeAddress {
    pub namespace: u16,
    pub identifier: Identifier,
}

impl NodeAddress {
    pub fn numeric(namespace: u16, id: u32) -> Self {
        Self {
            namespace,
            identifier: Identifier::Numeric(id),
        }
    }

    pub fn string(namespace: u16, id: &str) -> Self {
        Self {
            namespace,
            identifier: Identifier::String(id.to_string()),
        }
    }

    /// 64-bit FNV-1a of the canonical text form. Identical across runs,
    /// builds and platforms, so simulated waveforms are reproducible.
    pub(crate) fn fingerprint(&self) -> u64 {
        const FNV_OFFSET: u64 = 0xcbf2_9ce4_8422_2325;
        const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;
        self.to_string().bytes().fold(FNV_OFFSET, |h, b| {
            (h ^ u64::from(b)).wrapping_mul(FNV_PRIME)
        })
    }
}

/// Canonical text form; `ns=0` is omitted.
impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.namespace != 0 {
            write!(f, "ns={};", self.namespace)?;
        }
        match &self.identifier {
            Identifier::Numeric(n) => write!(f, "i={n}"),
            Identifier::String(s) => write!(f, "s={s}"),
            Identifier::Guid(g) => write!(f, "g={g}"),
            Identifier::Opaque(b) => write!(f, "b={b}"),
        }
    }
}

#[allow(clippy::expect_used)]
fn node_id_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)^(?:ns=(?P<ns>[^;]*);)?(?P<kind>[A-Za-z])=(?P<id>.*)$")
            .expect("node id pattern is valid")
    })
}

#[allow(clippy::expect_used)]
fn guid_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[0-9A-Fa-f]{8}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{4}-[0-9A-Fa-f]{12}$")
            .expect("guid pattern is valid")
    })
}

#[allow(clippy::expect_used)]
fn base64_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?:[A-Za-z0-9+/]{4})*(?:[A-Za-z0-9+/]{2}==|[A-Za-z0-9+/]{3}=)?$")
            .expect("base64 pattern is valid")
    })
}

impl FromStr for NodeAddress {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();
        if text.is_empty() {
            return Err(AddressError::Empty);
        }

        let caps = node_id_re()
            .captures(text)
            .ok_or_else(|| AddressError::Malformed(text.to_string()))?;

        let namespace = match caps.name("ns") {
            Some(ns) => ns
                .as_str()
                .trim()
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidNamespace(ns.as_str().to_string()))?,
            None => 0,
        };

        let id = caps.name("id").map_or("", |m| m.as_str());
        if id.is_empty() {
            return Err(AddressError::MissingIdentifier(text.to_string()));
        }

        let identifier = match caps.name("kind").map(|m| m.as_str()) {
            Some("i") => Identifier::Numeric(
                id.parse::<u32>()
                    .map_err(|_| AddressError::InvalidNumeric(id.to_string()))?,
            ),
            Some("s") => Identifier::String(id.to_string()),
            Some("g") => {
                if !guid_re().is_match(id) {
                    return Err(AddressError::InvalidGuid(id.to_string()));
                }
                Identifier::Guid(id.to_ascii_lowercase())
            }
            Some("b") => {
                if !base64_re().is_match(id) {
                    return Err(AddressError::InvalidOpaque(id.to_string()));
                }
                Identifier::Opaque(id.to_string())
            }
            _ => return Err(AddressError::Malformed(text.to_string())),
        };

        Ok(Self {
            namespace,
            identifier,
        })
    }
}

// ============================================================================
// Endpoints
// ============================================================================

/// A parsed device endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    OpcTcp {
        host: String,
        port: u16,
        path: String,
    },
    Simulated {
        name: String,
    },
}

impl Endpoint {
    /// URL scheme, used to route a device to a transport.
    pub fn scheme(&self) -> &'static str {
        match self {
            Endpoint::OpcTcp { .. } => "opc.tcp",
            Endpoint::Simulated { .. } => "sim",
        }
    }
}

#[allow(clippy::expect_used)]
fn opc_tcp_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(?i:opc\.tcp)://(?P<host>\[[^\]]+\]|[^:/\[\]]+)(?::(?P<port>\d+))?(?P<path>/.*)?$")
            .expect("endpoint pattern is valid")
    })
}

impl FromStr for Endpoint {
    type Err = AddressError;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let text = raw.trim();

        if let Some(name) = text.strip_prefix("sim://") {
            if name.is_empty() {
                return Err(AddressError::InvalidEndpoint(text.to_string()));
            }
            return Ok(Endpoint::Simulated {
                name: name.to_string(),
            });
        }

        let caps = opc_tcp_re()
            .captures(text)
            .ok_or_else(|| AddressError::InvalidEndpoint(text.to_string()))?;

        let host = caps
            .name("host")
            .map(|m| m.as_str().trim_start_matches('[').trim_end_matches(']').to_string())
            .ok_or_else(|| AddressError::InvalidEndpoint(text.to_string()))?;
        let port = match caps.name("port") {
            Some(p) => p
                .as_str()
                .parse::<u16>()
                .map_err(|_| AddressError::InvalidEndpoint(text.to_string()))?,
            None => DEFAULT_OPC_TCP_PORT,
        };
        let path = caps.name("path").map_or_else(String::new, |m| m.as_str().to_string());

        Ok(Endpoint::OpcTcp { host, port, path })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fingerprint_is_fixed_fnv1a_of_canonical_text() {
        let addr: NodeAddress = "ns=2;i=1".parse().expect("parse");
        assert_eq!(addr.fingerprint(), 0x891e_bb63_d07a_68f3);
        // same canonical text, same fingerprint
        assert_eq!(NodeAddress::numeric(2, 1).fingerprint(), addr.fingerprint());
        assert_ne!(NodeAddress::numeric(2, 2).fingerprint(), addr.fingerprint());
    }

    #[test]
    fn parses_each_identifier_kind() {
        assert_eq!(
            "ns=2;i=1042".parse::<NodeAddress>(),
            Ok(NodeAddress::numeric(2, 1042))
        );
        assert_eq!(
            "ns=3;s=Line1.Temp;raw".parse::<NodeAddress>(),
            Ok(NodeAddress::string(3, "Line1.Temp;raw"))
        );
        let guid: NodeAddress = "g=72962B91-FA75-4AE6-8D28-B404DC7DAF63".parse().expect("guid");
        assert_eq!(
            guid.identifier,
            Identifier::Guid("72962b91-fa75-4ae6-8d28-b404dc7daf63".to_string())
        );
        let opaque: NodeAddress = "ns=1;b=M/RbKBsRVkePCePcx24oRA==".parse().expect("opaque");
        assert_eq!(opaque.namespace, 1);
    }

    #[test]
    fn namespace_defaults_to_zero_and_display_is_canonical() {
        let addr: NodeAddress = "i=85".parse().expect("numeric");
        assert_eq!(addr.namespace, 0);
        assert_eq!(addr.to_string(), "i=85");
        let addr: NodeAddress = " ns=4;s=Tank.Level ".parse().expect("string");
        assert_eq!(addr.to_string(), "ns=4;s=Tank.Level");
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert_eq!("".parse::<NodeAddress>(), Err(AddressError::Empty));
        assert!(matches!("Tank.Level".parse::<NodeAddress>(), Err(AddressError::Malformed(_))));
        assert!(matches!("ns=x;i=1".parse::<NodeAddress>(), Err(AddressError::InvalidNamespace(_))));
        assert!(matches!("ns=70000;i=1".parse::<NodeAddress>(), Err(AddressError::InvalidNamespace(_))));
        assert!(matches!("ns=2;s=".parse::<NodeAddress>(), Err(AddressError::MissingIdentifier(_))));
        assert!(matches!("i=-4".parse::<NodeAddress>(), Err(AddressError::InvalidNumeric(_))));
        assert!(matches!("g=not-a-guid".parse::<NodeAddress>(), Err(AddressError::InvalidGuid(_))));
        assert!(matches!("b=***".parse::<NodeAddress>(), Err(AddressError::InvalidOpaque(_))));
        assert!(matches!("x=1".parse::<NodeAddress>(), Err(AddressError::Malformed(_))));
    }

    #[test]
    fn parses_endpoints() {
        assert_eq!(
            "opc.tcp://10.0.0.5:4841/server".parse::<Endpoint>(),
            Ok(Endpoint::OpcTcp {
                host: "10.0.0.5".to_string(),
                port: 4841,
                path: "/server".to_string(),
            })
        );
        assert_eq!(
            "opc.tcp://plc-7".parse::<Endpoint>(),
            Ok(Endpoint::OpcTcp {
                host: "plc-7".to_string(),
                port: DEFAULT_OPC_TCP_PORT,
                path: String::new(),
            })
        );
        assert_eq!(
            "opc.tcp://[fe80::1]:4840".parse::<Endpoint>().map(|e| e.scheme()),
            Ok("opc.tcp")
        );
        assert_eq!(
            "sim://press-1".parse::<Endpoint>(),
            Ok(Endpoint::Simulated {
                name: "press-1".to_string()
            })
        );
        assert!("http://example.com".parse::<Endpoint>().is_err());
        assert!("opc.tcp://host:99999".parse::<Endpoint>().is_err());
        assert!("sim://".parse::<Endpoint>().is_err());
    }
}
