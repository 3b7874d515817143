//! Data model shared by the controller and its collaborators
//!
//! Descriptors and records compare field-by-field through derived
//! `PartialEq`; a change to any field is a change to the whole value.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Result of polling the remote API for a versioned resource
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fetch<T> {
    /// Upstream returned a fresh value
    Modified(T),
    /// Upstream reports no change since the previous poll
    NotModified,
}

impl<T> Fetch<T> {
    /// Convert into an `Option`, mapping `NotModified` to `None`
    pub fn modified(self) -> Option<T> {
        match self {
            Fetch::Modified(value) => Some(value),
            Fetch::NotModified => None,
        }
    }

    pub fn is_modified(&self) -> bool {
        matches!(self, Fetch::Modified(_))
    }
}

/// Proxy protocol family served by a node
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum NodeType {
    Vless,
    Vmess,
    Trojan,
    Shadowsocks,
    /// Shadowsocks behind a forwarding inbound carrying the transport
    #[serde(rename = "Shadowsocks-Plugin")]
    ShadowsocksPlugin,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Vless => "Vless",
            NodeType::Vmess => "Vmess",
            NodeType::Trojan => "Trojan",
            NodeType::Shadowsocks => "Shadowsocks",
            NodeType::ShadowsocksPlugin => "Shadowsocks-Plugin",
        }
    }
}

impl fmt::Display for NodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for NodeType {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "Vless" => Ok(NodeType::Vless),
            "Vmess" => Ok(NodeType::Vmess),
            "Trojan" => Ok(NodeType::Trojan),
            "Shadowsocks" => Ok(NodeType::Shadowsocks),
            "Shadowsocks-Plugin" => Ok(NodeType::ShadowsocksPlugin),
            other => Err(crate::Error::invalid_input(format!(
                "unsupported node type: {}",
                other
            ))),
        }
    }
}

/// How the node's TLS certificate is obtained
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CertMode {
    #[default]
    None,
    /// Certificate files provided out of band
    File,
    /// ACME HTTP-01
    Http,
    /// ACME DNS-01
    Dns,
}

impl CertMode {
    /// Whether certificates in this mode are renewed by the controller
    pub fn is_managed(&self) -> bool {
        matches!(self, CertMode::Http | CertMode::Dns)
    }
}

/// Configuration of the node this controller manages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u16,
    /// Node-wide speed limit in bytes per second, 0 for unlimited
    #[serde(default)]
    pub speed_limit: u64,

    // Transport
    pub transport: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub header: Option<serde_json::Value>,
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub congestion: bool,
    #[serde(default)]
    pub quic_security: String,
    #[serde(default)]
    pub quic_key: String,

    // Security
    #[serde(default)]
    pub tls_type: String,
    #[serde(default)]
    pub cert_mode: CertMode,
    #[serde(default)]
    pub cert_domain: String,
    #[serde(default)]
    pub reject_unknown_sni: bool,
    #[serde(default)]
    pub allow_insecure: bool,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub alpn: String,
    #[serde(default)]
    pub cipher_method: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default)]
    pub flow: String,

    // REALITY
    #[serde(default)]
    pub dest: String,
    #[serde(default)]
    pub show: bool,
    #[serde(default)]
    pub server_names: Vec<String>,
    #[serde(default)]
    pub private_key: String,
    #[serde(default)]
    pub short_ids: Vec<String>,
    #[serde(default)]
    pub min_client_ver: String,
    #[serde(default)]
    pub max_client_ver: String,
    #[serde(default)]
    pub max_time_diff: u64,
    #[serde(default)]
    pub xver: u64,

    // Listener
    #[serde(default)]
    pub address: String,
    #[serde(default)]
    pub listen_ip: String,
    #[serde(default)]
    pub send_ip: String,
    #[serde(default)]
    pub sniffing: bool,
    #[serde(default)]
    pub proxy_protocol: bool,

    // Relay chaining
    #[serde(default)]
    pub relay: bool,
    #[serde(default)]
    pub relay_node_id: u32,
}

impl NodeDescriptor {
    /// Minimal descriptor; remaining fields take their empty values
    pub fn new(node_type: NodeType, node_id: u32, port: u16) -> Self {
        Self {
            node_type,
            node_id,
            port,
            speed_limit: 0,
            transport: "tcp".to_string(),
            host: String::new(),
            path: String::new(),
            service_name: String::new(),
            header: None,
            seed: String::new(),
            congestion: false,
            quic_security: String::new(),
            quic_key: String::new(),
            tls_type: String::new(),
            cert_mode: CertMode::None,
            cert_domain: String::new(),
            reject_unknown_sni: false,
            allow_insecure: false,
            fingerprint: String::new(),
            alpn: String::new(),
            cipher_method: String::new(),
            server_key: String::new(),
            flow: String::new(),
            dest: String::new(),
            show: false,
            server_names: Vec::new(),
            private_key: String::new(),
            short_ids: Vec::new(),
            min_client_ver: String::new(),
            max_client_ver: String::new(),
            max_time_diff: 0,
            xver: 0,
            address: String::new(),
            listen_ip: String::new(),
            send_ip: String::new(),
            sniffing: false,
            proxy_protocol: false,
            relay: false,
            relay_node_id: 0,
        }
    }

    pub fn uses_tls(&self) -> bool {
        self.tls_type.eq_ignore_ascii_case("tls")
    }

    /// Whether a certificate-renewal job should be scheduled for this node
    pub fn wants_certificate_job(&self) -> bool {
        self.uses_tls() && self.cert_mode != CertMode::None
    }
}

/// Configuration of the secondary node a relayed node egresses through
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelayNodeDescriptor {
    pub node_type: NodeType,
    pub node_id: u32,
    pub port: u16,
    pub address: String,

    #[serde(default)]
    pub transport: String,
    #[serde(default)]
    pub host: String,
    #[serde(default)]
    pub path: String,
    #[serde(default)]
    pub service_name: String,
    #[serde(default)]
    pub header: Option<serde_json::Value>,
    #[serde(default)]
    pub seed: String,
    #[serde(default)]
    pub congestion: bool,
    #[serde(default)]
    pub quic_security: String,
    #[serde(default)]
    pub quic_key: String,

    #[serde(default)]
    pub tls_type: String,
    #[serde(default)]
    pub cipher_method: String,
    #[serde(default)]
    pub server_key: String,
    #[serde(default)]
    pub flow: String,
    #[serde(default)]
    pub alpn: String,
    #[serde(default)]
    pub fingerprint: String,
    #[serde(default)]
    pub server_name: String,
    #[serde(default)]
    pub public_key: String,
    #[serde(default)]
    pub short_id: String,
    #[serde(default)]
    pub spider_x: String,
    #[serde(default)]
    pub show: bool,

    #[serde(default)]
    pub listen_ip: String,
    #[serde(default)]
    pub send_ip: String,
    #[serde(default)]
    pub proxy_protocol: bool,
}

impl RelayNodeDescriptor {
    /// Minimal descriptor; remaining fields take their empty values
    pub fn new(node_type: NodeType, node_id: u32, port: u16, address: impl Into<String>) -> Self {
        Self {
            node_type,
            node_id,
            port,
            address: address.into(),
            transport: "tcp".to_string(),
            host: String::new(),
            path: String::new(),
            service_name: String::new(),
            header: None,
            seed: String::new(),
            congestion: false,
            quic_security: String::new(),
            quic_key: String::new(),
            tls_type: String::new(),
            cipher_method: String::new(),
            server_key: String::new(),
            flow: String::new(),
            alpn: String::new(),
            fingerprint: String::new(),
            server_name: String::new(),
            public_key: String::new(),
            short_id: String::new(),
            spider_x: String::new(),
            show: false,
            listen_ip: String::new(),
            send_ip: String::new(),
            proxy_protocol: false,
        }
    }
}

/// A subscriber's credential and policy record
///
/// Field order defines the canonical ordering (UID first).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AccountRecord {
    pub uid: u32,
    /// Human-readable label, usually the subscriber's email
    pub label: String,
    /// Shared secret for password-based protocols
    #[serde(default)]
    pub secret: String,
    #[serde(default)]
    pub speed_limit: u64,
    #[serde(default)]
    pub device_limit: u32,
    /// Protocol UUID for UUID-based protocols
    #[serde(default)]
    pub uuid: String,
}

impl AccountRecord {
    pub fn new(uid: u32, label: impl Into<String>, uuid: impl Into<String>) -> Self {
        Self {
            uid,
            label: label.into(),
            secret: String::new(),
            speed_limit: 0,
            device_limit: 0,
            uuid: uuid.into(),
        }
    }

    pub fn with_secret(mut self, secret: impl Into<String>) -> Self {
        self.secret = secret.into();
        self
    }

    pub fn with_limits(mut self, speed_limit: u64, device_limit: u32) -> Self {
        self.speed_limit = speed_limit;
        self.device_limit = device_limit;
        self
    }
}

/// Illegal-access detection rule
#[derive(Debug, Clone)]
pub struct DetectRule {
    pub id: u32,
    pub pattern: Regex,
}

impl DetectRule {
    /// Compile a rule from its pattern source
    pub fn new(id: u32, pattern: &str) -> Result<Self, crate::Error> {
        Ok(Self {
            id,
            pattern: Regex::new(pattern)?,
        })
    }

    pub fn matches(&self, destination: &str) -> bool {
        self.pattern.is_match(destination)
    }
}

impl PartialEq for DetectRule {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id && self.pattern.as_str() == other.pattern.as_str()
    }
}

impl Eq for DetectRule {}

/// Upload/download counters of one account
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficCounters {
    pub upload: u64,
    pub download: u64,
}

impl TrafficCounters {
    pub fn new(upload: u64, download: u64) -> Self {
        Self { upload, download }
    }

    pub fn is_zero(&self) -> bool {
        self.upload == 0 && self.download == 0
    }
}

/// Traffic reported upstream for one account
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrafficSample {
    pub uid: u32,
    pub label: String,
    pub upload: u64,
    pub download: u64,
}

/// An account seen online from an address
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OnlineIp {
    pub uid: u32,
    pub ip: String,
}

/// A detection rule hit attributed to an account
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DetectResult {
    pub uid: u32,
    pub rule_id: u32,
}

/// Identity of the remote API endpoint, used in log prefixes
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ClientInfo {
    pub api_host: String,
    pub node_id: u32,
}
