//! Configuration entities consumed through registration calls.
//!
//! These structs are what an external management surface hands the gateway:
//! target systems with their transform and forwarder settings, plus the
//! protocol vocabulary shared by adapters, rules, and forwarders. They are
//! plain serde types; persistence is someone else's concern.

use std::{collections::BTreeMap, fmt, str::FromStr, time::Duration};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Transport protocol of a source or target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    /// Datagram ingress/egress.
    Udp,
    /// Stream ingress/egress with schema-driven framing.
    Tcp,
    /// Request-response ingress, POST/PUT egress.
    Http,
    /// Long-lived frame-per-message connections.
    WebSocket,
    /// Broker-mediated publish/subscribe.
    Mqtt,
}

impl Protocol {
    /// Canonical uppercase name.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Udp => "UDP",
            Self::Tcp => "TCP",
            Self::Http => "HTTP",
            Self::WebSocket => "WEBSOCKET",
            Self::Mqtt => "MQTT",
        }
    }

    /// Bus topic this protocol's adapters publish inbound envelopes on.
    #[must_use]
    pub fn received_topic(self) -> &'static str {
        match self {
            Self::Udp => "UDP_RECEIVED",
            Self::Tcp => "TCP_RECEIVED",
            Self::Http => "HTTP_RECEIVED",
            Self::WebSocket => "WEBSOCKET_RECEIVED",
            Self::Mqtt => "MQTT_RECEIVED",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "UDP" => Ok(Self::Udp),
            "TCP" => Ok(Self::Tcp),
            "HTTP" => Ok(Self::Http),
            "WEBSOCKET" | "WS" => Ok(Self::WebSocket),
            "MQTT" => Ok(Self::Mqtt),
            other => Err(format!("unknown protocol: {other}")),
        }
    }
}

/// Where a test-entry message claims to come from.
#[derive(Debug, Clone, Default)]
pub struct SourceInfo {
    /// Claimed ingress protocol.
    pub protocol: Option<Protocol>,
    /// Configured data-source identifier.
    pub source_id: Option<String>,
    /// Peer address in protocol-specific shape.
    pub source_address: Option<String>,
}

/// Per-target payload shaping.
///
/// `field_mapping` copies dotted source paths into flat target keys;
/// `add_fields` injects constants (mapped fields win on key collisions);
/// `drop_fields` removes keys last.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TransformConfig {
    /// Dotted source path → target key.
    #[serde(default)]
    pub field_mapping: BTreeMap<String, String>,
    /// Constant key → value injected after mapping.
    #[serde(default)]
    pub add_fields: BTreeMap<String, Value>,
    /// Keys removed from the final payload.
    #[serde(default)]
    pub drop_fields: Vec<String>,
}

/// Authentication for HTTP targets.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuthConfig {
    /// `Authorization: Bearer <token>`.
    Bearer {
        /// Bearer token.
        token: String,
    },
    /// `Authorization: Basic <base64(user:pass)>`.
    Basic {
        /// User name.
        username: String,
        /// Password.
        password: String,
    },
    /// Arbitrary header name/value pair.
    Header {
        /// Header name.
        name: String,
        /// Header value.
        value: String,
    },
}

/// Delivery policy for one target's forwarder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForwarderConfig {
    /// Per-attempt timeout in milliseconds.
    pub timeout_ms: u64,
    /// Maximum delivery attempts (1 = no retry).
    pub max_retries: u32,
    /// Payloads per dispatch; above 1 enables batching.
    pub batch_size: usize,
    /// Longest a partial batch waits before dispatch, in milliseconds.
    pub batch_window_ms: u64,
    /// HTTP authentication, if any.
    pub auth: Option<AuthConfig>,
    /// HTTP method for HTTP targets (POST or PUT).
    pub method: Option<String>,
    /// MQTT quality-of-service level.
    pub qos: u8,
    /// MQTT retained-message flag.
    pub retain: bool,
}

impl Default for ForwarderConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            max_retries: 3,
            batch_size: 1,
            batch_window_ms: 50,
            auth: None,
            method: None,
            qos: 0,
            retain: false,
        }
    }
}

impl ForwarderConfig {
    /// Per-attempt timeout as a [`Duration`].
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    /// Batch accumulation window as a [`Duration`].
    #[must_use]
    pub fn batch_window(&self) -> Duration {
        Duration::from_millis(self.batch_window_ms)
    }
}

/// A downstream endpoint: protocol, address, shaping, and delivery policy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetSystem {
    /// Target identity.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Operator-assigned name.
    pub name: String,
    /// Egress protocol.
    pub protocol_type: Protocol,
    /// Host, URL, or broker address depending on protocol.
    #[serde(default)]
    pub address: Option<String>,
    /// Port for socket protocols.
    #[serde(default)]
    pub port: Option<u16>,
    /// Request path for HTTP targets.
    #[serde(default)]
    pub path: Option<String>,
    /// Publish topic for MQTT targets.
    #[serde(default)]
    pub topic: Option<String>,
    /// Inactive targets stay registered but receive nothing.
    #[serde(default = "default_true")]
    pub is_active: bool,
    /// Wrap outgoing payloads in the AEAD envelope.
    #[serde(default)]
    pub encryption_enabled: bool,
    /// Frame schema used to encode payloads for raw transports.
    #[serde(default)]
    pub frame_schema_id: Option<Uuid>,
    /// Payload shaping; `None` forwards the parsed content as-is.
    #[serde(default)]
    pub transform: Option<TransformConfig>,
    /// Delivery policy.
    #[serde(default)]
    pub forwarder: ForwarderConfig,
}

fn default_true() -> bool {
    true
}
