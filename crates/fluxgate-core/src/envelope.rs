//! The in-flight message envelope.
//!
//! An envelope is born in an ingress adapter, decorated as it moves through
//! decrypt → parse → route, and consumed per target by transform and forward.
//! It is deliberately permissive: every field except identity is optional, and
//! downstream stages decorate rather than replace.

use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::{model::Protocol, path::lookup_path};

/// Pipeline stage names used in outcomes and error events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    /// AEAD envelope unwrap.
    Decrypt,
    /// Frame schema decode.
    Parse,
    /// Rule evaluation.
    Route,
    /// Per-target payload shaping.
    Transform,
    /// Delivery to a target system.
    Forward,
    /// All stages finished.
    Complete,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Decrypt => "decrypt",
            Self::Parse => "parse",
            Self::Route => "route",
            Self::Transform => "transform",
            Self::Forward => "forward",
            Self::Complete => "complete",
        };
        f.write_str(name)
    }
}

/// Diagnostic record of one matched routing rule.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleMatch {
    /// Matched rule id.
    pub rule_id: Uuid,
    /// Matched rule name.
    pub rule_name: String,
    /// Rule priority at match time.
    pub priority: i32,
}

/// The message carried across bus topics.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Unique message identity, assigned at ingress.
    pub message_id: Uuid,
    /// Wall-clock time at ingress.
    pub timestamp: SystemTime,
    /// Ingress protocol.
    pub source_protocol: Option<Protocol>,
    /// Configured data-source identifier.
    pub source_id: Option<String>,
    /// Peer address in protocol-specific shape.
    pub source_address: Option<String>,
    /// Name of the adapter that received the message.
    pub adapter_name: Option<String>,
    /// Frame schema bound to this message, if known at ingress.
    pub frame_schema_id: Option<Uuid>,
    /// Opaque inbound bytes.
    pub raw_data: Option<Bytes>,
    /// Inbound bytes decoded as UTF-8, when they are text.
    pub raw_text: Option<String>,
    /// Structured inbound payload (JSON bodies, decrypted envelopes).
    pub payload: Option<Value>,
    /// Field name → scalar mapping after a successful parse.
    pub parsed_data: Option<Map<String, Value>>,
    /// Parse failure decoration; set instead of `parsed_data`.
    pub parse_error: Option<String>,
    /// Whether the message arrived encrypted.
    pub is_encrypted: bool,
    /// base64 `nonce || ciphertext || tag` blob awaiting decryption.
    pub encrypted_payload: Option<String>,
    /// Decrypt failure decoration.
    pub decrypt_error: Option<String>,
    /// Rules that matched, highest priority first.
    pub matched_rules: Vec<RuleMatch>,
    /// Deduplicated targets the message routes to.
    pub target_system_ids: Vec<Uuid>,
    /// Set when the receiving adapter parsed inline and already published
    /// `DATA_PARSED` itself.
    #[serde(skip)]
    pub auto_parsed: bool,
}

impl Envelope {
    /// Fresh envelope with a new message id stamped at the current time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            message_id: Uuid::new_v4(),
            timestamp: SystemTime::now(),
            source_protocol: None,
            source_id: None,
            source_address: None,
            adapter_name: None,
            frame_schema_id: None,
            raw_data: None,
            raw_text: None,
            payload: None,
            parsed_data: None,
            parse_error: None,
            is_encrypted: false,
            encrypted_payload: None,
            decrypt_error: None,
            matched_rules: Vec::new(),
            target_system_ids: Vec::new(),
            auto_parsed: false,
        }
    }

    /// Envelope as adapters construct it: protocol, adapter, and peer.
    #[must_use]
    pub fn received(
        protocol: Protocol,
        adapter_name: impl Into<String>,
        source_address: Option<String>,
    ) -> Self {
        let mut envelope = Self::new();
        envelope.source_protocol = Some(protocol);
        envelope.adapter_name = Some(adapter_name.into());
        envelope.source_address = source_address;
        envelope
    }

    /// Attach an inbound body, classifying it as it lands.
    ///
    /// Bytes are always kept in `raw_data`. Valid UTF-8 additionally fills
    /// `raw_text`; a JSON document fills `payload`; a JSON object is exposed
    /// to routing under `parsed_data`; and an object carrying an
    /// `encrypted_payload` string is marked for the decrypt stage instead.
    #[must_use]
    pub fn with_body(mut self, data: Bytes) -> Self {
        if let Ok(text) = std::str::from_utf8(&data) {
            let trimmed = text.trim_start();
            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                if let Ok(value) = serde_json::from_str::<Value>(text) {
                    if let Some(blob) =
                        value.get("encrypted_payload").and_then(Value::as_str)
                    {
                        self.encrypted_payload = Some(blob.to_string());
                        self.is_encrypted = true;
                    } else {
                        if let Some(object) = value.as_object() {
                            self.parsed_data = Some(object.clone());
                        }
                        self.payload = Some(value);
                    }
                }
            }
            self.raw_text = Some(text.to_string());
        }
        self.raw_data = Some(data);
        self
    }

    /// Milliseconds since the Unix epoch at ingress.
    #[must_use]
    pub fn timestamp_millis(&self) -> u64 {
        self.timestamp.duration_since(UNIX_EPOCH).map_or(0, |d| d.as_millis() as u64)
    }

    /// Resolve a dotted field path against the envelope.
    ///
    /// The first segment selects an envelope field by name; remaining
    /// segments descend into structured values. `None` means absent, which is
    /// distinct from a field that holds a JSON null.
    #[must_use]
    pub fn field(&self, field_path: &str) -> Option<Value> {
        let (head, rest) = match field_path.split_once('.') {
            Some((head, rest)) => (head, Some(rest)),
            None => (field_path, None),
        };

        match head {
            "parsed_data" => {
                let map = self.parsed_data.as_ref()?;
                match rest {
                    None => Some(Value::Object(map.clone())),
                    Some(rest) => {
                        let mut current: &Value = map.get(rest.split('.').next()?)?;
                        for part in rest.split('.').skip(1) {
                            current = current.as_object()?.get(part)?;
                        }
                        Some(current.clone())
                    },
                }
            },
            "payload" => {
                let payload = self.payload.as_ref()?;
                match rest {
                    None => Some(payload.clone()),
                    Some(rest) => lookup_path(payload, rest).cloned(),
                }
            },
            _ if rest.is_some() => None,
            "message_id" => Some(Value::String(self.message_id.to_string())),
            "timestamp" => Some(Value::from(self.timestamp_millis())),
            "source_protocol" => {
                self.source_protocol.map(|p| Value::String(p.as_str().to_string()))
            },
            "source_id" => self.source_id.clone().map(Value::String),
            "source_address" => self.source_address.clone().map(Value::String),
            "adapter_name" => self.adapter_name.clone().map(Value::String),
            "raw_text" => self.raw_text.clone().map(Value::String),
            "parse_error" => self.parse_error.clone().map(Value::String),
            "decrypt_error" => self.decrypt_error.clone().map(Value::String),
            "is_encrypted" => Some(Value::Bool(self.is_encrypted)),
            _ => None,
        }
    }

    /// Text rendering used for source-pattern matching: `raw_text` first,
    /// then stringified parsed data, then lossy-decoded raw bytes.
    #[must_use]
    pub fn text_rendering(&self) -> Option<String> {
        if let Some(text) = &self.raw_text {
            return Some(text.clone());
        }
        if let Some(parsed) = &self.parsed_data {
            return serde_json::to_string(parsed).ok();
        }
        self.raw_data.as_ref().map(|data| String::from_utf8_lossy(data).into_owned())
    }
}

impl Default for Envelope {
    fn default() -> Self {
        Self::new()
    }
}
