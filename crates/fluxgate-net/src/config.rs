//! Gateway config file: the JSON document the binary loads at startup.
//!
//! The file stands in for the registration calls an external management
//! surface would make at runtime: keys, schemas, rules, targets, source
//! bindings, and adapters.

use std::sync::Arc;

use fluxgate_core::{RoutingRule, TargetSystem};
use fluxgate_crypto::{CryptoService, EncryptionKey, KeyStore};
use fluxgate_frame::FrameSchema;
use serde::Deserialize;
use uuid::Uuid;

use crate::{
    adapters::{self, AdapterEntry},
    error::GatewayError,
    manager::GatewayManager,
};

/// Encryption key as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct KeySpec {
    /// Key identity; generated when omitted.
    #[serde(default = "Uuid::new_v4")]
    pub id: Uuid,
    /// Key name.
    pub name: String,
    /// base64-encoded 32-byte key material.
    pub key: String,
    /// Whether this is the deployment's active key.
    #[serde(default)]
    pub is_active: bool,
}

/// Source → schema binding as written in the config file.
#[derive(Debug, Clone, Deserialize)]
pub struct SourceBinding {
    /// Data-source identifier.
    pub source_id: String,
    /// Schema applied to that source's raw frames.
    pub frame_schema_id: Uuid,
}

/// Root config document.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Encryption keys (at most one active).
    pub keys: Vec<KeySpec>,
    /// Frame schemas.
    pub schemas: Vec<FrameSchema>,
    /// Routing rules.
    pub rules: Vec<RoutingRule>,
    /// Target systems.
    pub targets: Vec<TargetSystem>,
    /// Source → schema bindings.
    pub bindings: Vec<SourceBinding>,
    /// Ingress adapters.
    pub adapters: Vec<AdapterEntry>,
}

impl GatewayConfig {
    /// Parse a config document.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] when the JSON does not deserialize.
    pub fn from_json(json: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(json).map_err(|e| GatewayError::Config(e.to_string()))
    }

    /// Build the crypto service from the configured keys.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Config`] on malformed key material or multiple active
    /// keys.
    pub fn build_crypto(&self) -> Result<CryptoService, GatewayError> {
        let keys: Result<Vec<EncryptionKey>, _> = self
            .keys
            .iter()
            .map(|spec| {
                EncryptionKey::from_base64(spec.id, spec.name.clone(), &spec.key).map(|key| {
                    if spec.is_active { key.activated() } else { key }
                })
            })
            .collect();
        let keys = keys.map_err(|e| GatewayError::Config(e.to_string()))?;

        let store = KeyStore::new();
        store.load(keys).map_err(|e| GatewayError::Config(e.to_string()))?;
        Ok(CryptoService::new(store))
    }

    /// Register everything in this config with `manager` and add its
    /// adapters.
    ///
    /// # Errors
    ///
    /// The first registration failure; earlier registrations stay in place.
    pub async fn apply(&self, manager: &GatewayManager) -> Result<(), GatewayError> {
        for schema in &self.schemas {
            manager.register_frame_schema(schema.clone())?;
        }
        for rule in &self.rules {
            manager.register_routing_rule(rule.clone());
        }
        for target in &self.targets {
            manager.register_target_system(target.clone()).await?;
        }
        for binding in &self.bindings {
            manager.bind_source(binding.source_id.clone(), binding.frame_schema_id);
        }
        for entry in &self.adapters {
            let schema = entry
                .frame_schema_id
                .and_then(|id| self.schemas.iter().find(|s| s.id == id).cloned());
            let adapter = adapters::build_adapter(entry, Arc::clone(manager.bus()), schema)?;
            manager.add_adapter(entry.id.clone(), adapter).await?;
        }
        Ok(())
    }
}
