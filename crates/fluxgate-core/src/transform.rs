//! Per-target payload shaping.
//!
//! The outgoing payload starts empty; `field_mapping` copies dotted source
//! paths into flat target keys, `add_fields` injects constants without
//! overriding mapped values, and `drop_fields` prunes keys last. Targets
//! without a transform config receive the parsed content as-is.
//!
//! Egress encryption is applied by the forwarder runner, after shaping, so
//! an encryption failure surfaces as a delivery failure instead of silently
//! skipping the target.

use serde_json::{Map, Value};
use thiserror::Error;

use crate::{envelope::Envelope, model::TargetSystem};

/// Failures that skip one target while the rest of the dispatch continues.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransformError {
    /// A non-empty field mapping resolved nothing; forwarding only constants
    /// would silently drop the message content.
    #[error("no mapped fields resolved for target `{target}`")]
    NoFieldsResolved {
        /// Target name.
        target: String,
    },

    /// The envelope carries nothing forwardable.
    #[error("envelope has no payload to forward")]
    NothingToForward,
}

/// Build the outgoing payload for one target.
///
/// # Errors
///
/// - [`TransformError::NoFieldsResolved`] if the mapping matched nothing
/// - [`TransformError::NothingToForward`] if a passthrough target gets an
///   envelope with no structured or textual content
pub fn build_payload(
    target: &TargetSystem,
    envelope: &Envelope,
) -> Result<Value, TransformError> {
    let Some(config) = &target.transform else {
        return passthrough(envelope);
    };

    let mut out = Map::new();

    for (source_path, target_key) in &config.field_mapping {
        // Missing source paths are omitted silently
        if let Some(value) = envelope.field(source_path) {
            out.insert(target_key.clone(), value);
        }
    }

    if !config.field_mapping.is_empty() && out.is_empty() {
        return Err(TransformError::NoFieldsResolved { target: target.name.clone() });
    }

    // Mapped fields win over injected constants
    for (key, value) in &config.add_fields {
        if !out.contains_key(key) {
            out.insert(key.clone(), value.clone());
        }
    }

    for key in &config.drop_fields {
        out.remove(key);
    }

    Ok(Value::Object(out))
}

/// Forward the richest content available without shaping. Used for targets
/// without a transform config and for rules that disable the transformer.
pub fn passthrough(envelope: &Envelope) -> Result<Value, TransformError> {
    if let Some(parsed) = &envelope.parsed_data {
        return Ok(Value::Object(parsed.clone()));
    }
    if let Some(payload) = &envelope.payload {
        return Ok(payload.clone());
    }
    if let Some(text) = &envelope.raw_text {
        return Ok(Value::String(text.clone()));
    }
    Err(TransformError::NothingToForward)
}
