//! Protocol emitters delivering transformed payloads to target systems.
//!
//! Each emitter implements [`fluxgate_core::Forward`]: one delivery attempt,
//! classified failures. Retries, backoff, batching, and result reporting are
//! owned by the core forwarder runner.

mod http;
mod mqtt;
mod tcp;
mod udp;
mod ws;

use std::sync::Arc;

use fluxgate_core::{Forward, ForwardError, Protocol, TargetSystem};
use fluxgate_frame::{FrameSchema, FrameType, encode_frame};
pub use http::HttpForwarder;
pub use mqtt::MqttForwarder;
use serde_json::Value;
pub use tcp::TcpForwarder;
pub use udp::UdpForwarder;
pub use ws::WebSocketForwarder;

use crate::error::GatewayError;

/// Build the emitter for a target.
///
/// `schema` is the target's bound frame schema, used by raw transports to
/// frame-encode payloads.
///
/// # Errors
///
/// [`GatewayError::TargetConfig`] when required endpoint fields are missing.
pub fn build_emitter(
    target: &TargetSystem,
    schema: Option<FrameSchema>,
) -> Result<Arc<dyn Forward>, GatewayError> {
    Ok(match target.protocol_type {
        Protocol::Http => Arc::new(HttpForwarder::build(target)?),
        Protocol::Mqtt => Arc::new(MqttForwarder::build(target)?),
        Protocol::Tcp => Arc::new(TcpForwarder::build(target, schema)?),
        Protocol::Udp => Arc::new(UdpForwarder::build(target, schema)?),
        Protocol::WebSocket => Arc::new(WebSocketForwarder::build(target)?),
    })
}

/// `host[:port]` for socket targets.
pub(crate) fn socket_address(target: &TargetSystem) -> Result<String, GatewayError> {
    let address = target
        .address
        .as_deref()
        .ok_or_else(|| GatewayError::TargetConfig(format!("target `{}` has no address", target.name)))?;
    Ok(match target.port {
        Some(port) => format!("{address}:{port}"),
        None => address.to_string(),
    })
}

/// Render one payload for a raw transport: frame-encoded when a schema is
/// bound (with the delimiter appended for delimited framing), newline-
/// terminated JSON otherwise.
pub(crate) fn render_raw(
    schema: Option<&FrameSchema>,
    payload: &Value,
) -> Result<Vec<u8>, ForwardError> {
    match schema {
        Some(schema) => {
            let fields = payload
                .as_object()
                .ok_or_else(|| ForwardError::Payload("frame encoding needs an object".to_string()))?;
            let mut frame = encode_frame(schema, fields)
                .map_err(|e| ForwardError::Payload(e.to_string()))?;
            if schema.frame_type == FrameType::Delimited {
                if let Some(delimiter) = schema.delimiter_bytes() {
                    frame.extend_from_slice(delimiter);
                }
            }
            Ok(frame)
        },
        None => {
            let mut line = serde_json::to_vec(payload)
                .map_err(|e| ForwardError::Payload(e.to_string()))?;
            line.push(b'\n');
            Ok(line)
        },
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;
    use uuid::Uuid;

    use super::*;

    fn target(protocol: Protocol) -> TargetSystem {
        serde_json::from_value(json!({
            "id": Uuid::new_v4(),
            "name": "sink",
            "protocol_type": protocol,
            "address": "127.0.0.1",
            "port": 4000,
            "topic": "fluxgate/out"
        }))
        .expect("target")
    }

    #[test]
    fn builds_an_emitter_per_protocol() {
        for protocol in
            [Protocol::Http, Protocol::Mqtt, Protocol::Tcp, Protocol::Udp, Protocol::WebSocket]
        {
            let emitter = build_emitter(&target(protocol), None).expect("emitter");
            assert!(!emitter.name().is_empty());
        }
    }

    #[test]
    fn socket_address_requires_an_address() {
        let mut missing = target(Protocol::Tcp);
        missing.address = None;
        assert!(matches!(socket_address(&missing), Err(GatewayError::TargetConfig(_))));

        assert_eq!(socket_address(&target(Protocol::Tcp)).expect("addr"), "127.0.0.1:4000");
    }

    #[test]
    fn render_raw_without_schema_is_json_lines() {
        let line = render_raw(None, &json!({"k": 1})).expect("render");
        assert_eq!(line, b"{\"k\":1}\n");
    }
}
