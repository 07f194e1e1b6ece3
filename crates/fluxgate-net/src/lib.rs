//! Fluxgate gateway transports.
//!
//! Production glue around [`fluxgate_core`]'s message plane: protocol
//! ingress adapters (UDP, TCP, HTTP, WebSocket, MQTT), matching forwarders,
//! the [`GatewayManager`] that owns their lifecycles, and the
//! `fluxgate-gateway` binary that wires a default instance from a JSON
//! config file.

#![forbid(unsafe_code)]

pub mod adapters;
pub mod config;
pub mod forwarders;
pub mod manager;

mod error;

pub use adapters::{AdapterState, AdapterStats, Ingress};
pub use config::GatewayConfig;
pub use error::{AdapterError, GatewayError};
pub use manager::{GatewayManager, GatewayStatus};
