//! Transport and gateway-level errors.

use fluxgate_core::ForwardError;
use fluxgate_frame::FrameError;
use thiserror::Error;

/// Errors from adapter configuration and lifecycle.
#[derive(Debug, Error)]
pub enum AdapterError {
    /// Adapter configuration is unusable.
    #[error("invalid adapter configuration: {0}")]
    Config(String),

    /// Could not bind or connect the adapter's transport.
    #[error("transport setup failed: {0}")]
    Bind(String),

    /// Transport failed after startup.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors from gateway assembly and registration.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// An adapter with this id is already registered.
    #[error("adapter `{0}` already exists")]
    DuplicateAdapter(String),

    /// Adapter lifecycle failure.
    #[error(transparent)]
    Adapter(#[from] AdapterError),

    /// A target system's configuration is unusable.
    #[error("invalid target configuration: {0}")]
    TargetConfig(String),

    /// Frame schema rejected at registration.
    #[error(transparent)]
    Schema(#[from] FrameError),

    /// Forwarder startup failure.
    #[error(transparent)]
    Forward(#[from] ForwardError),

    /// Gateway config file is unusable.
    #[error("invalid gateway configuration: {0}")]
    Config(String),
}
