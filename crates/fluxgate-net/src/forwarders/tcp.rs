//! TCP egress: frame-encoded (or JSON-lines) writes over a kept connection.

use async_trait::async_trait;
use fluxgate_core::{Forward, ForwardError, TargetSystem};
use fluxgate_frame::FrameSchema;
use serde_json::Value;
use tokio::{io::AsyncWriteExt, net::TcpStream, sync::Mutex};

use super::{render_raw, socket_address};
use crate::error::GatewayError;

/// Stream emitter. The connection is established lazily and dropped on any
/// write failure; the runner's retry policy drives reconnection.
pub struct TcpForwarder {
    name: String,
    address: String,
    schema: Option<FrameSchema>,
    stream: Mutex<Option<TcpStream>>,
}

impl TcpForwarder {
    /// Build the emitter from the target's socket address.
    ///
    /// # Errors
    ///
    /// [`GatewayError::TargetConfig`] when the address is missing.
    pub fn build(target: &TargetSystem, schema: Option<FrameSchema>) -> Result<Self, GatewayError> {
        Ok(Self {
            name: target.name.clone(),
            address: socket_address(target)?,
            schema,
            stream: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Forward for TcpForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            let stream = TcpStream::connect(&self.address)
                .await
                .map_err(|e| ForwardError::Connection(format!("{}: {e}", self.address)))?;
            *guard = Some(stream);
        }

        for payload in batch {
            let bytes = render_raw(self.schema.as_ref(), payload)?;
            let Some(stream) = guard.as_mut() else {
                return Err(ForwardError::Connection("connection lost".to_string()));
            };
            if let Err(error) = stream.write_all(&bytes).await {
                *guard = None;
                return Err(ForwardError::Connection(error.to_string()));
            }
        }

        if let Some(stream) = guard.as_mut() {
            if let Err(error) = stream.flush().await {
                *guard = None;
                return Err(ForwardError::Connection(error.to_string()));
            }
        }

        Ok(None)
    }
}
