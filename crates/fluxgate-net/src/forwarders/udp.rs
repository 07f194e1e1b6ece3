//! UDP egress: one datagram per payload.

use async_trait::async_trait;
use fluxgate_core::{Forward, ForwardError, TargetSystem};
use fluxgate_frame::FrameSchema;
use serde_json::Value;
use tokio::{net::UdpSocket, sync::Mutex};

use super::{render_raw, socket_address};
use crate::error::GatewayError;

/// Datagram emitter.
pub struct UdpForwarder {
    name: String,
    address: String,
    schema: Option<FrameSchema>,
    socket: Mutex<Option<UdpSocket>>,
}

impl UdpForwarder {
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
            socket: Mutex::new(None),
        })
    }
}

#[async_trait]
impl Forward for UdpForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> Result<(), ForwardError> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .map_err(|e| ForwardError::Connection(e.to_string()))?;
        *self.socket.lock().await = Some(socket);
        Ok(())
    }

    async fn stop(&self) {
        self.socket.lock().await.take();
    }

    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError> {
        let guard = self.socket.lock().await;
        let socket = guard
            .as_ref()
            .ok_or_else(|| ForwardError::Connection("socket not started".to_string()))?;

        for payload in batch {
            let bytes = render_raw(self.schema.as_ref(), payload)?;
            socket
                .send_to(&bytes, &self.address)
                .await
                .map_err(|e| ForwardError::Connection(format!("{}: {e}", self.address)))?;
        }

        Ok(None)
    }
}
