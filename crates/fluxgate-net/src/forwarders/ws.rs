//! WebSocket egress: one text frame per payload over a long-lived client
//! connection.
//!
//! The connection is (re)established lazily; a send failure drops it and
//! surfaces as a connection error, so the runner's backoff policy doubles as
//! the reconnect policy.

use async_trait::async_trait;
use fluxgate_core::{Forward, ForwardError, TargetSystem};
use futures_util::SinkExt;
use serde_json::Value;
use tokio::{net::TcpStream, sync::Mutex};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async, tungstenite::Message};

use crate::error::GatewayError;

type WsConnection = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Long-lived WebSocket client emitter.
pub struct WebSocketForwarder {
    name: String,
    url: String,
    stream: Mutex<Option<WsConnection>>,
}

impl WebSocketForwarder {
    /// Build the emitter from the target's address (`ws://` URL or
    /// host/port).
    ///
    /// # Errors
    ///
    /// [`GatewayError::TargetConfig`] when the address is missing.
    pub fn build(target: &TargetSystem) -> Result<Self, GatewayError> {
        let address = target.address.as_deref().ok_or_else(|| {
            GatewayError::TargetConfig(format!("target `{}` has no address", target.name))
        })?;

        let base = if address.starts_with("ws://") || address.starts_with("wss://") {
            address.to_string()
        } else if let Some(port) = target.port {
            format!("ws://{address}:{port}")
        } else {
            format!("ws://{address}")
        };
        let url = match target.path.as_deref() {
            Some(path) => format!("{}{path}", base.trim_end_matches('/')),
            None => base,
        };

        Ok(Self { name: target.name.clone(), url, stream: Mutex::new(None) })
    }

    /// Resolved connection URL.
    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl Forward for WebSocketForwarder {
    fn name(&self) -> &str {
        &self.name
    }

    async fn stop(&self) {
        if let Some(mut stream) = self.stream.lock().await.take() {
            let _ = stream.close(None).await;
        }
    }

    async fn attempt(&self, batch: &[Value]) -> Result<Option<u16>, ForwardError> {
        let mut guard = self.stream.lock().await;

        if guard.is_none() {
            let (stream, _response) = connect_async(self.url.as_str())
                .await
                .map_err(|e| ForwardError::Connection(format!("{}: {e}", self.url)))?;
            *guard = Some(stream);
        }

        for payload in batch {
            let text =
                serde_json::to_string(payload).map_err(|e| ForwardError::Payload(e.to_string()))?;
            let Some(stream) = guard.as_mut() else {
                return Err(ForwardError::Connection("connection lost".to_string()));
            };
            if let Err(error) = stream.send(Message::text(text)).await {
                *guard = None;
                return Err(ForwardError::Connection(error.to_string()));
            }
        }

        Ok(None)
    }
}
