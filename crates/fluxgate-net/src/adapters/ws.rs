//! WebSocket ingress: one frame, one message.
//!
//! Accepts up to `max_connections` concurrent clients; connections over the
//! cap complete the handshake and are immediately closed with
//! "Maximum connections reached".

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use fluxgate_core::{EventBus, Protocol};
use fluxgate_frame::FrameSchema;
use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::watch,
};
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, frame::coding::CloseCode};

use super::{AdapterCore, AdapterState, AdapterStats, Ingress};
use crate::error::AdapterError;

/// Close reason sent to clients rejected by the connection cap.
const CAP_REACHED: &str = "Maximum connections reached";

/// WebSocket server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WebSocketAdapterConfig {
    /// Interface to bind.
    pub listen_address: String,
    /// Port to bind; 0 picks an ephemeral port.
    pub listen_port: u16,
    /// Concurrent connection cap.
    pub max_connections: u64,
    /// Data-source identifier stamped on every envelope.
    pub source_id: Option<String>,
    /// Decode frames inline when a schema is bound.
    pub auto_parse: bool,
}

impl Default for WebSocketAdapterConfig {
    fn default() -> Self {
        Self {
            listen_address: "0.0.0.0".to_string(),
            listen_port: 0,
            max_connections: 100,
            source_id: None,
            auto_parse: false,
        }
    }
}

/// Frame-per-message receiver over long-lived connections.
pub struct WebSocketAdapter {
    core: Arc<AdapterCore>,
    config: WebSocketAdapterConfig,
    local_addr: std::sync::Mutex<Option<SocketAddr>>,
}

impl WebSocketAdapter {
    /// Build the adapter; the listener is bound by [`Ingress::start`].
    pub fn new(
        name: impl Into<String>,
        config: WebSocketAdapterConfig,
        bus: Arc<EventBus>,
        schema: Option<FrameSchema>,
    ) -> Result<Self, AdapterError> {
        let core = AdapterCore::new(
            name,
            Protocol::WebSocket,
            bus,
            config.source_id.clone(),
            schema,
            config.auto_parse,
        )?;
        Ok(Self { core: Arc::new(core), config, local_addr: std::sync::Mutex::new(None) })
    }

    /// Bound listener address, once started.
    #[must_use]
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

#[async_trait]
impl Ingress for WebSocketAdapter {
    fn name(&self) -> &str {
        self.core.name()
    }

    fn protocol(&self) -> Protocol {
        Protocol::WebSocket
    }

    fn state(&self) -> AdapterState {
        self.core.state()
    }

    fn stats(&self) -> AdapterStats {
        self.core.stats()
    }

    async fn start(&self) -> Result<(), AdapterError> {
        let Some(mut shutdown) = self.core.begin_start() else {
            return Ok(());
        };

        let bind = format!("{}:{}", self.config.listen_address, self.config.listen_port);
        let listener = match TcpListener::bind(&bind).await {
            Ok(listener) => listener,
            Err(error) => {
                self.core.abort_start();
                return Err(AdapterError::Bind(format!("websocket bind {bind}: {error}")));
            },
        };
        *self.local_addr.lock().unwrap_or_else(std::sync::PoisonError::into_inner) =
            listener.local_addr().ok();

        let core = Arc::clone(&self.core);
        let max_connections = self.config.max_connections;
        self.core.add_task(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.changed() => break,
                    accepted = listener.accept() => match accepted {
                        Ok((stream, peer)) => {
                            if core.active_connections() >= max_connections {
                                core.record_error();
                                core.add_task(tokio::spawn(reject_connection(stream, peer)));
                                continue;
                            }
                            core.connection_opened();
                            // Tracked so stop() joins per-connection loops too
                            core.add_task(tokio::spawn(serve_connection(
                                Arc::clone(&core),
                                stream,
                                peer,
                                shutdown.clone(),
                            )));
                        },
                        Err(error) => {
                            core.record_error();
                            tracing::warn!(adapter = %core.name(), %error, "websocket accept failed");
                        },
                    },
                }
            }
        }));

        self.core.finish_start();
        Ok(())
    }

    async fn stop(&self) -> Result<(), AdapterError> {
        self.core.stop().await;
        Ok(())
    }
}

/// Complete the handshake, then close immediately with the cap reason.
async fn reject_connection(stream: TcpStream, peer: SocketAddr) {
    let Ok(mut socket) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };
    tracing::warn!(%peer, "websocket connection rejected: {CAP_REACHED}");
    let _ = socket
        .close(Some(CloseFrame { code: CloseCode::Again, reason: CAP_REACHED.into() }))
        .await;
}

async fn serve_connection(
    core: Arc<AdapterCore>,
    stream: TcpStream,
    peer: SocketAddr,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = peer.to_string();
    let mut socket = match tokio_tungstenite::accept_async(stream).await {
        Ok(socket) => socket,
        Err(error) => {
            core.record_error();
            tracing::debug!(adapter = %core.name(), %peer, %error, "websocket handshake failed");
            core.connection_closed();
            return;
        },
    };

    loop {
        let message = tokio::select! {
            _ = shutdown.changed() => {
                let _ = socket.close(None).await;
                break;
            },
            message = socket.next() => message,
        };

        match message {
            Some(Ok(message)) if message.is_text() || message.is_binary() => {
                core.publish_received(message.into_data(), Some(peer.clone()));
            },
            Some(Ok(message)) if message.is_close() => break,
            Some(Ok(_)) => {}, // ping/pong handled by tungstenite
            Some(Err(error)) => {
                core.record_error();
                tracing::debug!(adapter = %core.name(), %peer, %error, "websocket read failed");
                break;
            },
            None => break,
        }
    }

    core.connection_closed();
}
